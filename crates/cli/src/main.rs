use std::path::PathBuf;

use anyhow::Result;
use clap::ArgAction;
use clap::{Args, Parser, Subcommand, ValueEnum};
use orphan_sweep_core::{
    collect_doctor_info, human_bytes, read_report, run_cleanup_with_callback,
    run_scan_with_callback, write_manifest, write_report, write_text_report, CleanupOptions,
    OrphanFolder, ProgressEvent, RiskLevel, ScanLocation, ScanOptions, ScanReport,
    SoftwareInventory, SweepConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const FAILURE_SUMMARY_LIMIT: usize = 10;

#[derive(Debug, Parser)]
#[command(
    name = "orphan-sweep",
    version,
    about = "Find folders left behind by uninstalled software and clean them up safely."
)]
struct Cli {
    /// JSON configuration file (thresholds, excludes, cleanup retries).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan a drive for orphaned folders and write a JSON report.
    Scan(ScanArgs),
    /// Delete folders from a scan report.
    Clean(CleanArgs),
    /// Write a plain-text listing of a scan report.
    Export(ExportArgs),
    /// Show or save the installed-software inventory.
    Inventory(InventoryArgs),
    /// Show environment, volumes and inventory sources.
    Doctor,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliLocation {
    #[value(name = "program-files")]
    ProgramFiles,
    #[value(name = "program-files-x86")]
    ProgramFilesX86,
    #[value(name = "appdata-roaming", alias = "roaming")]
    AppDataRoaming,
    #[value(name = "appdata-local", alias = "local")]
    AppDataLocal,
    #[value(name = "program-data")]
    ProgramData,
    #[value(name = "common-files")]
    CommonFiles,
    All,
}

impl From<CliLocation> for ScanLocation {
    fn from(value: CliLocation) -> Self {
        match value {
            CliLocation::ProgramFiles => ScanLocation::ProgramFiles,
            CliLocation::ProgramFilesX86 => ScanLocation::ProgramFilesX86,
            CliLocation::AppDataRoaming => ScanLocation::AppDataRoaming,
            CliLocation::AppDataLocal => ScanLocation::AppDataLocal,
            CliLocation::ProgramData => ScanLocation::ProgramData,
            CliLocation::CommonFiles => ScanLocation::CommonFiles,
            CliLocation::All => ScanLocation::All,
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliRisk {
    Low,
    Medium,
    High,
}

impl From<CliRisk> for RiskLevel {
    fn from(value: CliRisk) -> Self {
        match value {
            CliRisk::Low => RiskLevel::Low,
            CliRisk::Medium => RiskLevel::Medium,
            CliRisk::High => RiskLevel::High,
        }
    }
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Which base folders to scan.
    #[arg(long, default_value = "all")]
    location: CliLocation,

    /// Drive root to scan. Defaults to the system drive.
    #[arg(long, value_name = "PATH")]
    drive: Option<PathBuf>,

    /// Output report path.
    #[arg(long, default_value = "orphan-sweep-report.json", value_name = "FILE")]
    output: PathBuf,

    /// Also write a plain-text listing to this file.
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,

    /// Extra inventory manifest (repeatable).
    #[arg(long = "inventory-manifest", value_name = "FILE", num_args = 1.., action = ArgAction::Append)]
    inventory_manifests: Vec<PathBuf>,

    /// Exclude glob or substring patterns (repeatable).
    #[arg(long = "exclude", value_name = "GLOB", num_args = 1.., action = ArgAction::Append)]
    exclude: Vec<String>,

    /// Emit progress log events while scanning.
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Args)]
struct CleanArgs {
    /// Input report file.
    #[arg(long, value_name = "FILE")]
    report: PathBuf,

    /// Select every folder at or below this risk instead of the report's selection.
    #[arg(long, value_name = "RISK", conflicts_with = "all")]
    max_risk: Option<CliRisk>,

    /// Select every folder in the report.
    #[arg(long)]
    all: bool,

    /// Skip the recycle bin and delete permanently.
    #[arg(long)]
    permanent: bool,

    /// Actually delete. Without it the selection is only listed.
    #[arg(long)]
    yes: bool,

    /// Where to write the report minus deleted folders. Defaults to --report.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Input report file.
    #[arg(long, value_name = "FILE")]
    report: PathBuf,

    /// Output text file.
    #[arg(long, default_value = "orphan-sweep-report.txt", value_name = "FILE")]
    output: PathBuf,

    /// Only list folders selected for deletion.
    #[arg(long)]
    selected_only: bool,
}

#[derive(Debug, Args)]
struct InventoryArgs {
    /// Extra inventory manifest (repeatable).
    #[arg(long = "inventory-manifest", value_name = "FILE", num_args = 1.., action = ArgAction::Append)]
    inventory_manifests: Vec<PathBuf>,

    /// Save the merged inventory as a manifest.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SweepConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan(args) => run_scan_command(args, &config),
        Commands::Clean(args) => run_clean_command(args, &config),
        Commands::Export(args) => run_export_command(args),
        Commands::Inventory(args) => run_inventory_command(args, &config),
        Commands::Doctor => {
            run_doctor_command();
            Ok(())
        }
    }
}

fn run_scan_command(args: ScanArgs, config: &SweepConfig) -> Result<()> {
    let ScanArgs {
        location,
        drive,
        output,
        export,
        inventory_manifests,
        exclude,
        progress,
    } = args;

    let inventory = build_inventory(config, inventory_manifests);
    let mut options = ScanOptions::from_config(config, location.into());
    options.drive_root = drive.clone();
    options.excludes.extend(exclude);

    let folders = run_scan_with_callback(&options, &inventory, |event| {
        if progress {
            log_event(&event);
        }
    })?;

    let report = ScanReport::new(
        options.location,
        drive.map(|root| root.to_string_lossy().to_string()),
        folders,
    );
    write_report(&report, &output)?;

    println!("Report written to {}", output.display());
    print_risk_breakdown(&report.folders);
    println!(
        "Found {} orphan folder(s), {} in total; {} selected by default.",
        report.folders.len(),
        human_bytes(report.total_bytes()),
        report.selected().len()
    );

    if let Some(path) = export {
        write_text_report(&report.folders, &path)?;
        println!("Text listing written to {}", path.display());
    }

    Ok(())
}

fn run_clean_command(args: CleanArgs, config: &SweepConfig) -> Result<()> {
    let mut report = read_report(&args.report)?;
    let selection = select_folders(&report, args.max_risk.map(RiskLevel::from), args.all);

    if selection.is_empty() {
        println!("Nothing selected in {}", args.report.display());
        return Ok(());
    }

    let selected_bytes = selection
        .iter()
        .map(|folder| folder.size_bytes)
        .fold(0_u64, u64::saturating_add);
    println!(
        "{} folder(s) selected, {} in total:",
        selection.len(),
        human_bytes(selected_bytes)
    );
    for folder in &selection {
        println!(
            "- [{}] {} ({}) {}",
            folder.risk,
            folder.path,
            human_bytes(folder.size_bytes),
            folder.reason
        );
    }

    if !args.yes {
        println!("Dry run: re-run with --yes to delete these folders.");
        return Ok(());
    }

    let mut options = CleanupOptions::from_settings(&config.cleanup);
    if args.permanent {
        options.use_recoverable_delete = false;
    }
    let result = run_cleanup_with_callback(&selection, &options, |event| log_event(&event));

    println!(
        "Deleted {} folder(s), freed {}.",
        result.deleted_count(),
        human_bytes(result.total_bytes_freed)
    );
    if result.failed_count() > 0 {
        println!("{} folder(s) could not be deleted:", result.failed_count());
        for line in result.failure_summary(FAILURE_SUMMARY_LIMIT) {
            println!("  {line}");
        }
    }

    report.remove_deleted(&result);
    let output = args.output.unwrap_or(args.report);
    write_report(&report, &output)?;
    println!("Updated report written to {}", output.display());

    Ok(())
}

fn run_export_command(args: ExportArgs) -> Result<()> {
    let report = read_report(&args.report)?;
    let folders = if args.selected_only {
        report.selected()
    } else {
        report.folders
    };
    write_text_report(&folders, &args.output)?;
    println!(
        "Listed {} folder(s) in {}",
        folders.len(),
        args.output.display()
    );
    Ok(())
}

fn run_inventory_command(args: InventoryArgs, config: &SweepConfig) -> Result<()> {
    let inventory = build_inventory(config, args.inventory_manifests);
    let summary = inventory.summary();
    println!(
        "Programs: {} | known names: {} | install paths: {}",
        summary.program_count, summary.known_name_count, summary.known_install_path_count
    );
    println!(
        "Oldest install date: {}",
        summary.oldest_install_date.format("%Y-%m-%d")
    );

    if let Some(output) = args.output {
        write_manifest(&inventory, &output)?;
        println!("Inventory manifest written to {}", output.display());
    }
    Ok(())
}

fn run_doctor_command() {
    let info = collect_doctor_info();
    println!("OS: {} ({})", info.os, info.arch);
    println!("System root: {}", info.system_root);
    println!("Detected volumes: {}", info.volumes.len());
    for volume in info.volumes {
        println!(
            "- {} [{}] total={} free={} fs={} removable={} ssd={} system={}",
            volume.name,
            volume.mount_point,
            human_bytes(volume.total_space_bytes),
            human_bytes(volume.free_space_bytes),
            volume.file_system.as_deref().unwrap_or("unknown"),
            volume.is_removable,
            volume.is_ssd,
            volume.is_system
        );
    }
    if info.inventory_sources.is_empty() {
        println!("Inventory sources: none");
    } else {
        println!("Inventory sources:");
        for source in info.inventory_sources {
            println!("- {source}");
        }
    }
    for note in info.notes {
        println!("Note: {}", note);
    }
}

fn build_inventory(config: &SweepConfig, extra_manifests: Vec<PathBuf>) -> SoftwareInventory {
    let mut manifests = config.inventory_manifests.clone();
    manifests.extend(extra_manifests);
    SoftwareInventory::build_with_manifests(&manifests)
}

fn select_folders(
    report: &ScanReport,
    max_risk: Option<RiskLevel>,
    all: bool,
) -> Vec<OrphanFolder> {
    match (all, max_risk) {
        (true, _) => report.folders.clone(),
        (false, Some(max)) => report
            .folders
            .iter()
            .filter(|folder| folder.risk <= max)
            .cloned()
            .collect(),
        (false, None) => report.selected(),
    }
}

fn print_risk_breakdown(folders: &[OrphanFolder]) {
    for risk in [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High] {
        let matching = folders.iter().filter(|folder| folder.risk == risk);
        let (count, bytes) = matching.fold((0_usize, 0_u64), |(count, bytes), folder| {
            (count + 1, bytes.saturating_add(folder.size_bytes))
        });
        println!("{risk}: {count} folder(s), {}", human_bytes(bytes));
    }
}

fn log_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Status { text } => info!("{text}"),
        ProgressEvent::Progress { percent } => info!("progress {percent}%"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use orphan_sweep_core::{OrphanFolder, RiskLevel, ScanLocation, ScanReport};

    use super::{select_folders, Cli, Commands};

    fn report() -> ScanReport {
        let folder = |name: &str, risk| {
            OrphanFolder::new(
                format!("/data/{name}"),
                name.to_string(),
                ScanLocation::ProgramData,
                1,
                None,
                "test".to_string(),
                risk,
            )
        };
        ScanReport::new(
            ScanLocation::All,
            None,
            vec![
                folder("a", RiskLevel::Low),
                folder("b", RiskLevel::Medium),
                folder("c", RiskLevel::High),
            ],
        )
    }

    #[test]
    fn selection_follows_flags() {
        let report = report();
        assert_eq!(select_folders(&report, None, false).len(), 1);
        assert_eq!(select_folders(&report, Some(RiskLevel::Medium), false).len(), 2);
        assert_eq!(select_folders(&report, None, true).len(), 3);
    }

    #[test]
    fn parses_clean_arguments() {
        let cli = Cli::parse_from([
            "orphan-sweep",
            "clean",
            "--report",
            "r.json",
            "--max-risk",
            "medium",
            "--permanent",
        ]);
        match cli.command {
            Commands::Clean(args) => {
                assert!(args.permanent);
                assert!(!args.yes);
                assert!(args.max_risk.is_some());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
