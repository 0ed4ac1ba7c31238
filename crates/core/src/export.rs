use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use tracing::{info, warn};

use crate::model::{OrphanFolder, ScanReport, REPORT_VERSION};

/// Loads a JSON scan report. A report written by another version is still
/// returned, with a warning.
pub fn read_report(path: &Path) -> Result<ScanReport> {
    let data =
        fs::read_to_string(path).with_context(|| format!("failed to read report {}", path.display()))?;
    let report: ScanReport = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse report {}", path.display()))?;
    if report.report_version != REPORT_VERSION {
        warn!(
            "report {} has version {}, expected {}",
            path.display(),
            report.report_version,
            REPORT_VERSION
        );
    }
    Ok(report)
}

pub fn write_report(report: &ScanReport, path: &Path) -> Result<()> {
    let payload = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    create_parent(path)?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    info!(
        "report with {} folder(s) saved to {}",
        report.folders.len(),
        path.display()
    );
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

pub fn render_text_report(folders: &[OrphanFolder], generated_at: DateTime<Utc>) -> String {
    let total_bytes = folders
        .iter()
        .map(|folder| folder.size_bytes)
        .fold(0_u64, u64::saturating_add);

    let mut out = String::new();
    out.push_str("Orphan Folder Report\n");
    out.push_str(&format!(
        "Generated: {}\n",
        generated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!(
        "Folders: {}\nTotal size: {}\n",
        folders.len(),
        human_bytes(total_bytes)
    ));
    out.push_str(&"=".repeat(60));
    out.push_str("\n\n");

    if folders.is_empty() {
        out.push_str("No orphan folders.\n");
        return out;
    }

    for folder in folders {
        out.push_str(&format!("Path: {}\n", folder.path));
        out.push_str(&format!("Size: {}\n", human_bytes(folder.size_bytes)));
        out.push_str(&format!("Category: {}\n", folder.category.label()));
        out.push_str(&format!("Reason: {}\n", folder.reason));
        out.push_str(&format!("Risk: {}\n", folder.risk.label()));
        let modified = folder
            .last_modified
            .map(|time| time.with_timezone(&Local).format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        out.push_str(&format!("Last modified: {modified}\n"));
        out.push_str(&"-".repeat(40));
        out.push('\n');
    }
    out
}

pub fn write_text_report(folders: &[OrphanFolder], path: &Path) -> Result<()> {
    let text = render_text_report(folders, Utc::now());
    create_parent(path)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

pub fn human_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if value < 1024 {
        return format!("{value} B");
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{human_bytes, read_report, render_text_report, write_report};
    use crate::model::{OrphanFolder, RiskLevel, ScanLocation, ScanReport};

    #[test]
    fn formats_sizes() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KB");
        assert_eq!(human_bytes(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn report_lists_every_folder_with_its_fields() {
        let generated = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let folders = vec![
            OrphanFolder::new(
                "C:\\ProgramData\\OldTool".to_string(),
                "OldTool".to_string(),
                ScanLocation::ProgramData,
                2048,
                None,
                "Folder is empty".to_string(),
                RiskLevel::Low,
            ),
            OrphanFolder::new(
                "C:\\Program Files\\Viewer".to_string(),
                "Viewer".to_string(),
                ScanLocation::ProgramFiles,
                10,
                Some(generated),
                "Not accessed in 400 days".to_string(),
                RiskLevel::Medium,
            ),
        ];

        let text = render_text_report(&folders, generated);

        assert!(text.starts_with("Orphan Folder Report\n"));
        assert!(text.contains("Folders: 2\n"));
        assert!(text.contains("Total size: 2.0 KB\n"));
        assert!(text.contains("Path: C:\\ProgramData\\OldTool\n"));
        assert!(text.contains("Reason: Folder is empty\n"));
        assert!(text.contains("Last modified: unknown\n"));
        assert_eq!(text.matches("Path: ").count(), 2);
        assert!(text.contains(&format!("Risk: {}\n", RiskLevel::Medium.label())));
    }

    #[test]
    fn empty_report_says_so() {
        let text = render_text_report(&[], Utc::now());
        assert!(text.contains("No orphan folders."));
    }

    #[test]
    fn saved_report_loads_back_from_a_new_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("reports").join("scan.json");
        let report = ScanReport::new(
            ScanLocation::ProgramData,
            Some("D:\\".to_string()),
            vec![OrphanFolder::new(
                "D:\\ProgramData\\Stale".to_string(),
                "Stale".to_string(),
                ScanLocation::ProgramData,
                99,
                None,
                "Folder is empty".to_string(),
                RiskLevel::Low,
            )],
        );

        write_report(&report, &path).expect("report written");
        let loaded = read_report(&path).expect("report read");

        assert_eq!(loaded, report);
        assert!(read_report(&temp.path().join("missing.json")).is_err());
    }
}
