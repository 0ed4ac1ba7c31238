use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use chrono::Utc;
use filetime::FileTime;
use orphan_sweep_core::inventory::ManifestEntry;
use orphan_sweep_core::{
    run_cleanup, run_scan, run_scan_with_callback, CancelToken, CleanupOptions, InventorySource,
    ManifestSource, ProgressEvent, RiskLevel, ScanLocation, ScanOptions, ScanReport,
    SoftwareInventory, SweepError,
};
use tempfile::TempDir;

struct Drive {
    _temp: TempDir,
    root: PathBuf,
    inventory: SoftwareInventory,
}

fn write_file(path: &Path, len: usize) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, vec![7_u8; len]).unwrap();
}

fn age(path: &Path, days: u64) {
    let then = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
    let stamp = FileTime::from_system_time(then);
    filetime::set_file_times(path, stamp, stamp).unwrap();
}

/// A secondary drive with one registered program and a handful of leftovers.
fn build_drive() -> Result<Drive> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().to_path_buf();

    let program_files = root.join("Program Files");
    let program_data = root.join("ProgramData");
    let roaming = root.join("Users").join("alice").join("AppData").join("Roaming");

    write_file(&program_files.join("Contoso").join("contoso.exe"), 500);
    write_file(&program_files.join("FooBar_old").join("settings.ini"), 300);
    fs::create_dir_all(program_data.join("EmptyThing"))?;
    write_file(&program_data.join("Microsoft").join("state.bin"), 900);
    write_file(&program_data.join("Recent").join("cache.db"), 20);
    write_file(&roaming.join("OldGame.bak").join("save.dat"), 10);
    fs::create_dir_all(root.join("Users").join("Public").join("AppData").join("Roaming"))?;

    let notes = program_data.join("Notes");
    write_file(&notes.join("a.txt"), 50);
    write_file(&notes.join("b.txt"), 50);
    age(&notes.join("a.txt"), 100);
    age(&notes.join("b.txt"), 100);
    age(&notes, 100);

    let manifest = root.join("inventory.json");
    let entries = vec![ManifestEntry {
        name: "Contoso App 2.1 x64".to_string(),
        install_location: Some(program_files.join("Contoso").to_string_lossy().to_string()),
        publisher: Some("Contoso Ltd".to_string()),
        install_date: Some("20200101".to_string()),
    }];
    fs::write(&manifest, serde_json::to_string(&entries)?)?;

    let sources: Vec<Box<dyn InventorySource>> = vec![Box::new(ManifestSource::new(&manifest))];
    let inventory = SoftwareInventory::from_sources(&sources, Utc::now());

    Ok(Drive {
        _temp: temp,
        root,
        inventory,
    })
}

fn options_for(drive: &Drive) -> ScanOptions {
    ScanOptions {
        location: ScanLocation::All,
        drive_root: Some(drive.root.clone()),
        ..ScanOptions::default()
    }
}

#[test]
fn scan_finds_leftovers_sorted_by_size() -> Result<()> {
    let drive = build_drive()?;
    let folders = run_scan(&options_for(&drive), &drive.inventory)?;

    let names = folders
        .iter()
        .map(|folder| folder.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["FooBar_old", "Notes", "OldGame.bak", "EmptyThing"]);

    let sizes = folders.iter().map(|folder| folder.size_bytes).collect::<Vec<_>>();
    assert_eq!(sizes, vec![300, 100, 10, 0]);

    let foobar = &folders[0];
    assert_eq!(foobar.risk, RiskLevel::Low);
    assert_eq!(foobar.category, ScanLocation::ProgramFiles);
    assert!(foobar.is_selected);

    let notes = &folders[1];
    assert_eq!(notes.risk, RiskLevel::High);
    assert!(!notes.is_selected);
    assert!(notes.reason.contains("Small idle"));

    assert_eq!(folders[2].category, ScanLocation::AppDataRoaming);
    assert!(folders
        .iter()
        .all(|folder| folder.is_selected == (folder.risk == RiskLevel::Low)));
    Ok(())
}

#[test]
fn idle_folder_is_still_reported_on_the_next_scan() -> Result<()> {
    let drive = build_drive()?;
    let options = ScanOptions {
        location: ScanLocation::ProgramData,
        ..options_for(&drive)
    };

    let first = run_scan(&options, &drive.inventory)?;
    let second = run_scan(&options, &drive.inventory)?;

    for folders in [&first, &second] {
        let notes = folders
            .iter()
            .find(|folder| folder.name == "Notes")
            .expect("idle folder reported");
        assert_eq!(notes.risk, RiskLevel::High);
    }
    Ok(())
}

#[test]
fn progress_is_monotonic_and_completes() -> Result<()> {
    let drive = build_drive()?;
    let mut percents = Vec::new();
    let mut statuses = Vec::new();

    run_scan_with_callback(&options_for(&drive), &drive.inventory, |event| match event {
        ProgressEvent::Progress { percent } => percents.push(percent),
        ProgressEvent::Status { text } => statuses.push(text),
    })?;

    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(percents.last().copied(), Some(100));
    assert!(statuses.iter().any(|text| text.starts_with("Scanning ")));
    Ok(())
}

#[test]
fn excludes_and_extra_protected_names_are_honoured() -> Result<()> {
    let drive = build_drive()?;
    let options = ScanOptions {
        excludes: vec!["*.bak".to_string()],
        extra_protected_names: vec!["emptything".to_string()],
        ..options_for(&drive)
    };

    let folders = run_scan(&options, &drive.inventory)?;
    let names = folders
        .iter()
        .map(|folder| folder.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["FooBar_old", "Notes"]);
    Ok(())
}

#[test]
fn cancelled_scan_returns_no_results() -> Result<()> {
    let drive = build_drive()?;
    let token = CancelToken::new();
    token.cancel();
    let options = ScanOptions {
        cancel_flag: Some(token),
        ..options_for(&drive)
    };

    let outcome = run_scan(&options, &drive.inventory);
    assert!(matches!(outcome, Err(SweepError::Cancelled)));
    Ok(())
}

#[test]
fn drive_without_known_layout_is_an_error() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let inventory = SoftwareInventory::from_sources(&[], Utc::now());
    let options = ScanOptions {
        location: ScanLocation::ProgramFiles,
        drive_root: Some(temp.path().to_path_buf()),
        ..ScanOptions::default()
    };

    let outcome = run_scan(&options, &inventory);
    assert!(matches!(outcome, Err(SweepError::NoBaseFolders { .. })));
    Ok(())
}

#[test]
fn cleanup_removes_selected_folders_and_updates_report() -> Result<()> {
    let drive = build_drive()?;
    let folders = run_scan(&options_for(&drive), &drive.inventory)?;
    let mut report = ScanReport::new(
        ScanLocation::All,
        Some(drive.root.to_string_lossy().to_string()),
        folders,
    );

    let options = CleanupOptions {
        use_recoverable_delete: false,
        base_delay: Duration::from_millis(1),
        ..CleanupOptions::default()
    };
    let result = run_cleanup(&report.selected(), &options);

    assert_eq!(result.deleted_count(), 3);
    assert_eq!(result.failed_count(), 0);
    assert_eq!(result.total_bytes_freed, 310);
    assert!(!result.cancelled);
    assert!(!drive.root.join("Program Files").join("FooBar_old").exists());
    assert!(drive.root.join("Program Files").join("Contoso").exists());
    assert!(drive.root.join("ProgramData").join("Notes").exists());

    report.remove_deleted(&result);
    let remaining = report
        .folders
        .iter()
        .map(|folder| folder.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(remaining, vec!["Notes"]);
    Ok(())
}
