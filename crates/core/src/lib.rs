pub mod classify;
pub mod cleanup;
pub mod config;
pub mod doctor;
pub mod error;
pub mod export;
pub mod inventory;
pub mod locations;
pub mod model;
pub mod progress;
pub mod registry;
pub mod scan;
pub mod volumes;

pub use classify::{
    classify, inspect_folder, Classification, Classifier, ClassifierThresholds, FolderSnapshot,
    RuleId, Verdict,
};
pub use cleanup::{
    run_cleanup, run_cleanup_with_callback, run_cleanup_with_remover, CleanupOptions,
    FolderRemover, RemoveError, SystemRemover,
};
pub use config::{CleanupSettings, SweepConfig};
pub use doctor::{collect_doctor_info, DoctorInfo};
pub use error::SweepError;
pub use export::{human_bytes, read_report, render_text_report, write_report, write_text_report};
pub use inventory::{
    write_manifest, InventoryBuilder, InventorySource, InventorySummary, ManifestEntry,
    ManifestSource, SoftwareInventory,
};
pub use locations::{is_protected_name, resolve_base_folders, BaseFolder};
pub use model::{
    CleanupFailure, CleanupResult, OrphanFolder, ProgramRecord, ProgressEvent, RiskLevel,
    ScanLocation, ScanReport, REPORT_VERSION,
};
pub use progress::CancelToken;
pub use scan::{folder_size, run_scan, run_scan_with_callback, ScanOptions};
pub use volumes::{list_volumes, system_root, VolumeInfo};
