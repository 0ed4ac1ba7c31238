use std::fmt;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const REPORT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgramRecord {
    pub name: String,
    #[serde(default)]
    pub install_location: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub install_date: Option<NaiveDate>,
}

/// Confidence that deleting a folder is safe. `Low` is the only tier that
/// is ever pre-selected for deletion.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn label(self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanLocation {
    ProgramFiles,
    ProgramFilesX86,
    AppDataRoaming,
    AppDataLocal,
    ProgramData,
    CommonFiles,
    #[default]
    All,
}

impl ScanLocation {
    pub const CATEGORIES: [ScanLocation; 6] = [
        ScanLocation::ProgramFiles,
        ScanLocation::ProgramFilesX86,
        ScanLocation::AppDataRoaming,
        ScanLocation::AppDataLocal,
        ScanLocation::ProgramData,
        ScanLocation::CommonFiles,
    ];

    pub fn categories(self) -> Vec<ScanLocation> {
        match self {
            ScanLocation::All => Self::CATEGORIES.to_vec(),
            single => vec![single],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ScanLocation::ProgramFiles => "Program Files",
            ScanLocation::ProgramFilesX86 => "Program Files (x86)",
            ScanLocation::AppDataRoaming => "AppData (Roaming)",
            ScanLocation::AppDataLocal => "AppData (Local)",
            ScanLocation::ProgramData => "ProgramData",
            ScanLocation::CommonFiles => "Common Files",
            ScanLocation::All => "All locations",
        }
    }
}

impl fmt::Display for ScanLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrphanFolder {
    pub path: String,
    pub name: String,
    pub category: ScanLocation,
    pub size_bytes: u64,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    pub reason: String,
    pub risk: RiskLevel,
    #[serde(default)]
    pub is_selected: bool,
}

impl OrphanFolder {
    pub fn new(
        path: String,
        name: String,
        category: ScanLocation,
        size_bytes: u64,
        last_modified: Option<DateTime<Utc>>,
        reason: String,
        risk: RiskLevel,
    ) -> Self {
        Self {
            path,
            name,
            category,
            size_bytes,
            last_modified,
            reason,
            is_selected: risk == RiskLevel::Low,
            risk,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanupFailure {
    pub folder: OrphanFolder,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CleanupResult {
    pub deleted_folders: Vec<OrphanFolder>,
    pub failed_folders: Vec<CleanupFailure>,
    pub total_bytes_freed: u64,
    #[serde(default)]
    pub cancelled: bool,
}

impl CleanupResult {
    pub fn deleted_count(&self) -> usize {
        self.deleted_folders.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_folders.len()
    }

    /// One line per failure, at most `limit` lines, plus a trailer counting
    /// the failures left out.
    pub fn failure_summary(&self, limit: usize) -> Vec<String> {
        let mut lines = self
            .failed_folders
            .iter()
            .take(limit)
            .map(|failure| format!("{}: {}", failure.folder.name, failure.error))
            .collect::<Vec<_>>();
        let hidden = self.failed_folders.len().saturating_sub(limit);
        if hidden > 0 {
            lines.push(format!("... and {hidden} more"));
        }
        lines
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status { text: String },
    Progress { percent: u8 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanReport {
    pub report_version: String,
    pub generated_at: String,
    pub location: ScanLocation,
    #[serde(default)]
    pub drive_root: Option<String>,
    pub folders: Vec<OrphanFolder>,
}

impl ScanReport {
    pub fn new(location: ScanLocation, drive_root: Option<String>, folders: Vec<OrphanFolder>) -> Self {
        Self {
            report_version: REPORT_VERSION.to_string(),
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            location,
            drive_root,
            folders,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.folders.iter().map(|folder| folder.size_bytes).sum()
    }

    pub fn selected(&self) -> Vec<OrphanFolder> {
        self.folders
            .iter()
            .filter(|folder| folder.is_selected)
            .cloned()
            .collect()
    }

    pub fn remove_deleted(&mut self, result: &CleanupResult) {
        self.folders.retain(|folder| {
            !result
                .deleted_folders
                .iter()
                .any(|deleted| deleted.path == folder.path)
        });
    }
}
