use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::inventory::SoftwareInventory;
use crate::model::RiskLevel;

/// Substrings in a folder name that mark it as something left behind.
pub const LEFTOVER_PATTERNS: &[&str] = &[
    "uninstall",
    "_old",
    ".old",
    "backup",
    "_bak",
    ".bak",
    "_temp",
    "temp_",
    ".cache",
    "remove",
    "deleted",
    "obsolete",
    "leftover",
];

const JUNK_FILE_NAMES: &[&str] = &["desktop.ini", "thumbs.db"];
const JUNK_EXTENSIONS: &[&str] = &["log", "tmp"];
const ACTIVE_USE_EXTENSIONS: &[&str] = &["exe", "dll", "sys", "msi"];
const EXECUTABLE_EXTENSIONS: &[&str] = &[
    "exe", "dll", "sys", "msi", "com", "bat", "cmd", "ocx", "cpl", "scr", "ps1",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierThresholds {
    pub never_used_min_age_days: i64,
    pub never_used_window_days: i64,
    pub long_dormancy_days: i64,
    pub medium_dormancy_days: i64,
    pub stale_modified_days: i64,
    pub idle_access_days: i64,
    pub small_folder_max_files: u64,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            never_used_min_age_days: 180,
            never_used_window_days: 7,
            long_dormancy_days: 365,
            medium_dormancy_days: 180,
            stale_modified_days: 365,
            idle_access_days: 90,
            small_folder_max_files: 10,
        }
    }
}

impl ClassifierThresholds {
    pub fn validate(&self) -> Result<(), String> {
        let days = [
            ("never_used_min_age_days", self.never_used_min_age_days),
            ("never_used_window_days", self.never_used_window_days),
            ("long_dormancy_days", self.long_dormancy_days),
            ("medium_dormancy_days", self.medium_dormancy_days),
            ("stale_modified_days", self.stale_modified_days),
            ("idle_access_days", self.idle_access_days),
        ];
        if let Some((name, _)) = days.iter().find(|(_, value)| *value <= 0) {
            return Err(format!("{name} must be greater than zero"));
        }
        if self.medium_dormancy_days > self.long_dormancy_days {
            return Err("medium_dormancy_days must not exceed long_dormancy_days".to_string());
        }
        Ok(())
    }
}

/// The rule that decided a classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    KnownInstallPath,
    ContainsInstallPath,
    KnownName,
    LeftoverPattern,
    EmptyFolder,
    JunkOnly,
    UninstallerOnly,
    NeverUsed,
    LongDormancy,
    MediumDormancy,
    StaleUnmatched,
    PreInventoryData,
    SupersededVersion,
    SmallIdleData,
    NoSignal,
}

/// Kept folders carry `RiskLevel::High` so they can never be pre-selected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub is_orphan: bool,
    pub reason: String,
    pub risk: RiskLevel,
    pub rule: RuleId,
}

impl Classification {
    fn orphan(rule: RuleId, risk: RiskLevel, reason: impl Into<String>) -> Self {
        Self {
            is_orphan: true,
            reason: reason.into(),
            risk,
            rule,
        }
    }

    fn keep(rule: RuleId, reason: impl Into<String>) -> Self {
        Self {
            is_orphan: false,
            reason: reason.into(),
            risk: RiskLevel::High,
            rule,
        }
    }
}

/// Facts gathered from the recursive walk. Only present when every entry
/// below the folder could be read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderContents {
    pub file_count: u64,
    pub junk_only: bool,
    pub exe_names: Vec<String>,
    pub has_active_use_files: bool,
    pub has_executables: bool,
    pub newest_file_access: Option<DateTime<Utc>>,
    pub newest_file_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderSnapshot {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub total_bytes: u64,
    pub contents: Option<FolderContents>,
}

impl FolderSnapshot {
    /// Most recent access to any file in the folder. Listing the folder
    /// bumps its own access time, so that is only used when no file access
    /// is known.
    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        self.contents
            .as_ref()
            .and_then(|contents| contents.newest_file_access)
            .or(self.accessed)
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        let files = self
            .contents
            .as_ref()
            .and_then(|contents| contents.newest_file_modified);
        latest(self.modified, files)
    }
}

/// Reads folder timestamps and walks its tree. Never fails: unreadable parts
/// only remove information from the snapshot.
pub fn inspect_folder(path: &Path) -> FolderSnapshot {
    let metadata = fs::metadata(path).ok();
    let mut snapshot = FolderSnapshot {
        created: metadata
            .as_ref()
            .and_then(|meta| meta.created().ok())
            .map(DateTime::<Utc>::from),
        modified: metadata
            .as_ref()
            .and_then(|meta| meta.modified().ok())
            .map(DateTime::<Utc>::from),
        accessed: metadata
            .as_ref()
            .and_then(|meta| meta.accessed().ok())
            .map(DateTime::<Utc>::from),
        total_bytes: 0,
        contents: None,
    };

    let mut contents = FolderContents {
        junk_only: true,
        ..FolderContents::default()
    };
    let mut complete = metadata.is_some();

    for item in WalkDir::new(path).follow_links(false) {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                debug!("walk error under {}: {}", path.display(), err);
                complete = false;
                continue;
            }
        };
        if entry.depth() == 0 || !entry.file_type().is_file() {
            continue;
        }

        contents.file_count += 1;
        let file_name = entry.file_name().to_string_lossy().to_lowercase();
        let extension = Path::new(&file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_string();

        if !JUNK_FILE_NAMES.contains(&file_name.as_str())
            && !JUNK_EXTENSIONS.contains(&extension.as_str())
        {
            contents.junk_only = false;
        }
        if ACTIVE_USE_EXTENSIONS.contains(&extension.as_str()) {
            contents.has_active_use_files = true;
        }
        if EXECUTABLE_EXTENSIONS.contains(&extension.as_str()) {
            contents.has_executables = true;
        }
        if extension == "exe" {
            contents.exe_names.push(file_name.clone());
        }

        match entry.metadata() {
            Ok(meta) => {
                snapshot.total_bytes = snapshot.total_bytes.saturating_add(meta.len());
                contents.newest_file_access = latest(
                    contents.newest_file_access,
                    meta.accessed().ok().map(DateTime::<Utc>::from),
                );
                contents.newest_file_modified = latest(
                    contents.newest_file_modified,
                    meta.modified().ok().map(DateTime::<Utc>::from),
                );
            }
            Err(err) => {
                debug!("metadata read failed for {}: {}", entry.path().display(), err);
                complete = false;
            }
        }
    }

    if complete {
        snapshot.contents = Some(contents);
    }
    snapshot
}

/// Result of classifying a folder on disk. The snapshot is only taken when
/// the name and inventory checks could not decide.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub classification: Classification,
    pub snapshot: Option<FolderSnapshot>,
}

pub struct Classifier<'a> {
    inventory: &'a SoftwareInventory,
    thresholds: ClassifierThresholds,
    now: DateTime<Utc>,
}

impl<'a> Classifier<'a> {
    pub fn new(inventory: &'a SoftwareInventory) -> Self {
        Self {
            inventory,
            thresholds: ClassifierThresholds::default(),
            now: Utc::now(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: ClassifierThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn classify(&self, path: &Path, name: &str) -> Verdict {
        if let Some(classification) = self.check_inventory(path, name) {
            return Verdict {
                classification,
                snapshot: None,
            };
        }
        if let Some(classification) = check_leftover_pattern(name) {
            return Verdict {
                classification,
                snapshot: None,
            };
        }

        let snapshot = inspect_folder(path);
        let classification = self.evaluate_snapshot(name, &snapshot);
        Verdict {
            classification,
            snapshot: Some(snapshot),
        }
    }

    /// Rules 1 and 2: registered install locations and known names.
    pub fn check_inventory(&self, path: &Path, name: &str) -> Option<Classification> {
        let path_text = path.to_string_lossy();
        if let Some(known) = self.inventory.install_path_covering(&path_text) {
            return Some(Classification::keep(
                RuleId::KnownInstallPath,
                format!("Inside registered install location {known}"),
            ));
        }
        if let Some(known) = self.inventory.install_path_within(&path_text) {
            return Some(Classification::keep(
                RuleId::ContainsInstallPath,
                format!("Contains registered install location {known}"),
            ));
        }
        if let Some(known) = self.inventory.matching_name(name) {
            return Some(Classification::keep(
                RuleId::KnownName,
                format!("Matches installed software '{known}'"),
            ));
        }
        None
    }

    /// Every rule after the inventory checks, in order. The first match wins.
    pub fn evaluate(&self, name: &str, snapshot: &FolderSnapshot) -> Classification {
        check_leftover_pattern(name).unwrap_or_else(|| self.evaluate_snapshot(name, snapshot))
    }

    fn evaluate_snapshot(&self, name: &str, snapshot: &FolderSnapshot) -> Classification {
        let t = &self.thresholds;
        let contents = snapshot.contents.as_ref();

        if let Some(contents) = contents {
            if contents.file_count == 0 {
                return Classification::orphan(RuleId::EmptyFolder, RiskLevel::Low, "Empty folder");
            }
            if contents.junk_only {
                return Classification::orphan(
                    RuleId::JunkOnly,
                    RiskLevel::Low,
                    format!(
                        "Only logs, temp files and thumbnails remain ({} file(s))",
                        contents.file_count
                    ),
                );
            }
            if !contents.exe_names.is_empty()
                && contents.exe_names.iter().all(|exe| exe.contains("unins"))
            {
                return Classification::orphan(
                    RuleId::UninstallerOnly,
                    RiskLevel::Low,
                    "Only uninstaller present, main app missing",
                );
            }
        }

        let created_days = self.days_since(snapshot.created);
        let access_days = self.days_since(snapshot.last_access());

        if let (Some(created), Some(accessed)) = (created_days, access_days) {
            if created > t.never_used_min_age_days
                && (accessed - created).abs() < t.never_used_window_days
            {
                return Classification::orphan(
                    RuleId::NeverUsed,
                    RiskLevel::Low,
                    format!("Created {} months ago, never used since", created / 30),
                );
            }
        }

        let file_access_days =
            self.days_since(contents.and_then(|contents| contents.newest_file_access));
        if let Some(days) = file_access_days {
            if days > t.long_dormancy_days {
                return Classification::orphan(
                    RuleId::LongDormancy,
                    RiskLevel::Low,
                    format!("No file accessed in {days} days"),
                );
            }
            if days > t.medium_dormancy_days {
                return Classification::orphan(
                    RuleId::MediumDormancy,
                    RiskLevel::Medium,
                    format!("No file accessed in {days} days"),
                );
            }
        }

        if let Some(days) = self.days_since(snapshot.last_modified()) {
            if days > t.stale_modified_days {
                return Classification::orphan(
                    RuleId::StaleUnmatched,
                    RiskLevel::Medium,
                    format!("Not modified in {days} days and no installed software matches"),
                );
            }
        }

        if let (Some(created), Some(contents)) = (snapshot.created, contents) {
            if created < self.inventory.oldest_install_date() && !contents.has_active_use_files {
                return Classification::orphan(
                    RuleId::PreInventoryData,
                    RiskLevel::Medium,
                    "Data folder from removed program (older than every recorded install)",
                );
            }
        }

        if let (Some(base), Some(days)) = (version_suffix_base(name), access_days) {
            if days > t.idle_access_days {
                if let Some(known) = self.inventory.known_name_prefix_of(base) {
                    return Classification::orphan(
                        RuleId::SupersededVersion,
                        RiskLevel::Medium,
                        format!("Older version folder of installed '{known}', unused for {days} days"),
                    );
                }
            }
        }

        if let (Some(contents), Some(days)) = (contents, access_days) {
            if contents.file_count <= t.small_folder_max_files
                && days > t.idle_access_days
                && !contents.has_executables
            {
                return Classification::orphan(
                    RuleId::SmallIdleData,
                    RiskLevel::High,
                    format!(
                        "Small idle data folder ({} file(s), unused for {days} days)",
                        contents.file_count
                    ),
                );
            }
        }

        Classification::keep(RuleId::NoSignal, "No orphan signal")
    }

    fn days_since(&self, timestamp: Option<DateTime<Utc>>) -> Option<i64> {
        timestamp.map(|value| (self.now - value).num_days())
    }
}

/// Classifies `path` against `inventory` with default thresholds at the
/// current time.
pub fn classify(path: &Path, name: &str, inventory: &SoftwareInventory) -> Classification {
    Classifier::new(inventory).classify(path, name).classification
}

fn check_leftover_pattern(name: &str) -> Option<Classification> {
    let lowered = name.to_lowercase();
    LEFTOVER_PATTERNS
        .iter()
        .find(|pattern| lowered.contains(*pattern))
        .map(|pattern| {
            Classification::orphan(
                RuleId::LeftoverPattern,
                RiskLevel::Low,
                format!("Name contains leftover marker '{pattern}'"),
            )
        })
}

/// Name with a trailing `<sep>[v]1.2.3` suffix removed, if it has one.
pub fn version_suffix_base(name: &str) -> Option<&str> {
    static VERSION_SUFFIX: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = VERSION_SUFFIX
        .get_or_init(|| Regex::new(r"(?i)^(?P<base>.+?)[ ._-]v?\d+(?:\.\d+)*$").ok())
        .as_ref()?;
    pattern
        .captures(name)
        .and_then(|captures| captures.name("base"))
        .map(|base| base.as_str())
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
