use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::ProgramRecord;
use crate::registry;

const DEFAULT_INVENTORY_AGE_DAYS: i64 = 365 * 2;

const ARCHITECTURE_MARKERS: &[&str] = &[
    "x64", "x86", "x86_64", "amd64", "arm64", "win32", "win64", "32-bit", "64-bit", "32bit",
    "64bit",
];

const TRAILING_WORDS: &[&str] = &["setup", "installer", "update", "updater"];

/// A registration store the inventory can be merged from.
pub trait InventorySource {
    fn name(&self) -> String;

    fn collect(&self, builder: &mut InventoryBuilder) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InventoryBuilder {
    programs: Vec<ProgramRecord>,
    known_names: BTreeSet<String>,
    known_install_paths: BTreeSet<String>,
    oldest_install_date: Option<NaiveDate>,
}

impl InventoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_program(&mut self, record: ProgramRecord) {
        self.add_name(&record.name);
        if let Some(publisher) = &record.publisher {
            self.add_raw_name(publisher);
        }
        if let Some(location) = &record.install_location {
            self.add_install_path(location);
        }
        if let Some(date) = record.install_date {
            self.oldest_install_date = Some(match self.oldest_install_date {
                Some(current) => current.min(date),
                None => date,
            });
        }

        let duplicate = self.programs.iter().any(|existing| {
            existing.name.eq_ignore_ascii_case(&record.name)
                && existing.install_location == record.install_location
        });
        if !duplicate {
            self.programs.push(record);
        }
    }

    /// Adds the display name and its normalized variant.
    pub fn add_name(&mut self, name: &str) {
        self.add_raw_name(name);
        let normalized = normalize_program_name(name);
        if !normalized.is_empty() {
            self.known_names.insert(normalized);
        }
    }

    pub fn add_install_path(&mut self, path: &str) {
        if let Some(key) = install_path_key(path) {
            self.known_install_paths.insert(key);
        }
    }

    fn add_raw_name(&mut self, name: &str) {
        let lowered = name.trim().to_lowercase();
        if !lowered.is_empty() {
            self.known_names.insert(lowered);
        }
    }

    /// Merges one source. A failing source is logged and skipped; whatever it
    /// added before failing is kept.
    pub fn merge(&mut self, source: &dyn InventorySource) -> bool {
        let before = self.known_names.len();
        match source.collect(self) {
            Ok(()) => {
                debug!(
                    "inventory source {} added {} name(s)",
                    source.name(),
                    self.known_names.len().saturating_sub(before)
                );
                true
            }
            Err(err) => {
                warn!("inventory source {} skipped: {err:#}", source.name());
                false
            }
        }
    }

    pub fn build(self, now: DateTime<Utc>) -> SoftwareInventory {
        let oldest_install_date = self
            .oldest_install_date
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|datetime| datetime.and_utc())
            .unwrap_or_else(|| now - Duration::days(DEFAULT_INVENTORY_AGE_DAYS));

        SoftwareInventory {
            programs: self.programs,
            known_names: self.known_names,
            known_install_paths: self.known_install_paths,
            oldest_install_date,
        }
    }
}

/// Session snapshot of installed software. Never mutated after `build`.
#[derive(Debug, Clone)]
pub struct SoftwareInventory {
    programs: Vec<ProgramRecord>,
    known_names: BTreeSet<String>,
    known_install_paths: BTreeSet<String>,
    oldest_install_date: DateTime<Utc>,
}

impl SoftwareInventory {
    /// Reads every registration source available on this platform.
    pub fn build() -> Self {
        Self::build_with_manifests(&[])
    }

    pub fn build_with_manifests(manifests: &[PathBuf]) -> Self {
        let mut sources = registry::platform_sources();
        sources.extend(
            manifests
                .iter()
                .map(|path| Box::new(ManifestSource::new(path)) as Box<dyn InventorySource>),
        );
        Self::from_sources(&sources, Utc::now())
    }

    pub fn from_sources(sources: &[Box<dyn InventorySource>], now: DateTime<Utc>) -> Self {
        let mut builder = InventoryBuilder::new();
        let merged = sources
            .iter()
            .filter(|source| builder.merge(source.as_ref()))
            .count();
        let inventory = builder.build(now);
        info!(
            "software inventory built from {merged}/{} source(s): {} program(s), {} name(s), {} install path(s)",
            sources.len(),
            inventory.programs.len(),
            inventory.known_names.len(),
            inventory.known_install_paths.len()
        );
        inventory
    }

    pub fn programs(&self) -> &[ProgramRecord] {
        &self.programs
    }

    pub fn known_names(&self) -> impl Iterator<Item = &str> {
        self.known_names.iter().map(String::as_str)
    }

    pub fn oldest_install_date(&self) -> DateTime<Utc> {
        self.oldest_install_date
    }

    /// Known install path that equals `path` or one of its ancestors.
    pub fn install_path_covering(&self, path: &str) -> Option<&str> {
        let key = path_key(path);
        self.known_install_paths
            .iter()
            .find(|known| key == **known || is_nested_under(&key, known))
            .map(String::as_str)
    }

    /// Known install path nested somewhere below `path`.
    pub fn install_path_within(&self, path: &str) -> Option<&str> {
        let key = path_key(path);
        self.known_install_paths
            .iter()
            .find(|known| is_nested_under(known, &key))
            .map(String::as_str)
    }

    /// Known name equal to, containing, or contained in `folder_name`.
    pub fn matching_name(&self, folder_name: &str) -> Option<&str> {
        let folder = folder_name.trim().to_lowercase();
        if folder.is_empty() {
            return None;
        }
        if let Some(exact) = self.known_names.get(&folder) {
            return Some(exact.as_str());
        }
        self.known_names
            .iter()
            .find(|known| known.contains(folder.as_str()) || folder.contains(known.as_str()))
            .map(String::as_str)
    }

    /// Known name that prefixes `base_name` once both are reduced to their
    /// alphanumeric characters.
    pub fn known_name_prefix_of(&self, base_name: &str) -> Option<&str> {
        let base = compact(base_name);
        if base.is_empty() {
            return None;
        }
        self.known_names
            .iter()
            .find(|known| {
                let known_compact = compact(known);
                known_compact.len() >= 3 && base.starts_with(&known_compact)
            })
            .map(String::as_str)
    }

    pub fn summary(&self) -> InventorySummary {
        InventorySummary {
            program_count: self.programs.len(),
            known_name_count: self.known_names.len(),
            known_install_path_count: self.known_install_paths.len(),
            oldest_install_date: self.oldest_install_date,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventorySummary {
    pub program_count: usize,
    pub known_name_count: usize,
    pub known_install_path_count: usize,
    pub oldest_install_date: DateTime<Utc>,
}

/// One program in a JSON inventory manifest. Dates use the registry's
/// `YYYYMMDD` encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub name: String,
    #[serde(default)]
    pub install_location: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub install_date: Option<String>,
}

impl From<&ProgramRecord> for ManifestEntry {
    fn from(record: &ProgramRecord) -> Self {
        Self {
            name: record.name.clone(),
            install_location: record.install_location.clone(),
            publisher: record.publisher.clone(),
            install_date: record
                .install_date
                .map(|date| date.format("%Y%m%d").to_string()),
        }
    }
}

pub struct ManifestSource {
    path: PathBuf,
}

impl ManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl InventorySource for ManifestSource {
    fn name(&self) -> String {
        format!("manifest {}", self.path.display())
    }

    fn collect(&self, builder: &mut InventoryBuilder) -> Result<()> {
        for entry in read_manifest(&self.path)? {
            if entry.name.trim().is_empty() {
                continue;
            }
            builder.add_program(ProgramRecord {
                install_date: entry.install_date.as_deref().and_then(parse_install_date),
                name: entry.name,
                install_location: entry.install_location,
                publisher: entry.publisher,
            });
        }
        Ok(())
    }
}

pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read inventory manifest {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("failed to parse inventory manifest {}", path.display()))
}

pub fn write_manifest(inventory: &SoftwareInventory, path: &Path) -> Result<()> {
    let entries = inventory
        .programs()
        .iter()
        .map(ManifestEntry::from)
        .collect::<Vec<_>>();
    let payload =
        serde_json::to_string_pretty(&entries).context("failed to serialize inventory manifest")?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write inventory manifest {}", path.display()))
}

/// Parses the 8-digit `YYYYMMDD` install date encoding.
pub fn parse_install_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

/// Lowercases `name` and strips trailing version numbers, architecture
/// markers and setup/installer/update words.
pub fn normalize_program_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut tokens = lowered.split_whitespace().collect::<Vec<_>>();

    while tokens.len() > 1 {
        let Some(last) = tokens.last() else {
            break;
        };
        let token = last.trim_matches(|ch: char| matches!(ch, '-' | '_' | ',' | ':'));
        let bare = token.trim_start_matches('(').trim_end_matches(')');
        if token.is_empty()
            || is_version_token(bare)
            || ARCHITECTURE_MARKERS.contains(&bare)
            || TRAILING_WORDS.contains(&bare)
        {
            tokens.pop();
            continue;
        }
        break;
    }

    tokens.join(" ")
}

fn is_version_token(token: &str) -> bool {
    let digits = token.strip_prefix('v').unwrap_or(token);
    !digits.is_empty()
        && digits
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_digit()))
}

/// Comparison key for paths: lowercase, forward slashes, no trailing
/// separator.
pub fn path_key(path: &str) -> String {
    path.trim()
        .trim_matches('"')
        .to_lowercase()
        .replace('\\', "/")
        .trim_end_matches('/')
        .to_string()
}

fn install_path_key(raw: &str) -> Option<String> {
    let key = path_key(raw);
    let bare_drive = key.len() == 2 && key.ends_with(':');
    if key.is_empty() || bare_drive {
        return None;
    }
    Some(key)
}

fn is_nested_under(path_key: &str, ancestor_key: &str) -> bool {
    path_key.len() > ancestor_key.len()
        && path_key.starts_with(ancestor_key)
        && path_key.as_bytes()[ancestor_key.len()] == b'/'
}

fn compact(value: &str) -> String {
    value
        .chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    use super::{
        normalize_program_name, parse_install_date, path_key, InventoryBuilder, InventorySource,
        SoftwareInventory,
    };
    use crate::model::ProgramRecord;

    fn record(name: &str, location: Option<&str>, date: Option<NaiveDate>) -> ProgramRecord {
        ProgramRecord {
            name: name.to_string(),
            install_location: location.map(str::to_string),
            publisher: None,
            install_date: date,
        }
    }

    struct FailingSource;

    impl InventorySource for FailingSource {
        fn name(&self) -> String {
            "failing".to_string()
        }

        fn collect(&self, builder: &mut InventoryBuilder) -> Result<()> {
            builder.add_name("Partial Product");
            Err(anyhow!("registry hive is corrupt"))
        }
    }

    struct StaticSource(Vec<ProgramRecord>);

    impl InventorySource for StaticSource {
        fn name(&self) -> String {
            "static".to_string()
        }

        fn collect(&self, builder: &mut InventoryBuilder) -> Result<()> {
            for record in &self.0 {
                builder.add_program(record.clone());
            }
            Ok(())
        }
    }

    #[test]
    fn normalization_strips_versions_architecture_and_setup_words() {
        assert_eq!(normalize_program_name("7-Zip 23.01 (x64)"), "7-zip");
        assert_eq!(normalize_program_name("Foo Bar v1.2.3"), "foo bar");
        assert_eq!(normalize_program_name("Widget (2)"), "widget");
        assert_eq!(normalize_program_name("Acme Tools 32-bit Setup"), "acme tools");
        assert_eq!(normalize_program_name("Game Updater"), "game");
        assert_eq!(normalize_program_name("Setup"), "setup");
    }

    #[test]
    fn parses_only_eight_digit_dates() {
        assert_eq!(
            parse_install_date("20230115"),
            NaiveDate::from_ymd_opt(2023, 1, 15)
        );
        assert_eq!(parse_install_date("2023-01-15"), None);
        assert_eq!(parse_install_date("20231345"), None);
        assert_eq!(parse_install_date(""), None);
    }

    #[test]
    fn oldest_date_defaults_to_two_years_back() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let inventory = InventoryBuilder::new().build(now);
        assert_eq!(inventory.oldest_install_date(), now - Duration::days(730));
    }

    #[test]
    fn oldest_date_is_minimum_of_dated_entries() {
        let mut builder = InventoryBuilder::new();
        builder.add_program(record("A", None, NaiveDate::from_ymd_opt(2022, 5, 1)));
        builder.add_program(record("B", None, NaiveDate::from_ymd_opt(2019, 3, 9)));
        builder.add_program(record("C", None, None));
        let inventory = builder.build(Utc::now());
        assert_eq!(
            inventory.oldest_install_date(),
            Utc.with_ymd_and_hms(2019, 3, 9, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn install_paths_are_trimmed_and_case_insensitive() {
        let mut builder = InventoryBuilder::new();
        builder.add_program(record("Foo Bar", Some("C:\\Apps\\FooBar\\"), None));
        let inventory = builder.build(Utc::now());

        assert!(inventory.install_path_covering("c:\\apps\\foobar").is_some());
        assert!(inventory
            .install_path_covering("C:\\Apps\\FooBar\\plugins")
            .is_some());
        assert!(inventory.install_path_covering("C:\\Apps\\FooBar_old").is_none());
        assert!(inventory.install_path_within("C:\\Apps").is_some());
    }

    #[test]
    fn bare_drive_install_locations_are_ignored() {
        let mut builder = InventoryBuilder::new();
        builder.add_install_path("C:\\");
        builder.add_install_path("  ");
        let inventory = builder.build(Utc::now());
        assert_eq!(inventory.summary().known_install_path_count, 0);
    }

    #[test]
    fn name_matching_is_bidirectional() {
        let mut builder = InventoryBuilder::new();
        builder.add_name("Contoso Studio 2.0");
        let inventory = builder.build(Utc::now());

        assert!(inventory.matching_name("CONTOSO STUDIO").is_some());
        assert!(inventory.matching_name("Contoso").is_some());
        assert!(inventory.matching_name("Contoso Studio Cache").is_some());
        assert!(inventory.matching_name("Fabrikam").is_none());
    }

    #[test]
    fn failing_source_does_not_abort_build() {
        let sources: Vec<Box<dyn InventorySource>> = vec![
            Box::new(FailingSource),
            Box::new(StaticSource(vec![record("Zed Editor", None, None)])),
        ];
        let inventory = SoftwareInventory::from_sources(&sources, Utc::now());

        assert!(inventory.matching_name("Zed Editor").is_some());
        assert!(inventory.matching_name("Partial Product").is_some());
    }

    #[test]
    fn duplicate_programs_are_coalesced() {
        let sources: Vec<Box<dyn InventorySource>> = vec![
            Box::new(StaticSource(vec![record("Tool", Some("C:\\Tool"), None)])),
            Box::new(StaticSource(vec![record("TOOL", Some("C:\\Tool"), None)])),
        ];
        let inventory = SoftwareInventory::from_sources(&sources, Utc::now());
        assert_eq!(inventory.programs().len(), 1);
    }

    #[test]
    fn path_key_normalizes_separators() {
        assert_eq!(path_key("C:\\Program Files\\Foo\\"), "c:/program files/foo");
        assert_eq!(path_key("\"D:\\Apps\""), "d:/apps");
    }
}
