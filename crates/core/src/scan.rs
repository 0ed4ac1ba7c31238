use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::classify::{Classifier, ClassifierThresholds};
use crate::config::SweepConfig;
use crate::error::SweepError;
use crate::inventory::SoftwareInventory;
use crate::locations::{is_protected_name, resolve_base_folders, BaseFolder};
use crate::model::{OrphanFolder, ProgressEvent, ScanLocation};
use crate::progress::{emit_progress, emit_status, is_cancelled, CancelToken, ProgressTracker};

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub location: ScanLocation,
    pub drive_root: Option<PathBuf>,
    pub thresholds: ClassifierThresholds,
    pub excludes: Vec<String>,
    pub extra_protected_names: Vec<String>,
    pub cancel_flag: Option<CancelToken>,
}

impl ScanOptions {
    pub fn from_config(config: &SweepConfig, location: ScanLocation) -> Self {
        Self {
            location,
            thresholds: config.thresholds,
            excludes: config.excludes.clone(),
            extra_protected_names: config.extra_protected_names.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    name: String,
}

pub fn run_scan(
    options: &ScanOptions,
    inventory: &SoftwareInventory,
) -> Result<Vec<OrphanFolder>, SweepError> {
    run_scan_with_callback(options, inventory, |_| {})
}

/// Classifies every immediate subfolder of the location's base folders and
/// returns the orphans, largest first. Cancellation discards everything
/// found so far.
pub fn run_scan_with_callback<F>(
    options: &ScanOptions,
    inventory: &SoftwareInventory,
    mut on_event: F,
) -> Result<Vec<OrphanFolder>, SweepError>
where
    F: FnMut(ProgressEvent),
{
    validate_scan_options(options)?;
    let started = Instant::now();

    let mut warnings = Vec::new();
    let excludes = ExcludeMatcher::new(&options.excludes, &mut warnings);
    for warning in &warnings {
        warn!("{warning}");
    }

    let bases = resolve_base_folders(options.location, options.drive_root.as_deref());
    if bases.is_empty() {
        return Err(SweepError::NoBaseFolders {
            location: options.location,
            root: options
                .drive_root
                .as_ref()
                .map(|root| root.display().to_string())
                .unwrap_or_else(|| "the system drive".to_string()),
        });
    }

    emit_status(&mut on_event, "Counting folders...");
    let listings = bases
        .iter()
        .map(|base| (base, list_candidates(&base.path)))
        .collect::<Vec<_>>();
    let total = listings
        .iter()
        .map(|(_, listing)| listing.as_ref().map_or(0, Vec::len) as u64)
        .sum();
    let mut tracker = ProgressTracker::new(total);

    let classifier = Classifier::new(inventory).with_thresholds(options.thresholds);
    let mut folders = Vec::new();

    for (base, listing) in listings {
        let candidates = match listing {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!("base folder {} skipped: {}", base.path.display(), err);
                emit_status(
                    &mut on_event,
                    format!("Skipped {} ({err})", base.path.display()),
                );
                continue;
            }
        };

        emit_status(&mut on_event, format!("Scanning {}", base.path.display()));
        for candidate in candidates {
            if is_cancelled(options.cancel_flag.as_ref()) {
                info!("scan cancelled after {} orphan(s)", folders.len());
                return Err(SweepError::Cancelled);
            }

            if let Some(folder) = examine_candidate(&classifier, base, &candidate, &excludes, options)
            {
                folders.push(folder);
            }
            emit_progress(&mut on_event, tracker.advance());
        }
    }
    emit_progress(&mut on_event, tracker.finish());

    // Stable sort keeps discovery order for equal sizes.
    folders.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));

    info!(
        "scan of {} finished in {} ms: {} candidate(s), {} orphan(s)",
        options.location,
        started.elapsed().as_millis(),
        total,
        folders.len()
    );
    emit_status(
        &mut on_event,
        format!("Found {} orphan folder(s)", folders.len()),
    );
    Ok(folders)
}

fn examine_candidate(
    classifier: &Classifier<'_>,
    base: &BaseFolder,
    candidate: &Candidate,
    excludes: &ExcludeMatcher,
    options: &ScanOptions,
) -> Option<OrphanFolder> {
    if is_protected_name(&candidate.name, &options.extra_protected_names) {
        debug!("protected folder skipped: {}", candidate.path.display());
        return None;
    }
    if excludes.is_excluded(&candidate.path) {
        debug!("excluded folder skipped: {}", candidate.path.display());
        return None;
    }

    let verdict = classifier.classify(&candidate.path, &candidate.name);
    let classification = verdict.classification;
    if !classification.is_orphan {
        debug!(
            "kept {} ({:?}): {}",
            candidate.path.display(),
            classification.rule,
            classification.reason
        );
        return None;
    }

    let (size_bytes, last_modified) = match &verdict.snapshot {
        Some(snapshot) => (snapshot.total_bytes, snapshot.modified),
        None => (folder_size(&candidate.path), modified_time(&candidate.path)),
    };
    debug!(
        "orphan {} ({:?}, {}): {}",
        candidate.path.display(),
        classification.rule,
        classification.risk,
        classification.reason
    );

    Some(OrphanFolder::new(
        candidate.path.to_string_lossy().to_string(),
        candidate.name.clone(),
        base.category,
        size_bytes,
        last_modified,
        classification.reason,
        classification.risk,
    ))
}

/// Directories directly under `base`, sorted by name. Symlinks and
/// junctions are not candidates.
fn list_candidates(base: &Path) -> io::Result<Vec<Candidate>> {
    let mut candidates = fs::read_dir(base)?
        .filter_map(|item| match item {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!("entry read failed under {}: {}", base.display(), err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .map(|entry| Candidate {
            name: entry.file_name().to_string_lossy().to_string(),
            path: entry.path(),
        })
        .collect::<Vec<_>>();
    candidates.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(candidates)
}

/// Recursive sum of file lengths. Unreadable entries count as zero.
pub fn folder_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.metadata().map(|meta| meta.len()).unwrap_or(0))
        .fold(0_u64, u64::saturating_add)
}

fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// User exclusions. Glob patterns are tested case-insensitively against the
/// folder name and the full path; plain words are case-insensitive
/// substrings of the path.
struct ExcludeMatcher {
    globs: Option<GlobSet>,
    words: Vec<String>,
}

impl ExcludeMatcher {
    fn new(patterns: &[String], warnings: &mut Vec<String>) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut glob_count = 0;
        let mut words = Vec::new();

        for pattern in patterns.iter().map(|pattern| pattern.trim()) {
            if pattern.is_empty() {
                continue;
            }
            if !has_glob_syntax(pattern) {
                words.push(pattern.to_lowercase());
                continue;
            }
            match GlobBuilder::new(pattern).case_insensitive(true).build() {
                Ok(glob) => {
                    builder.add(glob);
                    glob_count += 1;
                }
                Err(err) => {
                    warnings.push(format!(
                        "exclude pattern '{pattern}' is not a valid glob ({err}); matching it literally"
                    ));
                    words.push(pattern.to_lowercase());
                }
            }
        }

        let globs = if glob_count == 0 {
            None
        } else {
            match builder.build() {
                Ok(set) => Some(set),
                Err(err) => {
                    warnings.push(format!("exclude globs disabled: {err}"));
                    None
                }
            }
        };
        Self { globs, words }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.matches_glob(path) || self.matches_word(path)
    }

    fn matches_glob(&self, path: &Path) -> bool {
        let Some(globs) = &self.globs else {
            return false;
        };
        path.file_name().is_some_and(|name| globs.is_match(name)) || globs.is_match(path)
    }

    fn matches_word(&self, path: &Path) -> bool {
        if self.words.is_empty() {
            return false;
        }
        let text = path.to_string_lossy().to_lowercase();
        self.words.iter().any(|word| text.contains(word.as_str()))
    }
}

fn has_glob_syntax(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', ']', '{', '}'])
}

fn validate_scan_options(options: &ScanOptions) -> Result<(), SweepError> {
    options
        .thresholds
        .validate()
        .map_err(SweepError::InvalidOptions)?;
    if options.drive_root.as_deref() == Some(Path::new("")) {
        return Err(SweepError::InvalidOptions(
            "drive root must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use super::{folder_size, validate_scan_options, ExcludeMatcher, ScanOptions};
    use crate::classify::ClassifierThresholds;

    #[test]
    fn exclude_matcher_matches_glob_name_and_substring() {
        let mut warnings = Vec::new();
        let matcher = ExcludeMatcher::new(
            &[
                "steam*".to_string(),
                "[".to_string(),
                "keepme".to_string(),
            ],
            &mut warnings,
        );

        assert!(matcher.is_excluded(Path::new("D:/Program Files/SteamLibrary")));
        assert!(matcher.is_excluded(Path::new("D:/ProgramData/KeepMe Tool")));
        assert!(!matcher.is_excluded(Path::new("D:/ProgramData/Contoso")));
        assert!(!warnings.is_empty());

        let none = ExcludeMatcher::new(&[" ".to_string()], &mut warnings);
        assert!(!none.is_excluded(Path::new("D:/ProgramData/Contoso")));
    }

    #[test]
    fn folder_size_sums_nested_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("a/b")).unwrap();
        fs::write(temp.path().join("one.bin"), vec![0_u8; 100]).unwrap();
        fs::write(temp.path().join("a/b/two.bin"), vec![0_u8; 23]).unwrap();
        assert_eq!(folder_size(temp.path()), 123);
        assert_eq!(folder_size(&temp.path().join("missing")), 0);
    }

    #[test]
    fn rejects_invalid_thresholds() {
        let options = ScanOptions {
            thresholds: ClassifierThresholds {
                idle_access_days: 0,
                ..ClassifierThresholds::default()
            },
            ..ScanOptions::default()
        };
        assert!(validate_scan_options(&options).is_err());

        let options = ScanOptions {
            drive_root: Some(PathBuf::new()),
            ..ScanOptions::default()
        };
        assert!(validate_scan_options(&options).is_err());
    }
}
