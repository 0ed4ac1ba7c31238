use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::CleanupSettings;
use crate::model::{CleanupFailure, CleanupResult, OrphanFolder, ProgressEvent};
use crate::progress::{emit_progress, emit_status, is_cancelled, CancelToken, ProgressTracker};

#[derive(Debug, Error)]
pub enum RemoveError {
    #[error("recoverable deletion unavailable: {0}")]
    TrashUnavailable(String),
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refusing to delete {}: path is too close to a volume root", .0.display())]
    Refused(PathBuf),
}

impl RemoveError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The two ways a folder can be removed. Implementations must not retry;
/// the executor owns the retry policy.
pub trait FolderRemover {
    /// Moves `path` to the recoverable-deletion facility. Only a failure of
    /// the facility itself may be reported as `TrashUnavailable`.
    fn move_to_trash(&self, path: &Path) -> Result<(), RemoveError>;

    fn remove_permanently(&self, path: &Path) -> Result<(), RemoveError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRemover;

impl FolderRemover for SystemRemover {
    fn move_to_trash(&self, path: &Path) -> Result<(), RemoveError> {
        fs::symlink_metadata(path).map_err(|err| RemoveError::io(path, err))?;
        trash::delete(path).map_err(|err| trash_error(path, err))
    }

    fn remove_permanently(&self, path: &Path) -> Result<(), RemoveError> {
        fs::symlink_metadata(path).map_err(|err| RemoveError::io(path, err))?;
        let cleared = clear_readonly_tree(path);
        debug!("cleared read-only flag on {cleared} entries under {}", path.display());
        fs::remove_dir_all(path).map_err(|err| RemoveError::io(path, err))
    }
}

/// Sorts a trash failure into "the facility is broken" and "this folder
/// cannot be moved right now". Only the former may fall back to permanent
/// deletion.
fn trash_error(path: &Path, err: trash::Error) -> RemoveError {
    match err {
        trash::Error::TargetedRoot => RemoveError::Refused(path.to_path_buf()),
        trash::Error::CouldNotAccess { target } => RemoveError::io(
            path,
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("cannot access {target}"),
            ),
        ),
        trash::Error::Os { code, description } if is_item_os_error(code) => RemoveError::io(
            path,
            io::Error::new(io::ErrorKind::PermissionDenied, description),
        ),
        #[cfg(all(
            unix,
            not(target_os = "macos"),
            not(target_os = "ios"),
            not(target_os = "android")
        ))]
        trash::Error::FileSystem {
            path: failed,
            source,
        } if failed.starts_with(path) || source.kind() == io::ErrorKind::PermissionDenied => {
            RemoveError::io(&failed, source)
        }
        other => RemoveError::TrashUnavailable(other.to_string()),
    }
}

// Win32 access denied, sharing and lock violations (bare or as HRESULT),
// and the Cocoa no-permission codes.
fn is_item_os_error(code: i32) -> bool {
    const WIN32_FACILITY: u32 = 0x8007_0000;
    let raw = code as u32;
    let code = if raw & 0xFFFF_0000 == WIN32_FACILITY {
        raw & 0xFFFF
    } else {
        raw
    };
    matches!(code, 5 | 32 | 33 | 257 | 513)
}

/// Best effort: entries that cannot be read or updated are skipped.
/// Returns how many entries were made writable.
pub fn clear_readonly_tree(path: &Path) -> usize {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| !entry.path_is_symlink())
        .filter(|entry| match clear_readonly(entry.path()) {
            Ok(changed) => changed,
            Err(err) => {
                debug!("cannot clear read-only on {}: {}", entry.path().display(), err);
                false
            }
        })
        .count()
}

#[cfg_attr(not(unix), allow(clippy::permissions_set_readonly_false))]
fn clear_readonly(path: &Path) -> io::Result<bool> {
    let mut permissions = fs::symlink_metadata(path)?.permissions();
    if !permissions.readonly() {
        return Ok(false);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(permissions.mode() | 0o200);
    }
    #[cfg(not(unix))]
    {
        permissions.set_readonly(false);
    }

    fs::set_permissions(path, permissions)?;
    Ok(true)
}

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub use_recoverable_delete: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cancel_flag: Option<CancelToken>,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self::from_settings(&CleanupSettings::default())
    }
}

impl CleanupOptions {
    pub fn from_settings(settings: &CleanupSettings) -> Self {
        Self {
            use_recoverable_delete: settings.use_recoverable_delete,
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay(),
            cancel_flag: None,
        }
    }
}

enum Outcome {
    Deleted,
    Failed(String),
    Cancelled,
}

pub fn run_cleanup(folders: &[OrphanFolder], options: &CleanupOptions) -> CleanupResult {
    run_cleanup_with_callback(folders, options, |_| {})
}

pub fn run_cleanup_with_callback<F>(
    folders: &[OrphanFolder],
    options: &CleanupOptions,
    on_event: F,
) -> CleanupResult
where
    F: FnMut(ProgressEvent),
{
    run_cleanup_with_remover(folders, options, &SystemRemover, on_event)
}

/// Deletes `folders` one at a time in the given order. Per-folder failures
/// are recorded in the result; nothing here returns early on error.
pub fn run_cleanup_with_remover<F>(
    folders: &[OrphanFolder],
    options: &CleanupOptions,
    remover: &dyn FolderRemover,
    mut on_event: F,
) -> CleanupResult
where
    F: FnMut(ProgressEvent),
{
    let started = Instant::now();
    let mut result = CleanupResult::default();
    let mut tracker = ProgressTracker::new(folders.len() as u64);
    info!(
        "cleanup of {} folder(s) started (recoverable: {})",
        folders.len(),
        options.use_recoverable_delete
    );

    for folder in folders {
        if is_cancelled(options.cancel_flag.as_ref()) {
            result.cancelled = true;
            break;
        }

        emit_status(&mut on_event, format!("Deleting {}", folder.path));
        match delete_with_retries(folder, options, remover) {
            Outcome::Deleted => {
                debug!("deleted {}", folder.path);
                result.total_bytes_freed = result.total_bytes_freed.saturating_add(folder.size_bytes);
                result.deleted_folders.push(folder.clone());
            }
            Outcome::Failed(error) => {
                warn!("giving up on {}: {}", folder.path, error);
                result.failed_folders.push(CleanupFailure {
                    folder: folder.clone(),
                    error,
                });
            }
            Outcome::Cancelled => {
                result.cancelled = true;
                break;
            }
        }
        emit_progress(&mut on_event, tracker.advance());
    }

    if result.cancelled {
        info!("cleanup cancelled");
        emit_status(&mut on_event, "Cleanup cancelled");
    } else {
        emit_progress(&mut on_event, tracker.finish());
    }

    info!(
        "cleanup finished in {} ms: {} deleted, {} failed, {} bytes freed",
        started.elapsed().as_millis(),
        result.deleted_count(),
        result.failed_count(),
        result.total_bytes_freed
    );
    emit_status(
        &mut on_event,
        format!(
            "Deleted {} folder(s), {} failed",
            result.deleted_count(),
            result.failed_count()
        ),
    );
    result
}

fn delete_with_retries(
    folder: &OrphanFolder,
    options: &CleanupOptions,
    remover: &dyn FolderRemover,
) -> Outcome {
    let path = Path::new(&folder.path);
    if let Err(err) = check_deletable(path) {
        return Outcome::Failed(err.to_string());
    }

    let max_attempts = options.max_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = options.base_delay * attempt;
            let finished = match &options.cancel_flag {
                Some(token) => token.sleep(delay),
                None => {
                    thread::sleep(delay);
                    true
                }
            };
            if !finished {
                return Outcome::Cancelled;
            }
        }

        match attempt_delete(remover, path, options.use_recoverable_delete) {
            Ok(()) => return Outcome::Deleted,
            Err(err) => {
                warn!(
                    "attempt {attempt}/{max_attempts} to delete {} failed: {err}",
                    path.display()
                );
                last_error = err.to_string();
            }
        }
    }
    Outcome::Failed(last_error)
}

fn attempt_delete(
    remover: &dyn FolderRemover,
    path: &Path,
    use_recoverable_delete: bool,
) -> Result<(), RemoveError> {
    if use_recoverable_delete {
        match remover.move_to_trash(path) {
            Ok(()) => return Ok(()),
            Err(RemoveError::TrashUnavailable(reason)) => {
                debug!(
                    "trash unavailable for {} ({reason}); deleting permanently",
                    path.display()
                );
            }
            Err(err) => return Err(err),
        }
    }
    remover.remove_permanently(path)
}

/// Volume roots and their direct children are never deleted.
fn check_deletable(path: &Path) -> Result<(), RemoveError> {
    let depth = path
        .components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .count();
    if !path.has_root() || depth < 2 {
        return Err(RemoveError::Refused(path.to_path_buf()));
    }
    Ok(())
}
