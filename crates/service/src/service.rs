use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Result};
use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use orphan_sweep_core::{
    collect_doctor_info, read_report, run_cleanup_with_callback, run_scan_with_callback,
    write_report, write_text_report, CancelToken, CleanupOptions, CleanupResult, DoctorInfo, InventorySummary, OrphanFolder,
    ProgressEvent, RiskLevel, ScanLocation, ScanOptions, ScanReport, SoftwareInventory,
    SweepConfig, SweepError,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScanRequest {
    #[serde(default)]
    pub scan_id: Option<String>,
    #[serde(default)]
    pub location: ScanLocation,
    #[serde(default)]
    pub drive_root: Option<PathBuf>,
    #[serde(default)]
    pub config: SweepConfig,
    #[serde(default)]
    pub inventory_manifests: Vec<PathBuf>,
    /// Report written after every successful scan or cleanup.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CleanupRequest {
    /// Overrides the configured recycle-bin behaviour when set.
    #[serde(default)]
    pub use_recoverable_delete: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanSessionStatus {
    Scanning,
    Ready,
    Cleaning,
    Cancelled,
    Failed,
}

impl ScanSessionStatus {
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Scanning | Self::Cleaning)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEvent {
    pub seq: u64,
    pub at: String,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSessionSnapshot {
    pub scan_id: String,
    pub status: ScanSessionStatus,
    pub location: ScanLocation,
    pub folder_count: usize,
    pub total_bytes: u64,
    pub selected_count: usize,
    pub selected_bytes: u64,
    pub report_path: Option<PathBuf>,
    pub inventory: Option<InventorySummary>,
    pub last_cleanup: Option<CleanupResult>,
    pub error: Option<String>,
    pub total_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelScanResponse {
    pub scan_id: String,
    pub status: ScanSessionStatus,
}

#[derive(Debug)]
struct ScanSession {
    status: ScanSessionStatus,
    request: ScanRequest,
    inventory: Option<Arc<SoftwareInventory>>,
    folders: Vec<OrphanFolder>,
    last_cleanup: Option<CleanupResult>,
    error: Option<String>,
    events: Vec<SessionEvent>,
    cancel_flag: CancelToken,
    /// Identifies the worker allowed to write results into this session.
    generation: u64,
}

impl ScanSession {
    fn push_event(&mut self, event: ProgressEvent) {
        let seq = self.events.len() as u64 + 1;
        self.events.push(SessionEvent {
            seq,
            at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
        });
    }

    fn selected(&self) -> impl Iterator<Item = &OrphanFolder> {
        self.folders.iter().filter(|folder| folder.is_selected)
    }

    fn report(&self) -> ScanReport {
        ScanReport::new(
            self.request.location,
            self.request
                .drive_root
                .as_ref()
                .map(|root| root.to_string_lossy().to_string()),
            self.folders.clone(),
        )
    }
}

static SESSIONS: Lazy<Mutex<HashMap<String, ScanSession>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// A worker thread's view of its session. Once the session has been
/// cancelled, rescanned, replaced or closed, every write is dropped.
#[derive(Debug, Clone)]
struct Worker {
    scan_id: String,
    generation: u64,
}

impl Worker {
    fn update<T>(&self, update: impl FnOnce(&mut ScanSession) -> T) -> Option<T> {
        with_session(&self.scan_id, |session| {
            (session.generation == self.generation).then(|| update(session))
        })
        .flatten()
    }

    fn record(&self, event: ProgressEvent) {
        self.update(|session| session.push_event(event));
    }
}

pub fn start_scan(request: ScanRequest) -> Result<String> {
    request.config.validate()?;
    let scan_id = request
        .scan_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let cancel_flag = CancelToken::new();
    let generation = next_generation();

    {
        let mut sessions = lock_sessions()?;
        if sessions
            .get(&scan_id)
            .is_some_and(|session| session.status.is_busy())
        {
            bail!("scan session {scan_id} is busy");
        }
        sessions.insert(
            scan_id.clone(),
            ScanSession {
                status: ScanSessionStatus::Scanning,
                request,
                inventory: None,
                folders: Vec::new(),
                last_cleanup: None,
                error: None,
                events: Vec::new(),
                cancel_flag: cancel_flag.clone(),
                generation,
            },
        );
    }

    spawn_scan(
        Worker {
            scan_id: scan_id.clone(),
            generation,
        },
        cancel_flag,
    );
    Ok(scan_id)
}

/// Scans the session's location again, reusing the inventory built by the
/// first scan.
pub fn rescan(scan_id: &str) -> Result<()> {
    let cancel_flag = CancelToken::new();
    let generation = next_generation();
    {
        let mut sessions = lock_sessions()?;
        let session = get_session_mut(&mut sessions, scan_id)?;
        if session.status.is_busy() {
            bail!("scan session {scan_id} is busy");
        }
        session.status = ScanSessionStatus::Scanning;
        session.error = None;
        session.folders.clear();
        session.cancel_flag = cancel_flag.clone();
        session.generation = generation;
    }

    spawn_scan(
        Worker {
            scan_id: scan_id.to_string(),
            generation,
        },
        cancel_flag,
    );
    Ok(())
}

fn spawn_scan(worker: Worker, cancel_flag: CancelToken) {
    thread::spawn(move || {
        let scan_id = worker.scan_id.clone();
        let Some((request, cached_inventory)) = worker.update(|session| {
            (session.request.clone(), session.inventory.clone())
        }) else {
            return;
        };

        let inventory = match cached_inventory {
            Some(inventory) => inventory,
            None => {
                worker.record(ProgressEvent::Status {
                    text: "Building software inventory...".to_string(),
                });
                let mut manifests = request.config.inventory_manifests.clone();
                manifests.extend(request.inventory_manifests.iter().cloned());
                let inventory = Arc::new(SoftwareInventory::build_with_manifests(&manifests));
                worker.update(|session| {
                    session.inventory = Some(Arc::clone(&inventory));
                });
                inventory
            }
        };

        let mut options = ScanOptions::from_config(&request.config, request.location);
        options.drive_root = request.drive_root.clone();
        options.cancel_flag = Some(cancel_flag);

        let run_result = run_scan_with_callback(&options, &inventory, |event| worker.record(event));

        match run_result {
            Ok(folders) => {
                info!("scan session {scan_id} found {} folder(s)", folders.len());
                let current = worker.update(|session| {
                    session.folders = folders;
                    session.status = ScanSessionStatus::Ready;
                    session.error = None;
                });
                if current.is_some() {
                    persist_report(&worker);
                }
            }
            Err(SweepError::Cancelled) => {
                info!("scan session {scan_id} cancelled");
                worker.update(|session| {
                    session.folders.clear();
                    session.status = ScanSessionStatus::Cancelled;
                });
            }
            Err(err) => {
                warn!("scan session {scan_id} failed: {err}");
                worker.update(|session| {
                    session.status = ScanSessionStatus::Failed;
                    session.error = Some(err.to_string());
                });
            }
        }
    });
}

/// Deletes the session's selected folders on a worker thread. Deleted
/// folders leave the session's result list; failed ones stay.
pub fn start_cleanup(scan_id: &str, request: CleanupRequest) -> Result<()> {
    let cancel_flag = CancelToken::new();
    let generation = next_generation();
    let (selection, mut options) = {
        let mut sessions = lock_sessions()?;
        let session = get_session_mut(&mut sessions, scan_id)?;
        if session.status != ScanSessionStatus::Ready {
            bail!(
                "scan session {scan_id} has no completed scan to clean (status {:?})",
                session.status
            );
        }
        let selection = session.selected().cloned().collect::<Vec<_>>();
        if selection.is_empty() {
            bail!("scan session {scan_id} has nothing selected");
        }
        session.status = ScanSessionStatus::Cleaning;
        session.cancel_flag = cancel_flag.clone();
        session.generation = generation;
        (
            selection,
            CleanupOptions::from_settings(&session.request.config.cleanup),
        )
    };

    if let Some(recoverable) = request.use_recoverable_delete {
        options.use_recoverable_delete = recoverable;
    }
    options.cancel_flag = Some(cancel_flag);

    let worker = Worker {
        scan_id: scan_id.to_string(),
        generation,
    };
    thread::spawn(move || {
        let result = run_cleanup_with_callback(&selection, &options, |event| worker.record(event));
        info!(
            "cleanup for session {}: {} deleted, {} failed",
            worker.scan_id,
            result.deleted_count(),
            result.failed_count()
        );

        let current = worker.update(|session| {
            session.folders.retain(|folder| {
                !result
                    .deleted_folders
                    .iter()
                    .any(|deleted| deleted.path == folder.path)
            });
            session.last_cleanup = Some(result);
            session.status = ScanSessionStatus::Ready;
        });
        if current.is_some() {
            persist_report(&worker);
        }
    });

    Ok(())
}

pub fn poll_scan_events(scan_id: &str, from_seq: u64) -> Result<Vec<SessionEvent>> {
    let sessions = lock_sessions()?;
    let session = get_session(&sessions, scan_id)?;

    Ok(session
        .events
        .iter()
        .filter(|event| event.seq > from_seq)
        .cloned()
        .collect())
}

pub fn cancel_scan(scan_id: &str) -> Result<CancelScanResponse> {
    let mut sessions = lock_sessions()?;
    let session = get_session_mut(&mut sessions, scan_id)?;

    session.cancel_flag.cancel();
    if session.status == ScanSessionStatus::Scanning {
        // The cancelled worker may still be running; it no longer owns the session.
        session.status = ScanSessionStatus::Cancelled;
        session.folders.clear();
        session.generation = next_generation();
    }

    Ok(CancelScanResponse {
        scan_id: scan_id.to_string(),
        status: session.status,
    })
}

pub fn get_scan_session(scan_id: &str) -> Result<ScanSessionSnapshot> {
    let sessions = lock_sessions()?;
    let session = get_session(&sessions, scan_id)?;

    let (folder_count, total_bytes) = count_and_bytes(session.folders.iter());
    let (selected_count, selected_bytes) = count_and_bytes(session.selected());

    Ok(ScanSessionSnapshot {
        scan_id: scan_id.to_string(),
        status: session.status,
        location: session.request.location,
        folder_count,
        total_bytes,
        selected_count,
        selected_bytes,
        report_path: session.request.output.clone(),
        inventory: session.inventory.as_ref().map(|inventory| inventory.summary()),
        last_cleanup: session.last_cleanup.clone(),
        error: session.error.clone(),
        total_events: session.events.len() as u64,
    })
}

/// Session results, largest first, optionally limited to folders at or
/// below `max_risk`.
pub fn session_folders(scan_id: &str, max_risk: Option<RiskLevel>) -> Result<Vec<OrphanFolder>> {
    let sessions = lock_sessions()?;
    let session = get_session(&sessions, scan_id)?;
    Ok(session
        .folders
        .iter()
        .filter(|folder| match max_risk {
            Some(max) => folder.risk <= max,
            None => true,
        })
        .cloned()
        .collect())
}

pub fn set_selection(scan_id: &str, path: &str, selected: bool) -> Result<()> {
    let mut sessions = lock_sessions()?;
    let session = get_session_mut(&mut sessions, scan_id)?;
    if session.status.is_busy() {
        bail!("scan session {scan_id} is busy");
    }
    let folder = session
        .folders
        .iter_mut()
        .find(|folder| folder.path == path)
        .ok_or_else(|| anyhow!("folder not in session {scan_id}: {path}"))?;
    folder.is_selected = selected;
    Ok(())
}

/// Selects exactly the folders at or below `max_risk`. Returns how many are
/// now selected.
pub fn select_up_to_risk(scan_id: &str, max_risk: RiskLevel) -> Result<usize> {
    let mut sessions = lock_sessions()?;
    let session = get_session_mut(&mut sessions, scan_id)?;
    if session.status.is_busy() {
        bail!("scan session {scan_id} is busy");
    }
    for folder in &mut session.folders {
        folder.is_selected = folder.risk <= max_risk;
    }
    Ok(session.selected().count())
}

pub fn export_session(scan_id: &str, output: impl AsRef<Path>, selected_only: bool) -> Result<usize> {
    let folders = {
        let sessions = lock_sessions()?;
        let session = get_session(&sessions, scan_id)?;
        if selected_only {
            session.selected().cloned().collect::<Vec<_>>()
        } else {
            session.folders.clone()
        }
    };
    write_text_report(&folders, output.as_ref())?;
    Ok(folders.len())
}

pub fn save_report(scan_id: &str, output: impl AsRef<Path>) -> Result<()> {
    let report = {
        let sessions = lock_sessions()?;
        get_session(&sessions, scan_id)?.report()
    };
    write_report(&report, output.as_ref())
}

pub fn load_report(path: impl AsRef<Path>) -> Result<ScanReport> {
    read_report(path.as_ref())
}

pub fn close_session(scan_id: &str) -> Result<()> {
    let mut sessions = lock_sessions()?;
    let session = get_session(&sessions, scan_id)?;
    if session.status.is_busy() {
        session.cancel_flag.cancel();
    }
    sessions.remove(scan_id);
    Ok(())
}

pub fn doctor() -> DoctorInfo {
    collect_doctor_info()
}

fn count_and_bytes<'a>(folders: impl Iterator<Item = &'a OrphanFolder>) -> (usize, u64) {
    folders.fold((0, 0), |(count, bytes), folder| {
        (count + 1, bytes.saturating_add(folder.size_bytes))
    })
}

fn persist_report(worker: &Worker) {
    let scan_id = &worker.scan_id;
    let Some(Some((report, path))) = worker.update(|session| {
        session
            .request
            .output
            .clone()
            .map(|path| (session.report(), path))
    }) else {
        return;
    };

    if let Err(err) = write_report(&report, &path) {
        warn!("scan session {scan_id}: {err:#}");
        worker.update(|session| {
            session.error = Some(err.to_string());
        });
    }
}

/// Runs `update` against a live session. Returns `None` when the registry is
/// poisoned or the session was closed.
fn with_session<T>(scan_id: &str, update: impl FnOnce(&mut ScanSession) -> T) -> Option<T> {
    let mut sessions = lock_sessions().ok()?;
    sessions.get_mut(scan_id).map(update)
}

fn get_session<'a>(
    sessions: &'a HashMap<String, ScanSession>,
    scan_id: &str,
) -> Result<&'a ScanSession> {
    sessions
        .get(scan_id)
        .ok_or_else(|| anyhow!("scan session not found: {scan_id}"))
}

fn get_session_mut<'a>(
    sessions: &'a mut HashMap<String, ScanSession>,
    scan_id: &str,
) -> Result<&'a mut ScanSession> {
    sessions
        .get_mut(scan_id)
        .ok_or_else(|| anyhow!("scan session not found: {scan_id}"))
}

fn lock_sessions() -> Result<std::sync::MutexGuard<'static, HashMap<String, ScanSession>>> {
    SESSIONS
        .lock()
        .map_err(|_| anyhow!("scan session registry lock poisoned"))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, Instant};

    use orphan_sweep_core::{ProgressEvent, RiskLevel, ScanLocation, SweepConfig};

    use super::{
        cancel_scan, close_session, doctor, export_session, get_scan_session, load_report,
        lock_sessions, poll_scan_events, rescan, select_up_to_risk, session_folders, set_selection,
        start_cleanup, start_scan, CleanupRequest, ScanRequest, ScanSessionSnapshot,
        ScanSessionStatus, Worker,
    };

    fn wait_idle(scan_id: &str) -> ScanSessionSnapshot {
        let started = Instant::now();
        loop {
            let snapshot = get_scan_session(scan_id).expect("session exists");
            if !snapshot.status.is_busy() {
                return snapshot;
            }
            assert!(started.elapsed() < Duration::from_secs(30));
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    fn drive_with_leftovers(root: &Path) {
        let data = root.join("ProgramData");
        fs::create_dir_all(data.join("Contoso_old")).unwrap();
        fs::write(data.join("Contoso_old").join("settings.ini"), vec![1_u8; 64]).unwrap();
        fs::create_dir_all(data.join("Empty Vendor")).unwrap();
    }

    fn request(root: &Path) -> ScanRequest {
        let mut config = SweepConfig::default();
        config.cleanup.use_recoverable_delete = false;
        config.cleanup.base_delay_ms = 1;
        ScanRequest {
            location: ScanLocation::ProgramData,
            drive_root: Some(root.to_path_buf()),
            config,
            output: Some(root.join("report.json")),
            ..ScanRequest::default()
        }
    }

    #[test]
    fn scan_select_and_clean_through_a_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        drive_with_leftovers(temp.path());

        let scan_id = start_scan(request(temp.path())).expect("scan starts");
        let snapshot = wait_idle(&scan_id);
        assert_eq!(snapshot.status, ScanSessionStatus::Ready);
        assert_eq!(snapshot.folder_count, 2);
        assert_eq!(snapshot.selected_count, 2);
        assert!(snapshot.inventory.is_some());

        let events = poll_scan_events(&scan_id, 0).expect("events");
        assert!(events
            .iter()
            .any(|event| event.event == ProgressEvent::Progress { percent: 100 }));
        assert!(events.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        let last_seq = events.last().map(|event| event.seq).unwrap_or(0);
        assert!(poll_scan_events(&scan_id, last_seq).unwrap().is_empty());

        let report = load_report(temp.path().join("report.json")).expect("report saved");
        assert_eq!(report.folders.len(), 2);

        let empty_vendor = session_folders(&scan_id, Some(RiskLevel::Low))
            .unwrap()
            .into_iter()
            .find(|folder| folder.name == "Empty Vendor")
            .expect("empty folder reported");
        set_selection(&scan_id, &empty_vendor.path, false).unwrap();
        assert!(set_selection(&scan_id, "/not/in/session", true).is_err());

        start_cleanup(&scan_id, CleanupRequest::default()).expect("cleanup starts");
        let snapshot = wait_idle(&scan_id);
        let cleanup = snapshot.last_cleanup.expect("cleanup recorded");
        assert_eq!(cleanup.deleted_count(), 1);
        assert_eq!(cleanup.total_bytes_freed, 64);
        assert_eq!(snapshot.folder_count, 1);
        assert!(!temp.path().join("ProgramData/Contoso_old").exists());
        assert!(temp.path().join("ProgramData/Empty Vendor").exists());

        let listed = export_session(&scan_id, temp.path().join("out.txt"), false).unwrap();
        assert_eq!(listed, 1);

        close_session(&scan_id).unwrap();
        assert!(get_scan_session(&scan_id).is_err());
    }

    #[test]
    fn rescan_reuses_inventory_and_sees_new_folders() {
        let temp = tempfile::tempdir().expect("tempdir");
        drive_with_leftovers(temp.path());

        let scan_id = start_scan(request(temp.path())).expect("scan starts");
        let first = wait_idle(&scan_id);
        assert_eq!(first.folder_count, 2);

        fs::create_dir_all(temp.path().join("ProgramData/Another.bak")).unwrap();
        rescan(&scan_id).expect("rescan starts");
        let second = wait_idle(&scan_id);
        assert_eq!(second.status, ScanSessionStatus::Ready);
        assert_eq!(second.folder_count, 3);
        assert_eq!(second.inventory, first.inventory);

        assert_eq!(select_up_to_risk(&scan_id, RiskLevel::Low).unwrap(), 3);
        close_session(&scan_id).unwrap();
    }

    fn current_generation(scan_id: &str) -> u64 {
        lock_sessions().unwrap().get(scan_id).expect("session exists").generation
    }

    #[test]
    fn rescan_after_cancel_is_not_overwritten_by_the_cancelled_worker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let data = temp.path().join("ProgramData");
        for index in 0..1500 {
            fs::create_dir_all(data.join(format!("Vendor{index:04}_old"))).unwrap();
        }

        let scan_id = start_scan(request(temp.path())).expect("scan starts");
        cancel_scan(&scan_id).expect("cancel response");
        rescan(&scan_id).expect("rescan starts");

        let started = Instant::now();
        let mut seen = Vec::new();
        let snapshot = loop {
            let snapshot = get_scan_session(&scan_id).expect("session exists");
            seen.push(snapshot.status);
            if !snapshot.status.is_busy() {
                break snapshot;
            }
            assert!(started.elapsed() < Duration::from_secs(60));
            std::thread::sleep(Duration::from_millis(5));
        };

        assert!(!seen.contains(&ScanSessionStatus::Cancelled));
        assert_eq!(snapshot.status, ScanSessionStatus::Ready);
        assert_eq!(snapshot.folder_count, 1500);

        std::thread::sleep(Duration::from_millis(200));
        let settled = get_scan_session(&scan_id).expect("session exists");
        assert_eq!(settled.status, ScanSessionStatus::Ready);
        assert_eq!(settled.folder_count, 1500);
        close_session(&scan_id).unwrap();
    }

    #[test]
    fn retired_worker_cannot_write_into_its_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        drive_with_leftovers(temp.path());

        let scan_id = start_scan(request(temp.path())).expect("scan starts");
        wait_idle(&scan_id);
        let retired = Worker {
            scan_id: scan_id.clone(),
            generation: current_generation(&scan_id),
        };

        rescan(&scan_id).expect("rescan starts");
        wait_idle(&scan_id);
        let events_before = get_scan_session(&scan_id).unwrap().total_events;

        let written = retired.update(|session| {
            session.status = ScanSessionStatus::Cancelled;
            session.folders.clear();
        });
        retired.record(ProgressEvent::Progress { percent: 1 });

        assert!(written.is_none());
        let snapshot = get_scan_session(&scan_id).unwrap();
        assert_eq!(snapshot.status, ScanSessionStatus::Ready);
        assert_eq!(snapshot.folder_count, 2);
        assert_eq!(snapshot.total_events, events_before);
        close_session(&scan_id).unwrap();
    }

    #[test]
    fn missing_layout_fails_the_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let scan_id = start_scan(ScanRequest {
            location: ScanLocation::ProgramFilesX86,
            drive_root: Some(temp.path().to_path_buf()),
            ..ScanRequest::default()
        })
        .expect("scan starts");

        let snapshot = wait_idle(&scan_id);
        assert_eq!(snapshot.status, ScanSessionStatus::Failed);
        assert!(snapshot.error.is_some());
        assert!(start_cleanup(&scan_id, CleanupRequest::default()).is_err());

        let cancel = cancel_scan(&scan_id).expect("cancel response");
        assert_eq!(cancel.status, ScanSessionStatus::Failed);
    }

    #[test]
    fn unknown_session_is_an_error() {
        assert!(get_scan_session("missing").is_err());
        assert!(poll_scan_events("missing", 0).is_err());
        assert!(cancel_scan("missing").is_err());
    }

    #[test]
    fn doctor_reports_platform() {
        let info = doctor();
        assert!(!info.os.is_empty());
    }
}
