pub mod service;

pub use service::{
    cancel_scan, close_session, doctor, export_session, get_scan_session, load_report,
    poll_scan_events, rescan, save_report, select_up_to_risk, session_folders, set_selection,
    start_cleanup, start_scan, CancelScanResponse, CleanupRequest, ScanRequest,
    ScanSessionSnapshot, ScanSessionStatus, SessionEvent,
};
