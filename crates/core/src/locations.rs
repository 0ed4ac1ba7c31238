use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::inventory::path_key;
use crate::model::ScanLocation;
use crate::volumes::system_root;

/// Folder names that are never scan candidates, compared case-insensitively.
pub const PROTECTED_NAMES: &[&str] = &[
    "Common Files",
    "Internet Explorer",
    "Microsoft",
    "Microsoft.NET",
    "ModifiableWindowsApps",
    "MSBuild",
    "Reference Assemblies",
    "Uninstall Information",
    "WindowsApps",
    "WindowsPowerShell",
    "dotnet",
    "Package Cache",
    "Packages",
    "Temp",
    "Application Data",
    "Desktop",
    "Documents",
    "Start Menu",
    "Templates",
    "Programs",
    "History",
    "Comms",
    "ConnectedDevicesPlatform",
    "D3DSCache",
    "PeerDistRepub",
    "Publishers",
    "regid.1991-06.com.microsoft",
    "SoftwareDistribution",
    "ssh",
    "USOPrivate",
    "USOShared",
    "Services",
    "SpeechEngines",
    "System",
    "VirtualStore",
    "CrashDumps",
    "Intel",
    "NVIDIA",
    "NVIDIA Corporation",
    "AMD",
    "Realtek",
    "Package Store",
];

const SKIPPED_PROFILES: &[&str] = &["Public", "Default", "Default User", "All Users"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseFolder {
    pub category: ScanLocation,
    pub path: PathBuf,
}

/// Base folders for `location`, rooted at `drive_root` or at the system
/// drive when none is given. Missing folders are dropped, and a folder
/// reachable from two categories is kept under the first.
pub fn resolve_base_folders(location: ScanLocation, drive_root: Option<&Path>) -> Vec<BaseFolder> {
    let system = system_root();
    let foreign_root = drive_root.filter(|root| !is_same_root(root, &system));

    let mut seen = HashSet::new();
    let mut bases = Vec::new();
    for category in location.categories() {
        let candidates = match foreign_root {
            Some(root) => drive_layout_paths(category, root),
            None => special_folder_paths(category),
        };
        for path in candidates {
            if !path.is_dir() {
                debug!("base folder {} does not exist; skipped", path.display());
                continue;
            }
            if seen.insert(path_key(&path.to_string_lossy())) {
                bases.push(BaseFolder { category, path });
            }
        }
    }
    bases
}

pub fn is_protected_name(name: &str, extra_protected: &[String]) -> bool {
    let lowered = name.to_lowercase();
    lowered.starts_with('.')
        || lowered.starts_with('$')
        || lowered.starts_with("microsoft")
        || lowered.starts_with("windows")
        || PROTECTED_NAMES
            .iter()
            .any(|protected| protected.eq_ignore_ascii_case(name))
        || extra_protected
            .iter()
            .any(|protected| protected.eq_ignore_ascii_case(name))
}

fn is_same_root(a: &Path, b: &Path) -> bool {
    path_key(&a.to_string_lossy()) == path_key(&b.to_string_lossy())
}

fn special_folder_paths(category: ScanLocation) -> Vec<PathBuf> {
    match category {
        ScanLocation::ProgramFiles => env_paths(&["ProgramW6432", "ProgramFiles"]),
        ScanLocation::ProgramFilesX86 => env_paths(&["ProgramFiles(x86)"]),
        ScanLocation::AppDataRoaming => dirs::data_dir().into_iter().collect(),
        ScanLocation::AppDataLocal => dirs::data_local_dir().into_iter().collect(),
        ScanLocation::ProgramData => env_paths(&["ProgramData"]),
        ScanLocation::CommonFiles => {
            let mut paths = env_paths(&["CommonProgramW6432", "CommonProgramFiles"]);
            paths.extend(env_paths(&["CommonProgramFiles(x86)"]));
            paths
        }
        ScanLocation::All => Vec::new(),
    }
}

/// First of the named environment variables that is set.
fn env_paths(names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .find_map(|name| env::var_os(name).filter(|value| !value.is_empty()))
        .map(PathBuf::from)
        .into_iter()
        .collect()
}

fn drive_layout_paths(category: ScanLocation, root: &Path) -> Vec<PathBuf> {
    match category {
        ScanLocation::ProgramFiles => vec![root.join("Program Files")],
        ScanLocation::ProgramFilesX86 => vec![root.join("Program Files (x86)")],
        ScanLocation::ProgramData => vec![root.join("ProgramData")],
        ScanLocation::CommonFiles => vec![
            root.join("Program Files").join("Common Files"),
            root.join("Program Files (x86)").join("Common Files"),
        ],
        ScanLocation::AppDataRoaming => user_profiles(root)
            .into_iter()
            .map(|profile| profile.join("AppData").join("Roaming"))
            .collect(),
        ScanLocation::AppDataLocal => user_profiles(root)
            .into_iter()
            .map(|profile| profile.join("AppData").join("Local"))
            .collect(),
        ScanLocation::All => Vec::new(),
    }
}

fn user_profiles(root: &Path) -> Vec<PathBuf> {
    let users = root.join("Users");
    let entries = match fs::read_dir(&users) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("cannot list profiles under {}: {}", users.display(), err);
            return Vec::new();
        }
    };

    let mut profiles = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            !SKIPPED_PROFILES
                .iter()
                .any(|skipped| skipped.eq_ignore_ascii_case(&name))
        })
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    profiles.sort();
    profiles
}
