use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::{DiskKind, Disks};

use crate::inventory::path_key;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeInfo {
    pub name: String,
    pub mount_point: String,
    pub file_system: Option<String>,
    pub total_space_bytes: u64,
    pub free_space_bytes: u64,
    pub is_removable: bool,
    pub is_ssd: bool,
    pub is_system: bool,
}

/// Root of the volume the operating system runs from.
pub fn system_root() -> PathBuf {
    #[cfg(windows)]
    {
        let drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
        PathBuf::from(format!("{}\\", drive.trim_end_matches('\\')))
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/")
    }
}

/// Mounted fixed and removable volumes, system volume first.
pub fn list_volumes() -> Vec<VolumeInfo> {
    let system_key = path_key(&system_root().to_string_lossy());
    let disks = Disks::new_with_refreshed_list();
    let mut volumes = disks
        .list()
        .iter()
        .map(|disk| {
            let mount_point = disk.mount_point().to_string_lossy().to_string();
            VolumeInfo {
                name: disk.name().to_string_lossy().to_string(),
                is_system: path_key(&mount_point) == system_key,
                mount_point,
                file_system: Some(disk.file_system().to_string_lossy().to_string())
                    .filter(|fs| !fs.is_empty()),
                total_space_bytes: disk.total_space(),
                free_space_bytes: disk.available_space(),
                is_removable: disk.is_removable(),
                is_ssd: matches!(disk.kind(), DiskKind::SSD),
            }
        })
        .filter(|volume| volume.total_space_bytes > 0)
        .collect::<Vec<_>>();
    volumes.sort_by(|a, b| {
        b.is_system
            .cmp(&a.is_system)
            .then_with(|| a.mount_point.cmp(&b.mount_point))
    });
    volumes
}
