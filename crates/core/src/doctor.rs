use std::env;

use serde::{Deserialize, Serialize};

use crate::registry::platform_source_names;
use crate::volumes::{list_volumes, system_root, VolumeInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInfo {
    pub os: String,
    pub arch: String,
    pub system_root: String,
    pub volumes: Vec<VolumeInfo>,
    pub inventory_sources: Vec<String>,
    pub notes: Vec<String>,
}

pub fn collect_doctor_info() -> DoctorInfo {
    let volumes = list_volumes();
    let inventory_sources = platform_source_names();

    let mut notes = vec![
        "Low-risk folders are the only ones selected by default.".to_string(),
        "Deletion goes to the recycle bin unless --permanent is given.".to_string(),
    ];
    if inventory_sources.is_empty() {
        notes.push(
            "No software registration sources on this platform; pass --inventory-manifest to describe installed software."
                .to_string(),
        );
    }
    if volumes.is_empty() {
        notes.push("No volumes detected by sysinfo; pass --drive explicitly.".to_string());
    }

    DoctorInfo {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        system_root: system_root().to_string_lossy().to_string(),
        volumes,
        inventory_sources,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::collect_doctor_info;

    #[test]
    fn doctor_reports_platform_and_root() {
        let info = collect_doctor_info();
        assert_eq!(info.os, std::env::consts::OS);
        assert!(!info.system_root.is_empty());
        assert!(info.notes.len() >= 2);
    }
}
