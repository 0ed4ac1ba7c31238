use crate::inventory::InventorySource;

/// Registration sources this platform can read.
pub fn platform_sources() -> Vec<Box<dyn InventorySource>> {
    #[cfg(windows)]
    {
        windows::sources()
    }
    #[cfg(not(windows))]
    {
        Vec::new()
    }
}

pub fn platform_source_names() -> Vec<String> {
    platform_sources()
        .iter()
        .map(|source| source.name())
        .collect()
}

#[cfg(windows)]
mod windows {
    use std::path::Path;

    use anyhow::{Context, Result};
    use winreg::enums::{
        HKEY, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_READ, KEY_WOW64_32KEY, KEY_WOW64_64KEY,
    };
    use winreg::RegKey;

    use crate::inventory::{parse_install_date, InventoryBuilder, InventorySource};
    use crate::model::ProgramRecord;

    const UNINSTALL_KEY: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";
    const APP_PATHS_KEY: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\App Paths";
    const PACKAGES_KEY: &str = r"Software\Classes\Local Settings\Software\Microsoft\Windows\CurrentVersion\AppModel\Repository\Packages";

    pub(super) fn sources() -> Vec<Box<dyn InventorySource>> {
        vec![
            Box::new(UninstallSource {
                hive: HKEY_LOCAL_MACHINE,
                label: "HKLM uninstall (64-bit view)",
                view: KEY_WOW64_64KEY,
            }),
            Box::new(UninstallSource {
                hive: HKEY_LOCAL_MACHINE,
                label: "HKLM uninstall (32-bit view)",
                view: KEY_WOW64_32KEY,
            }),
            Box::new(UninstallSource {
                hive: HKEY_CURRENT_USER,
                label: "HKCU uninstall",
                view: 0,
            }),
            Box::new(AppPathsSource {
                hive: HKEY_LOCAL_MACHINE,
                label: "HKLM app paths",
            }),
            Box::new(AppPathsSource {
                hive: HKEY_CURRENT_USER,
                label: "HKCU app paths",
            }),
            Box::new(PackagedAppsSource),
        ]
    }

    fn read_string(key: &RegKey, value: &str) -> Option<String> {
        key.get_value::<String, _>(value)
            .ok()
            .map(|text| text.trim().trim_matches('"').to_string())
            .filter(|text| !text.is_empty())
    }

    struct UninstallSource {
        hive: HKEY,
        label: &'static str,
        view: u32,
    }

    impl InventorySource for UninstallSource {
        fn name(&self) -> String {
            self.label.to_string()
        }

        fn collect(&self, builder: &mut InventoryBuilder) -> Result<()> {
            let flags = KEY_READ | self.view;
            let root = RegKey::predef(self.hive)
                .open_subkey_with_flags(UNINSTALL_KEY, flags)
                .with_context(|| format!("failed to open {}", self.label))?;

            for key_name in root.enum_keys().flatten() {
                let Ok(entry) = root.open_subkey_with_flags(&key_name, flags) else {
                    continue;
                };
                let Some(name) = read_string(&entry, "DisplayName") else {
                    continue;
                };
                builder.add_program(ProgramRecord {
                    name,
                    install_location: read_string(&entry, "InstallLocation"),
                    publisher: read_string(&entry, "Publisher"),
                    install_date: read_string(&entry, "InstallDate")
                        .as_deref()
                        .and_then(parse_install_date),
                });
            }
            Ok(())
        }
    }

    struct AppPathsSource {
        hive: HKEY,
        label: &'static str,
    }

    impl InventorySource for AppPathsSource {
        fn name(&self) -> String {
            self.label.to_string()
        }

        fn collect(&self, builder: &mut InventoryBuilder) -> Result<()> {
            let root = RegKey::predef(self.hive)
                .open_subkey(APP_PATHS_KEY)
                .with_context(|| format!("failed to open {}", self.label))?;

            for key_name in root.enum_keys().flatten() {
                let stem = Path::new(&key_name)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_else(|| key_name.clone());
                builder.add_name(&stem);

                let Ok(entry) = root.open_subkey(&key_name) else {
                    continue;
                };
                if let Some(directory) = read_string(&entry, "Path") {
                    builder.add_install_path(&directory);
                } else if let Some(executable) = read_string(&entry, "") {
                    if let Some(parent) = Path::new(&executable).parent() {
                        builder.add_install_path(&parent.to_string_lossy());
                    }
                }
            }
            Ok(())
        }
    }

    struct PackagedAppsSource;

    impl InventorySource for PackagedAppsSource {
        fn name(&self) -> String {
            "packaged applications".to_string()
        }

        fn collect(&self, builder: &mut InventoryBuilder) -> Result<()> {
            let root = RegKey::predef(HKEY_CURRENT_USER)
                .open_subkey(PACKAGES_KEY)
                .context("failed to open packaged application repository")?;

            for full_name in root.enum_keys().flatten() {
                // Package full names look like Publisher.App_1.2.3.0_x64__hash.
                let identity = full_name.split('_').next().unwrap_or(&full_name);
                builder.add_name(identity);
                if let Some((_, product)) = identity.split_once('.') {
                    builder.add_name(product);
                }

                let Ok(entry) = root.open_subkey(&full_name) else {
                    continue;
                };
                if let Some(display_name) = read_string(&entry, "DisplayName") {
                    if !display_name.starts_with('@') {
                        builder.add_name(&display_name);
                    }
                }
                if let Some(folder) = read_string(&entry, "PackageRootFolder") {
                    builder.add_install_path(&folder);
                }
            }
            Ok(())
        }
    }
}
