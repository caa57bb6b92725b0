//! Windows registry lookups and process creation flags

use std::path::PathBuf;

use tracing::debug;
use winreg::enums::HKEY_LOCAL_MACHINE;
use winreg::RegKey;

/// `CREATE_NO_WINDOW` process creation flag
pub const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// `ERROR_ELEVATION_REQUIRED`
pub const ERROR_ELEVATION_REQUIRED: i32 = 740;

/// Keys written by the LDPlayer 9 and LDPlayer 4/5 installers
const INSTALL_KEYS: &[&str] = &[r"SOFTWARE\LDPlayer9", r"SOFTWARE\LDPlayer"];

/// Read `InstallDir` from every known installer key
pub fn registry_install_dirs() -> Vec<PathBuf> {
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    INSTALL_KEYS
        .iter()
        .filter_map(|key| match hklm.open_subkey(key) {
            Ok(subkey) => match subkey.get_value::<String, _>("InstallDir") {
                Ok(dir) if !dir.trim().is_empty() => Some(PathBuf::from(dir.trim())),
                Ok(_) => None,
                Err(e) => {
                    debug!("No InstallDir under {}: {}", key, e);
                    None
                }
            },
            Err(e) => {
                debug!("Registry key {} unavailable: {}", key, e);
                None
            }
        })
        .collect()
}
