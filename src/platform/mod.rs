//! Platform-specific helpers for emulator discovery and process spawning

#[cfg(windows)]
pub mod windows;

use std::path::PathBuf;

/// Executable file name for `stem` on this platform
pub fn executable_name(stem: &str) -> String {
    format!("{}{}", stem, std::env::consts::EXE_SUFFIX)
}

/// Install directories recorded by emulator installers in the system registry
pub fn registry_install_dirs() -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        windows::registry_install_dirs()
    }
    #[cfg(not(windows))]
    {
        Vec::new()
    }
}

/// Default install locations used when the registry has no record
pub fn well_known_install_dirs() -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        vec![
            PathBuf::from(r"C:\LDPlayer\LDPlayer9"),
            PathBuf::from(r"C:\LDPlayer4.0\LDPlayer"),
        ]
    }
    #[cfg(not(windows))]
    {
        Vec::new()
    }
}

/// Keep spawned console tools from flashing a window
pub fn hide_console_window(cmd: &mut tokio::process::Command) {
    #[cfg(windows)]
    {
        cmd.creation_flags(windows::CREATE_NO_WINDOW);
    }
    #[cfg(not(windows))]
    {
        let _ = cmd;
    }
}

/// Whether a spawn failure means the target needs administrator rights
pub fn is_elevation_error(error: &std::io::Error) -> bool {
    #[cfg(windows)]
    {
        error.raw_os_error() == Some(windows::ERROR_ELEVATION_REQUIRED)
    }
    #[cfg(not(windows))]
    {
        let _ = error;
        false
    }
}
