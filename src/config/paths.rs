//! Data directory and process-global path resolution.
//!
//! The audio socket and PID lock paths are process-global contracts with
//! the SIP side; both take environment overrides so tests and multi-box
//! setups can redirect them.

use std::path::PathBuf;

/// Directory for logs and default transcript output.
pub fn get_data_dir() -> PathBuf {
    get_config_base().join("callwire")
}

/// Base config directory: $XDG_CONFIG_HOME, default ~/.config.
fn get_config_base() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
}

/// The SIP-side audio socket. The SIP process creates it; we connect.
pub fn audio_socket_path() -> PathBuf {
    std::env::var_os("CALLWIRE_AUDIO_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/ausock.sock"))
}

/// Single-instance PID lock file.
pub fn lock_path() -> PathBuf {
    std::env::var_os("CALLWIRE_LOCK_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/callwire-call.pid"))
}

/// Settings file location.
pub fn settings_path() -> PathBuf {
    get_data_dir().join("settings.json")
}
