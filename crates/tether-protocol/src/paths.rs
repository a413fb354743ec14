//! Well-known locations shared by the client binaries.

use std::path::PathBuf;

/// Where a backend listens when no endpoint is configured: a per-user socket
/// in the runtime dir, or under `/tmp` keyed by uid.
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(runtime) => PathBuf::from(runtime).join("tether.sock"),
        None => {
            // SAFETY: getuid has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/tether-{uid}.sock"))
        }
    }
}

fn config_dir() -> PathBuf {
    if let Some(base) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(base).join("tether");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config/tether"),
        None => PathBuf::from("/tmp/tether"),
    }
}

/// `config.toml` inside the tether config dir.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}
