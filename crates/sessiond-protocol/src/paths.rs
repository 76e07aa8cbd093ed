use std::path::PathBuf;

/// Returns the runtime directory holding the socket and pid file.
pub fn default_runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("sessiond")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/sessiond-{uid}"))
    }
}

/// Returns the default socket path for the sessiond service.
pub fn default_socket_path() -> PathBuf {
    default_runtime_dir().join("sessiond.sock")
}

/// Returns the config directory path for sessiond.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("sessiond")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("sessiond")
    } else {
        PathBuf::from("/tmp/sessiond")
    }
}

/// Returns the config file path for the sessiond service.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
