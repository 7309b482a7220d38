//! Default paths for dispensa components
//!
//! Paths are user-writable by default (no root required):
//! - Socket: `$XDG_RUNTIME_DIR/dispensa/dispensad.sock` or `/tmp/dispensa-$USER/dispensad.sock`
//! - Data: `$XDG_DATA_HOME/dispensa` or `~/.local/share/dispensa`
//! - Config: `$XDG_CONFIG_HOME/dispensa/config.toml` or `~/.config/dispensa/config.toml`

use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const DISPENSA_SOCKET_ENV: &str = "DISPENSA_SOCKET";

/// Environment variable for overriding the data directory
pub const DISPENSA_DATA_DIR_ENV: &str = "DISPENSA_DATA_DIR";

const SOCKET_FILENAME: &str = "dispensad.sock";

const CONFIG_FILENAME: &str = "config.toml";

const APP_DIR: &str = "dispensa";

/// Resolve `$xdg_var/dispensa`, falling back to `$HOME/<home_relative>/dispensa`
fn xdg_dir(xdg_var: &str, home_relative: &[&str], last_resort: &str) -> PathBuf {
    if let Ok(dir) = std::env::var(xdg_var) {
        return PathBuf::from(dir).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        let mut path = PathBuf::from(home);
        path.extend(home_relative);
        return path.join(APP_DIR);
    }

    PathBuf::from("/tmp").join(APP_DIR).join(last_resort)
}

/// Get the default socket path.
///
/// Order of precedence:
/// 1. `$DISPENSA_SOCKET` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/dispensa/dispensad.sock` (if XDG_RUNTIME_DIR is set)
/// 3. `/tmp/dispensa-$USER/dispensad.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(DISPENSA_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    socket_path_without_env()
}

/// Get the socket path without checking the DISPENSA_SOCKET env var.
/// Used for config defaults where clap checks the env var separately.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Get the default data directory.
///
/// Order of precedence:
/// 1. `$DISPENSA_DATA_DIR` environment variable (if set)
/// 2. `$XDG_DATA_HOME/dispensa` (if XDG_DATA_HOME is set)
/// 3. `~/.local/share/dispensa` (fallback)
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(DISPENSA_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

/// Get the data directory without checking the DISPENSA_DATA_DIR env var.
pub fn data_dir_without_env() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", &[".local", "share"], "data")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", &[".config"], "config").join(CONFIG_FILENAME)
}
