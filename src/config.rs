//! Socket location resolution.
//!
//! The daemon socket is found in this order:
//! 1. An explicit path (e.g. `krpc --socket`)
//! 2. `KLIPPY_SOCKET` environment variable
//! 3. `~/printer_data/comms/klippy.sock` (the KIAUH install layout)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment variable overriding the socket path.
pub const SOCKET_ENV_VAR: &str = "KLIPPY_SOCKET";

/// Socket path relative to the home directory.
pub const DEFAULT_SOCKET_RELATIVE: &str = "printer_data/comms/klippy.sock";

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path of the daemon's Unix socket.
    pub socket_path: PathBuf,
}

impl Config {
    /// Resolve the socket path from an optional override, the environment,
    /// and finally the default location under the home directory.
    pub fn resolve(socket_override: Option<&Path>) -> Result<Self> {
        let env_value = std::env::var_os(SOCKET_ENV_VAR).map(PathBuf::from);
        Self::resolve_with(socket_override, env_value, dirs::home_dir())
    }

    fn resolve_with(
        socket_override: Option<&Path>,
        env_value: Option<PathBuf>,
        home: Option<PathBuf>,
    ) -> Result<Self> {
        let socket_path = if let Some(path) = socket_override {
            path.to_path_buf()
        } else if let Some(path) = env_value.filter(|p| !p.as_os_str().is_empty()) {
            path
        } else {
            home.context("Could not determine home directory; pass --socket or set KLIPPY_SOCKET")?
                .join(DEFAULT_SOCKET_RELATIVE)
        };
        Ok(Self { socket_path })
    }
}
