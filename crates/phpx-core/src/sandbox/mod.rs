//! Confinement backends for script and tool execution.
//!
//! Selection order on Linux is bubblewrap, then nsjail, then passthrough; on
//! macOS the Seatbelt backend, then passthrough. A second dispatch path picks
//! a lighter network-only backend for `--offline` and `--allow-host` runs.

mod bubblewrap;
mod common;
mod config;
mod linux_network;
mod macos;
mod macos_network;
mod none;
mod nsjail;

use std::env;

use anyhow::Result;

pub use bubblewrap::Bubblewrap;
pub use config::{InputMode, OutputMode, SandboxConfig};
pub use linux_network::LinuxNetwork;
pub use macos::MacOs;
pub use macos_network::MacOsNetwork;
pub use none::Passthrough;
pub use nsjail::Nsjail;

use crate::context::ExecContext;

/// Result of a sandboxed execution. Output is buffered only when the caller
/// did not ask for pass-through streams.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Interface implemented by every confinement backend.
pub trait Sandbox {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// True if this backend actually applies sandboxing.
    fn is_sandboxed(&self) -> bool;

    /// True if this backend can be used on the current system.
    ///
    /// A backend that reports available must succeed on any configuration its
    /// contract accepts; failure to start is a hard error.
    fn available(&self) -> bool;

    /// Run the configured command under this backend.
    ///
    /// # Errors
    /// Returns an error when the child cannot be started or the helper binary
    /// fails outright. A non-zero child exit is not an error.
    fn execute(&self, ctx: &ExecContext, cfg: &SandboxConfig) -> Result<ExecResult>;
}

/// Return the best available full sandbox for the current system.
#[must_use]
pub fn detect() -> Box<dyn Sandbox> {
    match env::consts::OS {
        "linux" => {
            if Bubblewrap.available() {
                return Box::new(Bubblewrap);
            }
            if Nsjail.available() {
                return Box::new(Nsjail);
            }
        }
        "macos" => {
            if MacOs.available() {
                return Box::new(MacOs);
            }
        }
        _ => {}
    }
    Box::new(Passthrough)
}

/// Return the best available network-only sandbox. These restrict network
/// access but leave the filesystem open.
#[must_use]
pub fn detect_network_only() -> Box<dyn Sandbox> {
    match env::consts::OS {
        "linux" => {
            if LinuxNetwork.available() {
                return Box::new(LinuxNetwork);
            }
        }
        "macos" => {
            if MacOsNetwork.available() {
                return Box::new(MacOsNetwork);
            }
        }
        _ => {}
    }
    Box::new(Passthrough)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_reports_no_sandboxing() {
        let backend = Passthrough;
        assert_eq!(backend.name(), "none");
        assert!(!backend.is_sandboxed());
        assert!(backend.available());
    }

    #[test]
    fn detection_always_yields_an_available_backend() {
        assert!(detect().available());
        assert!(detect_network_only().available());
    }
}
