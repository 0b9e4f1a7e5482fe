//! Platform-specific route table programming

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

use crate::openconnect::TunnelDevice;
use crate::profile::DestinationNetwork;
use std::process::{Command, Output};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to add route: {0}")]
    AddRouteError(String),
    #[error("Failed to delete route: {0}")]
    DeleteRouteError(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Platform-agnostic routing interface, bound to the tunnel interface.
pub trait RoutingManager: Send + Sync {
    /// Remove the catch-all default route OpenConnect installed on `device`.
    fn delete_default_route(&self, device: &TunnelDevice) -> Result<(), PlatformError>;

    /// Route `network` through `device`.
    fn add_route(
        &self,
        network: &DestinationNetwork,
        device: &TunnelDevice,
    ) -> Result<(), PlatformError>;
}

/// Get the appropriate routing manager for the current platform
pub fn get_routing_manager() -> Result<Box<dyn RoutingManager>, PlatformError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(mac::MacRoutingManager::new()))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxRoutingManager::new()))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(windows::WindowsRoutingManager::new()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// Run a route command, mapping spawn failures and non-zero exits through `err`.
pub(crate) fn run_route_command(
    program: &str,
    args: &[String],
    err: fn(String) -> PlatformError,
) -> Result<(), PlatformError> {
    tracing::info!("Executing: {} {}", program, args.join(" "));
    let mut command = Command::new(program);
    command.args(args);
    #[cfg(windows)]
    {
        use ::windows::Win32::System::Threading::CREATE_NO_WINDOW;
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NO_WINDOW.0);
    }
    let output: Output = command.output().map_err(|e| err(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        // route.exe reports failures on stdout
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(err(detail.trim().to_string()));
    }

    Ok(())
}
