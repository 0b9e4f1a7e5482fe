//! Windows-specific routing implementation
//!
//! Routes are bound to the tunnel by interface index. The gateway is the
//! on-link placeholder `0.0.0.0`.

use super::{PlatformError, RoutingManager, run_route_command};
use crate::openconnect::TunnelDevice;
use crate::profile::DestinationNetwork;

const ON_LINK_GATEWAY: &str = "0.0.0.0";

pub struct WindowsRoutingManager;

impl WindowsRoutingManager {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WindowsRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

fn delete_default_args(device: &TunnelDevice) -> Vec<String> {
    ["delete", "0.0.0.0", "mask", "0.0.0.0", "IF", device.index.as_str()]
        .map(String::from)
        .to_vec()
}

fn add_args(network: &DestinationNetwork, device: &TunnelDevice) -> Vec<String> {
    vec![
        "add".to_string(),
        network.destination_ip().to_string(),
        "mask".to_string(),
        network.netmask().to_string(),
        ON_LINK_GATEWAY.to_string(),
        "IF".to_string(),
        device.index.clone(),
    ]
}

impl RoutingManager for WindowsRoutingManager {
    fn delete_default_route(&self, device: &TunnelDevice) -> Result<(), PlatformError> {
        run_route_command(
            "route",
            &delete_default_args(device),
            PlatformError::DeleteRouteError,
        )
    }

    fn add_route(
        &self,
        network: &DestinationNetwork,
        device: &TunnelDevice,
    ) -> Result<(), PlatformError> {
        run_route_command("route", &add_args(network, device), PlatformError::AddRouteError)
    }
}
