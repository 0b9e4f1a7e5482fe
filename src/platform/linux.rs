//! Linux-specific routing implementation

use super::{PlatformError, RoutingManager, run_route_command};
use crate::openconnect::TunnelDevice;
use crate::profile::DestinationNetwork;

pub struct LinuxRoutingManager;

impl LinuxRoutingManager {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

fn delete_default_args(device: &TunnelDevice) -> Vec<String> {
    ["route", "del", "default", "dev", device.name.as_str()]
        .map(String::from)
        .to_vec()
}

fn add_args(network: &DestinationNetwork, device: &TunnelDevice) -> Vec<String> {
    vec![
        "route".to_string(),
        "add".to_string(),
        network.to_cidr(),
        "dev".to_string(),
        device.name.clone(),
    ]
}

impl RoutingManager for LinuxRoutingManager {
    fn delete_default_route(&self, device: &TunnelDevice) -> Result<(), PlatformError> {
        run_route_command("ip", &delete_default_args(device), PlatformError::DeleteRouteError)
    }

    fn add_route(
        &self,
        network: &DestinationNetwork,
        device: &TunnelDevice,
    ) -> Result<(), PlatformError> {
        run_route_command("ip", &add_args(network, device), PlatformError::AddRouteError)
    }
}
