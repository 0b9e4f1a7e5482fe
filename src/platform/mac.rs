//! macOS-specific routing implementation

use super::{PlatformError, RoutingManager, run_route_command};
use crate::openconnect::TunnelDevice;
use crate::profile::DestinationNetwork;

pub struct MacRoutingManager;

impl MacRoutingManager {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MacRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

fn delete_default_args(device: &TunnelDevice) -> Vec<String> {
    ["-n", "delete", "default", "-interface", device.name.as_str()]
        .map(String::from)
        .to_vec()
}

fn add_args(network: &DestinationNetwork, device: &TunnelDevice) -> Vec<String> {
    vec![
        "-n".to_string(),
        "add".to_string(),
        "-net".to_string(),
        network.destination_ip().to_string(),
        "-netmask".to_string(),
        network.netmask().to_string(),
        "-interface".to_string(),
        device.name.clone(),
    ]
}

impl RoutingManager for MacRoutingManager {
    fn delete_default_route(&self, device: &TunnelDevice) -> Result<(), PlatformError> {
        run_route_command("route", &delete_default_args(device), PlatformError::DeleteRouteError)
    }

    fn add_route(
        &self,
        network: &DestinationNetwork,
        device: &TunnelDevice,
    ) -> Result<(), PlatformError> {
        run_route_command("route", &add_args(network, device), PlatformError::AddRouteError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_args() {
        let device = TunnelDevice {
            device_type: "utun".into(),
            name: "utun9".into(),
            index: "21".into(),
        };
        assert_eq!(
            delete_default_args(&device),
            ["-n", "delete", "default", "-interface", "utun9"]
        );

        let net: DestinationNetwork = "172.16.0.0/12".parse().unwrap();
        assert_eq!(
            add_args(&net, &device),
            ["-n", "add", "-net", "172.16.0.0", "-netmask", "255.240.0.0", "-interface", "utun9"]
        );
    }
}
