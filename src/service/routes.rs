//! Split-tunnel route application
//!
//! Runs after a tunnel device has settled: the default route through the
//! tunnel is removed once, then one route per destination network is added in
//! profile order. Failures are logged and never abort the session.

use crate::openconnect::TunnelDevice;
use crate::platform::RoutingManager;
use crate::profile::DestinationNetwork;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteReport {
    pub default_removed: bool,
    pub applied: Vec<DestinationNetwork>,
    pub failed: Vec<(DestinationNetwork, String)>,
}

pub fn apply_split_routes(
    manager: &dyn RoutingManager,
    device: &TunnelDevice,
    routes: &[DestinationNetwork],
) -> RouteReport {
    let mut report = RouteReport::default();
    if routes.is_empty() {
        return report;
    }

    info!(
        "Applying {} custom routes for split tunneling on {}",
        routes.len(),
        device.name
    );

    match manager.delete_default_route(device) {
        Ok(()) => {
            info!("Removed default route through {}", device.name);
            report.default_removed = true;
        }
        Err(e) => warn!("Failed to remove default route: {}", e),
    }

    for network in routes {
        match manager.add_route(network, device) {
            Ok(()) => {
                info!("Route added: {}", network);
                report.applied.push(*network);
            }
            Err(e) => {
                warn!("Failed to add route {}: {}", network, e);
                report.failed.push((*network, e.to_string()));
            }
        }
    }

    info!(
        "Split tunneling configured: {} of {} routes applied",
        report.applied.len(),
        routes.len()
    );
    report
}
