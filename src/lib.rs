//! Moshi Connect - privilege-separated OpenConnect supervisor
//!
//! A long-running service owns the OpenConnect child process and the route
//! table changes that need elevated rights. Unprivileged clients talk to it
//! over a local channel, send connect/disconnect/status commands and receive
//! a broadcast stream of status changes, process output and service logs.
//!
//! # Architecture
//!
//! - `config`: Service configuration file handling (TOML)
//! - `profile`: VPN profiles and split-tunnel destination networks
//! - `transport`: Local channel (named pipe on Windows, Unix socket elsewhere)
//! - `ipc`: Message types, framing codec and the client mirror
//! - `openconnect`: Child process control and output classification
//! - `platform`: Cross-platform route programming (macOS, Linux, Windows)
//! - `service`: Client registry, connection supervisor and log forwarding
//!
//! # Usage
//!
//! Run the service with the rights needed to create tunnels:
//! ```bash
//! sudo moshi-connect serve
//! ```
//!
//! Then drive it from an ordinary user session:
//! ```bash
//! moshi-connect connect --name corp --url vpn.example.com --route 10.0.0.0/8
//! ```

pub mod config;
pub mod ipc;
pub mod openconnect;
pub mod platform;
pub mod profile;
pub mod service;
pub mod transport;

pub use config::ServiceConfig;
pub use ipc::{ServiceClient, VpnStatusCallback};
pub use profile::{DestinationNetwork, VpnProfile};
pub use service::Service;
