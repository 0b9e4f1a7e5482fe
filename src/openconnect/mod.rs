//! OpenConnect integration
//!
//! The service never speaks the VPN protocol itself. It runs
//!
//! ```text
//! openconnect <url> --cookie <cookie>
//! ```
//!
//! and watches the child's output. Once OpenConnect prints
//! `Using <type> device '<name>', index <n>` the tunnel interface exists and
//! split-tunnel routes can be programmed against it.

pub mod output;
pub mod process;

pub use output::{
    Demultiplexer, LineConsumer, PatternMatcher, TunnelDevice, device_attach_matcher,
    spawn_line_reader,
};
pub use process::{ProcessError, ProcessExit, ProcessHandle, Termination};
