//! Local channel between the (possibly elevated) service and its clients
//!
//! Two implementations sit behind the same [`Listener`] interface:
//! - a named pipe whose security descriptor lets lower-integrity processes
//!   connect (Windows)
//! - a filesystem Unix domain socket (everything else)

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Service name shared by both transports.
pub const DEFAULT_SERVICE_NAME: &str = "moshi_connect_service";

/// A connected bidirectional byte stream.
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> IpcStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn IpcStream>;

/// Server side of the channel. Accepts an unbounded number of connections.
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next peer. Each call yields one logical connection.
    async fn accept(&mut self) -> io::Result<BoxedStream>;

    /// Address this listener was bound to
    fn address(&self) -> &str;
}

/// Platform address for a service name.
pub fn service_address(service_name: &str) -> String {
    if cfg!(windows) {
        format!(r"\\.\pipe\{}", service_name)
    } else {
        format!("/tmp/{}.sock", service_name)
    }
}

/// Bind the platform listener on `address`.
pub fn bind(address: &str) -> io::Result<Box<dyn Listener>> {
    #[cfg(windows)]
    {
        Ok(Box::new(windows::PipeListener::bind(address)?))
    }

    #[cfg(unix)]
    {
        Ok(Box::new(unix::SocketListener::bind(address)?))
    }
}

/// Connect to a listener as a client.
pub async fn connect(address: &str) -> io::Result<BoxedStream> {
    #[cfg(windows)]
    {
        windows::connect(address).await
    }

    #[cfg(unix)]
    {
        unix::connect(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_address() {
        let addr = service_address("moshi_connect_service");
        if cfg!(windows) {
            assert_eq!(addr, r"\\.\pipe\moshi_connect_service");
        } else {
            assert_eq!(addr, "/tmp/moshi_connect_service.sock");
        }
    }
}
