//! Unix domain socket transport

use super::{BoxedStream, Listener};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

pub struct SocketListener {
    listener: UnixListener,
    address: String,
    path: PathBuf,
}

impl SocketListener {
    /// Bind, replacing a socket file left behind by an unclean shutdown.
    pub fn bind(address: &str) -> io::Result<Self> {
        let path = PathBuf::from(address);
        remove_stale_socket(&path)?;

        let listener = UnixListener::bind(&path)?;
        info!("Listening on {}", path.display());

        Ok(Self {
            listener,
            address: address.to_string(),
            path,
        })
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Listener for SocketListener {
    async fn accept(&mut self) -> io::Result<BoxedStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove socket {}: {}", self.path.display(), e);
            }
        }
    }
}

pub async fn connect(address: &str) -> io::Result<BoxedStream> {
    let stream = UnixStream::connect(address).await?;
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_accept_multiple_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc.sock");
        let address = path.to_string_lossy().to_string();
        let mut listener = SocketListener::bind(&address).unwrap();
        assert_eq!(listener.address(), address);

        for i in 0..3u8 {
            let mut client = connect(&address).await.unwrap();
            let mut server = listener.accept().await.unwrap();
            client.write_all(&[i]).await.unwrap();
            let mut buf = [0u8; 1];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[0], i);
        }
    }

    #[tokio::test]
    async fn test_rebind_over_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        // a bound std listener that is leaked leaves the file behind
        let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        let listener = SocketListener::bind(&path.to_string_lossy()).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_peer_close_is_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let address = dir.path().join("eof.sock").to_string_lossy().to_string();
        let mut listener = SocketListener::bind(&address).unwrap();

        let client = connect(&address).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        drop(client);

        let mut buf = Vec::new();
        let n = server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
