mod stream;

pub use stream::Stream;

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::debug;

/// Unix socket addresses must contain this character. A socket in the current
/// directory can be named with the `./name` form.
const PATH_SEPARATOR: char = '/';

/// Check whether an address names a local (Unix-domain) socket
pub fn is_local_socket(addr: &str) -> bool {
    addr.contains(PATH_SEPARATOR)
}

/// Transport family of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// TCP, addressed as `host:port`
    Network,
    /// Unix-domain socket, addressed by filesystem path
    LocalSocket,
}

impl Family {
    /// Classify an address string
    pub fn of(addr: &str) -> Self {
        if is_local_socket(addr) {
            Family::LocalSocket
        } else {
            Family::Network
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Network => f.write_str("tcp"),
            Family::LocalSocket => f.write_str("unix"),
        }
    }
}

/// An address together with the transport family it was classified as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    family: Family,
    address: String,
}

impl Endpoint {
    pub fn parse(addr: &str) -> Self {
        Self {
            family: Family::of(addr),
            address: addr.to_string(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.address)
    }
}

/// Listening socket of either family
///
/// The socket file of a local listener is removed (best effort) on drop.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind a listener matching the endpoint's family
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint.family() {
            Family::Network => Ok(Listener::Tcp(TcpListener::bind(endpoint.address()).await?)),
            Family::LocalSocket => {
                let path = PathBuf::from(endpoint.address());
                let listener = UnixListener::bind(&path)?;
                Ok(Listener::Unix { listener, path })
            }
        }
    }

    /// Address actually bound (resolves port 0 for TCP)
    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            Listener::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            Listener::Unix { path, .. } => Ok(path.display().to_string()),
        }
    }
}

/// Source of inbound connections for a relay session
pub trait Accept {
    /// Accept the next inbound connection, returning it with a printable peer name
    fn accept(&self) -> impl Future<Output = io::Result<(Stream, String)>> + Send;
}

impl Accept for Listener {
    fn accept(&self) -> impl Future<Output = io::Result<(Stream, String)>> + Send {
        async move {
            match self {
                Listener::Tcp(listener) => {
                    let (stream, peer) = listener.accept().await?;
                    Ok((Stream::Tcp(stream), peer.to_string()))
                }
                Listener::Unix { listener, .. } => {
                    let (stream, peer) = listener.accept().await?;
                    let peer = peer
                        .as_pathname()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "unnamed".to_string());
                    Ok((Stream::Unix(stream), peer))
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            match std::fs::remove_file(&*path) {
                Ok(()) => debug!(path = %path.display(), "Removed socket file"),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Could not remove socket file")
                }
            }
        }
    }
}

/// Dials a fresh outbound connection to a fixed endpoint on every call
#[derive(Debug, Clone)]
pub struct Connector {
    endpoint: Endpoint,
}

impl Connector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Open one new connection; nothing is cached or pooled
    pub async fn connect(&self) -> io::Result<Stream> {
        match self.endpoint.family() {
            Family::Network => Ok(Stream::Tcp(
                TcpStream::connect(self.endpoint.address()).await?,
            )),
            Family::LocalSocket => Ok(Stream::Unix(
                UnixStream::connect(self.endpoint.address()).await?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_classify_addresses() {
        assert_eq!(Family::of("127.0.0.1:8080"), Family::Network);
        assert_eq!(Family::of("example:9000"), Family::Network);
        assert_eq!(Family::of("[::1]:22"), Family::Network);
        assert_eq!(Family::of("/tmp/sock"), Family::LocalSocket);
        assert_eq!(Family::of("./sock"), Family::LocalSocket);
        assert_eq!(Family::of(""), Family::Network);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::parse("localhost:80").to_string(), "tcp:localhost:80");
        assert_eq!(Endpoint::parse("/run/app.sock").to_string(), "unix:/run/app.sock");
    }

    #[tokio::test]
    async fn test_tcp_listener_and_connector() {
        let listener = Listener::bind(&Endpoint::parse("127.0.0.1:0")).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = Connector::new(Endpoint::parse(&addr));

        let (client, accepted) = tokio::join!(connector.connect(), listener.accept());
        let mut client = client.unwrap();
        let (mut server, peer) = accepted.unwrap();
        assert!(peer.starts_with("127.0.0.1:"));

        client.write_all(b"test").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"test");
    }

    #[tokio::test]
    async fn test_unix_listener_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let endpoint = Endpoint::parse(path.to_str().unwrap());
        assert_eq!(endpoint.family(), Family::LocalSocket);

        let listener = Listener::bind(&endpoint).await.unwrap();
        assert!(path.exists());

        let connector = Connector::new(endpoint);
        let (client, accepted) = tokio::join!(connector.connect(), listener.accept());
        assert!(matches!(client.unwrap(), Stream::Unix(_)));
        assert!(matches!(accepted.unwrap().0, Stream::Unix(_)));

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_accept_leaves_socket_options_to_caller() {
        let listener = Listener::bind(&Endpoint::parse("127.0.0.1:0")).await.unwrap();
        let connector = Connector::new(Endpoint::parse(&listener.local_addr().unwrap()));

        let (client, accepted) = tokio::join!(connector.connect(), listener.accept());
        let (accepted, _) = accepted.unwrap();
        match &accepted {
            Stream::Tcp(s) => assert!(!s.nodelay().unwrap()),
            Stream::Unix(_) => panic!("expected a TCP stream"),
        }

        accepted.set_nodelay().unwrap();
        match &accepted {
            Stream::Tcp(s) => assert!(s.nodelay().unwrap()),
            Stream::Unix(_) => unreachable!(),
        }
        drop(client);
    }

    #[tokio::test]
    async fn test_set_nodelay_is_noop_for_unix() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(Stream::Unix(a).set_nodelay().is_ok());
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let connector = Connector::new(Endpoint::parse(path.to_str().unwrap()));
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_bind_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("relay.sock");
        assert!(Listener::bind(&Endpoint::parse(path.to_str().unwrap())).await.is_err());
    }
}
