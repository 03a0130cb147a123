use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tracing::info;

use crate::config::ProxyConfig;
use crate::net::connection::PlainStream;

/// The listening endpoint handed to the accept loop.
///
/// Address family follows configuration: a `unix_socket_path` takes
/// precedence over TCP; otherwise the bind hostname's IP version selects
/// AF_INET or AF_INET6. SO_REUSEADDR is set before bind, the configured
/// backlog is applied at listen, and accepted TCP streams get TCP_NODELAY.
/// The Unix socket file is unlinked on drop.
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    pub async fn bind(config: &ProxyConfig) -> io::Result<Listener> {
        if let Some(ref path) = config.unix_socket_path {
            // A stale socket file from a previous run would fail the bind.
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)?;
            info!("listener: bound, unix_socket_path={}", path.display());
            return Ok(Listener::Unix {
                listener,
                path: path.clone(),
            });
        }

        let ip: IpAddr = config.hostname.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid bind hostname: {}", config.hostname),
            )
        })?;
        let socket = match ip {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::new(ip, config.port))?;
        let listener = socket.listen(config.backlog)?;
        info!("listener: bound, addr={}", listener.local_addr()?);
        Ok(Listener::Tcp(listener))
    }

    /// Accept one ready connection; returns the non-blocking stream and a
    /// printable peer address.
    pub async fn accept(&self) -> io::Result<(PlainStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((PlainStream::Tcp(stream), peer.to_string()))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok((PlainStream::Unix(stream), "unix".to_string()))
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
