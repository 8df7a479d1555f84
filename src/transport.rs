//! Byte-stream transports between the broker and its clients.
//!
//! TCP is the default. Local sockets (Unix domain sockets / named pipes, via `interprocess`)
//! serve single-host setups.

use std::pin::Pin;

use async_trait::async_trait;
use interprocess::local_socket::tokio::{LocalSocketListener, LocalSocketStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

use crate::config::BrokerAddr;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Opens a client connection to the broker.
pub async fn connect(addr: &BrokerAddr) -> std::io::Result<(BoxedReader, BoxedWriter)> {
    match addr {
        BrokerAddr::Tcp(address) => {
            let stream = TcpStream::connect(address.as_str()).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::pin(reader), Box::pin(writer)))
        }
        BrokerAddr::Local(name) => {
            let stream = LocalSocketStream::connect(name.as_str()).await?;
            let (reader, writer) = tokio::io::split(stream.compat());
            Ok((Box::pin(reader), Box::pin(writer)))
        }
    }
}

/// An accepted connection: its halves and a printable peer description.
pub type Accepted = (BoxedReader, BoxedWriter, String);

/// Source of inbound broker connections.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> std::io::Result<Accepted>;
}

/// A bound broker listener.
pub enum Listener {
    Tcp(TcpListener),
    Local {
        listener: LocalSocketListener,
        name: String,
    },
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("address", &self.local_addr())
            .finish()
    }
}

impl Listener {
    pub async fn bind(addr: &BrokerAddr) -> std::io::Result<Self> {
        match addr {
            BrokerAddr::Tcp(address) => Ok(Self::Tcp(TcpListener::bind(address.as_str()).await?)),
            BrokerAddr::Local(name) => {
                // Best-effort cleanup if a prior run left the socket path behind.
                #[cfg(unix)]
                if name.starts_with('/') {
                    let _ = std::fs::remove_file(name);
                }
                let listener = LocalSocketListener::bind(name.as_str())?;
                Ok(Self::Local {
                    listener,
                    name: name.clone(),
                })
            }
        }
    }

    /// The address clients should connect to. For TCP this carries the actual bound port.
    pub fn local_addr(&self) -> BrokerAddr {
        match self {
            Self::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => BrokerAddr::Tcp(addr.to_string()),
                Err(_) => BrokerAddr::Tcp("0.0.0.0:0".to_string()),
            },
            Self::Local { name, .. } => BrokerAddr::Local(name.clone()),
        }
    }
}

#[async_trait]
impl Acceptor for Listener {
    async fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok((Box::pin(reader), Box::pin(writer), peer.to_string()))
            }
            Self::Local { listener, name } => {
                let stream = listener.accept().await?;
                let (reader, writer) = tokio::io::split(stream.compat());
                Ok((Box::pin(reader), Box::pin(writer), name.clone()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Only the instance that bound the socket path unlinks it.
        #[cfg(unix)]
        if let Self::Local { name, .. } = self {
            if name.starts_with('/') {
                debug!(path = %name, "removing local socket");
                let _ = std::fs::remove_file(name.as_str());
            }
        }
    }
}
