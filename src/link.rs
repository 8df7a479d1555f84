//! Client side of the broker connection.
//!
//! A [`ClientLink`] bridges a component's two local channels to one broker connection. It
//! never interprets frame contents: outbound text is written as-is (sentinel appended when
//! missing) and inbound bytes are split at the sentinel and handed over one frame at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::config::BrokerAddr;
use crate::error::{FrameError, LinkError};
use crate::frame::{EndpointName, Frame, FrameCodec};
use crate::transport;

/// Destination for frames produced by a component.
///
/// Implemented by [`ClientLink`] for networked operation and by `mpsc::Sender<Frame>` for
/// in-process wiring.
#[async_trait]
pub trait FrameSink: Send {
    async fn deliver(&mut self, frame: Frame) -> Result<(), LinkError>;
}

#[async_trait]
impl FrameSink for mpsc::Sender<Frame> {
    async fn deliver(&mut self, frame: Frame) -> Result<(), LinkError> {
        self.send(frame).await.map_err(|_| LinkError::Closed)
    }
}

pub struct ClientLink {
    endpoint: EndpointName,
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Receiver<String>,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ClientLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLink")
            .field("endpoint", &self.endpoint)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ClientLink {
    /// Connects to the broker and declares `endpoint` in the handshake.
    pub async fn connect(
        addr: &BrokerAddr,
        endpoint: EndpointName,
        capacity: usize,
    ) -> Result<Self, LinkError> {
        let (reader, writer) = transport::connect(addr)
            .await
            .map_err(|source| LinkError::Connect {
                address: addr.to_string(),
                source,
            })?;
        info!(%endpoint, broker = %addr, "connected to broker");
        Ok(Self::start(endpoint, reader, writer, capacity))
    }

    /// Starts forwarding over an established byte stream.
    ///
    /// Spawns the local->remote and remote->local loops. When either ends, the other is
    /// cancelled and the link is marked dead.
    pub fn start<R, W>(endpoint: EndpointName, reader: R, writer: W, capacity: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (outbound, local_out) = mpsc::channel(capacity);
        let (local_in, inbound) = mpsc::channel(capacity);
        let alive = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(forward(
            endpoint.clone(),
            reader,
            writer,
            local_out,
            local_in,
            Arc::clone(&alive),
        ));

        Self {
            endpoint,
            outbound,
            inbound,
            alive,
            task,
        }
    }

    pub fn endpoint(&self) -> &EndpointName {
        &self.endpoint
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Queues raw frame text (`target;...`, sentinel optional) for the broker.
    ///
    /// Waits only when the outbound queue is full, which in turn fills when the network
    /// buffer does.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), LinkError> {
        let text = text.into();
        let body = text.strip_suffix('$').unwrap_or(&text);
        if body.contains('$') {
            return Err(FrameError::SentinelInPayload.into());
        }
        if !self.is_alive() {
            return Err(LinkError::Closed);
        }
        self.outbound
            .send(text)
            .await
            .map_err(|_| LinkError::Closed)
    }

    pub async fn send(&self, frame: &Frame) -> Result<(), LinkError> {
        self.send_text(frame.encode()).await
    }

    /// Next inbound frame body (payload without sentinel). `None` once the link is dead.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Stops forwarding and drops the connection.
    pub fn close(self) {
        self.task.abort();
        self.alive.store(false, Ordering::Release);
    }
}

#[async_trait]
impl FrameSink for ClientLink {
    async fn deliver(&mut self, frame: Frame) -> Result<(), LinkError> {
        self.send(&frame).await
    }
}

async fn forward<R, W>(
    endpoint: EndpointName,
    reader: R,
    writer: W,
    mut local_out: mpsc::Receiver<String>,
    local_in: mpsc::Sender<String>,
    alive: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::default());
    let mut source = FramedRead::new(reader, FrameCodec::default());

    if let Err(err) = sink.send(endpoint.as_str()).await {
        warn!(%endpoint, error = %err, "handshake failed");
        alive.store(false, Ordering::Release);
        return;
    }

    let reason = tokio::select! {
        result = local_to_remote(&mut local_out, &mut sink) => match result {
            Ok(()) => "local channel closed".to_string(),
            Err(err) => format!("write to broker failed: {err}"),
        },
        result = remote_to_local(&mut source, &local_in) => match result {
            Ok(()) => "broker closed the connection".to_string(),
            Err(err) => format!("read from broker failed: {err}"),
        },
    };

    alive.store(false, Ordering::Release);
    info!(%endpoint, %reason, "link terminated");
}

async fn local_to_remote<W>(
    local_out: &mut mpsc::Receiver<String>,
    sink: &mut FramedWrite<W, FrameCodec>,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(text) = local_out.recv().await {
        sink.send(text).await?;
    }
    Ok(())
}

async fn remote_to_local<R>(
    source: &mut FramedRead<R, FrameCodec>,
    local_in: &mpsc::Sender<String>,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = source.next().await {
        let frame = frame?;
        let text = String::from_utf8_lossy(&frame).into_owned();
        debug!(frame = %text, "frame received");
        if local_in.send(text).await.is_err() {
            // Local consumer is gone.
            return Ok(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn handshake_then_forwarding_in_both_directions() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let mut link = ClientLink::start(EndpointName::interpreter(), reader, writer, 4);

        link.send_text("robot-executor;execute").await.expect("queued");

        let mut buf = vec![0u8; 64];
        let mut received = Vec::new();
        while !received.ends_with(b"execute$") {
            let n = remote.read(&mut buf).await.expect("readable");
            assert!(n > 0, "stream closed early");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"interpreter$robot-executor;execute$");

        remote.write_all(b"speech;ok$update;0.1,0.2$").await.expect("writable");
        assert_eq!(link.recv().await.as_deref(), Some("speech;ok"));
        assert_eq!(link.recv().await.as_deref(), Some("update;0.1,0.2"));
    }

    #[tokio::test]
    async fn remote_close_marks_link_dead() {
        let (local, remote) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let mut link = ClientLink::start(EndpointName::ar_display(), reader, writer, 4);

        drop(remote);
        assert_eq!(link.recv().await, None);
        assert!(!link.is_alive());
        assert!(matches!(
            link.send_text("robot-executor;execute").await,
            Err(LinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn embedded_sentinel_is_rejected_locally() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let link = ClientLink::start(EndpointName::ar_display(), reader, writer, 4);
        assert!(matches!(
            link.send_text("a;b$c").await,
            Err(LinkError::Frame(FrameError::SentinelInPayload))
        ));
    }

    #[tokio::test]
    async fn channel_sink_delivers_frames() {
        let (mut tx, mut rx) = mpsc::channel::<Frame>(1);
        let frame = Frame::parse("ar-display;speech;ok").expect("parses");
        tx.deliver(frame.clone()).await.expect("delivered");
        assert_eq!(rx.recv().await, Some(frame));
    }
}
