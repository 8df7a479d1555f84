//! The message broker.
//!
//! Every connection gets one reader task. Readers push completed frames into a single routing
//! queue drained by one router task, which owns the binding table (endpoint -> connection).
//! Routing is fire-and-forget: a frame for an endpoint with no live binding is dropped with a
//! diagnostic and the sender never notices.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::config::{BrokerAddr, BrokerConfig};
use crate::error::{BrokerError, FrameError};
use crate::frame::{EndpointName, EndpointRegistry, FrameCodec, RawFrame};
use crate::transport::{Acceptor, Listener};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Identifies one accepted connection for the lifetime of the broker.
pub type LinkId = u64;

enum RouterCommand {
    Register {
        endpoint: EndpointName,
        link: LinkId,
        outbound: mpsc::Sender<String>,
    },
    Unregister {
        endpoint: EndpointName,
        link: LinkId,
    },
    Route(RawFrame),
    Bindings(oneshot::Sender<Vec<EndpointName>>),
}

/// What happened to a routed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// No live binding for the target.
    Miss,
    /// The target's outbound queue is full; the frame was dropped.
    Full,
    /// The target's connection is gone; its binding was removed.
    Closed,
}

struct Binding {
    link: LinkId,
    outbound: mpsc::Sender<String>,
}

/// Endpoint -> connection table. Owned by the router task.
#[derive(Default)]
pub struct BindingTable {
    bindings: HashMap<EndpointName, Binding>,
}

impl BindingTable {
    /// Binds `endpoint` to a connection, replacing (and thereby closing) any previous one.
    pub fn bind(
        &mut self,
        endpoint: EndpointName,
        link: LinkId,
        outbound: mpsc::Sender<String>,
    ) -> Option<LinkId> {
        self.bindings
            .insert(endpoint, Binding { link, outbound })
            .map(|previous| previous.link)
    }

    /// Removes the binding if it still belongs to `link`.
    pub fn unbind(&mut self, endpoint: &EndpointName, link: LinkId) -> bool {
        match self.bindings.get(endpoint) {
            Some(binding) if binding.link == link => {
                self.bindings.remove(endpoint);
                true
            }
            _ => false,
        }
    }

    /// Hands `payload` to the connection bound to `target` without waiting.
    pub fn route(&mut self, target: &EndpointName, payload: String) -> RouteOutcome {
        let Some(binding) = self.bindings.get(target) else {
            return RouteOutcome::Miss;
        };
        match binding.outbound.try_send(payload) {
            Ok(()) => RouteOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => RouteOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.bindings.remove(target);
                RouteOutcome::Closed
            }
        }
    }

    pub fn endpoints(&self) -> Vec<EndpointName> {
        let mut names: Vec<_> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A bound, not yet serving broker.
pub struct Broker {
    listener: Listener,
    registry: Arc<EndpointRegistry>,
    config: BrokerConfig,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("address", &self.listener.local_addr())
            .field("endpoints", &self.registry.names().count())
            .finish()
    }
}

impl Broker {
    /// Binds the listener. Fails only on socket setup errors.
    pub async fn bind(
        config: BrokerConfig,
        registry: EndpointRegistry,
    ) -> Result<Self, BrokerError> {
        let listener = Listener::bind(&config.address)
            .await
            .map_err(|source| BrokerError::Bind {
                address: config.address.to_string(),
                source,
            })?;
        info!(address = %listener.local_addr(), "broker listening");
        Ok(Self {
            listener,
            registry: Arc::new(registry),
            config,
        })
    }

    /// Address clients should connect to.
    pub fn local_addr(&self) -> BrokerAddr {
        self.listener.local_addr()
    }

    /// Starts the router and accept loop in the background.
    pub fn spawn(self) -> BrokerHandle {
        let address = self.local_addr();
        let Broker {
            listener,
            registry,
            config,
        } = self;
        let (router, commands) = mpsc::channel(config.route_queue_capacity.max(1));
        let router_task = tokio::spawn(route_loop(commands));
        let accept_task = tokio::spawn(accept_loop(listener, registry, config, router.clone()));
        BrokerHandle {
            address,
            router,
            accept_task,
            router_task,
        }
    }

    /// Runs the broker on the current task until the accept loop stops.
    pub async fn serve(self) -> Result<(), BrokerError> {
        let handle = self.spawn();
        handle.join().await
    }
}

/// Control handle for a running broker.
pub struct BrokerHandle {
    address: BrokerAddr,
    router: mpsc::Sender<RouterCommand>,
    accept_task: JoinHandle<()>,
    router_task: JoinHandle<()>,
}

impl BrokerHandle {
    pub fn address(&self) -> &BrokerAddr {
        &self.address
    }

    /// Endpoints that currently have a live binding, sorted by name.
    pub async fn bindings(&self) -> Result<Vec<EndpointName>, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.router
            .send(RouterCommand::Bindings(tx))
            .await
            .map_err(|_| BrokerError::RouterGone)?;
        rx.await.map_err(|_| BrokerError::RouterGone)
    }

    /// Waits for the accept loop to stop.
    pub async fn join(self) -> Result<(), BrokerError> {
        let result = self.accept_task.await;
        self.router_task.abort();
        result.map_err(|err| BrokerError::Io(std::io::Error::other(err)))
    }

    /// Stops accepting and routing. Established connections wind down once the router is gone.
    pub fn shutdown(self) {
        self.accept_task.abort();
        self.router_task.abort();
    }
}

async fn accept_loop<A: Acceptor>(
    listener: A,
    registry: Arc<EndpointRegistry>,
    config: BrokerConfig,
    router: mpsc::Sender<RouterCommand>,
) {
    let mut next_id: LinkId = 0;
    loop {
        match listener.accept().await {
            Ok((reader, writer, peer)) => {
                next_id += 1;
                let link = next_id;
                debug!(link, %peer, "connection accepted");
                let router = router.clone();
                let registry = Arc::clone(&registry);
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        serve_connection(link, reader, writer, router, registry, config).await
                    {
                        warn!(link, error = %err, "connection closed with error");
                    }
                });
            }
            Err(err) => {
                // Errors such as EMFILE persist until a descriptor frees up.
                error!(error = %err, "failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn route_loop(mut commands: mpsc::Receiver<RouterCommand>) {
    let mut table = BindingTable::default();
    while let Some(command) = commands.recv().await {
        match command {
            RouterCommand::Register {
                endpoint,
                link,
                outbound,
            } => {
                if let Some(previous) = table.bind(endpoint.clone(), link, outbound) {
                    info!(
                        %endpoint,
                        link,
                        previous,
                        "endpoint rebound, previous connection dropped"
                    );
                } else {
                    info!(%endpoint, link, "endpoint bound");
                }
            }
            RouterCommand::Unregister { endpoint, link } => {
                if table.unbind(&endpoint, link) {
                    info!(%endpoint, link, "endpoint unbound");
                }
            }
            RouterCommand::Route(frame) => {
                let destination = EndpointName::new(frame.target);
                match table.route(&destination, frame.payload) {
                    RouteOutcome::Delivered => debug!(%destination, "frame routed"),
                    RouteOutcome::Miss => {
                        warn!(%destination, "routing miss: no live binding, frame dropped")
                    }
                    RouteOutcome::Full => {
                        warn!(%destination, "outbound queue full, frame dropped")
                    }
                    RouteOutcome::Closed => {
                        warn!(%destination, "connection gone, binding removed and frame dropped")
                    }
                }
            }
            RouterCommand::Bindings(reply) => {
                let _ = reply.send(table.endpoints());
            }
        }
    }
}

/// Reads the handshake frame and resolves the declared endpoint.
async fn handshake<R>(
    frames: &mut FramedRead<R, FrameCodec>,
    registry: &EndpointRegistry,
) -> Result<EndpointName, BrokerError>
where
    R: AsyncRead + Unpin,
{
    let frame = frames.next().await.ok_or(BrokerError::HandshakeClosed)??;
    let declared = String::from_utf8_lossy(&frame);
    let declared = declared.split(';').next().unwrap_or("").trim();
    registry
        .resolve(declared)
        .ok_or_else(|| BrokerError::UnknownEndpoint(declared.to_string()))
}

async fn serve_connection<R, W>(
    link: LinkId,
    reader: R,
    writer: W,
    router: mpsc::Sender<RouterCommand>,
    registry: Arc<EndpointRegistry>,
    config: BrokerConfig,
) -> Result<(), BrokerError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new(config.max_frame_len));
    let timeout = config.handshake_timeout();
    let endpoint = tokio::time::timeout(timeout, handshake(&mut frames, &registry))
        .await
        .map_err(|_| BrokerError::HandshakeTimeout(timeout))??;

    let (outbound, pending) = mpsc::channel(config.outbound_capacity.max(1));
    router
        .send(RouterCommand::Register {
            endpoint: endpoint.clone(),
            link,
            outbound,
        })
        .await
        .map_err(|_| BrokerError::RouterGone)?;

    let sink = FramedWrite::new(writer, FrameCodec::new(config.max_frame_len));
    let result = tokio::select! {
        result = write_loop(pending, sink) => result,
        result = read_loop(&mut frames, link, &endpoint, &registry, &router) => result,
    };

    let _ = router
        .send(RouterCommand::Unregister {
            endpoint: endpoint.clone(),
            link,
        })
        .await;
    info!(%endpoint, link, "connection closed");
    result
}

/// Drains frames routed to this connection onto the socket. Ends when the binding is dropped.
async fn write_loop<W>(
    mut pending: mpsc::Receiver<String>,
    mut sink: FramedWrite<W, FrameCodec>,
) -> Result<(), BrokerError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = pending.recv().await {
        sink.send(payload).await?;
    }
    Ok(())
}

/// Pushes every frame read from this connection into the routing queue.
async fn read_loop<R>(
    frames: &mut FramedRead<R, FrameCodec>,
    link: LinkId,
    endpoint: &EndpointName,
    registry: &EndpointRegistry,
    router: &mpsc::Sender<RouterCommand>,
) -> Result<(), BrokerError>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let mut raw = match std::str::from_utf8(&frame)
            .map_err(|err| FrameError::malformed(err.to_string()))
            .and_then(RawFrame::parse)
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%endpoint, link, error = %err, "malformed frame ignored");
                continue;
            }
        };
        if raw.payload.trim().is_empty() {
            warn!(%endpoint, link, destination = %raw.target, "empty payload ignored");
            continue;
        }
        // Aliases route to their registered endpoint; unknown targets miss in the router.
        if let Some(resolved) = registry.resolve(&raw.target) {
            raw.target = resolved.to_string();
        }
        router
            .send(RouterCommand::Route(raw))
            .await
            .map_err(|_| BrokerError::RouterGone)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Accepted;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Acceptor whose every accept fails, as with an exhausted descriptor table.
    struct Exhausted(Arc<AtomicUsize>);

    #[async_trait]
    impl Acceptor for Exhausted {
        async fn accept(&self) -> std::io::Result<Accepted> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Err(std::io::Error::other("too many open files"))
        }
    }

    #[tokio::test]
    async fn failing_accept_backs_off() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (router, _commands) = mpsc::channel(1);
        let task = tokio::spawn(accept_loop(
            Exhausted(Arc::clone(&attempts)),
            Arc::new(EndpointRegistry::default()),
            BrokerConfig::default(),
            router,
        ));

        tokio::time::sleep(ACCEPT_BACKOFF * 5 / 2).await;
        task.abort();
        let attempts = attempts.load(Ordering::SeqCst);
        assert!((2..=5).contains(&attempts), "{attempts} accept attempts");
    }

    #[test]
    fn unbound_target_is_a_miss() {
        let mut table = BindingTable::default();
        assert_eq!(
            table.route(&EndpointName::robot_executor(), "execute".into()),
            RouteOutcome::Miss
        );
    }

    #[tokio::test]
    async fn rebinding_replaces_and_late_unbind_is_ignored() {
        let mut table = BindingTable::default();
        let (old_tx, mut old_rx) = mpsc::channel(1);
        let (new_tx, mut new_rx) = mpsc::channel(1);

        assert_eq!(table.bind(EndpointName::ar_display(), 1, old_tx), None);
        assert_eq!(table.bind(EndpointName::ar_display(), 2, new_tx), Some(1));
        // The superseded connection sees its queue close.
        assert_eq!(old_rx.recv().await, None);

        assert!(!table.unbind(&EndpointName::ar_display(), 1));
        assert_eq!(
            table.route(&EndpointName::ar_display(), "speech;ok".into()),
            RouteOutcome::Delivered
        );
        assert_eq!(new_rx.recv().await.as_deref(), Some("speech;ok"));

        assert!(table.unbind(&EndpointName::ar_display(), 2));
        assert!(table.endpoints().is_empty());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let mut table = BindingTable::default();
        let (tx, _rx) = mpsc::channel(1);
        table.bind(EndpointName::robot_executor(), 7, tx);
        let target = EndpointName::robot_executor();
        assert_eq!(table.route(&target, "a".into()), RouteOutcome::Delivered);
        assert_eq!(table.route(&target, "b".into()), RouteOutcome::Full);
    }

    #[test]
    fn closed_connection_is_unbound_on_route() {
        let mut table = BindingTable::default();
        let (tx, rx) = mpsc::channel(1);
        table.bind(EndpointName::interpreter(), 3, tx);
        drop(rx);
        assert_eq!(
            table.route(&EndpointName::interpreter(), "update;0,0".into()),
            RouteOutcome::Closed
        );
        assert!(table.endpoints().is_empty());
    }
}
