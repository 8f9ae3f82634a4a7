use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::messaging::config::TransportConfig;
use crate::messaging::connector::{Connector, TcpConnector};
use crate::messaging::envelope::{Envelope, OutboundRequest};
use crate::messaging::frame::encode_frame;

enum DispatchCommand {
    Send(OutboundRequest),
    Close(String),
    Shutdown,
}

/// A cheap, cloneable way to submit envelopes to a [Sender] from several places. All handles
///  share the sender's bounded submission queue.
///
/// Submitting is fire-and-forget: it returns once the envelope is queued, and there is no way to
///  learn whether it was actually delivered. Failures further down the line (connecting,
///  encoding, writing) are logged and the affected envelopes dropped.
#[derive(Clone)]
pub struct SenderHandle {
    commands: mpsc::Sender<DispatchCommand>,
}
impl Debug for SenderHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SenderHandle{{closed:{}}}", self.commands.is_closed())
    }
}

impl SenderHandle {
    /// Waits only if the submission queue is full
    pub async fn send(&self, request: OutboundRequest) {
        trace!(to = %request.destination, envelope = ?request.envelope, "submitting envelope");
        if let Err(e) = self.commands.send(DispatchCommand::Send(request)).await {
            if let DispatchCommand::Send(request) = e.0 {
                warn!(to = %request.destination, envelope = ?request.envelope, "sender was shut down - dropping envelope");
            }
        }
    }

    pub async fn send_to(&self, destination: impl Into<String>, envelope: Envelope) {
        self.send(OutboundRequest::new(destination, envelope)).await
    }

    /// Closes the connection to a destination after all envelopes submitted for it so far are
    ///  written. A later submission for the same destination opens a new connection.
    pub async fn close(&self, destination: impl Into<String>) {
        let destination = destination.into();
        if self.commands.send(DispatchCommand::Close(destination)).await.is_err() {
            debug!("close after sender was shut down - ignoring");
        }
    }
}


/// The outbound half of the transport: it keeps one connection per destination, opening it
///  when the first envelope for that destination is submitted, and writes envelopes for the
///  same destination in the order they were submitted.
///
/// Each destination has its own delivery task and queue, so a slow or unreachable peer does not
///  hold up envelopes for other peers. The map from destination to connection is owned by a
///  single dispatch task which means there is no locking, and there is never more than one
///  connection per destination.
pub struct Sender {
    handle: SenderHandle,
    dispatch_task: JoinHandle<()>,
}
impl Debug for Sender {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sender{{{:?}}}", self.handle)
    }
}

impl Sender {
    /// NB: This spawns the dispatch loop, so it must be called from inside a tokio runtime
    pub fn new(config: Arc<TransportConfig>) -> anyhow::Result<Sender> {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    pub fn with_connector(config: Arc<TransportConfig>, connector: Arc<dyn Connector>) -> anyhow::Result<Sender> {
        config.validate()?;

        let (send, recv) = mpsc::channel(config.submission_queue_capacity);
        let dispatcher = Dispatcher {
            config,
            connector,
            connections: FxHashMap::default(),
            closing: FxHashMap::default(),
            next_connection_id: 0,
        };

        Ok(Sender {
            handle: SenderHandle { commands: send },
            dispatch_task: tokio::spawn(dispatcher.run(recv)),
        })
    }

    pub fn handle(&self) -> SenderHandle {
        self.handle.clone()
    }

    pub async fn send(&self, request: OutboundRequest) {
        self.handle.send(request).await
    }

    pub async fn send_to(&self, destination: impl Into<String>, envelope: Envelope) {
        self.handle.send_to(destination, envelope).await
    }

    pub async fn close(&self, destination: impl Into<String>) {
        self.handle.close(destination).await
    }

    /// Stops the sender after everything submitted so far (through any handle) was handed to its
    ///  destination's connection, waits for all connections to write their remaining envelopes,
    ///  and closes them. Envelopes submitted through other handles after this are dropped.
    ///
    /// NB: A peer that stopped reading keeps its connection's queue full, and the dispatch loop
    ///  waits for room in that queue before it gets to the shutdown request. So this call does
    ///  not return before every such peer either reads again or drops the connection.
    ///
    /// Returns an error only if the dispatch loop terminated abnormally.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        if self.handle.commands.send(DispatchCommand::Shutdown).await.is_err() {
            debug!("dispatch loop terminated before shutdown");
        }
        self.dispatch_task.await
            .map_err(|e| anyhow!("dispatch loop terminated abnormally: {}", e))
    }
}


struct DestinationConnection {
    id: u64,
    envelopes: mpsc::Sender<Envelope>,
    /// completes (with an error) when the delivery task ends
    ended: oneshot::Receiver<()>,
}

/// A connection that was closed but may still be writing its backlog
struct ClosingConnection {
    id: u64,
    ended: oneshot::Receiver<()>,
}

struct Dispatcher {
    config: Arc<TransportConfig>,
    connector: Arc<dyn Connector>,
    connections: FxHashMap<String, DestinationConnection>,
    closing: FxHashMap<String, ClosingConnection>,
    next_connection_id: u64,
}

impl Dispatcher {
    async fn run(mut self, mut commands: mpsc::Receiver<DispatchCommand>) {
        debug!("starting dispatch loop");
        let mut delivery_tasks = JoinSet::new();

        loop {
            select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(DispatchCommand::Send(request)) => self.dispatch(request, &mut delivery_tasks).await,
                        Some(DispatchCommand::Close(destination)) => self.close(&destination),
                        Some(DispatchCommand::Shutdown) => {
                            info!("shutting down sender");
                            break;
                        }
                        None => {
                            debug!("all sender handles were dropped");
                            break;
                        }
                    }
                }
                Some(ended) = delivery_tasks.join_next(), if !delivery_tasks.is_empty() => {
                    self.on_delivery_task_ended(ended);
                }
            }
        }

        commands.close();
        while let Ok(cmd) = commands.try_recv() {
            if let DispatchCommand::Send(request) = cmd {
                warn!(to = %request.destination, envelope = ?request.envelope, "sender is shutting down - dropping envelope");
            }
        }

        // dropping the queues lets each delivery task finish its backlog and close its connection
        self.connections.clear();
        self.closing.clear();
        while let Some(ended) = delivery_tasks.join_next().await {
            self.on_delivery_task_ended(ended);
        }
        debug!("dispatch loop terminated");
    }

    async fn dispatch(&mut self, request: OutboundRequest, delivery_tasks: &mut JoinSet<(String, u64)>) {
        let OutboundRequest { destination, mut envelope } = request;

        if let Some(connection) = self.connections.get(&destination) {
            let result = connection.envelopes.send(envelope).await;
            match result {
                Ok(()) => return,
                Err(e) => {
                    // the delivery task ended on its own, but we did not reap it yet
                    debug!(to = %destination, "connection is gone, replacing it");
                    self.connections.remove(&destination);
                    envelope = e.0;
                }
            }
        }

        let connection = self.open_connection(destination, delivery_tasks);
        if let Err(e) = connection.send(envelope).await {
            warn!(envelope = ?e.0, "delivery task terminated immediately - dropping envelope");
        }
    }

    fn open_connection(&mut self, destination: String, delivery_tasks: &mut JoinSet<(String, u64)>) -> mpsc::Sender<Envelope> {
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        // a closed predecessor must be done before the new connection is opened
        let predecessor = self.closing.remove(&destination).map(|c| c.ended);

        debug!(to = %destination, id, after_closing = predecessor.is_some(), "initializing connection");
        let (send, recv) = mpsc::channel(self.config.delivery_queue_capacity);
        let (ended_send, ended_recv) = oneshot::channel();
        delivery_tasks.spawn(run_delivery(
            destination.clone(),
            id,
            self.connector.clone(),
            self.config.clone(),
            recv,
            predecessor,
            ended_send,
        ));

        self.connections.insert(destination, DestinationConnection {
            id,
            envelopes: send.clone(),
            ended: ended_recv,
        });
        send
    }

    fn close(&mut self, destination: &str) {
        match self.connections.remove(destination) {
            Some(connection) => {
                debug!(to = %destination, id = connection.id, "closing connection");
                // replaces an older closing entry, which this connection is already waiting for
                self.closing.insert(destination.to_string(), ClosingConnection {
                    id: connection.id,
                    ended: connection.ended,
                });
            }
            None => debug!(to = %destination, "no connection to close"),
        }
    }

    fn on_delivery_task_ended(&mut self, ended: Result<(String, u64), JoinError>) {
        match ended {
            Ok((destination, id)) => {
                if self.connections.get(&destination).map(|c| c.id) == Some(id) {
                    debug!(to = %destination, id, "connection terminated, removing it");
                    self.connections.remove(&destination);
                }
                if self.closing.get(&destination).map(|c| c.id) == Some(id) {
                    trace!(to = %destination, id, "closed connection terminated");
                    self.closing.remove(&destination);
                }
            }
            Err(e) => {
                // the dead connection's queue is closed, so the next send replaces it
                error!("delivery task terminated abnormally: {}", e);
            }
        }
    }
}


/// Opens the connection to a destination and writes envelopes to it in order until the queue is
///  closed (or, depending on configuration, until a write fails). Returns the destination and
///  connection id so the dispatcher can tell which record ended.
///
/// If the previous connection to the same destination was closed but is still busy, this waits
///  for it to finish before connecting. `_ended` is dropped when this task ends, which is what
///  a successor waits for.
#[instrument(name="outbound_connection", skip_all, fields(to = %destination, id = id))]
async fn run_delivery(
    destination: String,
    id: u64,
    connector: Arc<dyn Connector>,
    config: Arc<TransportConfig>,
    mut envelopes: mpsc::Receiver<Envelope>,
    predecessor: Option<oneshot::Receiver<()>>,
    _ended: oneshot::Sender<()>,
) -> (String, u64) {
    if let Some(predecessor) = predecessor {
        trace!("waiting for the closed connection to finish");
        // nothing is ever sent, the predecessor just drops its end
        let _ = predecessor.await;
    }

    let mut connection = match connector.connect(&destination).await {
        Ok(connection) => {
            info!("outgoing connection established");
            connection
        }
        Err(e) => {
            warn!("failed to connect: {:#}", e);
            drop_pending(&mut envelopes);
            return (destination, id);
        }
    };

    while let Some(envelope) = envelopes.recv().await {
        let frame = match encode_frame(&envelope, config.max_frame_len) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(?envelope, "failed to encode envelope - dropping it: {}", e);
                continue;
            }
        };

        match write_frame(&mut connection, &frame).await {
            Ok(()) => trace!(?envelope, "sent envelope"),
            Err(e) => {
                warn!(?envelope, "failed to send envelope - dropping it: {}", e);
                if config.evict_broken_connections {
                    info!("discarding broken connection");
                    drop_pending(&mut envelopes);
                    return (destination, id);
                }
            }
        }
    }

    if let Err(e) = connection.shutdown().await {
        debug!("error closing connection: {}", e);
    }
    debug!("connection closed");
    (destination, id)
}

async fn write_frame(connection: &mut (impl AsyncWrite + Unpin), frame: &[u8]) -> std::io::Result<()> {
    connection.write_all(frame).await?;
    connection.flush().await
}

fn drop_pending(envelopes: &mut mpsc::Receiver<Envelope>) {
    envelopes.close();
    let mut num_dropped = 0usize;
    while envelopes.try_recv().is_ok() {
        num_dropped += 1;
    }
    if num_dropped > 0 {
        warn!("dropped {} queued envelope(s)", num_dropped);
    }
}
