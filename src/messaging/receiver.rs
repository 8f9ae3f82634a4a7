use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::messaging::config::TransportConfig;
use crate::messaging::envelope::Envelope;
use crate::messaging::frame::read_frame;

/// The inbound half of the transport: it listens on a local address, accepts connections from
///  any number of peers, and merges the envelopes decoded from all of them into a single
///  bounded queue.
///
/// Envelopes from the same connection arrive in the order the peer sent them. There is no
///  ordering between different connections, and a connection that turns out to be corrupt is
///  closed without affecting the others.
pub struct Receiver {
    local_addr: SocketAddr,
    inbound: mpsc::Receiver<Envelope>,
    /// `None` after shutdown
    accept_task: Option<JoinHandle<()>>,
}
impl Debug for Receiver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Receiver{{local_addr:{:?}}}", self.local_addr)
    }
}

impl Receiver {
    /// Binds the listening socket and starts accepting connections in the background. Failure
    ///  to bind is the only error the receiver ever reports: the node can not receive anything
    ///  without its address.
    pub async fn bind(addr: &str, config: Arc<TransportConfig>) -> anyhow::Result<Receiver> {
        config.validate()?;

        let listener = TcpListener::bind(addr).await
            .with_context(|| format!("failed to bind to {}", addr))?;
        let local_addr = listener.local_addr()?;
        info!("listening on {:?}", local_addr);

        let (send, recv) = mpsc::channel(config.inbound_queue_capacity);
        Ok(Receiver {
            local_addr,
            inbound: recv,
            accept_task: Some(tokio::spawn(accept_loop(listener, send, config))),
        })
    }

    /// The address the receiver actually listens on, which differs from the requested address
    ///  when binding to port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next envelope from any peer. Returns `None` only after the receiver was
    ///  shut down and all queued envelopes were consumed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Direct access to the inbound queue, e.g. for use in a `select!` loop
    pub fn channel(&mut self) -> &mut mpsc::Receiver<Envelope> {
        &mut self.inbound
    }

    /// Stops accepting connections and closes all accepted connections. Envelopes that were
    ///  queued before remain available through [Receiver::recv]. Calling this again after the
    ///  receiver was shut down has no effect.
    pub async fn shutdown(&mut self) {
        let Some(accept_task) = self.accept_task.take() else {
            debug!("receiver on {:?} was already shut down", self.local_addr);
            return;
        };

        info!("shutting down receiver on {:?}", self.local_addr);
        accept_task.abort();
        match accept_task.await {
            Err(e) if e.is_panic() => error!("accept loop terminated abnormally: {}", e),
            _ => debug!("accept loop terminated"),
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Some(accept_task) = &self.accept_task {
            accept_task.abort();
        }
    }
}


async fn accept_loop(listener: TcpListener, inbound: mpsc::Sender<Envelope>, config: Arc<TransportConfig>) {
    // dropping the join set (when this task is aborted) aborts all connections' decode tasks
    let mut decode_tasks = JoinSet::new();

    loop {
        select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        info!("incoming connection established with {:?}", peer_addr);
                        decode_tasks.spawn(handle_connection(peer_addr, stream, inbound.clone(), config.clone()));
                    }
                    Err(e) => {
                        warn!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(ended) = decode_tasks.join_next(), if !decode_tasks.is_empty() => {
                if let Err(e) = ended {
                    error!("decode task terminated abnormally: {}", e);
                }
            }
        }
    }
}

#[instrument(name="accepted_connection", skip_all, fields(peer = ?peer_addr))]
async fn handle_connection(
    peer_addr: SocketAddr,
    stream: TcpStream,
    inbound: mpsc::Sender<Envelope>,
    config: Arc<TransportConfig>,
) {
    match decode_loop(BufReader::new(stream), &inbound, config.max_frame_len).await {
        Ok(num_received) => debug!("connection closed after {} envelope(s)", num_received),
        Err(e) => warn!("failed to receive, closing connection: {:#}", e),
    }
}

/// Decodes envelopes from a connection and hands them to the inbound queue, waiting while the
///  queue is full. Ends with `Ok` when the peer closes the connection between two frames, and
///  with an error for anything else.
async fn decode_loop<R: AsyncRead + Unpin>(mut reader: R, inbound: &mpsc::Sender<Envelope>, max_frame_len: u32) -> anyhow::Result<u64> {
    let mut num_received = 0;
    while let Some(envelope) = read_frame(&mut reader, max_frame_len).await? {
        trace!(?envelope, "received envelope");
        if inbound.send(envelope).await.is_err() {
            debug!("inbound queue was dropped - closing connection");
            break;
        }
        num_received += 1;
    }
    Ok(num_received)
}
