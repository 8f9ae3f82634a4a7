use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tracing::trace;

pub type BoxedConnection = Box<dyn AsyncWrite + Send + Unpin>;

/// This trait decouples opening outbound connections from the logic of dispatching envelopes to
///  them. The transport only ever writes to outbound connections, so a connection is represented
///  by its write side.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, destination: &str) -> anyhow::Result<BoxedConnection>;
}

/// Plain TCP connections, resolving `host:port` destinations through the OS resolver
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, destination: &str) -> anyhow::Result<BoxedConnection> {
        let stream = TcpStream::connect(destination).await
            .with_context(|| format!("failed to connect to {}", destination))?;

        // envelopes are written as complete frames, so there is nothing to gain from Nagle
        stream.set_nodelay(true)?;
        trace!(local_addr = ?stream.local_addr()?, "connected to {}", destination);

        Ok(Box::new(stream))
    }
}
