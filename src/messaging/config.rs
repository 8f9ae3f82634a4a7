use anyhow::bail;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Capacity of the queue between callers and the sender's dispatch loop. Callers wait when
    ///  it is full.
    pub submission_queue_capacity: usize,
    /// Capacity of each destination's private queue between the dispatch loop and the task
    ///  writing to that destination's connection.
    pub delivery_queue_capacity: usize,
    /// Capacity of the receiver's shared queue of decoded envelopes.
    pub inbound_queue_capacity: usize,

    /// Upper bound for a frame's length on the wire. Envelopes that do not fit are dropped
    ///  on the sending side, and a peer announcing a longer frame is treated as sending a
    ///  corrupt stream.
    pub max_frame_len: u32,

    /// If set, a connection is discarded after the first failed write, and the next envelope for
    ///  that destination opens a new connection. Otherwise the connection is kept, and every
    ///  subsequent envelope is attempted on it.
    pub evict_broken_connections: bool,
}

impl TransportConfig {
    pub const MIN_FRAME_LEN: u32 = 16;

    pub fn new() -> TransportConfig {
        TransportConfig {
            submission_queue_capacity: 1000,
            delivery_queue_capacity: 1000,
            inbound_queue_capacity: 1000,
            max_frame_len: 16*1024*1024,
            evict_broken_connections: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.submission_queue_capacity == 0 {
            bail!("submission queue capacity must be greater than 0");
        }
        if self.delivery_queue_capacity == 0 {
            bail!("delivery queue capacity must be greater than 0");
        }
        if self.inbound_queue_capacity == 0 {
            bail!("inbound queue capacity must be greater than 0");
        }
        if self.max_frame_len < Self::MIN_FRAME_LEN {
            bail!("max frame length must be at least {} bytes, was {}", Self::MIN_FRAME_LEN, self.max_frame_len);
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::new()
    }
}
