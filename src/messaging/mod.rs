//! Point-to-point transport of opaque [envelope::Envelope]s between nodes over TCP.
//!
//! The transport consists of two independent halves that share no state:
//!
//! * [sender::Sender] accepts `(destination, envelope)` pairs, lazily opens one connection per
//!   destination and writes envelopes for a destination in the order they were submitted
//! * [receiver::Receiver] listens on a local address and merges envelopes from all accepted
//!   connections into a single queue
//!
//! Delivery is best effort. Envelopes that can not be delivered (peer unreachable, envelope too
//!  big, connection broken) are logged and dropped, and callers are never told. Reliability is
//!  the job of the protocols running on top of this transport.
//!
//! All queues between tasks are bounded, so a producer that outpaces the network eventually
//!  waits instead of accumulating memory or losing envelopes.

pub mod config;
pub mod connector;
pub mod envelope;
pub mod frame;
pub mod receiver;
pub mod sender;

#[cfg(test)]
mod transport_tests;
