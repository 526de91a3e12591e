/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pluggable transport trait.

use std::time::Duration;

use crate::errors::TransportError;
use crate::types::basic::NodeId;

use super::messages::Message;

/// Point-to-point, authenticated delivery of [`Message`]s between the nodes of one schain.
///
/// The transport is responsible for identifying the origin of every message it delivers: the
/// [`NodeId`] returned from [`recv`](Self::recv) is trusted, and messages claiming another sender are
/// dropped. Implementations typically frame messages with
/// [`encode_frame`](super::messages::encode_frame) and [`decode_frame`](super::messages::decode_frame).
///
/// Clones share the same underlying connections: every node thread that sends holds its own clone.
pub trait PeerTransport: Clone + Send + 'static {
    /// Send `message` to `peer`. Blocks at most for the transport's own write timeout.
    fn send(&mut self, peer: NodeId, message: Message) -> Result<(), TransportError>;

    /// Receive a message from any peer, waiting at most `timeout`.
    fn recv(&mut self, timeout: Duration) -> Option<(NodeId, Message)>;

    /// Whether `peer` currently looks reachable. Only consulted by the start-up health check.
    fn reachable(&mut self, _peer: NodeId) -> bool {
        true
    }

    /// Close every connection. Called once, after all node threads have exited.
    fn shutdown(&mut self) {}
}
