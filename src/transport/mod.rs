//! §6.2: the Transport collaborator boundary. The core never issues raw
//! socket calls — everything below this trait is platform-specific and
//! out of scope for the responder core itself.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;

pub mod udp;

/// `(packet, srcAddr, ifIndex)` as delivered by `Transport::recv`.
/// `ifIndex=0` means "interface unknown; degrade gracefully" (§6.2).
pub type Received = (Vec<u8>, SocketAddr, u32);

/// The standard mDNS multicast group and port (§6.1).
pub const MULTICAST_ADDR: &str = "224.0.0.251:5353";

/// §4.6 step 4's `resolveIPv4(ifIndex)`: a second narrow collaborator
/// boundary, parallel to [`Transport`] — enumerating the host's interfaces
/// is exactly the kind of platform specificity the core delegates away.
/// Implementations answer "what IPv4 address does interface `ifIndex`
/// carry" and "what's a reasonable fallback when the interface is
/// unknown" (§4.6: `ifIndex=0` → first non-loopback IPv4 on any
/// interface; unknown `ifIndex` → `None`, and the response is skipped).
pub trait InterfaceResolver: Send + Sync {
    /// `None` means "no IPv4 on this interface" or "no such interface" —
    /// the caller must skip the response rather than leak another
    /// interface's address (§4.6, §8.1 invariant 1).
    fn resolve(&self, if_index: u32) -> Option<Ipv4Addr>;

    /// Used only when `if_index == 0` (control message unavailable).
    fn first_non_loopback(&self) -> Option<Ipv4Addr>;
}

/// A fixed `ifIndex → Ipv4Addr` table, populated by the embedder (or by a
/// test). The production default has no portable way to enumerate
/// interfaces without a platform-specific dependency outside this crate's
/// stack, so it is supplied rather than auto-detected.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaceResolver {
    by_index: HashMap<u32, Ipv4Addr>,
}

impl StaticInterfaceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interface(mut self, if_index: u32, addr: Ipv4Addr) -> Self {
        self.by_index.insert(if_index, addr);
        self
    }
}

impl InterfaceResolver for StaticInterfaceResolver {
    fn resolve(&self, if_index: u32) -> Option<Ipv4Addr> {
        self.by_index.get(&if_index).copied()
    }

    fn first_non_loopback(&self) -> Option<Ipv4Addr> {
        self.by_index
            .values()
            .find(|addr| !addr.is_loopback() && !addr.is_unspecified())
            .copied()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// `dest=None` means "multicast to the standard group/port" (§6.2).
    async fn send(&self, packet: &[u8], dest: Option<SocketAddr>) -> Result<()>;

    /// Blocks until the next inbound packet. `ifIndex=0` on platforms or
    /// code paths where the control message couldn't be extracted.
    async fn recv(&self) -> Result<Received>;

    /// Idempotent; a second call is a no-op.
    async fn close(&self) -> Result<()>;
}

/// A recorded outbound send, captured by [`MockTransport`] for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub packet: Vec<u8>,
    pub dest: Option<SocketAddr>,
}

/// An in-memory transport for tests (§9 "test seams"): `recv` replays a
/// queue of synthetic `(packet, srcAddr, ifIndex)` tuples fed in by the
/// test, and `send` is recorded rather than put on a wire.
pub struct MockTransport {
    inbox_tx: mpsc::UnboundedSender<Received>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Received>>,
    sent: StdMutex<Vec<SentPacket>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        MockTransport {
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            sent: StdMutex::new(Vec::new()),
        }
    }

    /// Queues a packet for a future `recv()` call to return.
    pub fn push_received(&self, packet: Vec<u8>, src: SocketAddr, if_index: u32) {
        let _ = self.inbox_tx.send((packet, src, if_index));
    }

    /// A snapshot of every packet recorded via `send()` so far.
    pub fn sent_packets(&self) -> Vec<SentPacket> {
        self.sent.lock().unwrap().clone()
    }

    /// Clears the recorded sends, so a later assertion only sees what
    /// happens from this point on.
    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, packet: &[u8], dest: Option<SocketAddr>) -> Result<()> {
        self.sent.lock().unwrap().push(SentPacket {
            packet: packet.to_vec(),
            dest,
        });
        Ok(())
    }

    async fn recv(&self) -> Result<Received> {
        let mut rx = self.inbox_rx.lock().await;
        rx.recv().await.ok_or(crate::error::Error::Closed)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_queued_packets_in_order() {
        let transport = MockTransport::new();
        let src: SocketAddr = "10.0.0.9:5353".parse().unwrap();
        transport.push_received(vec![1, 2, 3], src, 2);
        transport.push_received(vec![4, 5, 6], src, 3);

        let (packet, _, if_index) = transport.recv().await.unwrap();
        assert_eq!(packet, vec![1, 2, 3]);
        assert_eq!(if_index, 2);

        let (packet, _, if_index) = transport.recv().await.unwrap();
        assert_eq!(packet, vec![4, 5, 6]);
        assert_eq!(if_index, 3);
    }

    #[tokio::test]
    async fn records_every_send() {
        let transport = MockTransport::new();
        transport.send(&[9, 9], None).await.unwrap();
        let dest: SocketAddr = "10.0.0.1:5353".parse().unwrap();
        transport.send(&[1], Some(dest)).await.unwrap();

        let sent = transport.sent_packets();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].dest, None);
        assert_eq!(sent[1].dest, Some(dest));
    }

    #[test]
    fn static_resolver_distinguishes_interfaces_and_falls_back() {
        let resolver = StaticInterfaceResolver::new()
            .with_interface(2, Ipv4Addr::new(10, 0, 1, 10))
            .with_interface(3, Ipv4Addr::new(10, 0, 2, 10));

        assert_eq!(resolver.resolve(2), Some(Ipv4Addr::new(10, 0, 1, 10)));
        assert_eq!(resolver.resolve(3), Some(Ipv4Addr::new(10, 0, 2, 10)));
        assert_eq!(resolver.resolve(99), None);
        assert!(resolver.first_non_loopback().is_some());
    }
}
