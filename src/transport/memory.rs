//! In-process network for tests and local simulations.
//!
//! Every [`MemoryTransport`] created from one [`MemoryNetwork`] listens on an
//! address string and can dial the others. Only one link may exist between a
//! pair of endpoints; the second dial in either direction is refused with
//! [`TransportError::AlreadyConnected`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Connection, EventSender, Peer, PeerHandle, Transport, TransportError, TransportEvent};
use crate::raft::NodeId;

#[derive(Debug)]
struct Listener {
    id: NodeId,
    events: EventSender,
}

#[derive(Debug, Clone)]
struct LinkEnd {
    owner: String,
    remote: PeerHandle,
    pair: (NodeId, NodeId),
}

#[derive(Debug, Default)]
struct NetworkInner {
    next_handle: u64,
    listeners: HashMap<String, Listener>,
    links: HashMap<PeerHandle, LinkEnd>,
    pairs: HashSet<(NodeId, NodeId)>,
    refused: HashSet<String>,
    sent: u64,
}

impl NetworkInner {
    fn issue_handle(&mut self) -> PeerHandle {
        self.next_handle += 1;
        PeerHandle::new(self.next_handle)
    }

    fn notify(&self, owner: &str, event: TransportEvent) {
        if let Some(listener) = self.listeners.get(owner) {
            let _ = listener.events.send(event);
        }
    }

    /// Tear down both ends of the link `handle` belongs to and tell the remote side.
    fn close(&mut self, handle: PeerHandle) {
        let Some(end) = self.links.remove(&handle) else {
            return;
        };
        self.pairs.remove(&end.pair);
        if let Some(remote) = self.links.remove(&end.remote) {
            self.notify(&remote.owner, TransportEvent::Disconnected(end.remote));
        }
    }
}

/// Shared in-memory network. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint that will listen on `address` once started.
    pub fn transport(&self, address: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            id: NodeId::generate(),
            address: address.into(),
        }
    }

    /// Make every future dial to `address` fail.
    pub fn refuse(&self, address: impl Into<String>) {
        self.lock().refused.insert(address.into());
    }

    /// Number of payloads delivered over the network so far.
    pub fn sent_count(&self) -> u64 {
        self.lock().sent
    }

    /// Number of open links (each link counted once).
    pub fn link_count(&self) -> usize {
        self.lock().pairs.len()
    }

    pub fn is_listening(&self, address: &str) -> bool {
        self.lock().listeners.contains_key(address)
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    id: NodeId,
    address: String,
}

impl MemoryTransport {
    pub fn id(&self) -> NodeId {
        self.id
    }

    fn owned_link(&self, inner: &NetworkInner, handle: PeerHandle) -> Result<LinkEnd, TransportError> {
        match inner.links.get(&handle) {
            Some(end) if end.owner == self.address => Ok(end.clone()),
            _ => Err(TransportError::Closed(handle)),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> Option<NodeId> {
        Some(self.id)
    }

    async fn start(&self, events: EventSender) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        inner.listeners.insert(
            self.address.clone(),
            Listener {
                id: self.id,
                events,
            },
        );
        tracing::debug!(address = %self.address, id = %self.id, "Listening");
        Ok(())
    }

    async fn connect(&self, peer: &Peer) -> Result<Connection, TransportError> {
        let mut inner = self.network.lock();
        if !inner.listeners.contains_key(&self.address) {
            return Err(TransportError::NotListening);
        }

        match peer {
            Peer::Accepted(handle) => {
                let end = self.owned_link(&inner, *handle)?;
                let remote_owner = inner
                    .links
                    .get(&end.remote)
                    .map(|remote| remote.owner.clone())
                    .ok_or(TransportError::Closed(*handle))?;
                let id = inner.listeners.get(&remote_owner).map(|l| l.id);
                Ok(Connection {
                    handle: *handle,
                    id,
                })
            }
            Peer::Address(addr) => {
                if inner.refused.contains(addr) {
                    return Err(TransportError::Refused(addr.clone()));
                }
                let remote_id = inner
                    .listeners
                    .get(addr)
                    .map(|l| l.id)
                    .ok_or_else(|| TransportError::UnknownAddress(addr.clone()))?;

                let pair = if self.id <= remote_id {
                    (self.id, remote_id)
                } else {
                    (remote_id, self.id)
                };
                if inner.pairs.contains(&pair) {
                    return Err(TransportError::AlreadyConnected(addr.clone()));
                }

                let local = inner.issue_handle();
                let remote = inner.issue_handle();
                inner.pairs.insert(pair);
                inner.links.insert(
                    local,
                    LinkEnd {
                        owner: self.address.clone(),
                        remote,
                        pair,
                    },
                );
                inner.links.insert(
                    remote,
                    LinkEnd {
                        owner: addr.clone(),
                        remote: local,
                        pair,
                    },
                );
                inner.notify(addr, TransportEvent::Connected(remote));

                Ok(Connection {
                    handle: local,
                    id: Some(remote_id),
                })
            }
        }
    }

    async fn send(&self, peer: PeerHandle, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        let end = self.owned_link(&inner, peer)?;
        let remote_owner = inner
            .links
            .get(&end.remote)
            .map(|remote| remote.owner.clone())
            .ok_or(TransportError::Closed(peer))?;
        inner.notify(
            &remote_owner,
            TransportEvent::Data {
                peer: end.remote,
                payload,
            },
        );
        inner.sent += 1;
        Ok(())
    }

    async fn disconnect(&self, peer: PeerHandle) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        if self.owned_link(&inner, peer).is_ok() {
            inner.close(peer);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let mut inner = self.network.lock();
        let owned: Vec<PeerHandle> = inner
            .links
            .iter()
            .filter(|(_, end)| end.owner == self.address)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in owned {
            inner.close(handle);
        }
        inner.listeners.remove(&self.address);
        tracing::debug!(address = %self.address, "Stopped listening");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn started(
        network: &MemoryNetwork,
        address: &str,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = network.transport(address);
        let (tx, rx) = mpsc::unbounded_channel();
        transport.start(tx).await.unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn test_connect_notifies_remote_and_reports_id() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = started(&network, "a").await;
        let (b, mut b_rx) = started(&network, "b").await;

        let conn = a.connect(&Peer::Address("b".into())).await.unwrap();
        assert_eq!(conn.id, Some(b.id()));

        let accepted = match b_rx.try_recv().unwrap() {
            TransportEvent::Connected(handle) => handle,
            other => panic!("unexpected event {:?}", other),
        };
        let back = b.connect(&Peer::Accepted(accepted)).await.unwrap();
        assert_eq!(back.id, Some(a.id()));
        assert_eq!(network.link_count(), 1);
    }

    #[tokio::test]
    async fn test_second_link_between_pair_is_refused() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = started(&network, "a").await;
        let (b, _b_rx) = started(&network, "b").await;

        a.connect(&Peer::Address("b".into())).await.unwrap();
        let err = b.connect(&Peer::Address("a".into())).await.unwrap_err();
        assert_eq!(err, TransportError::AlreadyConnected("a".into()));
    }

    #[tokio::test]
    async fn test_send_delivers_in_order() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = started(&network, "a").await;
        let (_b, mut b_rx) = started(&network, "b").await;

        let conn = a.connect(&Peer::Address("b".into())).await.unwrap();
        a.send(conn.handle, b"one".to_vec()).await.unwrap();
        a.send(conn.handle, b"two".to_vec()).await.unwrap();

        let accepted = match b_rx.try_recv().unwrap() {
            TransportEvent::Connected(handle) => handle,
            other => panic!("unexpected event {:?}", other),
        };
        for expected in [b"one".to_vec(), b"two".to_vec()] {
            assert_eq!(
                b_rx.try_recv().unwrap(),
                TransportEvent::Data {
                    peer: accepted,
                    payload: expected
                }
            );
        }
        assert_eq!(network.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remote_once() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = started(&network, "a").await;
        let (_b, mut b_rx) = started(&network, "b").await;

        let conn = a.connect(&Peer::Address("b".into())).await.unwrap();
        let accepted = match b_rx.try_recv().unwrap() {
            TransportEvent::Connected(handle) => handle,
            other => panic!("unexpected event {:?}", other),
        };

        a.disconnect(conn.handle).await.unwrap();
        a.disconnect(conn.handle).await.unwrap();
        assert_eq!(b_rx.try_recv().unwrap(), TransportEvent::Disconnected(accepted));
        assert!(b_rx.try_recv().is_err());
        assert_eq!(network.link_count(), 0);
        assert_eq!(
            a.send(conn.handle, vec![]).await.unwrap_err(),
            TransportError::Closed(conn.handle)
        );
    }

    #[tokio::test]
    async fn test_refused_and_unknown_addresses() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = started(&network, "a").await;
        let (_b, _b_rx) = started(&network, "b").await;
        network.refuse("b");

        assert_eq!(
            a.connect(&Peer::Address("b".into())).await.unwrap_err(),
            TransportError::Refused("b".into())
        );
        assert_eq!(
            a.connect(&Peer::Address("nowhere".into())).await.unwrap_err(),
            TransportError::UnknownAddress("nowhere".into())
        );
    }

    #[tokio::test]
    async fn test_unstarted_transport_and_foreign_links() {
        let network = MemoryNetwork::new();
        let idle = network.transport("idle");
        let (a, _a_rx) = started(&network, "a").await;
        let (b, _b_rx) = started(&network, "b").await;

        assert_eq!(
            idle.connect(&Peer::Address("a".into())).await.unwrap_err(),
            TransportError::NotListening
        );

        // A handle issued to `a` is not usable by `b`.
        let conn = a.connect(&Peer::Address("b".into())).await.unwrap();
        assert_eq!(
            b.send(conn.handle, b"x".to_vec()).await.unwrap_err(),
            TransportError::Closed(conn.handle)
        );
        assert_eq!(network.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_links_and_listener() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = started(&network, "a").await;
        let (_b, mut b_rx) = started(&network, "b").await;
        a.connect(&Peer::Address("b".into())).await.unwrap();
        let _ = b_rx.try_recv();

        a.stop().await.unwrap();
        assert!(matches!(
            b_rx.try_recv().unwrap(),
            TransportEvent::Disconnected(_)
        ));
        assert!(!network.is_listening("a"));
        assert_eq!(network.link_count(), 0);
    }
}
