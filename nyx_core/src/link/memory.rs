/*!
In-process link layer.

Every node registers with a shared [`MemoryNetwork`](./struct.MemoryNetwork.html);
establishes succeed instantly when the peer is registered and frames are
delivered loss-free and in order. Used by the test suites.
*/

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::channel::mpsc;
use parking_lot::Mutex;

use nyx_crypto::RouterId;
use nyx_packet::router_contact::RouterContact;

use super::{LinkEvent, LinkEventReceiver, LinkEventSender, LinkLayer};

struct Peer {
    rc: RouterContact,
    events: LinkEventSender,
}

#[derive(Default)]
struct NetworkInner {
    peers: HashMap<RouterId, Peer>,
    sessions: HashSet<(RouterId, RouterId)>,
}

fn session_key(a: RouterId, b: RouterId) -> (RouterId, RouterId) {
    if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    }
}

/// The shared fabric all in-memory links hang off.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> MemoryNetwork {
        MemoryNetwork::default()
    }
}

/// One node's endpoint on a [`MemoryNetwork`](./struct.MemoryNetwork.html).
pub struct MemoryLink {
    network: MemoryNetwork,
    our_id: RouterId,
    events: LinkEventSender,
}

impl MemoryLink {
    /// Register on the network; the returned receiver is the router's
    /// event channel.
    pub fn new(network: &MemoryNetwork, rc: RouterContact) -> (Arc<MemoryLink>, LinkEventReceiver) {
        let (tx, rx) = mpsc::unbounded();
        let our_id = rc.pubkey;
        network.inner.lock().peers.insert(
            our_id,
            Peer {
                rc,
                events: tx.clone(),
            },
        );
        (
            Arc::new(MemoryLink {
                network: network.clone(),
                our_id,
                events: tx,
            }),
            rx,
        )
    }
}

impl LinkLayer for MemoryLink {
    fn has_session_to(&self, remote: &RouterId) -> bool {
        self.network
            .inner
            .lock()
            .sessions
            .contains(&session_key(self.our_id, *remote))
    }

    fn try_establish_to(&self, rc: &RouterContact) {
        let remote = rc.pubkey;
        let mut guard = self.network.inner.lock();
        let inner = &mut *guard;
        if !inner.peers.contains_key(&remote) {
            let _ = self.events.unbounded_send(LinkEvent::ConnectTimeout(remote));
            return;
        }
        inner.sessions.insert(session_key(self.our_id, remote));
        let remote_rc = inner.peers[&remote].rc.clone();
        let our_rc = inner.peers[&self.our_id].rc.clone();
        let _ = inner.peers[&remote]
            .events
            .unbounded_send(LinkEvent::SessionEstablished(our_rc));
        let _ = self
            .events
            .unbounded_send(LinkEvent::SessionEstablished(remote_rc));
    }

    fn send_to(&self, remote: &RouterId, frame: Vec<u8>) -> bool {
        let inner = self.network.inner.lock();
        if !inner.sessions.contains(&session_key(self.our_id, *remote)) {
            return false;
        }
        match inner.peers.get(remote) {
            Some(peer) => peer
                .events
                .unbounded_send(LinkEvent::Frame {
                    from: self.our_id,
                    bytes: frame,
                })
                .is_ok(),
            None => false,
        }
    }

    fn keep_alive(&self, _remote: &RouterId) {}

    fn close_all(&self) {
        let mut inner = self.network.inner.lock();
        let ours: Vec<(RouterId, RouterId)> = inner
            .sessions
            .iter()
            .filter(|(a, b)| *a == self.our_id || *b == self.our_id)
            .copied()
            .collect();
        for key in ours {
            inner.sessions.remove(&key);
            let other = if key.0 == self.our_id { key.1 } else { key.0 };
            if let Some(peer) = inner.peers.get(&other) {
                let _ = peer.events.unbounded_send(LinkEvent::SessionClosed(self.our_id));
            }
            let _ = self.events.unbounded_send(LinkEvent::SessionClosed(other));
        }
    }

    fn session_count(&self) -> usize {
        let inner = self.network.inner.lock();
        inner
            .sessions
            .iter()
            .filter(|(a, b)| *a == self.our_id || *b == self.our_id)
            .count()
    }

    fn sessions(&self) -> Vec<RouterId> {
        let inner = self.network.inner.lock();
        inner
            .sessions
            .iter()
            .filter(|(a, b)| *a == self.our_id || *b == self.our_id)
            .map(|(a, b)| if *a == self.our_id { *b } else { *a })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::path::tests::test_rc_with_keys;

    #[tokio::test]
    async fn establish_and_exchange() {
        let network = MemoryNetwork::new();
        let (rc_a, _, _) = test_rc_with_keys();
        let (rc_b, _, _) = test_rc_with_keys();
        let id_a = rc_a.pubkey;
        let id_b = rc_b.pubkey;

        let (link_a, mut events_a) = MemoryLink::new(&network, rc_a);
        let (link_b, mut events_b) = MemoryLink::new(&network, rc_b.clone());

        assert!(!link_a.has_session_to(&id_b));
        link_a.try_establish_to(&rc_b);
        assert!(link_a.has_session_to(&id_b));
        assert!(link_b.has_session_to(&id_a));

        match events_a.next().await.unwrap() {
            LinkEvent::SessionEstablished(rc) => assert_eq!(rc.pubkey, id_b),
            other => panic!("unexpected event {:?}", other),
        }
        match events_b.next().await.unwrap() {
            LinkEvent::SessionEstablished(rc) => assert_eq!(rc.pubkey, id_a),
            other => panic!("unexpected event {:?}", other),
        }

        assert!(link_a.send_to(&id_b, b"hello".to_vec()));
        match events_b.next().await.unwrap() {
            LinkEvent::Frame { from, bytes } => {
                assert_eq!(from, id_a);
                assert_eq!(bytes, b"hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_peer_times_out() {
        let network = MemoryNetwork::new();
        let (rc_a, _, _) = test_rc_with_keys();
        let (rc_b, _, _) = test_rc_with_keys();
        let (link_a, mut events_a) = MemoryLink::new(&network, rc_a);

        link_a.try_establish_to(&rc_b);
        match events_a.next().await.unwrap() {
            LinkEvent::ConnectTimeout(id) => assert_eq!(id, rc_b.pubkey),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_without_session_fails() {
        let network = MemoryNetwork::new();
        let (rc_a, _, _) = test_rc_with_keys();
        let (rc_b, _, _) = test_rc_with_keys();
        let id_b = rc_b.pubkey;
        let (link_a, _events_a) = MemoryLink::new(&network, rc_a);
        let (_link_b, _events_b) = MemoryLink::new(&network, rc_b);

        assert!(!link_a.send_to(&id_b, b"nope".to_vec()));
    }

    #[tokio::test]
    async fn close_all_notifies_both_sides() {
        let network = MemoryNetwork::new();
        let (rc_a, _, _) = test_rc_with_keys();
        let (rc_b, _, _) = test_rc_with_keys();
        let (link_a, _events_a) = MemoryLink::new(&network, rc_a);
        let (link_b, mut events_b) = MemoryLink::new(&network, rc_b.clone());

        link_a.try_establish_to(&rc_b);
        let _ = events_b.next().await;
        link_a.close_all();
        assert_eq!(link_a.session_count(), 0);
        assert!(!link_b.has_session_to(&link_a.our_id));

        match events_b.next().await.unwrap() {
            LinkEvent::SessionClosed(_) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
}
