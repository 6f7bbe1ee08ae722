/*!
UDP link layer.

One datagram carries one link message. Sessions are established with a
signed intro exchange: the initiator sends a
[`LinkIntroMessage`](../../nyx_packet/link/struct.LinkIntroMessage.html),
the responder answers with its own. Descriptor verification stays with
the router; this layer only maps peers to socket addresses.
*/

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use nyx_binary_io::{FromBytes, ToBytes};
use nyx_core::link::{LinkEvent, LinkEventReceiver, LinkEventSender, LinkLayer};
use nyx_crypto::RouterId;
use nyx_packet::link::LinkIntroMessage;
use nyx_packet::router_contact::RouterContact;
use nyx_packet::MAX_LINK_MSG_SIZE;

/// How long an intro may stay unanswered.
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(5);

struct PendingConnect {
    addr: SocketAddr,
    deadline: Instant,
}

#[derive(Default)]
struct LinkState {
    sessions: HashMap<RouterId, SocketAddr>,
    addrs: HashMap<SocketAddr, RouterId>,
    pending: HashMap<RouterId, PendingConnect>,
}

/// UDP implementation of the link layer.
pub struct UdpLink {
    our_rc: RouterContact,
    events: LinkEventSender,
    outbound: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    state: Mutex<LinkState>,
}

fn dial_addr(rc: &RouterContact) -> Option<SocketAddr> {
    rc.addrs
        .iter()
        .min_by_key(|a| a.rank)
        .map(|a| SocketAddr::new(a.ip, a.port))
}

impl UdpLink {
    /// Create the link around a bound socket. The returned future is the
    /// socket driver; the receiver is the router's event channel.
    pub fn new(
        socket: UdpSocket,
        our_rc: RouterContact,
    ) -> (Arc<UdpLink>, LinkEventReceiver, impl std::future::Future<Output = ()>) {
        let (event_tx, event_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded();
        let link = Arc::new(UdpLink {
            our_rc,
            events: event_tx,
            outbound: out_tx,
            state: Mutex::new(LinkState::default()),
        });
        let driver = link.clone().run(socket, out_rx);
        (link, event_rx, driver)
    }

    fn intro_bytes(&self) -> Option<Vec<u8>> {
        let intro = LinkIntroMessage {
            rc: self.our_rc.clone(),
        };
        let mut buf = [0; MAX_LINK_MSG_SIZE];
        match intro.to_bytes((&mut buf, 0)) {
            Ok((_, size)) => Some(buf[..size].to_vec()),
            Err(e) => {
                error!("failed to encode link intro: {:?}", e);
                None
            }
        }
    }

    fn queue_datagram(&self, addr: SocketAddr, bytes: Vec<u8>) -> bool {
        self.outbound.unbounded_send((addr, bytes)).is_ok()
    }

    async fn run(
        self: Arc<Self>,
        socket: UdpSocket,
        mut outbound: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    ) {
        let mut buf = vec![0; MAX_LINK_MSG_SIZE];
        let mut wakeups = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                out = outbound.next() => match out {
                    Some((addr, bytes)) => {
                        if let Err(e) = socket.send_to(&bytes, addr).await {
                            warn!("udp send to {} failed: {}", addr, e);
                        }
                    }
                    None => break,
                },
                recv = socket.recv_from(&mut buf) => match recv {
                    Ok((len, addr)) => self.handle_datagram(&buf[..len], addr),
                    Err(e) => warn!("udp receive failed: {}", e),
                },
                _ = wakeups.tick() => self.expire_pending(),
            }
        }
        debug!("udp link driver done");
    }

    fn handle_datagram(&self, bytes: &[u8], addr: SocketAddr) {
        if let Ok((_, intro)) = LinkIntroMessage::from_bytes(bytes) {
            self.handle_intro(intro, addr);
            return;
        }
        let from = self.state.lock().addrs.get(&addr).copied();
        match from {
            Some(from) => {
                let _ = self.events.unbounded_send(LinkEvent::Frame {
                    from,
                    bytes: bytes.to_vec(),
                });
            }
            None => debug!("datagram from {} without a session", addr),
        }
    }

    fn handle_intro(&self, intro: LinkIntroMessage, addr: SocketAddr) {
        let id = intro.rc.pubkey;
        let (initiated, known) = {
            let mut state = self.state.lock();
            let initiated = state.pending.remove(&id).is_some();
            let known = state.sessions.contains_key(&id);
            state.sessions.insert(id, addr);
            state.addrs.insert(addr, id);
            (initiated, known)
        };
        if !initiated && !known {
            // answer the handshake so the initiator completes too
            if let Some(bytes) = self.intro_bytes() {
                self.queue_datagram(addr, bytes);
            }
        }
        if !known {
            debug!("session with {} over {}", id, addr);
            let _ = self
                .events
                .unbounded_send(LinkEvent::SessionEstablished(intro.rc));
        }
    }

    fn expire_pending(&self) {
        let now = Instant::now();
        let expired: Vec<RouterId> = {
            let mut state = self.state.lock();
            let expired: Vec<RouterId> = state
                .pending
                .iter()
                .filter(|(_, pending)| now >= pending.deadline)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                state.pending.remove(id);
            }
            expired
        };
        for id in expired {
            let _ = self.events.unbounded_send(LinkEvent::ConnectTimeout(id));
        }
    }
}

impl LinkLayer for UdpLink {
    fn has_session_to(&self, remote: &RouterId) -> bool {
        self.state.lock().sessions.contains_key(remote)
    }

    fn try_establish_to(&self, rc: &RouterContact) {
        let id = rc.pubkey;
        let addr = match dial_addr(rc) {
            Some(addr) => addr,
            None => {
                warn!("{} has no dialable address", id);
                let _ = self.events.unbounded_send(LinkEvent::ConnectTimeout(id));
                return;
            }
        };
        {
            let mut state = self.state.lock();
            if state.sessions.contains_key(&id) || state.pending.contains_key(&id) {
                return;
            }
            state.pending.insert(
                id,
                PendingConnect {
                    addr,
                    deadline: Instant::now() + ESTABLISH_TIMEOUT,
                },
            );
        }
        if let Some(bytes) = self.intro_bytes() {
            self.queue_datagram(addr, bytes);
        }
    }

    fn send_to(&self, remote: &RouterId, frame: Vec<u8>) -> bool {
        let addr = match self.state.lock().sessions.get(remote) {
            Some(addr) => *addr,
            None => return false,
        };
        self.queue_datagram(addr, frame)
    }

    fn keep_alive(&self, remote: &RouterId) {
        let addr = match self.state.lock().sessions.get(remote) {
            Some(addr) => *addr,
            None => return,
        };
        if let Some(bytes) = self.intro_bytes() {
            self.queue_datagram(addr, bytes);
        }
    }

    fn close_all(&self) {
        let closed: Vec<RouterId> = {
            let mut state = self.state.lock();
            state.addrs.clear();
            state.pending.clear();
            state.sessions.drain().map(|(id, _)| id).collect()
        };
        for id in closed {
            let _ = self.events.unbounded_send(LinkEvent::SessionClosed(id));
        }
    }

    fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    fn sessions(&self) -> Vec<RouterId> {
        self.state.lock().sessions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    use nyx_crypto::{SecretKey, SigningKey};
    use nyx_packet::router_contact::{AddressInfo, NetId};

    fn test_rc(addr: Option<SocketAddr>) -> RouterContact {
        let mut rng = thread_rng();
        let identity = SigningKey::generate(&mut rng);
        let enckey = SecretKey::generate(&mut rng).public_key();
        let mut rc = RouterContact::new(&identity, enckey, NetId::default());
        if let Some(addr) = addr {
            rc.addrs.push(AddressInfo {
                dialect: "udp".to_owned(),
                ip: addr.ip(),
                port: addr.port(),
                rank: 1,
            });
        }
        rc.sign(&identity, nyx_core::time::now_ms()).unwrap();
        rc
    }

    async fn bind_link(rc_addr: bool) -> (Arc<UdpLink>, LinkEventReceiver, RouterContact) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let rc = test_rc(if rc_addr { Some(addr) } else { None });
        let (link, events, driver) = UdpLink::new(socket, rc.clone());
        tokio::spawn(driver);
        (link, events, rc)
    }

    #[tokio::test]
    async fn intro_exchange_establishes_both_sides() {
        let (link_a, mut events_a, rc_a) = bind_link(true).await;
        let (link_b, mut events_b, rc_b) = bind_link(true).await;

        link_a.try_establish_to(&rc_b);

        match events_b.next().await.unwrap() {
            LinkEvent::SessionEstablished(rc) => assert_eq!(rc.pubkey, rc_a.pubkey),
            other => panic!("unexpected event {:?}", other),
        }
        match events_a.next().await.unwrap() {
            LinkEvent::SessionEstablished(rc) => assert_eq!(rc.pubkey, rc_b.pubkey),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(link_a.has_session_to(&rc_b.pubkey));
        assert!(link_b.has_session_to(&rc_a.pubkey));
    }

    #[tokio::test]
    async fn frames_flow_after_establish() {
        let (link_a, mut events_a, rc_a) = bind_link(true).await;
        let (link_b, mut events_b, rc_b) = bind_link(true).await;

        link_a.try_establish_to(&rc_b);
        let _ = events_a.next().await;
        let _ = events_b.next().await;

        assert!(link_a.send_to(&rc_b.pubkey, b"d1:Xi1ee".to_vec()));
        match events_b.next().await.unwrap() {
            LinkEvent::Frame { from, bytes } => {
                assert_eq!(from, rc_a.pubkey);
                assert_eq!(bytes, b"d1:Xi1ee");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn establish_to_addressless_rc_times_out() {
        let (link_a, mut events_a, _rc_a) = bind_link(true).await;
        let rc_ghost = test_rc(None);

        link_a.try_establish_to(&rc_ghost);
        match events_a.next().await.unwrap() {
            LinkEvent::ConnectTimeout(id) => assert_eq!(id, rc_ghost.pubkey),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
