/*!
Local onion paths.

A [`Path`](./struct.Path.html) is an ordered list of hops we built through
other routers. The path owner applies one XChaCha20 layer per hop: on the
way out it encrypts near-to-far mutating the nonce after each layer, on
the way back it mutates the nonce first and then decrypts, which is
exactly what each transit hop undoes.
*/

pub mod builder;
pub mod context;
pub mod set;
pub mod transit;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use nyx_binary_io::ToBytes;
use nyx_crypto::*;
use nyx_packet::relay::RelayUpstream;
use nyx_packet::routing::*;
use nyx_packet::router_contact::RouterContact;
use nyx_packet::{MAX_LINK_MSG_SIZE, MESSAGE_PAD_SIZE};

use crate::time::clock_now;

/// Lifetime granted to a hop when the build does not say otherwise.
pub const DEFAULT_PATH_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// A build older than this has timed out.
pub const PATH_BUILD_TIMEOUT: Duration = Duration::from_secs(30);

/// An established path with no traffic for this long is dead.
pub const PATH_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often an established path probes its latency.
pub const LATENCY_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Role bits a path can carry.
pub mod role {
    /// The path carries exit traffic.
    pub const EXIT: u8 = 1;
    /// The path serves a hidden service.
    pub const SVC: u8 = 2;
    /// The path carries plain IP tunneling.
    pub const IP: u8 = 4;
}

/// Per-hop record inside a local path.
#[derive(Clone)]
pub struct PathHop {
    /// Descriptor of the hop.
    pub rc: RouterContact,
    /// Path id used when forwarding toward the endpoint.
    pub tx_id: PathId,
    /// Path id used when receiving from the endpoint.
    pub rx_id: PathId,
    /// Symmetric key shared with the hop.
    pub shared: SharedSecret,
    /// Nonce mutation mask of the hop.
    pub nonce_xor: ShortHash,
    /// Lifetime granted to the hop.
    pub lifetime: Duration,
}

/// Life stage of a path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathStatus {
    /// LR Commit sent, waiting for confirmation.
    Building,
    /// Latency-confirmed and usable.
    Established,
    /// Gave up; terminal.
    Timeout,
    /// Lifetime over; terminal.
    Expired,
}

/// Something the router has to act on after a path handled traffic.
#[derive(Debug)]
pub enum PathEvent {
    /// The build was confirmed; keep the session to the first hop alive
    /// until the path expires.
    BuildConfirmed,
    /// The latency probe came back and the path is usable.
    Established {
        /// Measured round trip.
        latency: Duration,
    },
    /// The endpoint discarded one of our frames.
    Discarded {
        /// Path id named by the endpoint.
        path_id: PathId,
        /// Sequence number of the dropped frame.
        seq: u64,
    },
    /// DHT messages arrived over the path.
    DhtMessages(Vec<nyx_packet::dht::DhtMessage>),
    /// The endpoint granted exit traffic.
    ExitGranted,
    /// The endpoint rejected exit traffic.
    ExitRejected {
        /// Backoff the endpoint asked for, milliseconds.
        backoff: u64,
    },
    /// The exit was closed.
    ExitClosed,
    /// An exit update or close was acknowledged.
    ExitUpdated,
    /// Exit traffic arrived for the local tunnel.
    ExitTraffic {
        /// Counter-prefixed packets.
        packets: Vec<Vec<u8>>,
    },
}

/// Outcome of handling one inbound routing message.
#[derive(Debug, Default)]
pub struct HandleResult {
    /// Messages to send back up the same path.
    pub replies: Vec<RoutingMessage>,
    /// State changes the router reacts to.
    pub events: Vec<PathEvent>,
}

/// What a periodic tick asks the router to do.
#[derive(Debug, Eq, PartialEq)]
pub enum TickAction {
    /// Nothing.
    Idle,
    /// Send this latency probe up the path.
    SendProbe(PathLatencyMessage),
    /// The path just moved to Timeout; profile and rebuild.
    TimedOut,
}

/// Error of sending a routing message over a path.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PathError {
    /// The routing message did not fit the link budget.
    #[error("routing message too large")]
    Encode,
}

struct PathState {
    status: PathStatus,
    build_started: Instant,
    last_recv: Option<Instant>,
    last_latency_test_time: Instant,
    last_latency_test_id: u64,
    latency: Duration,
    role: u8,
    exit_obtain_tx: u64,
    update_exit_tx: u64,
    close_exit_tx: u64,
}

/// A path we made.
pub struct Path {
    /// Hops in near-to-far order.
    pub hops: Vec<PathHop>,
    state: Mutex<PathState>,
    seqno: AtomicU64,
}

impl Path {
    /// Wrap fully keyed hops into a building path.
    pub fn new(hops: Vec<PathHop>, starting_role: u8) -> Path {
        debug_assert!(!hops.is_empty());
        Path {
            hops,
            state: Mutex::new(PathState {
                status: PathStatus::Building,
                build_started: clock_now(),
                last_recv: None,
                last_latency_test_time: clock_now(),
                last_latency_test_id: 0,
                latency: Duration::from_millis(0),
                role: starting_role,
                exit_obtain_tx: 0,
                update_exit_tx: 0,
                close_exit_tx: 0,
            }),
            seqno: AtomicU64::new(0),
        }
    }

    /// Path id the first hop expects on upstream traffic.
    pub fn tx_id(&self) -> PathId {
        self.hops[0].tx_id
    }

    /// Path id downstream traffic reaches us under.
    pub fn rx_id(&self) -> PathId {
        self.hops[0].rx_id
    }

    /// The router the path enters the network through.
    pub fn upstream(&self) -> RouterId {
        self.hops[0].rc.pubkey
    }

    /// The router terminating the path.
    pub fn endpoint(&self) -> RouterId {
        self.hops[self.hops.len() - 1].rc.pubkey
    }

    /// Path id the endpoint hands out as our introduction.
    pub fn intro_id(&self) -> PathId {
        self.hops[self.hops.len() - 1].tx_id
    }

    /// Current status.
    pub fn status(&self) -> PathStatus {
        self.state.lock().status
    }

    /// Measured round trip; zero until the first probe echoes.
    pub fn latency(&self) -> Duration {
        self.state.lock().latency
    }

    /// Role bits.
    pub fn role(&self) -> u8 {
        self.state.lock().role
    }

    /// Whether any of `roles` is supported.
    pub fn supports_any_role(&self, roles: u8) -> bool {
        roles == 0 || self.state.lock().role & roles != 0
    }

    /// Established and latency-confirmed.
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.status == PathStatus::Established && state.latency > Duration::from_millis(0)
    }

    /// When the path stops being usable.
    pub fn expire_time(&self) -> Instant {
        self.state.lock().build_started + self.hops[0].lifetime
    }

    /// Whether the path is past its lifetime (terminal states count as
    /// expired, a building path never does).
    pub fn expired(&self, now: Instant) -> bool {
        let state = self.state.lock();
        match state.status {
            PathStatus::Established => now >= state.build_started + self.hops[0].lifetime,
            PathStatus::Building => false,
            PathStatus::Timeout | PathStatus::Expired => true,
        }
    }

    /// Whether the path expires within `dlt`.
    pub fn expires_soon(&self, now: Instant, dlt: Duration) -> bool {
        now + dlt >= self.expire_time()
    }

    /// Note inbound traffic.
    fn mark_active(&self, now: Instant) {
        let mut state = self.state.lock();
        state.last_recv = Some(match state.last_recv {
            Some(prev) => prev.max(now),
            None => now,
        });
    }

    fn next_seq(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::Relaxed)
    }

    /// Name for logs.
    pub fn name(&self) -> String {
        format!("TX={} RX={}", self.tx_id(), self.rx_id())
    }

    /// Remember the transaction id of an exit request sent on this path.
    pub fn note_exit_request(&self, tx_id: u64) {
        self.state.lock().exit_obtain_tx = tx_id;
    }

    /// Remember the transaction id of an exit update sent on this path.
    pub fn note_exit_update(&self, tx_id: u64) {
        self.state.lock().update_exit_tx = tx_id;
    }

    /// Apply the upstream onion transform in place: encrypt each layer
    /// near-to-far, mutating the nonce afterwards.
    pub fn onion_upstream(&self, buf: &mut [u8], y: TunnelNonce) {
        let mut n = y;
        for hop in &self.hops {
            xchacha20_xor(buf, &hop.shared, &n);
            n = n.xor(&hop.nonce_xor);
        }
    }

    /// Apply the downstream onion transform in place: mutate the nonce,
    /// then strip a layer, near-to-far.
    pub fn onion_downstream(&self, buf: &mut [u8], y: TunnelNonce) {
        let mut n = y;
        for hop in &self.hops {
            n = n.xor(&hop.nonce_xor);
            xchacha20_xor(buf, &hop.shared, &n);
        }
    }

    /** Onion-wrap a routing message for this path.

    The message is bencoded, right-padded with random bytes to
    [`MESSAGE_PAD_SIZE`](../constant.MESSAGE_PAD_SIZE.html) and encrypted
    under a fresh tunnel nonce.
    */
    pub fn prepare_upstream<R: Rng>(
        &self,
        mut msg: RoutingMessage,
        rng: &mut R,
    ) -> Result<RelayUpstream, PathError> {
        set_seq(&mut msg, self.next_seq());
        let mut buf = [0; MAX_LINK_MSG_SIZE / 2];
        let size = match msg.to_bytes((&mut buf, 0)) {
            Ok((_, size)) => size,
            Err(_) => return Err(PathError::Encode),
        };
        let size = if size < MESSAGE_PAD_SIZE {
            rng.fill(&mut buf[size..MESSAGE_PAD_SIZE]);
            MESSAGE_PAD_SIZE
        } else {
            size
        };
        let y = TunnelNonce::random(rng);
        self.onion_upstream(&mut buf[..size], y);
        Ok(RelayUpstream {
            path_id: self.tx_id(),
            x: buf[..size].to_vec(),
            y,
        })
    }

    /// Unwrap a downstream payload and parse the routing message inside.
    /// Any successfully parsed message counts as activity.
    pub fn decrypt_downstream(&self, x: &[u8], y: TunnelNonce) -> Option<RoutingMessage> {
        use nyx_binary_io::FromBytes;

        let mut buf = x.to_vec();
        self.onion_downstream(&mut buf, y);
        match RoutingMessage::from_bytes(&buf) {
            Ok((_, msg)) => {
                self.mark_active(clock_now());
                Some(msg)
            }
            Err(_) => {
                warn!("failed to parse inbound routing message on {}", self.name());
                None
            }
        }
    }

    /// Dispatch one inbound routing message.
    pub fn handle_routing_message<R: Rng>(&self, msg: RoutingMessage, rng: &mut R) -> HandleResult {
        let now = clock_now();
        let mut result = HandleResult::default();
        match msg {
            RoutingMessage::PathConfirm(_) => {
                let mut state = self.state.lock();
                if state.status == PathStatus::Building {
                    info!("path {} is confirmed, probing latency", self.name());
                    let t = gen_probe_token(rng);
                    state.last_latency_test_id = t;
                    state.last_latency_test_time = now;
                    drop(state);
                    self.mark_active(now);
                    result.events.push(PathEvent::BuildConfirmed);
                    result
                        .replies
                        .push(RoutingMessage::PathLatency(PathLatencyMessage { l: 0, s: 0, t }));
                } else {
                    warn!("unwarranted path confirm on {}", self.name());
                }
            }
            RoutingMessage::PathLatency(latency) => {
                self.mark_active(now);
                let mut state = self.state.lock();
                if latency.l != 0 && latency.l == state.last_latency_test_id {
                    state.latency = now.saturating_duration_since(state.last_latency_test_time);
                    state.last_latency_test_id = 0;
                    let latency = state.latency;
                    if state.status == PathStatus::Building {
                        info!("path {} is built", self.name());
                        state.status = PathStatus::Established;
                        drop(state);
                        result.events.push(PathEvent::Established { latency });
                    }
                } else if latency.t != 0 {
                    // a probe reaching us on a local path means the
                    // endpoint bounced it back; echo it
                    drop(state);
                    result
                        .replies
                        .push(RoutingMessage::PathLatency(PathLatencyMessage {
                            l: latency.t,
                            s: 0,
                            t: 0,
                        }));
                } else {
                    warn!("unwarranted path latency on {}", self.name());
                }
            }
            RoutingMessage::DataDiscard(discard) => {
                self.mark_active(now);
                result.events.push(PathEvent::Discarded {
                    path_id: discard.p,
                    seq: discard.s,
                });
            }
            RoutingMessage::PathTransfer(_) => {
                warn!("unwarranted path transfer on {}", self.name());
            }
            RoutingMessage::TransferTraffic(traffic) => {
                if self.supports_any_role(role::EXIT | role::SVC) {
                    self.mark_active(now);
                    result.events.push(PathEvent::ExitTraffic { packets: traffic.x });
                } else {
                    warn!("transfer traffic on non-exit path {}", self.name());
                }
            }
            RoutingMessage::Dht(dht) => {
                self.mark_active(now);
                result.events.push(PathEvent::DhtMessages(dht.m));
            }
            RoutingMessage::ObtainExit(_) | RoutingMessage::UpdateExit(_) => {
                warn!("unwarranted exit request on {}", self.name());
            }
            RoutingMessage::GrantExit(grant) => {
                let expected = self.state.lock().exit_obtain_tx;
                if expected != 0 && grant.t == expected && self.verify_from_endpoint(|vk| grant.verify(vk)) {
                    let mut state = self.state.lock();
                    state.role |= role::EXIT;
                    state.exit_obtain_tx = 0;
                    drop(state);
                    self.mark_active(now);
                    info!("{} granted exit", self.name());
                    result.events.push(PathEvent::ExitGranted);
                } else {
                    warn!("unwarranted or unverified exit grant on {}", self.name());
                }
            }
            RoutingMessage::RejectExit(reject) => {
                let expected = self.state.lock().exit_obtain_tx;
                if expected != 0 && reject.t == expected && self.verify_from_endpoint(|vk| reject.verify(vk)) {
                    self.state.lock().exit_obtain_tx = 0;
                    self.mark_active(now);
                    info!("{} rejected exit", self.name());
                    result.events.push(PathEvent::ExitRejected { backoff: reject.b });
                } else {
                    warn!("unwarranted or unverified exit reject on {}", self.name());
                }
            }
            RoutingMessage::CloseExit(close) => {
                if self.supports_any_role(role::EXIT | role::SVC)
                    && self.verify_from_endpoint(|vk| close.verify(vk))
                {
                    let mut state = self.state.lock();
                    state.role &= !role::EXIT;
                    drop(state);
                    self.mark_active(now);
                    info!("{} had its exit closed", self.name());
                    result.events.push(PathEvent::ExitClosed);
                } else {
                    warn!("unwarranted exit close on {}", self.name());
                }
            }
            RoutingMessage::UpdateExitVerify(update) => {
                let state = self.state.lock();
                let matches = (state.update_exit_tx != 0 && update.t == state.update_exit_tx)
                    || (state.close_exit_tx != 0 && update.t == state.close_exit_tx);
                drop(state);
                if matches {
                    self.mark_active(now);
                    result.events.push(PathEvent::ExitUpdated);
                } else {
                    warn!("unwarranted exit verify on {}", self.name());
                }
            }
        }
        result
    }

    fn verify_from_endpoint<F: FnOnce(&VerifyingKey) -> bool>(&self, f: F) -> bool {
        match self.endpoint().verifying_key() {
            Some(vk) => f(&vk),
            None => false,
        }
    }

    /// Drive timers: build timeout, keepalive probes and the dead check.
    pub fn tick<R: Rng>(&self, now: Instant, rng: &mut R) -> TickAction {
        let mut state = self.state.lock();
        match state.status {
            PathStatus::Building => {
                if now.saturating_duration_since(state.build_started) >= PATH_BUILD_TIMEOUT {
                    state.status = PathStatus::Timeout;
                    return TickAction::TimedOut;
                }
                TickAction::Idle
            }
            PathStatus::Established => {
                if let Some(last_recv) = state.last_recv {
                    if now.saturating_duration_since(last_recv) > PATH_ALIVE_TIMEOUT {
                        state.status = PathStatus::Timeout;
                        return TickAction::TimedOut;
                    }
                }
                let since_test = now.saturating_duration_since(state.last_latency_test_time);
                if state.last_latency_test_id == 0 && since_test > LATENCY_PROBE_INTERVAL {
                    let t = gen_probe_token(rng);
                    state.last_latency_test_id = t;
                    state.last_latency_test_time = now;
                    return TickAction::SendProbe(PathLatencyMessage { l: 0, s: 0, t });
                }
                TickAction::Idle
            }
            PathStatus::Timeout | PathStatus::Expired => TickAction::Idle,
        }
    }

    /// Mark an established path whose lifetime ran out.
    pub fn mark_expired(&self) {
        self.state.lock().status = PathStatus::Expired;
    }
}

fn gen_probe_token<R: Rng>(rng: &mut R) -> u64 {
    let mut t = 0;
    while t == 0 {
        t = rng.gen();
    }
    t
}

fn set_seq(msg: &mut RoutingMessage, seq: u64) {
    match msg {
        RoutingMessage::PathConfirm(m) => m.s = seq,
        RoutingMessage::PathLatency(m) => m.s = seq,
        RoutingMessage::DataDiscard(m) => m.s = seq,
        RoutingMessage::PathTransfer(m) => m.s = seq,
        RoutingMessage::TransferTraffic(m) => m.s = seq,
        RoutingMessage::Dht(m) => m.s = seq,
        RoutingMessage::ObtainExit(m) => m.s = seq,
        RoutingMessage::GrantExit(m) => m.s = seq,
        RoutingMessage::RejectExit(m) => m.s = seq,
        RoutingMessage::UpdateExit(m) => m.s = seq,
        RoutingMessage::CloseExit(m) => m.s = seq,
        RoutingMessage::UpdateExitVerify(m) => m.s = seq,
    }
}

#[cfg(test)]
pub mod tests {
    use rand::thread_rng;

    use nyx_packet::router_contact::{AddressInfo, NetId};

    use super::transit::TransitHop;
    use super::*;

    pub fn test_rc_with_keys() -> (RouterContact, SigningKey, SecretKey) {
        let mut rng = thread_rng();
        let identity = SigningKey::generate(&mut rng);
        let enc_sk = SecretKey::generate(&mut rng);
        let mut rc = RouterContact::new(&identity, enc_sk.public_key(), NetId::default());
        rc.addrs.push(AddressInfo {
            dialect: "udp".to_owned(),
            ip: "203.0.113.7".parse().unwrap(),
            port: 1090,
            rank: 1,
        });
        rc.sign(&identity, crate::time::now_ms()).unwrap();
        (rc, identity, enc_sk)
    }

    pub fn test_path(hop_count: usize) -> Path {
        let mut rng = thread_rng();
        let rcs: Vec<_> = (0..hop_count).map(|_| test_rc_with_keys().0).collect();
        let mut hops: Vec<PathHop> = rcs
            .into_iter()
            .map(|rc| PathHop {
                rc,
                tx_id: PathId::random(&mut rng),
                rx_id: PathId::random(&mut rng),
                shared: SharedSecret::random(&mut rng),
                nonce_xor: shorthash(SharedSecret::random(&mut rng).as_bytes()),
                lifetime: DEFAULT_PATH_LIFETIME,
            })
            .collect();
        for i in 0..hops.len() - 1 {
            hops[i].tx_id = hops[i + 1].rx_id;
        }
        Path::new(hops, 0)
    }

    #[test]
    fn hop_chain_invariant() {
        let path = test_path(4);
        for i in 0..path.hops.len() - 1 {
            assert_eq!(path.hops[i].tx_id, path.hops[i + 1].rx_id);
        }
        assert_eq!(path.intro_id(), path.hops[3].tx_id);
    }

    // the endpoint and every transit hop undo exactly what the owner did
    #[test]
    fn onion_round_trip_through_transit_hops() {
        let mut rng = thread_rng();
        let path = test_path(3);
        let transits: Vec<TransitHop> = path
            .hops
            .iter()
            .map(|hop| TransitHop::from_parts(hop.tx_id, hop.rx_id, hop.shared, hop.nonce_xor))
            .collect();

        let plaintext = b"routing message bytes".to_vec();
        let y = TunnelNonce::random(&mut rng);

        // owner wraps
        let mut buf = plaintext.clone();
        path.onion_upstream(&mut buf, y);
        assert_ne!(buf, plaintext);

        // each hop strips one layer on the way up
        let mut nonce = y;
        for transit in &transits {
            transit.cipher(&mut buf, &nonce);
            nonce = transit.next_nonce(&nonce);
        }
        assert_eq!(buf, plaintext);

        // and wraps one layer on the way back
        let mut nonce = TunnelNonce::random(&mut rng);
        for transit in transits.iter().rev() {
            transit.cipher(&mut buf, &nonce);
            nonce = transit.next_nonce(&nonce);
        }
        path.onion_downstream(&mut buf, nonce);
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn prepare_upstream_pads_small_messages() {
        let mut rng = thread_rng();
        let path = test_path(2);
        let msg = RoutingMessage::PathLatency(PathLatencyMessage { l: 0, s: 0, t: 1 });
        let relay = path.prepare_upstream(msg, &mut rng).unwrap();
        assert_eq!(relay.x.len(), MESSAGE_PAD_SIZE);
        assert_eq!(relay.path_id, path.tx_id());
    }

    #[test]
    fn prepare_upstream_leaves_large_messages() {
        let mut rng = thread_rng();
        let path = test_path(2);
        let msg = RoutingMessage::TransferTraffic(TransferTrafficMessage {
            s: 0,
            x: vec![vec![7; 300]],
        });
        let relay = path.prepare_upstream(msg, &mut rng).unwrap();
        assert!(relay.x.len() > MESSAGE_PAD_SIZE);
    }

    #[test]
    fn confirm_then_latency_establishes() {
        let mut rng = thread_rng();
        let path = test_path(2);
        assert_eq!(path.status(), PathStatus::Building);

        let result = path.handle_routing_message(
            RoutingMessage::PathConfirm(PathConfirmMessage {
                path_created: 1,
                path_lifetime: 600_000,
                s: 0,
            }),
            &mut rng,
        );
        assert!(matches!(result.events.as_slice(), [PathEvent::BuildConfirmed]));
        let probe = match &result.replies[..] {
            [RoutingMessage::PathLatency(probe)] => probe.clone(),
            other => panic!("expected latency probe, got {:?}", other),
        };
        assert_eq!(path.status(), PathStatus::Building);

        let result = path.handle_routing_message(
            RoutingMessage::PathLatency(PathLatencyMessage { l: probe.t, s: 0, t: 0 }),
            &mut rng,
        );
        assert!(matches!(result.events.as_slice(), [PathEvent::Established { .. }]));
        assert_eq!(path.status(), PathStatus::Established);
    }

    #[test]
    fn wrong_latency_token_is_ignored() {
        let mut rng = thread_rng();
        let path = test_path(2);
        path.handle_routing_message(
            RoutingMessage::PathConfirm(PathConfirmMessage {
                path_created: 1,
                path_lifetime: 600_000,
                s: 0,
            }),
            &mut rng,
        );
        let result = path.handle_routing_message(
            RoutingMessage::PathLatency(PathLatencyMessage { l: 1, s: 0, t: 0 }),
            &mut rng,
        );
        assert!(result.events.is_empty());
        assert_eq!(path.status(), PathStatus::Building);
    }

    #[tokio::test]
    async fn build_timeout_is_inclusive() {
        tokio::time::pause();
        let mut rng = thread_rng();
        let path = test_path(2);

        tokio::time::advance(PATH_BUILD_TIMEOUT - Duration::from_millis(1)).await;
        assert_eq!(path.tick(clock_now(), &mut rng), TickAction::Idle);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(path.tick(clock_now(), &mut rng), TickAction::TimedOut);
        assert_eq!(path.status(), PathStatus::Timeout);
    }

    #[tokio::test]
    async fn alive_timeout_kills_established() {
        tokio::time::pause();
        let mut rng = thread_rng();
        let path = test_path(2);

        // establish by hand
        let result = path.handle_routing_message(
            RoutingMessage::PathConfirm(PathConfirmMessage {
                path_created: 1,
                path_lifetime: 600_000,
                s: 0,
            }),
            &mut rng,
        );
        let probe = match &result.replies[..] {
            [RoutingMessage::PathLatency(probe)] => probe.clone(),
            other => panic!("expected probe, got {:?}", other),
        };
        path.handle_routing_message(
            RoutingMessage::PathLatency(PathLatencyMessage { l: probe.t, s: 0, t: 0 }),
            &mut rng,
        );
        assert_eq!(path.status(), PathStatus::Established);

        tokio::time::advance(PATH_ALIVE_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(path.tick(clock_now(), &mut rng), TickAction::TimedOut);
    }

    #[test]
    fn unsolicited_exit_grant_is_rejected() {
        let mut rng = thread_rng();
        let path = test_path(2);
        let result = path.handle_routing_message(
            RoutingMessage::GrantExit(GrantExitMessage {
                s: 0,
                t: 42,
                z: Signature::from_bytes(&[0; SIGNATURE_SIZE]),
            }),
            &mut rng,
        );
        assert!(result.events.is_empty());
        assert_eq!(path.role() & role::EXIT, 0);
    }
}
