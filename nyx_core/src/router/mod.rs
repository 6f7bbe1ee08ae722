/*!
The router: the single coordinator of one overlay node.

Owns the session table, the bounded per-peer outbound queues, connect
jobs, persisting sessions and the 1 s maintenance tick. All link traffic
enters through the event channel of the [`link`](../link/index.html)
layer and is dispatched into the DHT and the path context; everything
CPU-heavy (descriptor verifies, path key exchanges, frame unsealing) runs
on the blocking worker pool and only its result comes back here.
*/

pub mod errors;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use tokio::sync::watch;

use nyx_binary_io::{FromBytes, ToBytes};
use nyx_crypto::*;
use nyx_packet::dht::{DhtMessage, FindRouterMessage, GotRouterMessage};
use nyx_packet::link::LinkMessage;
use nyx_packet::lr_commit::LrCommitMessage;
use nyx_packet::relay::{RelayDownstream, RelayUpstream};
use nyx_packet::router_contact::{AddressInfo, NetId, RouterContact};
use nyx_packet::routing::*;
use nyx_packet::MAX_LINK_MSG_SIZE;

use crate::dht::bucket::BUCKET_SIZE;
use crate::dht::{Dht, LocalLookup, LookupOrigin, PendingLookup};
use crate::link::{LinkEvent, LinkEventReceiver, LinkLayer};
use crate::nodedb::disk::DiskWorker;
use crate::nodedb::NodeDb;
use crate::path::builder::generate_path;
use crate::path::context::{Handler, PathContext};
use crate::path::set::Builder;
use crate::path::transit::TransitHop;
use crate::path::{Path, PathEvent, TickAction};
use crate::profile::Profiles;
use crate::time::{clock_now, now_ms};

use self::errors::BuildPathError;

/// Outbound messages a peer may have parked while its session comes up.
pub const MAX_PENDING_SEND_QUEUE_SIZE: usize = 8;

/// Period of the maintenance tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Jitter window for own-RC regeneration, milliseconds.
const RC_REGEN_JITTER: u64 = 10_000;

/// Backoff advertised when we reject an exit request, milliseconds.
const EXIT_REJECT_BACKOFF: u64 = 5_000;

/// Static configuration of a router.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Network tag; peers with a different one are rejected.
    pub net_id: NetId,
    /// Whether we relay paths and DHT lookups for others.
    pub allow_transit: bool,
    /// Whether we grant exit requests on paths terminating here.
    pub allow_exit: bool,
    /// Whether this node accepts inbound links (a public relay).
    pub is_service_node: bool,
    /// Endpoints advertised in our descriptor.
    pub advertise_addrs: Vec<AddressInfo>,
    /// Below this many known descriptors we keep bootstrapping.
    pub min_required_routers: usize,
    /// Below this many sessions we dial random peers.
    pub min_connected_routers: usize,
    /// Establish attempts per connect job.
    pub connect_retry_budget: u32,
    /// Descriptors to bootstrap from.
    pub bootstrap: Vec<RouterContact>,
    /// Paths the client builder keeps up; 0 disables automatic builds.
    pub paths_per_set: usize,
    /// Hops per automatically built path.
    pub hops_per_path: usize,
    /// Where our own signed descriptor is mirrored, if anywhere.
    pub our_rc_file: Option<std::path::PathBuf>,
    /// Where profiles are persisted, if anywhere.
    pub profiles_file: Option<std::path::PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> RouterConfig {
        RouterConfig {
            net_id: NetId::default(),
            allow_transit: false,
            allow_exit: false,
            is_service_node: false,
            advertise_addrs: Vec::new(),
            min_required_routers: 4,
            min_connected_routers: 1,
            connect_retry_budget: 4,
            bootstrap: Vec::new(),
            paths_per_set: 4,
            hops_per_path: 4,
            our_rc_file: None,
            profiles_file: None,
        }
    }
}

struct TryConnectJob {
    rc: RouterContact,
    retries_left: u32,
}

#[derive(Default)]
struct RouterState {
    valid_routers: HashMap<RouterId, RouterContact>,
    outbound_queue: HashMap<RouterId, VecDeque<Vec<u8>>>,
    pending_establish: HashMap<RouterId, TryConnectJob>,
    persisting_sessions: HashMap<RouterId, Instant>,
}

/// One overlay node.
#[derive(Clone)]
pub struct Router {
    /// Our identity key hash, the address peers know us by.
    pub id: RouterId,
    identity: SigningKey,
    encryption: SecretKey,
    config: Arc<RouterConfig>,
    /// Verified descriptor store.
    pub nodedb: NodeDb,
    /// Router lookup state.
    pub dht: Dht,
    /// Local and transit path state.
    pub paths: PathContext,
    /// Peer statistics.
    pub profiles: Profiles,
    link: Arc<dyn LinkLayer>,
    disk: DiskWorker,
    state: Arc<Mutex<RouterState>>,
    our_rc: Arc<Mutex<RouterContact>>,
    client_builder: Arc<Builder>,
    dropped_frames: Arc<AtomicU64>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl Router {
    /// Assemble a router from its keys, store and link layer. The own
    /// descriptor is signed immediately.
    pub fn new(
        identity: SigningKey,
        encryption: SecretKey,
        config: RouterConfig,
        nodedb: NodeDb,
        link: Arc<dyn LinkLayer>,
        disk: DiskWorker,
    ) -> Router {
        let id = RouterId::from_signing_key(&identity);
        let mut rc = RouterContact::new(&identity, encryption.public_key(), config.net_id.clone());
        rc.addrs = config.advertise_addrs.clone();
        if let Err(e) = rc.sign(&identity, now_ms()) {
            error!("failed to sign our RC: {:?}", e);
        }
        if let Some(path) = &config.our_rc_file {
            let mut buf = [0; nyx_packet::router_contact::MAX_RC_SIZE];
            if let Ok((_, size)) = rc.to_bytes((&mut buf, 0)) {
                disk.write_file(path.clone(), buf[..size].to_vec());
            }
        }

        let profiles = Profiles::new();
        if let Some(path) = &config.profiles_file {
            if let Err(e) = profiles.load(path) {
                warn!("could not load profiles: {}", e);
            }
        }

        let paths = PathContext::new();
        if config.allow_transit {
            paths.allow_transit();
        }
        let client_builder = Arc::new(Builder::new(config.paths_per_set, config.hops_per_path));
        paths.add_builder(&client_builder);

        let (stop_tx, _) = watch::channel(false);

        Router {
            id,
            identity,
            encryption,
            dht: Dht::new(id),
            config: Arc::new(config),
            nodedb,
            paths,
            profiles,
            link,
            disk,
            state: Arc::new(Mutex::new(RouterState::default())),
            our_rc: Arc::new(Mutex::new(rc)),
            client_builder,
            dropped_frames: Arc::new(AtomicU64::new(0)),
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// Our current signed descriptor.
    pub fn our_rc(&self) -> RouterContact {
        self.our_rc.lock().clone()
    }

    /// The builder maintaining the default client path set.
    pub fn client_builder(&self) -> Arc<Builder> {
        self.client_builder.clone()
    }

    /// Frames dropped because they failed to parse or found no handler.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Messages parked for `remote` waiting for a session.
    pub fn outbound_queue_len(&self, remote: &RouterId) -> usize {
        self.state
            .lock()
            .outbound_queue
            .get(remote)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Peers with a verified descriptor and an open session.
    pub fn connected_routers(&self) -> Vec<RouterId> {
        self.state
            .lock()
            .valid_routers
            .keys()
            .filter(|id| self.link.has_session_to(id))
            .copied()
            .collect()
    }

    /** Run the router until [`stop`](#method.stop) is called: drain link
    events and fire the maintenance tick every second.
    */
    pub async fn run(&self, mut events: LinkEventReceiver) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut wakeups = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                event = events.next() => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => break,
                },
                _ = wakeups.tick() => self.tick().await,
            }
        }
        debug!("router {} event loop done", self.id);
    }

    /** Stop in two phases: no new timers fire, in-flight completions get
    200 ms to unwind, then the link sessions close and another 200 ms
    later the node is gone.
    */
    pub async fn stop(&self) {
        info!("stopping router {}", self.id);
        for builder in self.paths.builders() {
            builder.stop();
        }
        let _ = self.stop_tx.send(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.link.close_all();
        if let Some(path) = &self.config.profiles_file {
            self.profiles.save(path, &self.disk);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::SessionEstablished(rc) => self.handle_session_established(rc).await,
            LinkEvent::SessionClosed(id) => self.handle_session_closed(id),
            LinkEvent::ConnectTimeout(id) => self.handle_connect_timeout(id),
            LinkEvent::Frame { from, bytes } => self.handle_frame(from, bytes).await,
        }
    }

    async fn handle_frame(&self, from: RouterId, bytes: Vec<u8>) {
        let msg = match LinkMessage::from_bytes(&bytes) {
            Ok((_, msg)) => msg,
            Err(_) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                warn!("undecodable frame from {}", from);
                return;
            }
        };
        trace!("link message from {}", from);
        match msg {
            LinkMessage::LrCommit(commit) => self.handle_lr_commit(from, commit).await,
            LinkMessage::RelayUpstream(relay) => self.handle_relay_upstream(from, relay).await,
            LinkMessage::RelayDownstream(relay) => self.handle_relay_downstream(from, relay).await,
            LinkMessage::DhtImmediate(DhtMessage::FindRouter(find)) => {
                self.handle_find_router(from, find)
            }
            LinkMessage::DhtImmediate(DhtMessage::GotRouter(got)) => {
                self.handle_got_router(got).await
            }
        }
    }

    // ------------------------------------------------------------------
    // sessions and outbound queueing
    // ------------------------------------------------------------------

    fn encode_link_message(&self, msg: &LinkMessage) -> Option<Vec<u8>> {
        let mut buf = [0; MAX_LINK_MSG_SIZE];
        match msg.to_bytes((&mut buf, 0)) {
            Ok((_, size)) => Some(buf[..size].to_vec()),
            Err(e) => {
                error!("failed to encode outbound message: {:?}", e);
                None
            }
        }
    }

    /** Send a link message to `remote` or park it until a session exists.

    With an open session the message goes out immediately. Otherwise it is
    queued (bounded; overflow is dropped with a warning) and a connect is
    started from the stored descriptor, falling back to a DHT lookup when
    the peer is unknown.
    */
    pub fn send_to_or_queue(&self, remote: &RouterId, msg: &LinkMessage) -> bool {
        let bytes = match self.encode_link_message(msg) {
            Some(bytes) => bytes,
            None => return false,
        };
        if self.link.has_session_to(remote) {
            debug!("send {} bytes to {}", bytes.len(), remote);
            if !self.link.send_to(remote, bytes) {
                warn!("message to {} was dropped", remote);
            }
            return true;
        }

        {
            let mut state = self.state.lock();
            let queue = state.outbound_queue.entry(*remote).or_default();
            if queue.len() < MAX_PENDING_SEND_QUEUE_SIZE {
                queue.push_back(bytes);
            } else {
                warn!("outbound queue for {} is full, dropping message", remote);
            }
        }

        match self.nodedb.get(remote) {
            Some(rc) => self.try_connect(rc, self.config.connect_retry_budget),
            None => {
                if !self.dht.has_pending_for(remote) {
                    self.lookup_router(*remote, LocalLookup::SendTo);
                }
            }
        }
        true
    }

    /// Start establishing a session; at most one job per peer.
    pub fn try_connect(&self, rc: RouterContact, retries: u32) {
        let id = rc.pubkey;
        if id == self.id {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.pending_establish.contains_key(&id) {
                return;
            }
            state.pending_establish.insert(
                id,
                TryConnectJob {
                    rc: rc.clone(),
                    retries_left: retries,
                },
            );
        }
        debug!("establish to {}", id);
        self.link.try_establish_to(&rc);
    }

    async fn handle_session_established(&self, rc: RouterContact) {
        let id = rc.pubkey;
        if !self.nodedb.async_verify(rc.clone()).await {
            warn!("session from {} with unverifiable RC", id);
            return;
        }
        info!("session established with {}", id);
        {
            let mut state = self.state.lock();
            state.valid_routers.insert(id, rc);
            state.pending_establish.remove(&id);
        }
        self.dht.add_node(id);
        self.profiles.mark_connect_success(&id);
        self.flush_outbound_for(&id);
    }

    fn handle_session_closed(&self, id: RouterId) {
        info!("session to {} fully closed", id);
        self.state.lock().valid_routers.remove(&id);
        self.dht.remove_node(&id);
    }

    fn handle_connect_timeout(&self, id: RouterId) {
        self.profiles.mark_connect_timeout(&id);
        let retry = {
            let mut state = self.state.lock();
            match state.pending_establish.get_mut(&id) {
                Some(job) if job.retries_left > 0 => {
                    job.retries_left -= 1;
                    Some(job.rc.clone())
                }
                Some(_) => {
                    state.pending_establish.remove(&id);
                    None
                }
                None => None,
            }
        };
        match retry {
            Some(rc) => {
                debug!("retrying establish to {}", id);
                self.link.try_establish_to(&rc);
            }
            None => {
                warn!("gave up establishing to {}", id);
                if !self.config.is_service_node && self.profiles.is_bad(&id) {
                    self.nodedb.remove(&id);
                }
                self.discard_outbound_for(&id);
            }
        }
    }

    fn flush_outbound_for(&self, id: &RouterId) {
        let queued = self.state.lock().outbound_queue.remove(id);
        if let Some(queued) = queued {
            debug!("flush outbound for {}", id);
            for bytes in queued {
                if !self.link.send_to(id, bytes) {
                    warn!("flush to {} lost a message", id);
                }
            }
        }
    }

    fn discard_outbound_for(&self, id: &RouterId) {
        self.state.lock().outbound_queue.remove(id);
    }

    fn persist_session_until(&self, remote: RouterId, until: Instant) {
        let mut state = self.state.lock();
        let entry = state.persisting_sessions.entry(remote).or_insert(until);
        *entry = (*entry).max(until);
    }

    // ------------------------------------------------------------------
    // DHT
    // ------------------------------------------------------------------

    fn send_got_router(&self, to: &RouterId, rcs: Vec<RouterContact>, tx_id: u64) {
        let reply = LinkMessage::DhtImmediate(DhtMessage::GotRouter(GotRouterMessage { rcs, tx_id }));
        self.send_to_or_queue(to, &reply);
    }

    fn closest_known_rcs(&self, target: &RouterId) -> Vec<RouterContact> {
        self.dht
            .find_closest_n(target, BUCKET_SIZE)
            .into_iter()
            .filter_map(|id| self.nodedb.get(&id))
            .collect()
    }

    /// FindRouter arriving over a direct link.
    fn handle_find_router(&self, from: RouterId, msg: FindRouterMessage) {
        if !self.config.allow_transit {
            warn!("got DHT lookup from {} when transit is not allowed", from);
            return;
        }
        if self.dht.is_duplicate_remote(&from, msg.tx_id) {
            warn!("duplicate lookup from {} txid={}", from, msg.tx_id);
            return;
        }
        if msg.key == self.id {
            self.send_got_router(&from, vec![self.our_rc()], msg.tx_id);
            return;
        }
        if msg.exploratory {
            self.send_got_router(&from, self.closest_known_rcs(&msg.key), msg.tx_id);
            return;
        }
        if let Some(found) = self.nodedb.get(&msg.key) {
            self.send_got_router(&from, vec![found], msg.tx_id);
            return;
        }
        if msg.iterative {
            self.send_got_router(&from, self.closest_known_rcs(&msg.key), msg.tx_id);
            return;
        }
        // recursive: relay toward the closest peer we know
        match self.dht.find_closest(&msg.key) {
            Some(peer) if peer != from => {
                let tx_id = self.dht.register_lookup(
                    &mut thread_rng(),
                    PendingLookup {
                        target: msg.key,
                        origin: LookupOrigin::Remote {
                            requester: from,
                            tx_id: msg.tx_id,
                        },
                    },
                );
                let relay = LinkMessage::DhtImmediate(DhtMessage::FindRouter(FindRouterMessage {
                    exploratory: false,
                    iterative: false,
                    key: msg.key,
                    tx_id,
                }));
                self.send_to_or_queue(&peer, &relay);
            }
            _ => self.send_got_router(&from, Vec::new(), msg.tx_id),
        }
    }

    /// FindRouter arriving over one of our transit paths.
    fn handle_relayed_find_router(&self, hop: &Arc<TransitHop>, msg: FindRouterMessage) {
        if msg.key == self.id {
            self.reply_on_path(hop, vec![self.our_rc()], msg.tx_id);
            return;
        }
        if msg.exploratory {
            self.reply_on_path(hop, self.closest_known_rcs(&msg.key), msg.tx_id);
            return;
        }
        if let Some(found) = self.nodedb.get(&msg.key) {
            self.reply_on_path(hop, vec![found], msg.tx_id);
            return;
        }
        if msg.iterative {
            self.reply_on_path(hop, self.closest_known_rcs(&msg.key), msg.tx_id);
            return;
        }
        match self.dht.find_closest(&msg.key) {
            Some(peer) => {
                let tx_id = self.dht.register_lookup(
                    &mut thread_rng(),
                    PendingLookup {
                        target: msg.key,
                        origin: LookupOrigin::Path {
                            path_id: hop.info.rx_id,
                            tx_id: msg.tx_id,
                        },
                    },
                );
                let relay = LinkMessage::DhtImmediate(DhtMessage::FindRouter(FindRouterMessage {
                    exploratory: false,
                    iterative: false,
                    key: msg.key,
                    tx_id,
                }));
                self.send_to_or_queue(&peer, &relay);
            }
            None => self.reply_on_path(hop, Vec::new(), msg.tx_id),
        }
    }

    fn reply_on_path(&self, hop: &Arc<TransitHop>, rcs: Vec<RouterContact>, tx_id: u64) {
        let msg = RoutingMessage::Dht(DhtRoutingMessage {
            m: vec![DhtMessage::GotRouter(GotRouterMessage { rcs, tx_id })],
            s: 0,
        });
        self.send_transit_routing(hop, msg);
    }

    async fn handle_got_router(&self, msg: GotRouterMessage) {
        let pending = match self.dht.claim(msg.tx_id) {
            Some(pending) => pending,
            None => {
                warn!("unwarranted GotRouter txid={}", msg.tx_id);
                return;
            }
        };
        let pending_target = pending.target;
        match pending.origin {
            LookupOrigin::Remote { requester, tx_id } => {
                self.send_got_router(&requester, msg.rcs, tx_id);
            }
            LookupOrigin::Path { path_id, tx_id } => {
                match self.paths.get_path_for_transfer(&self.id, &path_id) {
                    Some(hop) => self.reply_on_path(&hop, msg.rcs, tx_id),
                    None => debug!("path {} for lookup reply is gone", path_id),
                }
            }
            LookupOrigin::Local(local) => {
                let mut verified = Vec::new();
                for rc in msg.rcs {
                    let pk = rc.pubkey;
                    if self.nodedb.async_verify(rc.clone()).await {
                        self.dht.add_node(pk);
                        verified.push(rc);
                    }
                }
                match local {
                    LocalLookup::SendTo => {
                        match verified.iter().find(|rc| rc.pubkey == pending_target) {
                            Some(rc) => {
                                self.try_connect(rc.clone(), self.config.connect_retry_budget)
                            }
                            None => {
                                debug!("lookup for {} found nothing", pending_target);
                                self.discard_outbound_for(&pending_target);
                            }
                        }
                    }
                    LocalLookup::Explore | LocalLookup::Refresh => {
                        debug!("lookup stored {} descriptors", verified.len());
                    }
                    LocalLookup::Caller(tx) => {
                        let _ = tx.send(verified);
                    }
                }
            }
        }
    }

    /** Start a recursive lookup for `target`. Returns `false` when no
    peer is available to ask, in which case the origin is failed
    immediately.
    */
    pub fn lookup_router(&self, target: RouterId, origin: LocalLookup) -> bool {
        if target == self.id {
            return false;
        }
        match self.dht.find_closest(&target) {
            Some(peer) => {
                let tx_id = self.dht.register_lookup(
                    &mut thread_rng(),
                    PendingLookup {
                        target,
                        origin: LookupOrigin::Local(origin),
                    },
                );
                let msg = LinkMessage::DhtImmediate(DhtMessage::FindRouter(FindRouterMessage {
                    exploratory: false,
                    iterative: false,
                    key: target,
                    tx_id,
                }));
                self.send_to_or_queue(&peer, &msg)
            }
            None => {
                warn!("no DHT peers to resolve {}", target);
                if let LocalLookup::Caller(tx) = origin {
                    let _ = tx.send(Vec::new());
                }
                false
            }
        }
    }

    /// Ask a bootstrap peer for its neighbourhood.
    pub fn explore_via(&self, rc: &RouterContact) {
        let tx_id = self.dht.register_lookup(
            &mut thread_rng(),
            PendingLookup {
                target: self.id,
                origin: LookupOrigin::Local(LocalLookup::Explore),
            },
        );
        let msg = LinkMessage::DhtImmediate(DhtMessage::FindRouter(FindRouterMessage {
            exploratory: true,
            iterative: false,
            key: self.id,
            tx_id,
        }));
        self.send_to_or_queue(&rc.pubkey, &msg);
    }

    // ------------------------------------------------------------------
    // paths
    // ------------------------------------------------------------------

    async fn handle_lr_commit(&self, from: RouterId, msg: LrCommitMessage) {
        if !self.paths.allowing_transit() {
            warn!("LR commit from {} but transit is not allowed", from);
            return;
        }
        let (frame, rest) = msg.pop_frame(&mut thread_rng());
        let encryption = self.encryption.clone();
        let opened = tokio::task::spawn_blocking(move || {
            frame
                .open(&encryption)
                .map(|record| TransitHop::from_record(&record, from, &encryption))
        })
        .await;
        let hop = match opened {
            Ok(Ok(hop)) => Arc::new(hop),
            Ok(Err(e)) => {
                warn!("LR commit frame from {} does not open: {}", from, e);
                return;
            }
            Err(e) => {
                error!("frame worker failed: {}", e);
                return;
            }
        };
        if self.paths.has_transit_hop(&hop.info) {
            warn!("duplicate transit hop {}", hop.info);
            return;
        }
        debug!("installing transit hop {}", hop.info);
        self.paths.put_transit_hop(hop.clone());

        if hop.is_endpoint(&self.id) {
            let confirm = RoutingMessage::PathConfirm(PathConfirmMessage {
                path_created: now_ms(),
                path_lifetime: hop.lifetime.as_millis() as u64,
                s: 0,
            });
            self.send_transit_routing(&hop, confirm);
        } else {
            self.send_to_or_queue(&hop.info.upstream, &LinkMessage::LrCommit(rest));
        }
    }

    async fn handle_relay_upstream(&self, from: RouterId, relay: RelayUpstream) {
        let hop = match self.paths.get_by_downstream(&from, &relay.path_id) {
            Some(hop) => hop,
            None => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                warn!("no transit hop for upstream {} from {}", relay.path_id, from);
                return;
            }
        };
        hop.mark_active(clock_now());
        let mut x = relay.x;
        hop.cipher(&mut x, &relay.y);
        let y = hop.next_nonce(&relay.y);

        if hop.is_endpoint(&self.id) {
            match RoutingMessage::from_bytes(&x) {
                Ok((_, msg)) => self.handle_transit_routing(&hop, msg).await,
                Err(_) => {
                    self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    warn!("unparsable routing message on {}", hop.info);
                }
            }
        } else {
            let forward = LinkMessage::RelayUpstream(RelayUpstream {
                path_id: hop.info.tx_id,
                x,
                y,
            });
            self.send_to_or_queue(&hop.info.upstream, &forward);
        }
    }

    async fn handle_relay_downstream(&self, from: RouterId, relay: RelayDownstream) {
        match self.paths.get_by_upstream(&from, &relay.path_id) {
            Some(Handler::Local(path)) => {
                if let Some(msg) = path.decrypt_downstream(&relay.x, relay.y) {
                    let result = path.handle_routing_message(msg, &mut thread_rng());
                    self.process_path_result(&path, result).await;
                }
            }
            Some(Handler::Transit(hop)) => {
                hop.mark_active(clock_now());
                let mut x = relay.x;
                hop.cipher(&mut x, &relay.y);
                let forward = LinkMessage::RelayDownstream(RelayDownstream {
                    path_id: hop.info.rx_id,
                    x,
                    y: hop.next_nonce(&relay.y),
                });
                self.send_to_or_queue(&hop.info.downstream, &forward);
            }
            None => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                warn!("no handler for downstream {} from {}", relay.path_id, from);
            }
        }
    }

    /// Routing messages addressed to us as the endpoint of a transit path.
    async fn handle_transit_routing(&self, hop: &Arc<TransitHop>, msg: RoutingMessage) {
        match msg {
            RoutingMessage::PathLatency(latency) if latency.t != 0 => {
                let echo = RoutingMessage::PathLatency(PathLatencyMessage {
                    l: latency.t,
                    s: 0,
                    t: 0,
                });
                self.send_transit_routing(hop, echo);
            }
            RoutingMessage::Dht(dht) => {
                for inner in dht.m {
                    match inner {
                        DhtMessage::FindRouter(find) => self.handle_relayed_find_router(hop, find),
                        DhtMessage::GotRouter(_) => {
                            warn!("unwarranted GotRouter on transit {}", hop.info);
                        }
                    }
                }
            }
            RoutingMessage::PathTransfer(transfer) => {
                match self.paths.get_path_for_transfer(&self.id, &transfer.p) {
                    Some(target) => {
                        let mut x = transfer.x;
                        target.cipher(&mut x, &transfer.y);
                        let forward = LinkMessage::RelayDownstream(RelayDownstream {
                            path_id: target.info.rx_id,
                            x,
                            y: target.next_nonce(&transfer.y),
                        });
                        self.send_to_or_queue(&target.info.downstream, &forward);
                    }
                    None => {
                        debug!("path transfer to unknown path {}", transfer.p);
                        let discard = RoutingMessage::DataDiscard(DataDiscardMessage {
                            p: transfer.p,
                            s: transfer.s,
                        });
                        self.send_transit_routing(hop, discard);
                    }
                }
            }
            RoutingMessage::ObtainExit(obtain) => {
                if !obtain.verify() {
                    warn!("exit request with bad signature on {}", hop.info);
                    return;
                }
                if self.config.allow_exit {
                    let mut grant = GrantExitMessage {
                        s: 0,
                        t: obtain.t,
                        z: Signature::from_bytes(&[0; SIGNATURE_SIZE]),
                    };
                    if grant.sign(&self.identity).is_ok() {
                        info!("granting exit on {}", hop.info);
                        self.send_transit_routing(hop, RoutingMessage::GrantExit(grant));
                    }
                } else {
                    let mut reject = RejectExitMessage {
                        b: EXIT_REJECT_BACKOFF,
                        r: Vec::new(),
                        s: 0,
                        t: obtain.t,
                        z: Signature::from_bytes(&[0; SIGNATURE_SIZE]),
                    };
                    if reject.sign(&self.identity).is_ok() {
                        self.send_transit_routing(hop, RoutingMessage::RejectExit(reject));
                    }
                }
            }
            RoutingMessage::CloseExit(close) => {
                let verify = RoutingMessage::UpdateExitVerify(UpdateExitVerifyMessage {
                    s: 0,
                    t: close.y,
                });
                self.send_transit_routing(hop, verify);
            }
            RoutingMessage::TransferTraffic(traffic) => {
                // no exit session is wired up to this hop
                let discard = RoutingMessage::DataDiscard(DataDiscardMessage {
                    p: hop.info.rx_id,
                    s: traffic.s,
                });
                self.send_transit_routing(hop, discard);
            }
            other => {
                warn!("unwarranted {} on transit {}", routing_tag(&other), hop.info);
            }
        }
    }

    fn send_transit_routing(&self, hop: &Arc<TransitHop>, msg: RoutingMessage) -> bool {
        match hop.prepare_downstream(msg, &mut thread_rng()) {
            Ok(relay) => {
                self.send_to_or_queue(&hop.info.downstream, &LinkMessage::RelayDownstream(relay))
            }
            Err(e) => {
                error!("failed to wrap routing message: {}", e);
                false
            }
        }
    }

    /// Send a routing message up one of our own paths.
    pub fn send_path_routing(&self, path: &Arc<Path>, msg: RoutingMessage) -> bool {
        match path.prepare_upstream(msg, &mut thread_rng()) {
            Ok(relay) => {
                self.send_to_or_queue(&path.upstream(), &LinkMessage::RelayUpstream(relay))
            }
            Err(e) => {
                error!("failed to wrap routing message: {}", e);
                false
            }
        }
    }

    async fn process_path_result(&self, path: &Arc<Path>, result: crate::path::HandleResult) {
        for reply in result.replies {
            self.send_path_routing(path, reply);
        }
        for event in result.events {
            match event {
                PathEvent::BuildConfirmed => {
                    self.persist_session_until(path.upstream(), path.expire_time());
                }
                PathEvent::Established { latency } => {
                    info!("path {} established, latency {:?}", path.name(), latency);
                    let hops: Vec<RouterId> = path.hops.iter().map(|h| h.rc.pubkey).collect();
                    self.profiles.mark_path_success(&hops);
                    if let Some(builder) = self.paths.get_local_builder(&path.rx_id()) {
                        builder.handle_path_built();
                    }
                }
                PathEvent::Discarded { path_id, seq } => {
                    debug!("endpoint discarded frame {} seq {}", path_id, seq);
                }
                PathEvent::DhtMessages(messages) => {
                    for inner in messages {
                        match inner {
                            DhtMessage::GotRouter(got) => self.handle_got_router(got).await,
                            DhtMessage::FindRouter(_) => {
                                warn!("unwarranted FindRouter on local path {}", path.name());
                            }
                        }
                    }
                }
                PathEvent::ExitGranted => info!("{} granted exit", path.name()),
                PathEvent::ExitRejected { backoff } => {
                    info!("{} rejected exit, backoff {} ms", path.name(), backoff)
                }
                PathEvent::ExitClosed => info!("{} exit closed", path.name()),
                PathEvent::ExitUpdated => debug!("{} exit updated", path.name()),
                PathEvent::ExitTraffic { packets } => {
                    debug!("{} exit traffic, {} packets", path.name(), packets.len())
                }
            }
        }
    }

    /** Build a path through the given descriptors: generate the per-hop
    keys off-thread, send the LR Commit to the first hop and register the
    path with `builder`.
    */
    pub async fn build_path(
        &self,
        builder: &Arc<Builder>,
        rcs: Vec<RouterContact>,
    ) -> Result<Arc<Path>, BuildPathError> {
        if rcs.is_empty() {
            return Err(BuildPathError::NoHops);
        }
        builder.note_build_started(clock_now());
        let generated = tokio::task::spawn_blocking(move || {
            let mut rng = thread_rng();
            generate_path(rcs, 0, &mut rng)
        })
        .await;
        let (path, lrcm) = generated.map_err(|_| BuildPathError::Worker)?;
        let path = Arc::new(path);
        info!("path {} is building", path.name());

        let first = path.upstream();
        if !self.send_to_or_queue(&first, &LinkMessage::LrCommit(lrcm)) {
            return Err(BuildPathError::Send);
        }
        self.persist_session_until(first, path.expire_time());
        self.paths.add_own_path(builder, path.clone());
        Ok(path)
    }

    /// Ask the endpoint of `path` to become our exit.
    pub fn request_exit(&self, path: &Arc<Path>) -> bool {
        let mut rng = thread_rng();
        let mut tx_id = 0;
        while tx_id == 0 {
            tx_id = rng.gen();
        }
        let mut msg = ObtainExitMessage {
            b: Vec::new(),
            e: 1,
            i: RouterId::default(),
            s: 0,
            t: tx_id,
            w: Vec::new(),
            x: now_ms() + 600_000,
            z: Signature::from_bytes(&[0; SIGNATURE_SIZE]),
        };
        if msg.sign(&self.identity).is_err() {
            return false;
        }
        path.note_exit_request(tx_id);
        self.send_path_routing(path, RoutingMessage::ObtainExit(msg))
    }

    // ------------------------------------------------------------------
    // maintenance tick
    // ------------------------------------------------------------------

    async fn tick(&self) {
        trace!("router {} tick", self.id);
        let now = clock_now();
        let now_unix = now_ms();

        // rotate our descriptor before it expires
        let jitter = thread_rng().gen_range(0..RC_REGEN_JITTER);
        if self.our_rc().expires_soon(now_unix, jitter) {
            info!("regenerating our RC");
            self.update_our_rc();
        }

        // service nodes refresh other descriptors nearing expiry
        if self.config.is_service_node {
            let mut expiring = Vec::new();
            self.nodedb.visit(|rc| {
                if rc.expires_soon(now_unix, RC_REGEN_JITTER) {
                    expiring.push(rc.pubkey);
                }
                true
            });
            for pk in expiring {
                self.lookup_router(pk, LocalLookup::Refresh);
            }
        }

        self.tick_paths(now);
        self.paths.expire_paths(now);
        self.tick_persisting_sessions(now);

        // fail timed out lookups
        for pending in self.dht.timed_out() {
            match pending.origin {
                LookupOrigin::Local(LocalLookup::SendTo) => {
                    warn!("lookup for {} timed out", pending.target);
                    self.discard_outbound_for(&pending.target);
                }
                LookupOrigin::Local(LocalLookup::Caller(tx)) => {
                    let _ = tx.send(Vec::new());
                }
                _ => {}
            }
        }

        // keep bootstrapping until the nodedb is usable
        if self.nodedb.len() < self.config.min_required_routers {
            if self.config.bootstrap.is_empty() {
                if self.nodedb.is_empty() {
                    warn!("we have no bootstrap nodes specified");
                }
            } else {
                info!(
                    "we need at least {} routers but have {}, bootstrapping",
                    self.config.min_required_routers,
                    self.nodedb.len()
                );
                for rc in &self.config.bootstrap {
                    self.try_connect(rc.clone(), self.config.connect_retry_budget);
                    self.explore_via(rc);
                }
            }
        }

        // clients keep their path sets at strength
        if !self.config.is_service_node {
            self.build_paths_tick(now).await;
        }

        if self.link.session_count() < self.config.min_connected_routers {
            self.connect_to_random_router(&mut thread_rng());
        }
    }

    fn tick_paths(&self, now: Instant) {
        for builder in self.paths.builders() {
            for path in builder.set.paths() {
                match path.tick(now, &mut thread_rng()) {
                    TickAction::Idle => {}
                    TickAction::SendProbe(probe) => {
                        self.send_path_routing(&path, RoutingMessage::PathLatency(probe));
                    }
                    TickAction::TimedOut => {
                        warn!("path {} timed out", path.name());
                        let hops: Vec<RouterId> = path.hops.iter().map(|h| h.rc.pubkey).collect();
                        self.profiles.mark_path_fail(&hops);
                        builder.handle_path_build_timeout();
                    }
                }
            }
        }
    }

    fn tick_persisting_sessions(&self, now: Instant) {
        let entries: Vec<(RouterId, Instant)> = {
            let state = self.state.lock();
            state
                .persisting_sessions
                .iter()
                .map(|(id, deadline)| (*id, *deadline))
                .collect()
        };
        for (id, deadline) in entries {
            if now < deadline {
                if self.link.has_session_to(&id) {
                    trace!("keepalive to {}", id);
                    self.link.keep_alive(&id);
                } else if let Some(rc) = self.nodedb.get(&id) {
                    debug!("establish to {}", id);
                    self.try_connect(rc, self.config.connect_retry_budget);
                }
            } else {
                info!("session persist to {} expired", id);
                self.state.lock().persisting_sessions.remove(&id);
            }
        }
    }

    async fn build_paths_tick(&self, now: Instant) {
        for builder in self.paths.builders() {
            if !builder.should_build_more(now) {
                continue;
            }
            let connected = self.connected_routers();
            let hops = {
                let mut rng = thread_rng();
                builder.select_hops(&mut rng, &self.nodedb, &self.profiles, &connected)
            };
            if let Some(hops) = hops {
                if let Err(e) = self.build_path(&builder, hops).await {
                    warn!("path build failed: {}", e);
                }
            }
        }
    }

    fn connect_to_random_router<R: Rng>(&self, rng: &mut R) {
        if let Some(rc) = self.nodedb.select_random_hop(rng, None, 1) {
            if !self.link.has_session_to(&rc.pubkey) {
                self.try_connect(rc, self.config.connect_retry_budget);
            }
        }
    }

    fn update_our_rc(&self) {
        let mut rc = self.our_rc();
        if let Err(e) = rc.sign(&self.identity, now_ms()) {
            error!("failed to re-sign our RC: {:?}", e);
            return;
        }
        *self.our_rc.lock() = rc.clone();
        if let Some(path) = &self.config.our_rc_file {
            let mut buf = [0; nyx_packet::router_contact::MAX_RC_SIZE];
            if let Ok((_, size)) = rc.to_bytes((&mut buf, 0)) {
                self.disk.write_file(path.clone(), buf[..size].to_vec());
            }
        }
    }
}

fn routing_tag(msg: &RoutingMessage) -> &'static str {
    match msg {
        RoutingMessage::PathConfirm(_) => "PathConfirm",
        RoutingMessage::PathLatency(_) => "PathLatency",
        RoutingMessage::DataDiscard(_) => "DataDiscard",
        RoutingMessage::PathTransfer(_) => "PathTransfer",
        RoutingMessage::TransferTraffic(_) => "TransferTraffic",
        RoutingMessage::Dht(_) => "DHT",
        RoutingMessage::ObtainExit(_) => "ObtainExit",
        RoutingMessage::GrantExit(_) => "GrantExit",
        RoutingMessage::RejectExit(_) => "RejectExit",
        RoutingMessage::UpdateExit(_) => "UpdateExit",
        RoutingMessage::CloseExit(_) => "CloseExit",
        RoutingMessage::UpdateExitVerify(_) => "UpdateExitVerify",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::link::memory::{MemoryLink, MemoryNetwork};
    use crate::path::{role, PathStatus};

    struct TestNode {
        router: Router,
        rc: RouterContact,
        _dir: tempfile::TempDir,
    }

    fn relay_config(allow_exit: bool) -> RouterConfig {
        RouterConfig {
            allow_transit: true,
            allow_exit,
            is_service_node: true,
            advertise_addrs: vec![AddressInfo {
                dialect: "udp".to_owned(),
                ip: "203.0.113.7".parse().unwrap(),
                port: 1090,
                rank: 1,
            }],
            min_required_routers: 0,
            min_connected_routers: 0,
            paths_per_set: 0,
            ..RouterConfig::default()
        }
    }

    fn client_config() -> RouterConfig {
        RouterConfig {
            min_required_routers: 0,
            min_connected_routers: 0,
            paths_per_set: 0,
            hops_per_path: 2,
            ..RouterConfig::default()
        }
    }

    fn spawn_node(network: &MemoryNetwork, config: RouterConfig) -> TestNode {
        let mut rng = thread_rng();
        let identity = SigningKey::generate(&mut rng);
        let encryption = SecretKey::generate(&mut rng);

        let mut rc = RouterContact::new(&identity, encryption.public_key(), config.net_id.clone());
        rc.addrs = config.advertise_addrs.clone();
        rc.sign(&identity, now_ms()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (disk, disk_task) = DiskWorker::new();
        tokio::spawn(disk_task);
        let nodedb = NodeDb::new(dir.path().to_path_buf(), config.net_id.clone(), disk.clone());

        let (link, events) = MemoryLink::new(network, rc.clone());
        let router = Router::new(identity, encryption, config, nodedb, link, disk);
        let runner = router.clone();
        tokio::spawn(async move { runner.run(events).await });

        TestNode { router, rc, _dir: dir }
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
        for _ in 0..500 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    // 3-node line: the client builds a 2-hop path, the build confirms,
    // the latency probe echoes and exit negotiation runs over the
    // established circuit
    #[tokio::test]
    async fn path_builds_end_to_end() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, client_config());
        let b = spawn_node(&network, relay_config(false));
        let c = spawn_node(&network, relay_config(true));

        a.router.nodedb.insert(b.rc.clone());
        a.router.nodedb.insert(c.rc.clone());
        b.router.nodedb.insert(c.rc.clone());

        let path = a
            .router
            .build_path(&a.router.client_builder(), vec![b.rc.clone(), c.rc.clone()])
            .await
            .unwrap();
        assert_eq!(path.status(), PathStatus::Building);

        wait_until("path to establish", || {
            path.status() == PathStatus::Established
        })
        .await;

        // both transit hops exist under both of their ids
        assert!(b.router.paths.transit_count() >= 2);
        assert!(c.router.paths.transit_count() >= 2);

        // exit negotiation over the established path
        assert!(a.router.request_exit(&path));
        wait_until("exit grant", || path.role() & role::EXIT != 0).await;
    }

    // sendToOrQueue to an unknown router resolves it over the DHT,
    // connects and flushes the queue
    #[tokio::test]
    async fn send_to_unknown_router_resolves_and_flushes() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, client_config());
        let b = spawn_node(&network, relay_config(false));
        let c = spawn_node(&network, relay_config(false));

        a.router.nodedb.insert(b.rc.clone());
        b.router.nodedb.insert(c.rc.clone());

        // get a DHT peer first
        a.router.try_connect(b.rc.clone(), 2);
        wait_until("session to b", || {
            a.router.connected_routers().contains(&b.router.id)
        })
        .await;

        let c_id = c.router.id;
        assert!(!a.router.nodedb.has(&c_id));
        let msg = LinkMessage::DhtImmediate(DhtMessage::FindRouter(FindRouterMessage {
            exploratory: false,
            iterative: true,
            key: b.router.id,
            tx_id: 7,
        }));
        assert!(a.router.send_to_or_queue(&c_id, &msg));
        assert_eq!(a.router.outbound_queue_len(&c_id), 1);

        wait_until("lookup, connect and flush", || {
            a.router.nodedb.has(&c_id)
                && a.router.connected_routers().contains(&c_id)
                && a.router.outbound_queue_len(&c_id) == 0
        })
        .await;
    }

    // the 9th message parked for an unreachable peer is dropped
    #[tokio::test]
    async fn outbound_queue_is_bounded() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, client_config());

        let ghost = RouterId::random(&mut thread_rng());
        let msg = LinkMessage::DhtImmediate(DhtMessage::FindRouter(FindRouterMessage {
            exploratory: false,
            iterative: false,
            key: ghost,
            tx_id: 1,
        }));
        for _ in 0..MAX_PENDING_SEND_QUEUE_SIZE + 1 {
            assert!(a.router.send_to_or_queue(&ghost, &msg));
        }
        assert_eq!(a.router.outbound_queue_len(&ghost), MAX_PENDING_SEND_QUEUE_SIZE);
    }

    // a router that does not allow transit drops DHT lookups silently
    #[tokio::test]
    async fn find_router_needs_transit() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, client_config());
        let mut no_transit = relay_config(false);
        no_transit.allow_transit = false;
        let b = spawn_node(&network, no_transit);

        a.router.nodedb.insert(b.rc.clone());
        a.router.try_connect(b.rc.clone(), 2);
        wait_until("session to b", || {
            a.router.connected_routers().contains(&b.router.id)
        })
        .await;

        let msg = LinkMessage::DhtImmediate(DhtMessage::FindRouter(FindRouterMessage {
            exploratory: false,
            iterative: false,
            key: RouterId::random(&mut thread_rng()),
            tx_id: 9,
        }));
        assert!(a.router.send_to_or_queue(&b.router.id, &msg));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(b.router.dht.pending_count(), 0);
        assert_eq!(b.router.dropped_frames(), 0);
    }

    // FindRouter for our own key answers with exactly our descriptor
    #[tokio::test]
    async fn find_router_for_self_returns_own_rc() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, relay_config(false));
        let b = spawn_node(&network, relay_config(false));

        a.router.nodedb.insert(b.rc.clone());
        a.router.try_connect(b.rc.clone(), 2);
        wait_until("session to b", || {
            a.router.connected_routers().contains(&b.router.id)
        })
        .await;

        // b resolves a's key by asking a directly
        let (tx, rx) = futures::channel::oneshot::channel();
        b.router.dht.add_node(a.router.id);
        assert!(b
            .router
            .lookup_router(a.router.id, LocalLookup::Caller(tx)));
        let rcs = rx.await.unwrap();
        assert_eq!(rcs.len(), 1);
        assert_eq!(rcs[0].pubkey, a.router.id);
    }

    #[tokio::test]
    async fn persist_until_max_coalesces() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, client_config());

        let id = RouterId::random(&mut thread_rng());
        let now = clock_now();
        a.router.persist_session_until(id, now + Duration::from_secs(5));
        a.router.persist_session_until(id, now + Duration::from_secs(2));
        assert_eq!(
            a.router.state.lock().persisting_sessions[&id],
            now + Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn stop_closes_sessions() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, relay_config(false));
        let b = spawn_node(&network, relay_config(false));

        a.router.nodedb.insert(b.rc.clone());
        a.router.try_connect(b.rc.clone(), 2);
        wait_until("session to b", || {
            a.router.connected_routers().contains(&b.router.id)
        })
        .await;

        a.router.stop().await;
        wait_until("session teardown", || {
            !b.router.connected_routers().contains(&a.router.id)
        })
        .await;
    }
}
