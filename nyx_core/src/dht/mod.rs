/*!
DHT router lookup state.

A single XOR-metric [`Bucket`](./bucket/struct.Bucket.html) tracks peers
close to our key. Outstanding lookups live in a
[`RequestQueue`](./request_queue/struct.RequestQueue.html) keyed by our
outgoing transaction id; lookups we relay for somebody else are
additionally deduplicated on the `(requester, tx_id)` pair. All message
handling happens in the [`router`](../router/index.html); this module only
owns the state.
*/

pub mod bucket;
pub mod request_queue;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use parking_lot::Mutex;
use rand::Rng;

use nyx_crypto::{PathId, RouterId};
use nyx_packet::router_contact::RouterContact;

use self::bucket::{Bucket, BUCKET_SIZE};
use self::request_queue::RequestQueue;

/// How long a router lookup may stay unanswered.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do with the result of a lookup we started ourselves.
#[derive(Debug)]
pub enum LocalLookup {
    /// Resolve, connect and flush the outbound queue for the target.
    SendTo,
    /// Neighbourhood exploration; results are just verified and stored.
    Explore,
    /// Refresh of an expiring descriptor; results are verified and stored.
    Refresh,
    /// Hand the verified results to a caller.
    Caller(oneshot::Sender<Vec<RouterContact>>),
}

/// Where the answer to a pending lookup has to go.
#[derive(Debug)]
pub enum LookupOrigin {
    /// We asked.
    Local(LocalLookup),
    /// A directly linked peer asked and we relay recursively.
    Remote {
        /// Who asked.
        requester: RouterId,
        /// Their transaction id.
        tx_id: u64,
    },
    /// The lookup arrived over one of our transit paths; the reply goes
    /// back down that path.
    Path {
        /// Path the lookup arrived on.
        path_id: PathId,
        /// Transaction id used on that path.
        tx_id: u64,
    },
}

/// One lookup in flight.
#[derive(Debug)]
pub struct PendingLookup {
    /// Identity being resolved.
    pub target: RouterId,
    /// Where the answer goes.
    pub origin: LookupOrigin,
}

struct DhtInner {
    nodes: Bucket,
    pending: RequestQueue<PendingLookup>,
    // (requester, their tx id) pairs we are currently relaying
    active_remote: HashSet<(RouterId, u64)>,
}

/// DHT state of one router.
#[derive(Clone)]
pub struct Dht {
    inner: Arc<Mutex<DhtInner>>,
    /// Our own key, the base of the routing table.
    pub our_id: RouterId,
}

impl Dht {
    /// Create DHT state around our identity.
    pub fn new(our_id: RouterId) -> Dht {
        Dht {
            inner: Arc::new(Mutex::new(DhtInner {
                nodes: Bucket::new(our_id, BUCKET_SIZE),
                pending: RequestQueue::new(LOOKUP_TIMEOUT),
                active_remote: HashSet::new(),
            })),
            our_id,
        }
    }

    /// Track a peer in the routing table.
    pub fn add_node(&self, id: RouterId) -> bool {
        self.inner.lock().nodes.try_add(id)
    }

    /// Forget a peer.
    pub fn remove_node(&self, id: &RouterId) {
        self.inner.lock().nodes.remove(id);
    }

    /// Closest known peer to `target`, excluding the target itself.
    pub fn find_closest(&self, target: &RouterId) -> Option<RouterId> {
        self.inner.lock().nodes.find_closest(target)
    }

    /// Up to `n` closest known peers to `target`.
    pub fn find_closest_n(&self, target: &RouterId, n: usize) -> Vec<RouterId> {
        self.inner.lock().nodes.find_closest_n(target, n)
    }

    /// Number of peers in the routing table.
    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Register a lookup and mint the transaction id to send with it.
    pub fn register_lookup<R: Rng>(&self, rng: &mut R, pending: PendingLookup) -> u64 {
        let mut inner = self.inner.lock();
        if let LookupOrigin::Remote { requester, tx_id } = pending.origin {
            inner.active_remote.insert((requester, tx_id));
        }
        inner.pending.new_tx_id(rng, pending)
    }

    /// Claim the pending lookup a reply with `tx_id` answers. `None` for
    /// unknown or timed out transactions.
    pub fn claim(&self, tx_id: u64) -> Option<PendingLookup> {
        let mut inner = self.inner.lock();
        let pending = inner.pending.check_tx_id(tx_id, |_| true)?;
        if let LookupOrigin::Remote { requester, tx_id } = pending.origin {
            inner.active_remote.remove(&(requester, tx_id));
        }
        Some(pending)
    }

    /// Whether we are already relaying a lookup for this `(requester,
    /// tx_id)` pair. Duplicates are dropped by the caller.
    pub fn is_duplicate_remote(&self, requester: &RouterId, tx_id: u64) -> bool {
        self.inner.lock().active_remote.contains(&(*requester, tx_id))
    }

    /// Drop timed out lookups and return them so the caller can deliver
    /// empty results.
    pub fn timed_out(&self) -> Vec<PendingLookup> {
        let mut inner = self.inner.lock();
        let expired = inner.pending.clear_timed_out();
        for pending in &expired {
            if let LookupOrigin::Remote { requester, tx_id } = pending.origin {
                inner.active_remote.remove(&(requester, tx_id));
            }
        }
        expired
    }

    /// Whether a lookup for `target` is already in flight.
    pub fn has_pending_for(&self, target: &RouterId) -> bool {
        self.inner
            .lock()
            .pending
            .values()
            .any(|pending| pending.target == *target)
    }

    /// Number of lookups in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    fn id(byte: u8) -> RouterId {
        RouterId::new([byte; RouterId::SIZE])
    }

    #[test]
    fn register_and_claim() {
        let dht = Dht::new(id(0));
        let tx_id = dht.register_lookup(&mut thread_rng(), PendingLookup {
            target: id(1),
            origin: LookupOrigin::Local(LocalLookup::Explore),
        });

        let pending = dht.claim(tx_id).unwrap();
        assert_eq!(pending.target, id(1));
        assert!(dht.claim(tx_id).is_none());
    }

    #[test]
    fn remote_duplicates_are_visible_until_claimed() {
        let dht = Dht::new(id(0));
        assert!(!dht.is_duplicate_remote(&id(7), 42));

        let tx_id = dht.register_lookup(&mut thread_rng(), PendingLookup {
            target: id(1),
            origin: LookupOrigin::Remote { requester: id(7), tx_id: 42 },
        });
        assert!(dht.is_duplicate_remote(&id(7), 42));

        dht.claim(tx_id).unwrap();
        assert!(!dht.is_duplicate_remote(&id(7), 42));
    }

    #[tokio::test]
    async fn timed_out_clears_remote_marker() {
        tokio::time::pause();

        let dht = Dht::new(id(0));
        dht.register_lookup(&mut thread_rng(), PendingLookup {
            target: id(1),
            origin: LookupOrigin::Remote { requester: id(7), tx_id: 42 },
        });

        tokio::time::advance(LOOKUP_TIMEOUT + Duration::from_secs(1)).await;
        let expired = dht.timed_out();
        assert_eq!(expired.len(), 1);
        assert!(!dht.is_duplicate_remote(&id(7), 42));
    }
}
