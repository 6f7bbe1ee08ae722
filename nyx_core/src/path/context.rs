/*!
PathContext: routes inbound path traffic to its owner.

Two multimaps keyed by path id: locally owned paths (both the TX and the
RX id of every first hop point at the owning builder) and transit hops
(both ids point at the same shared hop record). Builders are owned by
whoever created them; the context only keeps weak handles and drops them
when the owner goes away.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use nyx_crypto::{PathId, RouterId};

use super::set::Builder;
use super::transit::{TransitHop, TransitHopInfo};
use super::Path;

/// Who handles an inbound routing message for a given path id.
pub enum Handler {
    /// One of our own paths.
    Local(Arc<Path>),
    /// The endpoint side of a transit hop.
    Transit(Arc<TransitHop>),
}

#[derive(Default)]
struct PathContextInner {
    our_paths: Mutex<HashMap<PathId, Weak<Builder>>>,
    transit: Mutex<HashMap<PathId, Vec<Arc<TransitHop>>>>,
    builders: Mutex<Vec<Weak<Builder>>>,
    allow_transit: AtomicBool,
}

/// Shared path routing state of one router.
#[derive(Clone, Default)]
pub struct PathContext {
    inner: Arc<PathContextInner>,
}

impl PathContext {
    /// Fresh context; transit is rejected until allowed.
    pub fn new() -> PathContext {
        PathContext::default()
    }

    /// Accept LR Commit frames from other routers.
    pub fn allow_transit(&self) {
        self.inner.allow_transit.store(true, Ordering::Relaxed);
    }

    /// Whether we relay for others.
    pub fn allowing_transit(&self) -> bool {
        self.inner.allow_transit.load(Ordering::Relaxed)
    }

    /// Track a path builder.
    pub fn add_builder(&self, builder: &Arc<Builder>) {
        self.inner.builders.lock().push(Arc::downgrade(builder));
    }

    /// Builders that are still alive.
    pub fn builders(&self) -> Vec<Arc<Builder>> {
        let mut list = self.inner.builders.lock();
        list.retain(|weak| weak.strong_count() > 0);
        list.iter().filter_map(Weak::upgrade).collect()
    }

    /// Register a freshly built path under both of its first-hop ids.
    pub fn add_own_path(&self, builder: &Arc<Builder>, path: Arc<Path>) {
        builder.set.add_path(path.clone());
        let mut our_paths = self.inner.our_paths.lock();
        our_paths.insert(path.tx_id(), Arc::downgrade(builder));
        our_paths.insert(path.rx_id(), Arc::downgrade(builder));
    }

    /// The builder owning a local path id.
    pub fn get_local_builder(&self, id: &PathId) -> Option<Arc<Builder>> {
        self.inner.our_paths.lock().get(id).and_then(Weak::upgrade)
    }

    /// Install a transit hop under both of its path ids.
    pub fn put_transit_hop(&self, hop: Arc<TransitHop>) {
        let mut transit = self.inner.transit.lock();
        transit.entry(hop.info.tx_id).or_default().push(hop.clone());
        transit.entry(hop.info.rx_id).or_default().push(hop);
    }

    /// Whether this exact hop tuple is already installed.
    pub fn has_transit_hop(&self, info: &TransitHopInfo) -> bool {
        self.inner
            .transit
            .lock()
            .get(&info.tx_id)
            .map(|hops| hops.iter().any(|hop| hop.info == *info))
            .unwrap_or(false)
    }

    /** Resolve traffic arriving from `remote` toward the endpoint side.

    Checks our own paths first, then transit hops whose upstream neighbor
    is `remote`.
    */
    pub fn get_by_upstream(&self, remote: &RouterId, id: &PathId) -> Option<Handler> {
        let own = self
            .get_local_builder(id)
            .and_then(|builder| builder.set.get_by_upstream(remote, id));
        if let Some(path) = own {
            return Some(Handler::Local(path));
        }
        self.inner
            .transit
            .lock()
            .get(id)?
            .iter()
            .find(|hop| hop.info.upstream == *remote)
            .cloned()
            .map(Handler::Transit)
    }

    /// Resolve traffic arriving from `remote` toward the path owner side.
    pub fn get_by_downstream(&self, remote: &RouterId, id: &PathId) -> Option<Arc<TransitHop>> {
        self.inner
            .transit
            .lock()
            .get(id)?
            .iter()
            .find(|hop| hop.info.downstream == *remote)
            .cloned()
    }

    /// The transit hop we terminate for the given path id.
    pub fn get_path_for_transfer(&self, us: &RouterId, id: &PathId) -> Option<Arc<TransitHop>> {
        self.inner
            .transit
            .lock()
            .get(id)?
            .iter()
            .find(|hop| hop.info.upstream == *us)
            .cloned()
    }

    /** Central dispatch for an inbound routing message by path id: a
    local path, or the endpoint side of a transit hop.
    */
    pub fn get_handler(&self, us: &RouterId, id: &PathId) -> Option<Handler> {
        if let Some(path) = self
            .get_local_builder(id)
            .and_then(|builder| builder.set.get_path_by_id(id))
        {
            return Some(Handler::Local(path));
        }
        self.get_path_for_transfer(us, id).map(Handler::Transit)
    }

    /// Drop expired transit hops (from both indices) and reap terminal
    /// paths in every live builder. Returns the reaped local paths.
    pub fn expire_paths(&self, now: Instant) -> Vec<Arc<Path>> {
        {
            let mut transit = self.inner.transit.lock();
            transit.retain(|_, hops| {
                hops.retain(|hop| !hop.expired(now));
                !hops.is_empty()
            });
        }

        let mut reaped = Vec::new();
        for builder in self.builders() {
            for path in builder.set.expire_paths(now) {
                reaped.push(path);
            }
        }
        let mut our_paths = self.inner.our_paths.lock();
        for path in &reaped {
            our_paths.remove(&path.tx_id());
            our_paths.remove(&path.rx_id());
        }
        our_paths.retain(|_, weak| weak.strong_count() > 0);
        reaped
    }

    /// Number of installed transit hop index entries.
    pub fn transit_count(&self) -> usize {
        self.inner.transit.lock().len()
    }
}
