/*!
PathSet: a group of paths owned by one local purpose, plus the builder
policy that keeps the group at strength.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use nyx_crypto::{PathId, RouterId};
use nyx_packet::router_contact::RouterContact;

use super::{Path, PathStatus};
use crate::nodedb::NodeDb;
use crate::profile::Profiles;

/// Floor of the delay between two builds of one set.
pub const MIN_PATH_BUILD_INTERVAL: Duration = Duration::from_secs(10);

/// How many times hop selection retries around bad profiles.
const SELECT_TRIES: usize = 5;

/// A group of paths serving one purpose.
pub struct PathSet {
    paths: Mutex<HashMap<(RouterId, PathId), Arc<Path>>>,
    num_paths: usize,
}

impl PathSet {
    /// A set that tries to keep `num_paths` usable paths.
    pub fn new(num_paths: usize) -> PathSet {
        PathSet {
            paths: Mutex::new(HashMap::new()),
            num_paths,
        }
    }

    /// Track a freshly built path.
    pub fn add_path(&self, path: Arc<Path>) {
        self.paths
            .lock()
            .insert((path.upstream(), path.rx_id()), path);
    }

    /// The path using `remote` as first hop under the given id.
    pub fn get_by_upstream(&self, remote: &RouterId, id: &PathId) -> Option<Arc<Path>> {
        self.paths.lock().get(&(*remote, *id)).cloned()
    }

    /// The path owning `id` as either of its first-hop path ids.
    pub fn get_path_by_id(&self, id: &PathId) -> Option<Arc<Path>> {
        self.paths
            .lock()
            .values()
            .find(|path| path.rx_id() == *id || path.tx_id() == *id)
            .cloned()
    }

    /// Paths currently tracked.
    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    /// Whether no paths are tracked.
    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }

    /// Snapshot of all paths.
    pub fn paths(&self) -> Vec<Arc<Path>> {
        self.paths.lock().values().cloned().collect()
    }

    /// Whether the target strength calls for another build.
    pub fn should_build_more(&self) -> bool {
        self.paths.lock().len() < self.num_paths
    }

    /// Drop terminal paths, returning what was reaped.
    pub fn expire_paths(&self, now: Instant) -> Vec<Arc<Path>> {
        let mut paths = self.paths.lock();
        let dead: Vec<(RouterId, PathId)> = paths
            .iter()
            .filter(|(_, path)| {
                if path.status() == PathStatus::Established && path.expired(now) {
                    path.mark_expired();
                }
                matches!(path.status(), PathStatus::Timeout | PathStatus::Expired)
            })
            .map(|(key, _)| *key)
            .collect();
        dead.into_iter().filter_map(|key| paths.remove(&key)).collect()
    }
}

struct BuilderState {
    last_build: Option<Instant>,
    build_interval_limit: Duration,
    enabled: bool,
}

/// Path builder: a [`PathSet`](./struct.PathSet.html) plus the policy for
/// selecting hops and pacing builds.
pub struct Builder {
    /// The set of paths this builder maintains.
    pub set: PathSet,
    /// Hops per path.
    pub hop_count: usize,
    state: Mutex<BuilderState>,
}

impl Builder {
    /// A builder keeping `num_paths` paths of `hop_count` hops.
    pub fn new(num_paths: usize, hop_count: usize) -> Builder {
        Builder {
            set: PathSet::new(num_paths),
            hop_count,
            state: Mutex::new(BuilderState {
                last_build: None,
                build_interval_limit: MIN_PATH_BUILD_INTERVAL,
                enabled: true,
            }),
        }
    }

    /// Stop building new paths (shutdown).
    pub fn stop(&self) {
        self.state.lock().enabled = false;
    }

    /// Whether the builder still builds.
    pub fn enabled(&self) -> bool {
        self.state.lock().enabled
    }

    fn build_cooldown_hit(&self, now: Instant) -> bool {
        let state = self.state.lock();
        match state.last_build {
            Some(last) => now.saturating_duration_since(last) < state.build_interval_limit,
            None => false,
        }
    }

    /// Whether a build should start now.
    pub fn should_build_more(&self, now: Instant) -> bool {
        self.enabled() && self.set.should_build_more() && !self.build_cooldown_hit(now)
    }

    /// Note that a build started.
    pub fn note_build_started(&self, now: Instant) {
        self.state.lock().last_build = Some(now);
    }

    /// A path of this set reached Established; reset the backoff.
    pub fn handle_path_built(&self) {
        self.state.lock().build_interval_limit = MIN_PATH_BUILD_INTERVAL;
    }

    /// A build timed out; back off linearly.
    pub fn handle_path_build_timeout(&self) {
        self.state.lock().build_interval_limit += Duration::from_secs(1);
    }

    /** Select the descriptors for one path.

    Hop 0 is the guard: it must be a router we already have a session to.
    Later hops are uniform random picks from the NodeDB, skipping the
    previous hop and profiled-bad routers.
    */
    pub fn select_hops<R: Rng>(
        &self,
        rng: &mut R,
        nodedb: &NodeDb,
        profiles: &Profiles,
        connected: &[RouterId],
    ) -> Option<Vec<RouterContact>> {
        let mut hops: Vec<RouterContact> = Vec::with_capacity(self.hop_count);

        let candidates: Vec<RouterContact> = connected
            .iter()
            .filter(|id| !profiles.is_bad(id))
            .filter_map(|id| nodedb.get(id))
            .collect();
        if candidates.is_empty() {
            warn!("failed to select guard hop");
            return None;
        }
        hops.push(candidates[rng.gen_range(0..candidates.len())].clone());

        while hops.len() < self.hop_count {
            let prev = hops[hops.len() - 1].pubkey;
            let mut selected = None;
            for _ in 0..SELECT_TRIES {
                match nodedb.select_random_hop(rng, Some(&prev), hops.len()) {
                    Some(rc) if profiles.is_bad(&rc.pubkey) => continue,
                    Some(rc) if hops.iter().any(|h| h.pubkey == rc.pubkey) => continue,
                    Some(rc) => {
                        selected = Some(rc);
                        break;
                    }
                    None => break,
                }
            }
            match selected {
                Some(rc) => hops.push(rc),
                None => {
                    warn!("failed to select hop {}", hops.len());
                    return None;
                }
            }
        }
        Some(hops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    use crate::nodedb::disk::DiskWorker;
    use crate::path::tests::test_path;
    use crate::time::clock_now;
    use nyx_packet::router_contact::NetId;

    #[test]
    fn add_and_find_by_ids() {
        let set = PathSet::new(2);
        let path = Arc::new(test_path(3));
        set.add_path(path.clone());

        let upstream = path.upstream();
        assert!(set.get_by_upstream(&upstream, &path.rx_id()).is_some());
        assert!(set.get_path_by_id(&path.rx_id()).is_some());
        assert!(set.get_path_by_id(&path.tx_id()).is_some());
        assert!(set.get_path_by_id(&PathId::default()).is_none());
    }

    #[test]
    fn should_build_more_tracks_target() {
        let set = PathSet::new(1);
        assert!(set.should_build_more());
        set.add_path(Arc::new(test_path(2)));
        assert!(!set.should_build_more());
    }

    #[test]
    fn expire_reaps_timed_out() {
        use crate::path::{PATH_BUILD_TIMEOUT, TickAction};

        let set = PathSet::new(2);
        let path = Arc::new(test_path(2));
        set.add_path(path.clone());

        // healthy paths stay
        assert!(set.expire_paths(clock_now()).is_empty());

        let mut rng = thread_rng();
        assert_eq!(
            path.tick(clock_now() + PATH_BUILD_TIMEOUT, &mut rng),
            TickAction::TimedOut
        );
        let reaped = set.expire_paths(clock_now());
        assert_eq!(reaped.len(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn builder_backoff_grows_and_resets() {
        let builder = Builder::new(1, 2);
        let now = clock_now();
        assert!(builder.should_build_more(now));

        builder.note_build_started(now);
        assert!(!builder.should_build_more(now));

        builder.handle_path_build_timeout();
        builder.handle_path_built();
        assert!(!builder.should_build_more(now + Duration::from_secs(1)));
        assert!(builder.should_build_more(now + MIN_PATH_BUILD_INTERVAL));
    }

    #[tokio::test]
    async fn select_hops_requires_connected_guard() {
        let dir = tempfile::tempdir().unwrap();
        let (disk, _task) = DiskWorker::new();
        let nodedb = NodeDb::new(dir.path().to_path_buf(), NetId::default(), disk);
        let profiles = Profiles::new();
        let builder = Builder::new(1, 2);
        let mut rng = thread_rng();

        let rcs: Vec<_> = (0..4)
            .map(|_| crate::path::tests::test_rc_with_keys().0)
            .collect();
        for rc in &rcs {
            nodedb.insert(rc.clone());
        }

        // no sessions, no guard
        assert!(builder.select_hops(&mut rng, &nodedb, &profiles, &[]).is_none());

        let connected = [rcs[0].pubkey];
        let hops = builder
            .select_hops(&mut rng, &nodedb, &profiles, &connected)
            .unwrap();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].pubkey, rcs[0].pubkey);
        assert_ne!(hops[1].pubkey, hops[0].pubkey);
    }
}
