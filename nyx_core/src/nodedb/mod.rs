/*!
NodeDB: the keyed store of verified router descriptors.

The in-memory map is the source of truth; the on-disk mirror under
`<dir>/<nibble>/<hex(pubkey)>.signed` is best effort and recovers state on
the next start. The single hex nibble subdirectory keeps directories small.
*/

pub mod disk;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use nyx_binary_io::{FromBytes, ToBytes};
use nyx_crypto::RouterId;
use nyx_packet::router_contact::{NetId, RouterContact, MAX_RC_SIZE};

use self::disk::DiskWorker;
use crate::time::now_ms;

/// Extension of descriptor files.
pub const RC_FILE_EXT: &str = "signed";

/// Hop selection requires at least this many known routers.
pub const MIN_ENTRIES_FOR_SELECTION: usize = 3;

const SELECT_TRIES: usize = 5;

const SKIPLIST_SUBDIRS: &str = "0123456789abcdef";

/// Keyed store of router descriptors with a disk mirror.
#[derive(Clone)]
pub struct NodeDb {
    entries: Arc<Mutex<HashMap<RouterId, RouterContact>>>,
    dir: PathBuf,
    disk: DiskWorker,
    net_id: NetId,
}

fn encode_rc(rc: &RouterContact) -> Option<Vec<u8>> {
    let mut buf = [0; MAX_RC_SIZE];
    match rc.to_bytes((&mut buf, 0)) {
        Ok((_, size)) => Some(buf[..size].to_vec()),
        Err(e) => {
            error!("failed to encode RC for {}: {:?}", rc.pubkey, e);
            None
        }
    }
}

impl NodeDb {
    /// Create a NodeDB rooted at `dir`.
    pub fn new(dir: PathBuf, net_id: NetId, disk: DiskWorker) -> NodeDb {
        NodeDb {
            entries: Arc::new(Mutex::new(HashMap::new())),
            dir,
            net_id,
            disk,
        }
    }

    /// Path of the descriptor file for `pk`: the shard is the last hex
    /// nibble of the key.
    pub fn rc_file_path(&self, pk: &RouterId) -> PathBuf {
        let hex = hex::encode(pk.as_bytes());
        let shard = &hex[hex.len() - 1..];
        self.dir
            .join(shard)
            .join(format!("{}.{}", hex, RC_FILE_EXT))
    }

    /** Insert a descriptor and queue the disk write.

    The in-memory insertion happens first so a concurrent `get` observes
    the new RC even while the file is still in flight; a failed disk write
    only costs durability. Returns `false` when the RC cannot be encoded.
    */
    pub fn insert(&self, rc: RouterContact) -> bool {
        let bytes = match encode_rc(&rc) {
            Some(bytes) => bytes,
            None => return false,
        };
        let path = self.rc_file_path(&rc.pubkey);
        self.entries.lock().insert(rc.pubkey, rc);
        self.disk.write_file(path, bytes);
        true
    }

    /// Remove a descriptor from memory and disk.
    pub fn remove(&self, pk: &RouterId) -> bool {
        let removed = self.entries.lock().remove(pk).is_some();
        if removed {
            self.disk.remove_file(self.rc_file_path(pk));
        }
        removed
    }

    /// Get a copy of the descriptor for `pk`.
    pub fn get(&self, pk: &RouterId) -> Option<RouterContact> {
        self.entries.lock().get(pk).cloned()
    }

    /// Whether a descriptor for `pk` is known.
    pub fn has(&self, pk: &RouterId) -> bool {
        self.entries.lock().contains_key(pk)
    }

    /// Number of descriptors known.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no descriptors are known.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Visit every descriptor until the visitor returns `false`.
    pub fn visit<F: FnMut(&RouterContact) -> bool>(&self, mut visit: F) {
        let entries = self.entries.lock();
        for rc in entries.values() {
            if !visit(rc) {
                return;
            }
        }
    }

    /** Pick a uniformly random public router for hop `n`, rejecting a
    match with `prev`.

    Retries up to 5 times; fails when fewer than 3 routers are known. For
    `n == 0` the caller enforces its own guard policy instead.
    */
    pub fn select_random_hop<R: Rng>(
        &self,
        rng: &mut R,
        prev: Option<&RouterId>,
        n: usize,
    ) -> Option<RouterContact> {
        let entries = self.entries.lock();
        let sz = entries.len();
        if sz < MIN_ENTRIES_FOR_SELECTION {
            return None;
        }
        if n == 0 {
            let idx = rng.gen_range(0..sz);
            return entries.values().nth(idx).cloned();
        }
        for _ in 0..SELECT_TRIES {
            let idx = rng.gen_range(0..sz);
            let rc = match entries.values().nth(idx) {
                Some(rc) => rc,
                None => continue,
            };
            if Some(&rc.pubkey) == prev {
                continue;
            }
            if !rc.is_public_router() {
                continue;
            }
            return Some(rc.clone());
        }
        None
    }

    /// Pick a random router advertising exit ranges.
    pub fn select_random_exit<R: Rng>(&self, rng: &mut R) -> Option<RouterContact> {
        let entries = self.entries.lock();
        let sz = entries.len();
        if sz < MIN_ENTRIES_FOR_SELECTION {
            return None;
        }
        let start = rng.gen_range(0..sz);
        entries
            .values()
            .cycle()
            .skip(start)
            .take(sz)
            .find(|rc| rc.is_exit())
            .cloned()
    }

    /** Load every descriptor below the database directory.

    Files that fail to parse or verify are skipped with an error log.
    Returns the number of descriptors loaded.
    */
    pub fn load_dir(&self) -> std::io::Result<usize> {
        let now = now_ms();
        let mut loaded = 0;
        for shard in SKIPLIST_SUBDIRS.chars() {
            let sub = self.dir.join(shard.to_string());
            if !sub.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&sub)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RC_FILE_EXT) {
                    continue;
                }
                if self.load_file(&path, now) {
                    loaded += 1;
                }
            }
        }
        Ok(loaded)
    }

    fn load_file(&self, path: &Path, now: u64) -> bool {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to read {}: {}", path.display(), e);
                return false;
            }
        };
        let rc = match RouterContact::from_bytes(&bytes) {
            Ok((_, rc)) => rc,
            Err(_) => {
                error!("{} does not contain an RC", path.display());
                return false;
            }
        };
        if !rc.verify(&self.net_id, now) {
            error!("{} contains an invalid RC", path.display());
            return false;
        }
        self.entries.lock().insert(rc.pubkey, rc);
        true
    }

    /** Verify a descriptor off the main tasks and store it when valid.

    Stage one checks the signature on a blocking worker, stage two inserts
    in memory and queues the disk write, the awaiting caller observes the
    `valid` flag. A failed disk write keeps the in-memory entry.
    */
    pub async fn async_verify(&self, rc: RouterContact) -> bool {
        let net_id = self.net_id.clone();
        let now = now_ms();
        let verified = tokio::task::spawn_blocking(move || {
            let valid = rc.verify(&net_id, now);
            (valid, rc)
        })
        .await;

        let (valid, rc) = match verified {
            Ok(result) => result,
            Err(e) => {
                error!("verify worker failed: {}", e);
                return false;
            }
        };
        if !valid {
            warn!("RC for {} is not valid, can't save to disk", rc.pubkey);
            return false;
        }
        if rc.is_public_router() {
            debug!("RC for {} is valid, saving to disk", rc.pubkey);
            self.insert(rc);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::thread_rng;

    use nyx_crypto::{SecretKey, SigningKey};
    use nyx_packet::router_contact::AddressInfo;

    use super::*;

    fn test_rc(now: u64) -> RouterContact {
        let mut rng = thread_rng();
        let identity = SigningKey::generate(&mut rng);
        let enckey = SecretKey::generate(&mut rng).public_key();
        let mut rc = RouterContact::new(&identity, enckey, NetId::default());
        rc.addrs.push(AddressInfo {
            dialect: "udp".to_owned(),
            ip: "203.0.113.7".parse().unwrap(),
            port: 1090,
            rank: 1,
        });
        rc.sign(&identity, now).unwrap();
        rc
    }

    fn test_db(dir: &tempfile::TempDir) -> (NodeDb, tokio::task::JoinHandle<()>) {
        let (disk, task) = DiskWorker::new();
        let handle = tokio::spawn(task);
        (
            NodeDb::new(dir.path().to_path_buf(), NetId::default(), disk),
            handle,
        )
    }

    #[tokio::test]
    async fn insert_get_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let (db, _task) = test_db(&dir);

        let rc = test_rc(now_ms());
        let pk = rc.pubkey;
        assert!(db.insert(rc.clone()));
        assert_eq!(db.get(&pk), Some(rc));
        assert!(db.has(&pk));
        assert_eq!(db.len(), 1);
    }

    #[tokio::test]
    async fn remove_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let (db, _task) = test_db(&dir);

        let rc = test_rc(now_ms());
        let pk = rc.pubkey;
        db.insert(rc);
        assert!(db.remove(&pk));
        assert!(!db.remove(&pk));
        assert!(db.get(&pk).is_none());
    }

    #[test]
    fn file_path_shards_on_last_nibble() {
        let (disk, _task) = DiskWorker::new();
        let db = NodeDb::new(PathBuf::from("/tmp/ndb"), NetId::default(), disk);
        let pk = RouterId::new([0xab; RouterId::SIZE]);
        let path = db.rc_file_path(&pk);
        assert_eq!(
            path,
            PathBuf::from(format!("/tmp/ndb/b/{}.signed", hex::encode(pk.as_bytes())))
        );
    }

    #[tokio::test]
    async fn persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (db, handle) = test_db(&dir);

        let rc = test_rc(now_ms());
        let pk = rc.pubkey;
        assert!(db.insert(rc.clone()));
        // closing the worker flushes the queue
        let NodeDb { disk, .. } = db;
        drop(disk);
        handle.await.unwrap();

        let (db2, _task) = test_db(&dir);
        assert_eq!(db2.load_dir().unwrap(), 1);
        assert_eq!(db2.get(&pk), Some(rc));
    }

    #[tokio::test]
    async fn load_dir_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("0")).unwrap();
        std::fs::write(dir.path().join("0").join("junk.signed"), b"junk").unwrap();
        let (db, _task) = test_db(&dir);
        assert_eq!(db.load_dir().unwrap(), 0);
    }

    #[tokio::test]
    async fn select_random_hop_needs_three_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (db, _task) = test_db(&dir);
        let mut rng = thread_rng();

        db.insert(test_rc(now_ms()));
        db.insert(test_rc(now_ms()));
        assert!(db.select_random_hop(&mut rng, None, 1).is_none());

        db.insert(test_rc(now_ms()));
        assert!(db.select_random_hop(&mut rng, None, 1).is_some());
    }

    #[tokio::test]
    async fn select_random_hop_never_returns_prev() {
        let dir = tempfile::tempdir().unwrap();
        let (db, _task) = test_db(&dir);
        let mut rng = thread_rng();

        let rcs: Vec<_> = (0..4).map(|_| test_rc(now_ms())).collect();
        for rc in &rcs {
            db.insert(rc.clone());
        }
        let prev = rcs[0].pubkey;
        for _ in 0..100 {
            if let Some(hop) = db.select_random_hop(&mut rng, Some(&prev), 1) {
                assert_ne!(hop.pubkey, prev);
            }
        }
    }

    #[tokio::test]
    async fn select_random_hop_is_roughly_uniform() {
        let dir = tempfile::tempdir().unwrap();
        let (db, _task) = test_db(&dir);
        let mut rng = thread_rng();

        let rcs: Vec<_> = (0..10).map(|_| test_rc(now_ms())).collect();
        for rc in &rcs {
            db.insert(rc.clone());
        }

        let mut counts: HashMap<RouterId, u32> = HashMap::new();
        let draws = 1000;
        for _ in 0..draws {
            let hop = db.select_random_hop(&mut rng, None, 1).unwrap();
            *counts.entry(hop.pubkey).or_insert(0) += 1;
        }

        // each key expects draws/10 = 100 hits; five sigma of a
        // binomial(1000, 0.1) is ~47
        for rc in &rcs {
            let count = *counts.get(&rc.pubkey).unwrap_or(&0);
            assert!(count > 100 - 48 && count < 100 + 48, "count {}", count);
        }
    }

    #[tokio::test]
    async fn select_random_exit_finds_exits() {
        let dir = tempfile::tempdir().unwrap();
        let (db, _task) = test_db(&dir);
        let mut rng = thread_rng();

        db.insert(test_rc(now_ms()));
        db.insert(test_rc(now_ms()));
        let mut exit_rc = test_rc(now_ms());
        let identity = SigningKey::generate(&mut rng);
        exit_rc.exits.push(nyx_packet::router_contact::ExitInfo {
            address: "10.0.0.0".parse().unwrap(),
            netmask: 8,
        });
        exit_rc.sign(&identity, now_ms()).unwrap();
        let exit_pk = exit_rc.pubkey;
        db.insert(exit_rc);

        let found = db.select_random_exit(&mut rng).unwrap();
        assert_eq!(found.pubkey, exit_pk);
    }

    #[tokio::test]
    async fn async_verify_accepts_and_stores() {
        let dir = tempfile::tempdir().unwrap();
        let (db, _task) = test_db(&dir);

        let rc = test_rc(now_ms());
        let pk = rc.pubkey;
        assert!(db.async_verify(rc).await);
        assert!(db.has(&pk));
    }

    #[tokio::test]
    async fn async_verify_rejects_tampered() {
        let dir = tempfile::tempdir().unwrap();
        let (db, _task) = test_db(&dir);

        let mut rc = test_rc(now_ms());
        rc.last_updated += 1;
        let pk = rc.pubkey;
        assert!(!db.async_verify(rc).await);
        assert!(!db.has(&pk));
    }
}
