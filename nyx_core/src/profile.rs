/*!
Router profiling: per-peer connect and path statistics.

Profiles feed hop selection (bad peers are skipped) and the client-side
decision to drop a peer's descriptor after repeated failures. The whole
table is persisted as one bencoded file, atomically replaced.
*/

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use nyx_binary_io::*;
use nyx_crypto::RouterId;

use crate::nodedb::disk::DiskWorker;

/// Connect timeouts after which a peer with no successes is bad.
const MAX_CONNECT_TIMEOUTS: u64 = 10;

/// Path failures a peer may accumulate over its successes.
const MAX_PATH_FAIL_MARGIN: u64 = 10;

/// Counters for one peer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RouterProfile {
    /// Sessions established.
    pub connect_success: u64,
    /// Connect attempts that timed out.
    pub connect_timeout: u64,
    /// Paths through this peer that reached Established.
    pub path_success: u64,
    /// Paths through this peer that timed out.
    pub path_fail: u64,
}

impl RouterProfile {
    /// Whether the peer should be avoided.
    pub fn is_bad(&self) -> bool {
        if self.connect_timeout >= MAX_CONNECT_TIMEOUTS && self.connect_success == 0 {
            return true;
        }
        self.path_fail > self.path_success + MAX_PATH_FAIL_MARGIN
    }
}

/// Profile table shared across the router.
#[derive(Clone, Default)]
pub struct Profiles {
    entries: Arc<Mutex<HashMap<RouterId, RouterProfile>>>,
}

impl Profiles {
    /// Empty table.
    pub fn new() -> Profiles {
        Profiles::default()
    }

    fn update<F: FnOnce(&mut RouterProfile)>(&self, id: &RouterId, f: F) {
        let mut entries = self.entries.lock();
        f(entries.entry(*id).or_default())
    }

    /// Record an established session.
    pub fn mark_connect_success(&self, id: &RouterId) {
        self.update(id, |p| p.connect_success += 1);
    }

    /// Record a connect timeout.
    pub fn mark_connect_timeout(&self, id: &RouterId) {
        self.update(id, |p| p.connect_timeout += 1);
    }

    /// Record a path through `hops` reaching Established.
    pub fn mark_path_success(&self, hops: &[RouterId]) {
        for id in hops {
            self.update(id, |p| p.path_success += 1);
        }
    }

    /// Record a path through `hops` timing out.
    pub fn mark_path_fail(&self, hops: &[RouterId]) {
        for id in hops {
            self.update(id, |p| p.path_fail += 1);
        }
    }

    /// Whether the peer should be avoided.
    pub fn is_bad(&self, id: &RouterId) -> bool {
        self.entries
            .lock()
            .get(id)
            .map(|p| p.is_bad())
            .unwrap_or(false)
    }

    /// Snapshot of one peer's counters.
    pub fn get(&self, id: &RouterId) -> Option<RouterProfile> {
        self.entries.lock().get(id).cloned()
    }

    fn encode(&self) -> Vec<u8> {
        let entries = self.entries.lock();
        let mut keys: Vec<&RouterId> = entries.keys().collect();
        keys.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

        let mut out = Vec::with_capacity(entries.len() * 96 + 2);
        out.push(b'd');
        for key in keys {
            let profile = &entries[key];
            let mut buf = [0; 256];
            let value = gen_bencode_bytes((&mut buf, 0), key.as_bytes())
                .and_then(|buf| gen_put_slice(buf, b"d1:c"))
                .and_then(|buf| gen_bencode_int(buf, profile.connect_success))
                .and_then(|buf| gen_put_slice(buf, b"1:f"))
                .and_then(|buf| gen_bencode_int(buf, profile.path_fail))
                .and_then(|buf| gen_put_slice(buf, b"1:s"))
                .and_then(|buf| gen_bencode_int(buf, profile.path_success))
                .and_then(|buf| gen_put_slice(buf, b"1:t"))
                .and_then(|buf| gen_bencode_int(buf, profile.connect_timeout))
                .and_then(|buf| gen_put_slice(buf, b"e"));
            match value {
                Ok((buf, size)) => out.extend_from_slice(&buf[..size]),
                Err(e) => {
                    error!("failed to encode profile: {:?}", e);
                    return Vec::new();
                }
            }
        }
        out.push(b'e');
        out
    }

    /// Queue an atomic write of the whole table.
    pub fn save(&self, path: &Path, disk: &DiskWorker) {
        let bytes = self.encode();
        if !bytes.is_empty() {
            disk.write_file(path.to_path_buf(), bytes);
        }
    }

    /// Load the table from `path`, replacing the current entries. A
    /// missing file is not an error; entries that fail to parse are
    /// skipped.
    pub fn load(&self, path: &Path) -> std::io::Result<()> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut loaded = HashMap::new();
        let parsed = read_dict(&bytes, |key, value| {
            let id = match key.len() {
                n if n == RouterId::SIZE => {
                    let mut bytes = [0; RouterId::SIZE];
                    bytes.copy_from_slice(key);
                    RouterId::new(bytes)
                }
                _ => return false,
            };
            let mut profile = RouterProfile::default();
            let inner = read_dict(value, |k, v| {
                let value = match bencode_int(v) {
                    Ok((_, value)) => value,
                    Err(_) => return false,
                };
                match k {
                    b"c" => profile.connect_success = value,
                    b"f" => profile.path_fail = value,
                    b"s" => profile.path_success = value,
                    b"t" => profile.connect_timeout = value,
                    _ => {}
                }
                true
            });
            if inner.is_err() {
                return false;
            }
            loaded.insert(id, profile);
            true
        });

        if parsed.is_err() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "malformed profiles file",
            ));
        }
        *self.entries.lock() = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> RouterId {
        RouterId::new([byte; RouterId::SIZE])
    }

    #[test]
    fn connect_timeouts_make_bad() {
        let profiles = Profiles::new();
        for _ in 0..MAX_CONNECT_TIMEOUTS {
            profiles.mark_connect_timeout(&id(1));
        }
        assert!(profiles.is_bad(&id(1)));

        // one success clears the verdict
        profiles.mark_connect_success(&id(1));
        assert!(!profiles.is_bad(&id(1)));
    }

    #[test]
    fn path_failures_make_bad() {
        let profiles = Profiles::new();
        let hops = [id(1), id(2)];
        for _ in 0..=MAX_PATH_FAIL_MARGIN {
            profiles.mark_path_fail(&hops);
        }
        assert!(profiles.is_bad(&id(1)));
        assert!(profiles.is_bad(&id(2)));
        assert!(!profiles.is_bad(&id(3)));
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.dat");
        let (disk, task) = DiskWorker::new();
        let handle = tokio::spawn(task);

        let profiles = Profiles::new();
        profiles.mark_connect_success(&id(1));
        profiles.mark_path_fail(&[id(1), id(2)]);
        profiles.save(&path, &disk);
        drop(disk);
        handle.await.unwrap();

        let reloaded = Profiles::new();
        reloaded.load(&path).unwrap();
        assert_eq!(reloaded.get(&id(1)), profiles.get(&id(1)));
        assert_eq!(reloaded.get(&id(2)), profiles.get(&id(2)));
    }

    #[test]
    fn load_missing_file_is_ok() {
        let profiles = Profiles::new();
        assert!(profiles.load(Path::new("/nonexistent/profiles.dat")).is_ok());
    }
}
