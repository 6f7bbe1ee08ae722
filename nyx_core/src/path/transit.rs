/*!
Transit hop: the half-state an intermediate router keeps for one segment
of somebody else's path.

Both directions apply the same stream cipher with the arriving nonce and
forward the nonce XOR-mutated, which is exactly what the path owner's
layered transform expects.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use nyx_binary_io::ToBytes;
use nyx_crypto::*;
use nyx_packet::lr_commit::LrCommitRecord;
use nyx_packet::relay::RelayDownstream;
use nyx_packet::routing::RoutingMessage;
use nyx_packet::{MAX_LINK_MSG_SIZE, MESSAGE_PAD_SIZE};

use super::{PathError, DEFAULT_PATH_LIFETIME};
use crate::time::clock_now;

/// Identifying tuple of a transit hop.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TransitHopInfo {
    /// Path id on the upstream-facing side.
    pub tx_id: PathId,
    /// Path id on the downstream-facing side.
    pub rx_id: PathId,
    /// Neighbor toward the endpoint; ourselves when we terminate the path.
    pub upstream: RouterId,
    /// Neighbor toward the path owner.
    pub downstream: RouterId,
}

impl std::fmt::Display for TransitHopInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "<tx={} rx={} upstream={} downstream={}>",
            self.tx_id, self.rx_id, self.upstream, self.downstream
        )
    }
}

/// One segment of a foreign path passing through this router.
pub struct TransitHop {
    /// Identifying tuple.
    pub info: TransitHopInfo,
    /// Symmetric key shared with the path owner.
    pub shared: SharedSecret,
    /// Nonce mutation mask.
    pub nonce_xor: ShortHash,
    /// When the hop was installed.
    pub started: Instant,
    /// How long the hop lives.
    pub lifetime: Duration,
    last_activity: Mutex<Option<Instant>>,
    seqno: AtomicU64,
}

impl TransitHop {
    /// Install a hop from an accepted commit record. `downstream` is the
    /// router the commit arrived from, `enc_sk` our encryption key.
    pub fn from_record(record: &LrCommitRecord, downstream: RouterId, enc_sk: &SecretKey) -> TransitHop {
        let shared = path_dh_server(&record.commkey, enc_sk, &record.tunnel_nonce);
        let lifetime = Duration::from_millis(record.lifetime)
            .min(DEFAULT_PATH_LIFETIME);
        TransitHop {
            info: TransitHopInfo {
                tx_id: record.tx_id,
                rx_id: record.rx_id,
                upstream: record.next_hop,
                downstream,
            },
            nonce_xor: nonce_xor(&shared),
            shared,
            started: clock_now(),
            lifetime,
            last_activity: Mutex::new(None),
            seqno: AtomicU64::new(0),
        }
    }

    /// Whether this router is the endpoint of the path.
    pub fn is_endpoint(&self, us: &RouterId) -> bool {
        self.info.upstream == *us
    }

    /// When the hop dies.
    pub fn expire_time(&self) -> Instant {
        self.started + self.lifetime
    }

    /// Whether the hop is past its lifetime.
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.expire_time()
    }

    /// Whether the hop expires within `dlt`.
    pub fn expires_soon(&self, now: Instant, dlt: Duration) -> bool {
        now + dlt >= self.expire_time()
    }

    /// Note traffic on the hop.
    pub fn mark_active(&self, now: Instant) {
        let mut last = self.last_activity.lock();
        *last = Some(last.map_or(now, |prev| prev.max(now)));
    }

    /// Timestamp of the last remote activity.
    pub fn last_activity(&self) -> Option<Instant> {
        *self.last_activity.lock()
    }

    /// Next sequence number for endpoint-side sends.
    pub fn next_seq(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::Relaxed)
    }

    /// Apply our single layer in place; the stream cipher is its own
    /// inverse so this serves both directions.
    pub fn cipher(&self, buf: &mut [u8], y: &TunnelNonce) {
        xchacha20_xor(buf, &self.shared, y);
    }

    /// Nonce to forward alongside the transformed payload.
    pub fn next_nonce(&self, y: &TunnelNonce) -> TunnelNonce {
        y.xor(&self.nonce_xor)
    }

    /** Wrap a routing message to send from the endpoint side toward the
    path owner: pad, cipher under a fresh nonce and address it with our
    rx path id. The caller sends the result to `info.downstream`.
    */
    pub fn prepare_downstream<R: Rng>(
        &self,
        mut msg: RoutingMessage,
        rng: &mut R,
    ) -> Result<RelayDownstream, PathError> {
        super::set_seq(&mut msg, self.next_seq());
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
        self.cipher(&mut buf[..size], &y);
        Ok(RelayDownstream {
            path_id: self.info.rx_id,
            x: buf[..size].to_vec(),
            y: self.next_nonce(&y),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        tx_id: PathId,
        rx_id: PathId,
        shared: SharedSecret,
        nonce_xor: ShortHash,
    ) -> TransitHop {
        TransitHop {
            info: TransitHopInfo {
                tx_id,
                rx_id,
                upstream: RouterId::default(),
                downstream: RouterId::default(),
            },
            shared,
            nonce_xor,
            started: clock_now(),
            lifetime: DEFAULT_PATH_LIFETIME,
            last_activity: Mutex::new(None),
            seqno: AtomicU64::new(0),
        }
    }
}
