/*!
Path key generation: turn a list of selected descriptors into a keyed
[`Path`](../struct.Path.html) and the LR Commit message that installs it.

This is pure CPU work (one key exchange and one sealing per hop); the
router runs it on the blocking worker pool so the logic tasks never stall
on crypto.
*/

use rand::{CryptoRng, Rng};

use nyx_crypto::*;
use nyx_packet::lr_commit::{EncryptedFrame, LrCommitMessage, LrCommitRecord};
use nyx_packet::router_contact::RouterContact;
use nyx_packet::MAX_HOPS;

use super::{Path, PathHop, DEFAULT_PATH_LIFETIME};

/** Generate per-hop keys and commit frames for a path through `rcs`.

For every hop an ephemeral commit key is generated; the shared key is the
nonce-bound X25519 agreement with the hop's advertised encryption key and
the XOR mask is its short hash. Records chain each hop to the next; the
terminal record names the terminal router itself so the endpoint can tell
it terminates the path.
*/
pub fn generate_path<R: Rng + CryptoRng>(
    rcs: Vec<RouterContact>,
    starting_role: u8,
    rng: &mut R,
) -> (Path, LrCommitMessage) {
    debug_assert!(!rcs.is_empty() && rcs.len() <= MAX_HOPS);

    let mut hops: Vec<PathHop> = rcs
        .into_iter()
        .map(|rc| PathHop {
            rc,
            tx_id: PathId::random(rng),
            rx_id: PathId::random(rng),
            shared: SharedSecret::default(),
            nonce_xor: ShortHash::default(),
            lifetime: DEFAULT_PATH_LIFETIME,
        })
        .collect();
    for i in 0..hops.len() - 1 {
        hops[i].tx_id = hops[i + 1].rx_id;
    }

    let mut frames = Vec::with_capacity(hops.len());
    for idx in 0..hops.len() {
        let commkey = SecretKey::generate(rng);
        let tunnel_nonce = TunnelNonce::random(rng);
        let shared = path_dh_client(&hops[idx].rc.enckey, &commkey, &tunnel_nonce);
        let next_hop = if idx + 1 < hops.len() {
            hops[idx + 1].rc.pubkey
        } else {
            hops[idx].rc.pubkey
        };

        let record = LrCommitRecord {
            commkey: commkey.public_key(),
            next_hop,
            tunnel_nonce,
            rx_id: hops[idx].rx_id,
            tx_id: hops[idx].tx_id,
            lifetime: hops[idx].lifetime.as_millis() as u64,
        };
        frames.push(EncryptedFrame::seal(&record, &hops[idx].rc.enckey, rng));

        hops[idx].nonce_xor = nonce_xor(&shared);
        hops[idx].shared = shared;
    }

    (Path::new(hops, starting_role), LrCommitMessage::new(frames, rng))
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use super::super::tests::test_rc_with_keys;
    use super::*;
    use crate::path::transit::TransitHop;

    #[test]
    fn generated_path_chains_ids() {
        let mut rng = thread_rng();
        let rcs: Vec<_> = (0..3).map(|_| test_rc_with_keys().0).collect();
        let (path, lrcm) = generate_path(rcs, 0, &mut rng);

        assert_eq!(path.hops.len(), 3);
        assert_eq!(lrcm.frames.len(), MAX_HOPS);
        for i in 0..path.hops.len() - 1 {
            assert_eq!(path.hops[i].tx_id, path.hops[i + 1].rx_id);
        }
    }

    #[test]
    fn frames_open_in_hop_order_and_agree_on_keys() {
        let mut rng = thread_rng();
        let keyed: Vec<_> = (0..3).map(|_| test_rc_with_keys()).collect();
        let rcs: Vec<_> = keyed.iter().map(|(rc, _, _)| rc.clone()).collect();
        let ids: Vec<_> = rcs.iter().map(|rc| rc.pubkey).collect();
        let (path, mut lrcm) = generate_path(rcs, 0, &mut rng);

        for (idx, (_, _, enc_sk)) in keyed.iter().enumerate() {
            let (frame, rest) = lrcm.pop_frame(&mut rng);
            lrcm = rest;

            let record = frame.open(enc_sk).unwrap();
            assert_eq!(record.tx_id, path.hops[idx].tx_id);
            assert_eq!(record.rx_id, path.hops[idx].rx_id);
            let expected_next = if idx + 1 < keyed.len() { ids[idx + 1] } else { ids[idx] };
            assert_eq!(record.next_hop, expected_next);

            let hop = TransitHop::from_record(&record, RouterId::random(&mut rng), enc_sk);
            assert_eq!(hop.shared, path.hops[idx].shared);
            assert_eq!(hop.nonce_xor, path.hops[idx].nonce_xor);
        }
    }

    #[test]
    fn unused_frames_do_not_open() {
        let mut rng = thread_rng();
        let keyed: Vec<_> = (0..2).map(|_| test_rc_with_keys()).collect();
        let rcs: Vec<_> = keyed.iter().map(|(rc, _, _)| rc.clone()).collect();
        let (_, lrcm) = generate_path(rcs, 0, &mut rng);

        // slots past the real hops are random filler
        for frame in &lrcm.frames[2..] {
            assert!(frame.open(&keyed[0].2).is_err());
        }
    }
}
