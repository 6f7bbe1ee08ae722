/*!
Core crypto for the nyx overlay.

Identity keys are Ed25519, onion encryption keys are X25519 (`crypto_box`
keys), per-hop layer crypto is the XChaCha20 stream cipher and key
derivation runs through blake2b-256.
*/

#![forbid(unsafe_code)]

use std::fmt;

use blake2::{Blake2b, Blake2bMac};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use digest::consts::U32;
use digest::{Digest, Mac};
use nom::bytes::complete::take;
use nom::combinator::map;
use nom::IResult;
use rand::RngCore;

pub use crypto_box::{PublicKey, SecretKey, KEY_SIZE};
pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

use nyx_binary_io::FromBytes;

/// Size of a router identity key in bytes.
pub const ROUTER_ID_SIZE: usize = 32;
/// Size of a path identifier in bytes.
pub const PATH_ID_SIZE: usize = 16;
/// Size of a tunnel nonce in bytes.
pub const TUNNEL_NONCE_SIZE: usize = 24;
/// Size of a derived shared secret in bytes.
pub const SHARED_SECRET_SIZE: usize = 32;
/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;
/// Size of a `crypto_box` nonce in bytes.
pub const BOX_NONCE_SIZE: usize = 24;

/// Nonce used by `SalsaBox` sealed payloads.
pub type BoxNonce = [u8; BOX_NONCE_SIZE];

type Blake2b256 = Blake2b<U32>;
type Blake2bMac256 = Blake2bMac<U32>;

macro_rules! fixed_bytes (
    ($(#[$attr:meta])* $name:ident, $size:expr) => (
        $(#[$attr])*
        #[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
        pub struct $name([u8; $size]);

        impl $name {
            /// Size of this value in bytes.
            pub const SIZE: usize = $size;

            /// Wrap raw bytes.
            pub fn new(bytes: [u8; $size]) -> Self {
                $name(bytes)
            }

            /// Uniform random value.
            pub fn random<R: RngCore>(rng: &mut R) -> Self {
                let mut bytes = [0; $size];
                rng.fill_bytes(&mut bytes);
                $name(bytes)
            }

            /// Borrow the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.0
            }

            /// Whether every byte is zero.
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl From<[u8; $size]> for $name {
            fn from(bytes: [u8; $size]) -> Self {
                $name(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(self.0))
            }
        }

        impl FromBytes for $name {
            fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
                map(take($size as usize), |bytes: &[u8]| {
                    let mut inner = [0; $size];
                    inner.copy_from_slice(bytes);
                    $name(inner)
                })(input)
            }
        }
    )
);

fixed_bytes!(
    /// Identity of a router: the raw bytes of its Ed25519 public key.
    RouterId, ROUTER_ID_SIZE
);
fixed_bytes!(
    /// 128-bit circuit segment identifier, per-direction per-hop.
    PathId, PATH_ID_SIZE
);
fixed_bytes!(
    /// Nonce carried alongside onion-wrapped payloads.
    TunnelNonce, TUNNEL_NONCE_SIZE
);
fixed_bytes!(
    /// Symmetric key shared between a path owner and one of its hops.
    SharedSecret, SHARED_SECRET_SIZE
);
fixed_bytes!(
    /// blake2b-256 digest, used for the per-hop nonce mutation mask.
    ShortHash, SHARED_SECRET_SIZE
);

impl RouterId {
    /// Identity of the holder of a signing key.
    pub fn from_signing_key(sk: &SigningKey) -> Self {
        RouterId(sk.verifying_key().to_bytes())
    }

    /// Interpret the identity as an Ed25519 verifying key. Fails for byte
    /// strings that are not valid curve points.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).ok()
    }
}

impl From<VerifyingKey> for RouterId {
    fn from(vk: VerifyingKey) -> Self {
        RouterId(vk.to_bytes())
    }
}

impl TunnelNonce {
    /// Mutate the nonce with the leading bytes of a hop's XOR mask.
    pub fn xor(&self, mask: &ShortHash) -> TunnelNonce {
        let mut out = self.0;
        for (o, m) in out.iter_mut().zip(mask.as_bytes().iter()) {
            *o ^= m;
        }
        TunnelNonce(out)
    }
}

/// Read an encryption public key out of a wire field. `None` unless the
/// slice is exactly [`KEY_SIZE`](./constant.KEY_SIZE.html) bytes.
pub fn public_key_from_slice(bytes: &[u8]) -> Option<PublicKey> {
    if bytes.len() != KEY_SIZE {
        return None;
    }
    let mut key = [0; KEY_SIZE];
    key.copy_from_slice(bytes);
    Some(key.into())
}

/// blake2b-256 digest of a buffer.
pub fn shorthash(data: &[u8]) -> ShortHash {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    ShortHash(hasher.finalize().into())
}

fn keyed_hash(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    let mut mac = Blake2bMac256::new_from_slice(key).unwrap();
    mac.update(message);
    mac.finalize().into_bytes().into()
}

fn dh(client_pk: &PublicKey, server_pk: &PublicKey, them: &PublicKey, us: &SecretKey) -> [u8; 32] {
    let sk = x25519_dalek::StaticSecret::from(us.to_bytes());
    let pk = x25519_dalek::PublicKey::from(*them.as_bytes());
    let point = sk.diffie_hellman(&pk);
    let mut hasher = Blake2b256::new();
    hasher.update(client_pk.as_bytes());
    hasher.update(server_pk.as_bytes());
    hasher.update(point.as_bytes());
    hasher.finalize().into()
}

/// Derive the per-hop shared key on the path-owner side: `us` is the
/// ephemeral commit key, `them` the hop's advertised encryption key.
pub fn path_dh_client(them: &PublicKey, us: &SecretKey, nonce: &TunnelNonce) -> SharedSecret {
    let result = dh(&us.public_key(), them, them, us);
    SharedSecret(keyed_hash(&result, nonce.as_bytes()))
}

/// Derive the per-hop shared key on the hop side: `us` is the hop's
/// encryption key, `them` the ephemeral commit key from the commit record.
pub fn path_dh_server(them: &PublicKey, us: &SecretKey, nonce: &TunnelNonce) -> SharedSecret {
    let result = dh(them, &us.public_key(), them, us);
    SharedSecret(keyed_hash(&result, nonce.as_bytes()))
}

/// XOR mask applied to the tunnel nonce after each layer.
pub fn nonce_xor(shared: &SharedSecret) -> ShortHash {
    shorthash(shared.as_bytes())
}

/// Apply one XChaCha20 layer in place. The stream cipher is its own
/// inverse, so the same call encrypts and decrypts.
pub fn xchacha20_xor(data: &mut [u8], key: &SharedSecret, nonce: &TunnelNonce) {
    let mut cipher = XChaCha20::new(key.as_bytes().into(), nonce.as_bytes().into());
    cipher.apply_keystream(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    #[test]
    fn tunnel_nonce_xor_is_involutive() {
        let mut rng = thread_rng();
        let nonce = TunnelNonce::random(&mut rng);
        let mask = shorthash(b"mask input");
        assert_ne!(nonce.xor(&mask), nonce);
        assert_eq!(nonce.xor(&mask).xor(&mask), nonce);
    }

    #[test]
    fn path_dh_sides_agree() {
        let mut rng = thread_rng();
        let hop_sk = SecretKey::generate(&mut rng);
        let hop_pk = hop_sk.public_key();
        let ephemeral = SecretKey::generate(&mut rng);
        let nonce = TunnelNonce::random(&mut rng);

        let client = path_dh_client(&hop_pk, &ephemeral, &nonce);
        let server = path_dh_server(&ephemeral.public_key(), &hop_sk, &nonce);
        assert_eq!(client, server);
    }

    #[test]
    fn path_dh_is_nonce_bound() {
        let mut rng = thread_rng();
        let hop_sk = SecretKey::generate(&mut rng);
        let ephemeral = SecretKey::generate(&mut rng);
        let first = path_dh_client(&hop_sk.public_key(), &ephemeral, &TunnelNonce::random(&mut rng));
        let second = path_dh_client(&hop_sk.public_key(), &ephemeral, &TunnelNonce::random(&mut rng));
        assert_ne!(first, second);
    }

    #[test]
    fn xchacha20_round_trip() {
        let mut rng = thread_rng();
        let key = SharedSecret::random(&mut rng);
        let nonce = TunnelNonce::random(&mut rng);
        let plaintext = b"onion layer payload".to_vec();

        let mut data = plaintext.clone();
        xchacha20_xor(&mut data, &key, &nonce);
        assert_ne!(data, plaintext);
        xchacha20_xor(&mut data, &key, &nonce);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn router_id_round_trips_verifying_key() {
        let sk = SigningKey::generate(&mut thread_rng());
        let id = RouterId::from_signing_key(&sk);
        assert_eq!(id.verifying_key().unwrap(), sk.verifying_key());
    }

    #[test]
    fn fixed_bytes_parse() {
        let bytes = [7; PATH_ID_SIZE];
        let (rest, id) = PathId::from_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(id.as_bytes(), &bytes);
    }

    #[test]
    fn public_key_from_slice_checks_length() {
        let bytes = [42; KEY_SIZE];
        let pk = public_key_from_slice(&bytes).unwrap();
        assert_eq!(pk.as_bytes(), &bytes);

        assert!(public_key_from_slice(&bytes[1..]).is_none());
        assert!(public_key_from_slice(&[42; KEY_SIZE + 1]).is_none());
    }
}
