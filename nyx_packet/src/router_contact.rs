/*! RouterContact: the signed descriptor a router gossips about itself.

Serialized form (bencoded dictionary, keys ascending):

Key | Content
--- | -------
`a` | list of `AddressInfo` dictionaries
`i` | NetID tag (up to 8 bytes)
`k` | identity public key (32 bytes)
`n` | optional nickname (up to 32 bytes)
`p` | onion encryption public key (32 bytes)
`t` | last updated, unix milliseconds
`v` | protocol version
`x` | list of `ExitInfo` dictionaries
`z` | Ed25519 signature over the encoding with `z` zeroed
*/

use std::net::IpAddr;
use std::str::{self, FromStr};

use cookie_factory::GenError;
use ed25519_dalek::{Signer, Verifier};
use nom::combinator::verify;
use nom::error::ErrorKind;
use nom::IResult;

use nyx_binary_io::*;
use nyx_crypto::*;

use crate::PROTO_VERSION;

/// RCs older than this are expired and rejected on verify.
pub const RC_LIFETIME: u64 = 24 * 60 * 60 * 1000;

/// Upper bound on a bencoded RC.
pub const MAX_RC_SIZE: usize = 1024;

/// Longest allowed nickname.
pub const MAX_NICK_SIZE: usize = 32;

/// Longest allowed NetID tag.
pub const MAX_NET_ID_SIZE: usize = 8;

/// String tag identifying the overlay network. Routers with mismatched
/// NetIDs cannot interoperate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetId(String);

impl Default for NetId {
    fn default() -> Self {
        NetId("nyx".to_owned())
    }
}

impl NetId {
    /// Create a NetID from a tag of up to 8 bytes.
    pub fn new(tag: &str) -> Option<NetId> {
        if tag.is_empty() || tag.len() > MAX_NET_ID_SIZE {
            None
        } else {
            Some(NetId(tag.to_owned()))
        }
    }

    /// The raw tag bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/** One dialable link-layer endpoint of a router.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`d` | transport dialect name
`i` | IP address in text form
`p` | port
`r` | rank (lower is preferred)
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressInfo {
    /// Transport dialect, e.g. `"udp"`.
    pub dialect: String,
    /// Address the router listens on.
    pub ip: IpAddr,
    /// Port the router listens on.
    pub port: u16,
    /// Preference rank.
    pub rank: u64,
}

impl FromBytes for AddressInfo {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("d")(input)?;
        let (input, dialect) = bencode_bytes(input)?;
        let (input, _) = bencode_key("i")(input)?;
        let (input, ip) = bencode_bytes(input)?;
        let (input, _) = bencode_key("p")(input)?;
        let (input, port) = verify(bencode_int, |p| *p <= u64::from(u16::max_value()))(input)?;
        let (input, _) = bencode_key("r")(input)?;
        let (input, rank) = bencode_int(input)?;
        let (input, _) = bencode_end(input)?;

        let dialect = str::from_utf8(dialect)
            .map_err(|_| nom::Err::Error((input, ErrorKind::Verify)))?
            .to_owned();
        let ip = str::from_utf8(ip)
            .ok()
            .and_then(|s| IpAddr::from_str(s).ok())
            .ok_or(nom::Err::Error((input, ErrorKind::Verify)))?;

        Ok((input, AddressInfo { dialect, ip, port: port as u16, rank }))
    }
}

impl ToBytes for AddressInfo {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        let ip = self.ip.to_string();
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "d") >>
            gen_call!(gen_bencode_bytes, self.dialect.as_bytes()) >>
            gen_call!(gen_bencode_key, "i") >>
            gen_call!(gen_bencode_bytes, ip.as_bytes()) >>
            gen_call!(gen_bencode_key, "p") >>
            gen_call!(gen_bencode_int, u64::from(self.port)) >>
            gen_call!(gen_bencode_key, "r") >>
            gen_call!(gen_bencode_int, self.rank) >>
            gen_slice!(b"e")
        )
    }
}

/** An exit range a router advertises.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`a` | network address in text form
`m` | netmask bits
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExitInfo {
    /// Network address of the advertised range.
    pub address: IpAddr,
    /// Netmask bits of the advertised range.
    pub netmask: u8,
}

impl FromBytes for ExitInfo {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("a")(input)?;
        let (input, address) = bencode_bytes(input)?;
        let (input, _) = bencode_key("m")(input)?;
        let (input, netmask) = verify(bencode_int, |m| *m <= 128)(input)?;
        let (input, _) = bencode_end(input)?;

        let address = str::from_utf8(address)
            .ok()
            .and_then(|s| IpAddr::from_str(s).ok())
            .ok_or(nom::Err::Error((input, ErrorKind::Verify)))?;

        Ok((input, ExitInfo { address, netmask: netmask as u8 }))
    }
}

impl ToBytes for ExitInfo {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        let address = self.address.to_string();
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "a") >>
            gen_call!(gen_bencode_bytes, address.as_bytes()) >>
            gen_call!(gen_bencode_key, "m") >>
            gen_call!(gen_bencode_int, u64::from(self.netmask)) >>
            gen_slice!(b"e")
        )
    }
}

fn gen_address_list<'a>(
    buf: (&'a mut [u8], usize),
    addrs: &[AddressInfo],
) -> Result<(&'a mut [u8], usize), GenError> {
    let mut buf = gen_put_slice(buf, b"l")?;
    for addr in addrs {
        buf = addr.to_bytes(buf)?;
    }
    gen_put_slice(buf, b"e")
}

fn gen_exit_list<'a>(
    buf: (&'a mut [u8], usize),
    exits: &[ExitInfo],
) -> Result<(&'a mut [u8], usize), GenError> {
    let mut buf = gen_put_slice(buf, b"l")?;
    for exit in exits {
        buf = exit.to_bytes(buf)?;
    }
    gen_put_slice(buf, b"e")
}

fn gen_nickname<'a>(
    buf: (&'a mut [u8], usize),
    nickname: &Option<String>,
) -> Result<(&'a mut [u8], usize), GenError> {
    match nickname {
        Some(nick) => {
            let buf = gen_bencode_key(buf, "n")?;
            gen_bencode_bytes(buf, nick.as_bytes())
        }
        None => Ok(buf),
    }
}

fn zero_signature() -> Signature {
    Signature::from_bytes(&[0; SIGNATURE_SIZE])
}

/** Signed descriptor advertising a router's keys and addresses.

A descriptor is valid when its signature verifies under `pubkey`, its NetID
matches the local network and `last_updated` is no older than
[`RC_LIFETIME`](./constant.RC_LIFETIME.html).
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouterContact {
    /// Dialable endpoints; empty for pure clients.
    pub addrs: Vec<AddressInfo>,
    /// Network tag.
    pub net_id: NetId,
    /// Identity public key.
    pub pubkey: RouterId,
    /// Optional human-readable nickname.
    pub nickname: Option<String>,
    /// Onion encryption public key.
    pub enckey: PublicKey,
    /// Unix milliseconds of the last (re)signing.
    pub last_updated: u64,
    /// Advertised exit ranges.
    pub exits: Vec<ExitInfo>,
    /// Signature over the encoding with this field zeroed.
    pub signature: Signature,
}

impl RouterContact {
    /// Fresh unsigned descriptor for the holder of `identity`.
    pub fn new(identity: &SigningKey, enckey: PublicKey, net_id: NetId) -> RouterContact {
        RouterContact {
            addrs: Vec::new(),
            net_id,
            pubkey: RouterId::from_signing_key(identity),
            nickname: None,
            enckey,
            last_updated: 0,
            exits: Vec::new(),
            signature: zero_signature(),
        }
    }

    /// Whether this router accepts inbound links.
    pub fn is_public_router(&self) -> bool {
        !self.addrs.is_empty()
    }

    /// Whether this router advertises exit ranges.
    pub fn is_exit(&self) -> bool {
        !self.exits.is_empty()
    }

    /// Whether the descriptor is past its lifetime.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.last_updated + RC_LIFETIME
    }

    /// Whether the descriptor expires within `dlt` milliseconds.
    pub fn expires_soon(&self, now: u64, dlt: u64) -> bool {
        if self.is_expired(now) {
            return true;
        }
        self.last_updated + RC_LIFETIME - now <= dlt
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, GenError> {
        let mut copy = self.clone();
        copy.signature = zero_signature();
        let mut buf = [0; MAX_RC_SIZE];
        let (_, size) = copy.to_bytes((&mut buf, 0))?;
        Ok(buf[..size].to_vec())
    }

    /// Stamp `last_updated`, fill in the identity and sign.
    pub fn sign(&mut self, identity: &SigningKey, now: u64) -> Result<(), GenError> {
        self.pubkey = RouterId::from_signing_key(identity);
        self.last_updated = now;
        let bytes = self.signing_bytes()?;
        self.signature = identity.sign(&bytes);
        Ok(())
    }

    /// Check the signature alone, ignoring NetID and lifetime.
    pub fn verify_signature(&self) -> bool {
        let vk = match self.pubkey.verifying_key() {
            Some(vk) => vk,
            None => return false,
        };
        let bytes = match self.signing_bytes() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        vk.verify(&bytes, &self.signature).is_ok()
    }

    /// Full descriptor validity check against the local network tag.
    pub fn verify(&self, local: &NetId, now: u64) -> bool {
        if self.net_id != *local {
            return false;
        }
        if self.is_expired(now) {
            return false;
        }
        if self.is_public_router() && self.addrs.iter().any(|a| a.port == 0) {
            return false;
        }
        self.verify_signature()
    }
}

impl FromBytes for RouterContact {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let mut addrs = None;
        let mut net_id = None;
        let mut pubkey = None;
        let mut nickname = None;
        let mut enckey = None;
        let mut last_updated = None;
        let mut version = None;
        let mut exits = None;
        let mut signature = None;
        let mut bad = false;

        let (rest, _) = read_dict(input, |key, value| {
            let ok = match key {
                b"a" => bencode_list(AddressInfo::from_bytes)(value)
                    .map(|(_, v)| addrs = Some(v))
                    .is_ok(),
                b"i" => bencode_bytes(value)
                    .ok()
                    .and_then(|(_, v)| str::from_utf8(v).ok())
                    .and_then(NetId::new)
                    .map(|v| net_id = Some(v))
                    .is_some(),
                b"k" => bencode_bytes(value)
                    .ok()
                    .filter(|(_, v)| v.len() == RouterId::SIZE)
                    .and_then(|(_, v)| RouterId::from_bytes(v).ok())
                    .map(|(_, v)| pubkey = Some(v))
                    .is_some(),
                b"n" => bencode_bytes(value)
                    .ok()
                    .filter(|(_, v)| v.len() <= MAX_NICK_SIZE)
                    .and_then(|(_, v)| str::from_utf8(v).ok())
                    .map(|v| nickname = Some(v.to_owned()))
                    .is_some(),
                b"p" => bencode_bytes(value)
                    .ok()
                    .and_then(|(_, v)| public_key_from_slice(v))
                    .map(|v| enckey = Some(v))
                    .is_some(),
                b"t" => bencode_int(value).map(|(_, v)| last_updated = Some(v)).is_ok(),
                b"v" => bencode_int(value).map(|(_, v)| version = Some(v)).is_ok(),
                b"x" => bencode_list(ExitInfo::from_bytes)(value)
                    .map(|(_, v)| exits = Some(v))
                    .is_ok(),
                b"z" => bencode_bytes(value)
                    .ok()
                    .filter(|(_, v)| v.len() == SIGNATURE_SIZE)
                    .map(|(_, v)| {
                        let mut bytes = [0; SIGNATURE_SIZE];
                        bytes.copy_from_slice(v);
                        signature = Some(Signature::from_bytes(&bytes));
                    })
                    .is_some(),
                // unknown keys are skipped for forward compatibility
                _ => true,
            };
            if !ok {
                bad = true;
            }
            !bad
        })?;

        if bad || version != Some(PROTO_VERSION) {
            return Err(nom::Err::Error((input, ErrorKind::Verify)));
        }
        match (addrs, net_id, pubkey, enckey, last_updated, exits, signature) {
            (
                Some(addrs),
                Some(net_id),
                Some(pubkey),
                Some(enckey),
                Some(last_updated),
                Some(exits),
                Some(signature),
            ) => Ok((
                rest,
                RouterContact {
                    addrs,
                    net_id,
                    pubkey,
                    nickname,
                    enckey,
                    last_updated,
                    exits,
                    signature,
                },
            )),
            _ => Err(nom::Err::Error((input, ErrorKind::Verify))),
        }
    }
}

impl ToBytes for RouterContact {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "a") >>
            gen_call!(gen_address_list, &self.addrs) >>
            gen_call!(gen_bencode_key, "i") >>
            gen_call!(gen_bencode_bytes, self.net_id.as_bytes()) >>
            gen_call!(gen_bencode_key, "k") >>
            gen_call!(gen_bencode_bytes, self.pubkey.as_ref()) >>
            gen_call!(gen_nickname, &self.nickname) >>
            gen_call!(gen_bencode_key, "p") >>
            gen_call!(gen_bencode_bytes, self.enckey.as_bytes()) >>
            gen_call!(gen_bencode_key, "t") >>
            gen_call!(gen_bencode_int, self.last_updated) >>
            gen_call!(gen_bencode_key, "v") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_call!(gen_bencode_key, "x") >>
            gen_call!(gen_exit_list, &self.exits) >>
            gen_call!(gen_bencode_key, "z") >>
            gen_call!(gen_bencode_bytes, &self.signature.to_bytes()) >>
            gen_slice!(b"e") >>
            gen_call!(gen_len_limit, MAX_RC_SIZE)
        )
    }
}

#[cfg(test)]
pub mod tests {
    use rand::thread_rng;

    use super::*;

    pub fn test_rc(now: u64) -> (RouterContact, SigningKey) {
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
        (rc, identity)
    }

    encode_decode_test!(
        address_info_encode_decode,
        AddressInfo {
            dialect: "udp".to_owned(),
            ip: "203.0.113.7".parse().unwrap(),
            port: 1090,
            rank: 1,
        }
    );

    encode_decode_test!(
        exit_info_encode_decode,
        ExitInfo {
            address: "10.0.0.0".parse().unwrap(),
            netmask: 8,
        }
    );

    encode_decode_test!(router_contact_encode_decode, test_rc(1_000_000).0);

    encode_decode_test!(
        router_contact_with_nickname_encode_decode,
        {
            let (mut rc, identity) = test_rc(1_000_000);
            rc.nickname = Some("edge-router".to_owned());
            rc.sign(&identity, 1_000_000).unwrap();
            rc
        }
    );

    #[test]
    fn sign_verify() {
        let (rc, _) = test_rc(1_000_000);
        assert!(rc.verify(&NetId::default(), 1_000_000));
    }

    #[test]
    fn verify_rejects_tampering() {
        let (rc, _) = test_rc(1_000_000);
        let mut buf = [0; MAX_RC_SIZE];
        let (_, size) = rc.to_bytes((&mut buf, 0)).unwrap();

        for i in 0..size {
            let mut mangled = buf[..size].to_vec();
            mangled[i] ^= 0x20;
            if let Ok((_, parsed)) = RouterContact::from_bytes(&mangled) {
                assert!(!parsed.verify(&NetId::default(), 1_000_000), "byte {} accepted", i);
            }
        }
    }

    #[test]
    fn verify_rejects_wrong_net_id() {
        let (rc, _) = test_rc(1_000_000);
        assert!(!rc.verify(&NetId::new("testnet").unwrap(), 1_000_000));
    }

    #[test]
    fn verify_rejects_expired() {
        let (rc, _) = test_rc(1_000_000);
        assert!(!rc.verify(&NetId::default(), 1_000_000 + RC_LIFETIME));
    }

    #[test]
    fn expires_soon_boundary() {
        let (rc, _) = test_rc(1_000_000);
        let expiry = rc.last_updated + RC_LIFETIME;
        assert!(rc.expires_soon(expiry - 1000, 1000));
        assert!(!rc.expires_soon(expiry - 1001, 1000));
    }

    #[test]
    fn accepts_any_key_order() {
        // same entries as the canonical encoding, scrambled by hand
        let (rc, _) = test_rc(1_000_000);
        let mut buf = [0; MAX_RC_SIZE];
        let (_, size) = rc.to_bytes((&mut buf, 0)).unwrap();
        let canonical = &buf[..size];

        // split out the `t` entry and move it to the front
        let t_pos = {
            let needle = b"1:ti";
            canonical
                .windows(needle.len())
                .position(|w| w == needle)
                .unwrap()
        };
        let t_end = t_pos + canonical[t_pos..].iter().position(|b| *b == b'e').unwrap() + 1;
        let mut scrambled = Vec::new();
        scrambled.push(b'd');
        scrambled.extend_from_slice(&canonical[t_pos..t_end]);
        scrambled.extend_from_slice(&canonical[1..t_pos]);
        scrambled.extend_from_slice(&canonical[t_end..]);

        let (_, parsed) = RouterContact::from_bytes(&scrambled).unwrap();
        assert_eq!(parsed, rc);
    }
}
