/*! Exit negotiation messages.

A client asks the endpoint of a path to become its exit with
`ObtainExitMessage`; the endpoint answers with a signed grant or reject.
Grants and rejects MUST verify under the endpoint's identity key before the
client acts on them.
*/

use cookie_factory::GenError;
use ed25519_dalek::{Signer, Verifier};
use nom::combinator::verify;
use nom::IResult;

use nyx_binary_io::*;
use nyx_crypto::*;

use crate::{MAX_LINK_MSG_SIZE, PROTO_VERSION};

fn zero_signature() -> Signature {
    Signature::from_bytes(&[0; SIGNATURE_SIZE])
}

fn parse_signature(input: &[u8]) -> IResult<&[u8], Signature> {
    let (input, bytes) = verify(bencode_bytes, |b: &[u8]| b.len() == SIGNATURE_SIZE)(input)?;
    let mut sig = [0; SIGNATURE_SIZE];
    sig.copy_from_slice(bytes);
    Ok((input, Signature::from_bytes(&sig)))
}

/** One traffic policy entry.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`a` | IP protocol number
`b` | port, 0 for any
`d` | drop flag (0/1)
`v` | protocol version
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExitPolicy {
    /// IP protocol number the policy applies to.
    pub proto: u64,
    /// Port the policy applies to, 0 for any.
    pub port: u64,
    /// Whether matching traffic is dropped.
    pub drop: u64,
}

impl FromBytes for ExitPolicy {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("a")(input)?;
        let (input, proto) = bencode_int(input)?;
        let (input, _) = bencode_key("b")(input)?;
        let (input, port) = bencode_int(input)?;
        let (input, _) = bencode_key("d")(input)?;
        let (input, drop) = bencode_int(input)?;
        let (input, _) = bencode_key("v")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, ExitPolicy { proto, port, drop }))
    }
}

impl ToBytes for ExitPolicy {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "a") >>
            gen_call!(gen_bencode_int, self.proto) >>
            gen_call!(gen_bencode_key, "b") >>
            gen_call!(gen_bencode_int, self.port) >>
            gen_call!(gen_bencode_key, "d") >>
            gen_call!(gen_bencode_int, self.drop) >>
            gen_call!(gen_bencode_key, "v") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

fn gen_policy_list<'a>(
    buf: (&'a mut [u8], usize),
    policies: &[ExitPolicy],
) -> Result<(&'a mut [u8], usize), GenError> {
    let mut buf = gen_put_slice(buf, b"l")?;
    for policy in policies {
        buf = policy.to_bytes(buf)?;
    }
    gen_put_slice(buf, b"e")
}

/** Request to use the path endpoint as an exit.

Signed by the client identity carried in `I`.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"O"`
`B` | blacklisted traffic policies
`E` | wants-exit flag (0/1)
`I` | client identity key (32 bytes)
`S` | sequence number
`T` | transaction id
`V` | protocol version
`W` | whitelisted traffic policies
`X` | requested expiry, milliseconds since epoch
`Z` | signature over the encoding with `Z` zeroed
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObtainExitMessage {
    /// Blacklisted traffic policies.
    pub b: Vec<ExitPolicy>,
    /// Whether the client wants full exit traffic.
    pub e: u64,
    /// Client identity the grant will be bound to.
    pub i: RouterId,
    /// Sequence number.
    pub s: u64,
    /// Transaction id echoed by the grant or reject.
    pub t: u64,
    /// Whitelisted traffic policies.
    pub w: Vec<ExitPolicy>,
    /// Requested expiry.
    pub x: u64,
    /// Client signature.
    pub z: Signature,
}

impl ObtainExitMessage {
    fn signing_bytes(&self) -> Result<Vec<u8>, GenError> {
        let mut copy = self.clone();
        copy.z = zero_signature();
        let mut buf = [0; MAX_LINK_MSG_SIZE];
        let (_, size) = copy.to_bytes((&mut buf, 0))?;
        Ok(buf[..size].to_vec())
    }

    /// Populate `I` and sign with the client identity.
    pub fn sign(&mut self, identity: &SigningKey) -> Result<(), GenError> {
        self.i = RouterId::from_signing_key(identity);
        let bytes = self.signing_bytes()?;
        self.z = identity.sign(&bytes);
        Ok(())
    }

    /// Verify the signature against the identity in `I`.
    pub fn verify(&self) -> bool {
        let vk = match self.i.verifying_key() {
            Some(vk) => vk,
            None => return false,
        };
        match self.signing_bytes() {
            Ok(bytes) => vk.verify(&bytes, &self.z).is_ok(),
            Err(_) => false,
        }
    }
}

impl FromBytes for ObtainExitMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"O")(input)?;
        let (input, _) = bencode_key("B")(input)?;
        let (input, b) = bencode_list(ExitPolicy::from_bytes)(input)?;
        let (input, _) = bencode_key("E")(input)?;
        let (input, e) = bencode_int(input)?;
        let (input, _) = bencode_key("I")(input)?;
        let (input, i) = verify(bencode_bytes, |b: &[u8]| b.len() == RouterId::SIZE)(input)?;
        let (_, i) = RouterId::from_bytes(i)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("T")(input)?;
        let (input, t) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_key("W")(input)?;
        let (input, w) = bencode_list(ExitPolicy::from_bytes)(input)?;
        let (input, _) = bencode_key("X")(input)?;
        let (input, x) = bencode_int(input)?;
        let (input, _) = bencode_key("Z")(input)?;
        let (input, z) = parse_signature(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, ObtainExitMessage { b, e, i, s, t, w, x, z }))
    }
}

impl ToBytes for ObtainExitMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"O") >>
            gen_call!(gen_bencode_key, "B") >>
            gen_call!(gen_policy_list, &self.b) >>
            gen_call!(gen_bencode_key, "E") >>
            gen_call!(gen_bencode_int, self.e) >>
            gen_call!(gen_bencode_key, "I") >>
            gen_call!(gen_bencode_bytes, self.i.as_ref()) >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "T") >>
            gen_call!(gen_bencode_int, self.t) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_call!(gen_bencode_key, "W") >>
            gen_call!(gen_policy_list, &self.w) >>
            gen_call!(gen_bencode_key, "X") >>
            gen_call!(gen_bencode_int, self.x) >>
            gen_call!(gen_bencode_key, "Z") >>
            gen_call!(gen_bencode_bytes, &self.z.to_bytes()) >>
            gen_slice!(b"e") >>
            gen_call!(gen_len_limit, MAX_LINK_MSG_SIZE)
        )
    }
}

macro_rules! signed_message_impl (
    ($name:ident) => (
        impl $name {
            fn signing_bytes(&self) -> Result<Vec<u8>, GenError> {
                let mut copy = self.clone();
                copy.z = zero_signature();
                let mut buf = [0; MAX_LINK_MSG_SIZE];
                let (_, size) = copy.to_bytes((&mut buf, 0))?;
                Ok(buf[..size].to_vec())
            }

            /// Sign with the sender's identity key.
            pub fn sign(&mut self, identity: &SigningKey) -> Result<(), GenError> {
                let bytes = self.signing_bytes()?;
                self.z = identity.sign(&bytes);
                Ok(())
            }

            /// Verify the signature against the claimed sender.
            pub fn verify(&self, vk: &VerifyingKey) -> bool {
                match self.signing_bytes() {
                    Ok(bytes) => vk.verify(&bytes, &self.z).is_ok(),
                    Err(_) => false,
                }
            }
        }
    )
);

/** Signed grant of exit traffic, sent by the endpoint.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"G"`
`S` | sequence number
`T` | transaction id of the obtain request this answers
`V` | protocol version
`Z` | endpoint signature over the encoding with `Z` zeroed
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GrantExitMessage {
    /// Sequence number.
    pub s: u64,
    /// Transaction id of the obtain request this answers.
    pub t: u64,
    /// Endpoint signature.
    pub z: Signature,
}

signed_message_impl!(GrantExitMessage);

impl FromBytes for GrantExitMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"G")(input)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("T")(input)?;
        let (input, t) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_key("Z")(input)?;
        let (input, z) = parse_signature(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, GrantExitMessage { s, t, z }))
    }
}

impl ToBytes for GrantExitMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"G") >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "T") >>
            gen_call!(gen_bencode_int, self.t) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_call!(gen_bencode_key, "Z") >>
            gen_call!(gen_bencode_bytes, &self.z.to_bytes()) >>
            gen_slice!(b"e")
        )
    }
}

/** Signed rejection of an exit request, sent by the endpoint.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"J"`
`B` | backoff the client must honour, milliseconds
`R` | policies the endpoint refused
`S` | sequence number
`T` | transaction id of the obtain request this answers
`V` | protocol version
`Z` | endpoint signature over the encoding with `Z` zeroed
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectExitMessage {
    /// Backoff the client must honour before retrying, milliseconds.
    pub b: u64,
    /// Policies the endpoint refused.
    pub r: Vec<ExitPolicy>,
    /// Sequence number.
    pub s: u64,
    /// Transaction id of the obtain request this answers.
    pub t: u64,
    /// Endpoint signature.
    pub z: Signature,
}

signed_message_impl!(RejectExitMessage);

impl FromBytes for RejectExitMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"J")(input)?;
        let (input, _) = bencode_key("B")(input)?;
        let (input, b) = bencode_int(input)?;
        let (input, _) = bencode_key("R")(input)?;
        let (input, r) = bencode_list(ExitPolicy::from_bytes)(input)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("T")(input)?;
        let (input, t) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_key("Z")(input)?;
        let (input, z) = parse_signature(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, RejectExitMessage { b, r, s, t, z }))
    }
}

impl ToBytes for RejectExitMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"J") >>
            gen_call!(gen_bencode_key, "B") >>
            gen_call!(gen_bencode_int, self.b) >>
            gen_call!(gen_bencode_key, "R") >>
            gen_call!(gen_policy_list, &self.r) >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "T") >>
            gen_call!(gen_bencode_int, self.t) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_call!(gen_bencode_key, "Z") >>
            gen_call!(gen_bencode_bytes, &self.z.to_bytes()) >>
            gen_slice!(b"e")
        )
    }
}

/** Move an exit grant onto a different path of the same owner.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"U"`
`P` | path id the grant should move to (16 bytes)
`S` | sequence number
`T` | transaction id echoed by the verify reply
`V` | protocol version
`Z` | client signature over the encoding with `Z` zeroed
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpdateExitMessage {
    /// Path the grant should move to.
    pub p: PathId,
    /// Sequence number.
    pub s: u64,
    /// Transaction id echoed by the verify reply.
    pub t: u64,
    /// Client signature.
    pub z: Signature,
}

signed_message_impl!(UpdateExitMessage);

impl FromBytes for UpdateExitMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"U")(input)?;
        let (input, _) = bencode_key("P")(input)?;
        let (input, p) = verify(bencode_bytes, |b: &[u8]| b.len() == PathId::SIZE)(input)?;
        let (_, p) = PathId::from_bytes(p)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("T")(input)?;
        let (input, t) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_key("Z")(input)?;
        let (input, z) = parse_signature(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, UpdateExitMessage { p, s, t, z }))
    }
}

impl ToBytes for UpdateExitMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"U") >>
            gen_call!(gen_bencode_key, "P") >>
            gen_call!(gen_bencode_bytes, self.p.as_ref()) >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "T") >>
            gen_call!(gen_bencode_int, self.t) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_call!(gen_bencode_key, "Z") >>
            gen_call!(gen_bencode_bytes, &self.z.to_bytes()) >>
            gen_slice!(b"e")
        )
    }
}

/** Close an exit grant; either side may send it.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"C"`
`S` | sequence number
`V` | protocol version
`Y` | anti-replay nonce
`Z` | signature over the encoding with `Z` zeroed
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseExitMessage {
    /// Sequence number.
    pub s: u64,
    /// Anti-replay nonce.
    pub y: u64,
    /// Sender signature.
    pub z: Signature,
}

signed_message_impl!(CloseExitMessage);

impl FromBytes for CloseExitMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"C")(input)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_key("Y")(input)?;
        let (input, y) = bencode_int(input)?;
        let (input, _) = bencode_key("Z")(input)?;
        let (input, z) = parse_signature(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, CloseExitMessage { s, y, z }))
    }
}

impl ToBytes for CloseExitMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"C") >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_call!(gen_bencode_key, "Y") >>
            gen_call!(gen_bencode_int, self.y) >>
            gen_call!(gen_bencode_key, "Z") >>
            gen_call!(gen_bencode_bytes, &self.z.to_bytes()) >>
            gen_slice!(b"e")
        )
    }
}

/** Acknowledges an [`UpdateExitMessage`](./struct.UpdateExitMessage.html)
or a close.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"F"`
`S` | sequence number
`T` | transaction id being acknowledged
`V` | protocol version
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpdateExitVerifyMessage {
    /// Sequence number.
    pub s: u64,
    /// Transaction id being acknowledged.
    pub t: u64,
}

impl FromBytes for UpdateExitVerifyMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"F")(input)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("T")(input)?;
        let (input, t) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, UpdateExitVerifyMessage { s, t }))
    }
}

impl ToBytes for UpdateExitVerifyMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"F") >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "T") >>
            gen_call!(gen_bencode_int, self.t) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use super::*;

    fn test_policy() -> ExitPolicy {
        ExitPolicy { proto: 17, port: 0, drop: 0 }
    }

    encode_decode_test!(exit_policy_encode_decode, test_policy());

    encode_decode_test!(
        obtain_exit_encode_decode,
        {
            let mut msg = ObtainExitMessage {
                b: Vec::new(),
                e: 1,
                i: RouterId::default(),
                s: 0,
                t: 42,
                w: vec![test_policy()],
                x: 1_000_000,
                z: zero_signature(),
            };
            msg.sign(&SigningKey::generate(&mut thread_rng())).unwrap();
            msg
        }
    );

    encode_decode_test!(
        grant_exit_encode_decode,
        GrantExitMessage { t: 42, s: 0, z: zero_signature() }
    );

    encode_decode_test!(
        reject_exit_encode_decode,
        RejectExitMessage { b: 5000, r: vec![test_policy()], t: 42, s: 0, z: zero_signature() }
    );

    encode_decode_test!(
        update_exit_encode_decode,
        UpdateExitMessage { p: PathId::random(&mut thread_rng()), t: 42, s: 0, z: zero_signature() }
    );

    encode_decode_test!(
        close_exit_encode_decode,
        CloseExitMessage { y: 7, s: 0, z: zero_signature() }
    );

    encode_decode_test!(
        update_exit_verify_encode_decode,
        UpdateExitVerifyMessage { s: 0, t: 42 }
    );

    #[test]
    fn obtain_exit_sign_verify() {
        let mut rng = thread_rng();
        let identity = SigningKey::generate(&mut rng);
        let mut msg = ObtainExitMessage {
            b: Vec::new(),
            e: 1,
            i: RouterId::default(),
            s: 0,
            t: 1,
            w: Vec::new(),
            x: 123,
            z: zero_signature(),
        };
        msg.sign(&identity).unwrap();
        assert!(msg.verify());

        msg.t = 2;
        assert!(!msg.verify());
    }

    #[test]
    fn grant_exit_sign_verify() {
        let mut rng = thread_rng();
        let endpoint = SigningKey::generate(&mut rng);
        let stranger = SigningKey::generate(&mut rng);
        let mut msg = GrantExitMessage { t: 9, s: 0, z: zero_signature() };
        msg.sign(&endpoint).unwrap();

        assert!(msg.verify(&endpoint.verifying_key()));
        assert!(!msg.verify(&stranger.verifying_key()));
    }

    #[test]
    fn reject_exit_sign_verify_tamper() {
        let mut rng = thread_rng();
        let endpoint = SigningKey::generate(&mut rng);
        let mut msg = RejectExitMessage {
            b: 1000,
            r: Vec::new(),
            t: 9,
            s: 0,
            z: zero_signature(),
        };
        msg.sign(&endpoint).unwrap();
        assert!(msg.verify(&endpoint.verifying_key()));

        msg.b = 2000;
        assert!(!msg.verify(&endpoint.verifying_key()));
    }
}
