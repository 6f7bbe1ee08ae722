/*! LR Commit: the onion-wrapped path build message.

An LR Commit carries exactly [`MAX_HOPS`](../constant.MAX_HOPS.html)
encrypted frames, one per possible hop. Unused slots hold random bytes the
same length as a real frame, so every path build looks identical on the
wire regardless of hop count.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"c"`
`F` | list of exactly 8 frames, each `FRAME_SIZE` bytes
`V` | protocol version
*/

use aead::{Aead, AeadCore};
use cookie_factory::GenError;
use crypto_box::SalsaBox;
use nom::combinator::{map_opt, verify};
use nom::error::ErrorKind;
use nom::IResult;
use rand::{CryptoRng, RngCore};

use nyx_binary_io::*;
use nyx_crypto::*;

use crate::errors::GetPayloadError;
use crate::{MAX_HOPS, MAX_LINK_MSG_SIZE, PROTO_VERSION};

/// Commit records are padded to this length before sealing.
pub const LR_RECORD_PAD_SIZE: usize = 192;

/// Length of the sealed record inside a frame.
pub const FRAME_CIPHERTEXT_SIZE: usize = LR_RECORD_PAD_SIZE + 16;

/// Length of one frame: ephemeral key, box nonce, sealed record.
pub const FRAME_SIZE: usize = KEY_SIZE + BOX_NONCE_SIZE + FRAME_CIPHERTEXT_SIZE;

/** Per-hop path build record, sealed to the hop's encryption key.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`c` | ephemeral commit public key (32 bytes)
`i` | next hop router identity (32 bytes)
`n` | tunnel nonce for the key exchange (24 bytes)
`r` | rx path id (16 bytes)
`t` | tx path id (16 bytes)
`u` | hop lifetime, milliseconds
`v` | protocol version

The encoding is right-padded with random bytes up to
[`LR_RECORD_PAD_SIZE`](./constant.LR_RECORD_PAD_SIZE.html); readers ignore
everything past the dictionary.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LrCommitRecord {
    /// Ephemeral public key the hop runs its key exchange against.
    pub commkey: PublicKey,
    /// Where to forward the remaining frames; our own identity on the
    /// terminal hop.
    pub next_hop: RouterId,
    /// Nonce binding the derived shared key to this build.
    pub tunnel_nonce: TunnelNonce,
    /// Path id of the downstream-facing direction.
    pub rx_id: PathId,
    /// Path id of the upstream-facing direction.
    pub tx_id: PathId,
    /// Milliseconds this hop should stay alive.
    pub lifetime: u64,
}

impl FromBytes for LrCommitRecord {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("c")(input)?;
        let (input, commkey) = map_opt(bencode_bytes, public_key_from_slice)(input)?;
        let (input, _) = bencode_key("i")(input)?;
        let (input, next_hop) = verify(bencode_bytes, |b: &[u8]| b.len() == RouterId::SIZE)(input)?;
        let (_, next_hop) = RouterId::from_bytes(next_hop)?;
        let (input, _) = bencode_key("n")(input)?;
        let (input, tunnel_nonce) = verify(bencode_bytes, |b: &[u8]| b.len() == TunnelNonce::SIZE)(input)?;
        let (_, tunnel_nonce) = TunnelNonce::from_bytes(tunnel_nonce)?;
        let (input, _) = bencode_key("r")(input)?;
        let (input, rx_id) = verify(bencode_bytes, |b: &[u8]| b.len() == PathId::SIZE)(input)?;
        let (_, rx_id) = PathId::from_bytes(rx_id)?;
        let (input, _) = bencode_key("t")(input)?;
        let (input, tx_id) = verify(bencode_bytes, |b: &[u8]| b.len() == PathId::SIZE)(input)?;
        let (_, tx_id) = PathId::from_bytes(tx_id)?;
        let (input, _) = bencode_key("u")(input)?;
        let (input, lifetime) = bencode_int(input)?;
        let (input, _) = bencode_key("v")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        // trailing random padding is left unparsed
        Ok((input, LrCommitRecord {
            commkey,
            next_hop,
            tunnel_nonce,
            rx_id,
            tx_id,
            lifetime,
        }))
    }
}

impl ToBytes for LrCommitRecord {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "c") >>
            gen_call!(gen_bencode_bytes, self.commkey.as_bytes()) >>
            gen_call!(gen_bencode_key, "i") >>
            gen_call!(gen_bencode_bytes, self.next_hop.as_ref()) >>
            gen_call!(gen_bencode_key, "n") >>
            gen_call!(gen_bencode_bytes, self.tunnel_nonce.as_ref()) >>
            gen_call!(gen_bencode_key, "r") >>
            gen_call!(gen_bencode_bytes, self.rx_id.as_ref()) >>
            gen_call!(gen_bencode_key, "t") >>
            gen_call!(gen_bencode_bytes, self.tx_id.as_ref()) >>
            gen_call!(gen_bencode_key, "u") >>
            gen_call!(gen_bencode_int, self.lifetime) >>
            gen_call!(gen_bencode_key, "v") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_slice!(b"e") >>
            gen_call!(gen_len_limit, LR_RECORD_PAD_SIZE)
        )
    }
}

/// One slot of an LR Commit: either a record sealed to a hop's encryption
/// key or indistinguishable random filler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncryptedFrame(Vec<u8>);

impl EncryptedFrame {
    /// Random filler frame for unused hop slots.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> EncryptedFrame {
        let mut bytes = vec![0; FRAME_SIZE];
        rng.fill_bytes(&mut bytes);
        EncryptedFrame(bytes)
    }

    /// Seal a commit record to `recipient` with a fresh ephemeral key.
    pub fn seal<R: RngCore + CryptoRng>(
        record: &LrCommitRecord,
        recipient: &PublicKey,
        rng: &mut R,
    ) -> EncryptedFrame {
        let mut plaintext = [0; LR_RECORD_PAD_SIZE];
        let (_, size) = record.to_bytes((&mut plaintext, 0)).unwrap();
        rng.fill_bytes(&mut plaintext[size..]);

        let frame_sk = SecretKey::generate(rng);
        let nonce = SalsaBox::generate_nonce(rng);
        let ciphertext = SalsaBox::new(recipient, &frame_sk)
            .encrypt(&nonce, &plaintext[..])
            .unwrap();

        let mut bytes = Vec::with_capacity(FRAME_SIZE);
        bytes.extend_from_slice(frame_sk.public_key().as_bytes());
        bytes.extend_from_slice(nonce.as_slice());
        bytes.extend_from_slice(&ciphertext);
        EncryptedFrame(bytes)
    }

    /** Unseal the frame with our encryption key.

    Returns `Error` in case of failure:

    - fails to decrypt
    - fails to parse as [`LrCommitRecord`](./struct.LrCommitRecord.html)
    */
    pub fn open(&self, recipient_sk: &SecretKey) -> Result<LrCommitRecord, GetPayloadError> {
        let (frame_pk, rest) = self.0.split_at(KEY_SIZE);
        let (nonce, ciphertext) = rest.split_at(BOX_NONCE_SIZE);
        let frame_pk = public_key_from_slice(frame_pk).ok_or_else(GetPayloadError::decrypt)?;
        let mut nonce_bytes: BoxNonce = [0; BOX_NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);
        let decrypted = SalsaBox::new(&frame_pk, recipient_sk)
            .decrypt((&nonce_bytes).into(), ciphertext)
            .map_err(|_| GetPayloadError::decrypt())?;
        match LrCommitRecord::from_bytes(&decrypted) {
            Err(error) => Err(GetPayloadError::deserialize(error)),
            Ok((_, record)) => Ok(record),
        }
    }

    /// Raw frame bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Wrap raw bytes, checking the fixed frame length.
    pub fn from_slice(bytes: &[u8]) -> Option<EncryptedFrame> {
        if bytes.len() == FRAME_SIZE {
            Some(EncryptedFrame(bytes.to_vec()))
        } else {
            None
        }
    }
}

/** Path build message: 8 frames, first one addressed to the receiving
router.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LrCommitMessage {
    /// Exactly [`MAX_HOPS`](../constant.MAX_HOPS.html) frames.
    pub frames: Vec<EncryptedFrame>,
}

impl LrCommitMessage {
    /// Build a message from the sealed frames of a path, padding the unused
    /// slots with random filler.
    pub fn new<R: RngCore + CryptoRng>(mut frames: Vec<EncryptedFrame>, rng: &mut R) -> LrCommitMessage {
        while frames.len() < MAX_HOPS {
            frames.push(EncryptedFrame::random(rng));
        }
        LrCommitMessage { frames }
    }

    /// Take the frame addressed to us and produce the message for the next
    /// hop: remaining frames shift up, a fresh random frame fills the tail.
    pub fn pop_frame<R: RngCore + CryptoRng>(&self, rng: &mut R) -> (EncryptedFrame, LrCommitMessage) {
        let mut frames = self.frames.clone();
        let first = frames.remove(0);
        frames.push(EncryptedFrame::random(rng));
        (first, LrCommitMessage { frames })
    }
}

fn gen_frame_list<'a>(
    buf: (&'a mut [u8], usize),
    frames: &[EncryptedFrame],
) -> Result<(&'a mut [u8], usize), GenError> {
    let mut buf = gen_put_slice(buf, b"l")?;
    for frame in frames {
        buf = gen_bencode_bytes(buf, frame.as_bytes())?;
    }
    gen_put_slice(buf, b"e")
}

fn parse_frame(input: &[u8]) -> IResult<&[u8], EncryptedFrame> {
    let (input, bytes) = verify(bencode_bytes, |b: &[u8]| b.len() == FRAME_SIZE)(input)?;
    match EncryptedFrame::from_slice(bytes) {
        Some(frame) => Ok((input, frame)),
        None => Err(nom::Err::Error((input, ErrorKind::Verify))),
    }
}

impl FromBytes for LrCommitMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"c")(input)?;
        let (input, _) = bencode_key("F")(input)?;
        let (input, frames) = verify(bencode_list(parse_frame), |f: &Vec<EncryptedFrame>| {
            f.len() == MAX_HOPS
        })(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, LrCommitMessage { frames }))
    }
}

impl ToBytes for LrCommitMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.frames.len() != MAX_HOPS, |buf| gen_error(buf, 0)) >>
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"c") >>
            gen_call!(gen_bencode_key, "F") >>
            gen_call!(gen_frame_list, &self.frames) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_slice!(b"e") >>
            gen_call!(gen_len_limit, MAX_LINK_MSG_SIZE)
        )
    }
}
