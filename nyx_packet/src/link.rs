/*! Top-level link messages: everything a router can receive in one
datagram from a direct peer.

The [`LinkIntroMessage`](./struct.LinkIntroMessage.html) is spoken by the
link layer itself to identify session peers; it never reaches the router.
*/

use cookie_factory::GenError;
use nom::branch::alt;
use nom::combinator::{map, verify};
use nom::IResult;

use nyx_binary_io::*;

use crate::dht::DhtMessage;
use crate::lr_commit::LrCommitMessage;
use crate::relay::{RelayDownstream, RelayUpstream};
use crate::router_contact::RouterContact;
use crate::PROTO_VERSION;

/** Session hello carrying the sender's signed descriptor.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"i"`
`R` | the sender's RouterContact dictionary
`V` | protocol version
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkIntroMessage {
    /// The sender's descriptor.
    pub rc: RouterContact,
}

impl FromBytes for LinkIntroMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"i")(input)?;
        let (input, _) = bencode_key("R")(input)?;
        let (input, rc) = RouterContact::from_bytes(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, LinkIntroMessage { rc }))
    }
}

impl ToBytes for LinkIntroMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"i") >>
            gen_call!(gen_bencode_key, "R") >>
            gen_call!(|b, rc: &RouterContact| rc.to_bytes(b), &self.rc) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/// Any message exchanged between directly linked routers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkMessage {
    /// [`LrCommitMessage`](../lr_commit/struct.LrCommitMessage.html) structure.
    LrCommit(LrCommitMessage),
    /// [`RelayUpstream`](../relay/struct.RelayUpstream.html) structure.
    RelayUpstream(RelayUpstream),
    /// [`RelayDownstream`](../relay/struct.RelayDownstream.html) structure.
    RelayDownstream(RelayDownstream),
    /// A DHT message sent outside any path.
    DhtImmediate(DhtMessage),
}

impl FromBytes for LinkMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(LrCommitMessage::from_bytes, LinkMessage::LrCommit),
            map(RelayUpstream::from_bytes, LinkMessage::RelayUpstream),
            map(RelayDownstream::from_bytes, LinkMessage::RelayDownstream),
            map(DhtMessage::from_bytes, LinkMessage::DhtImmediate),
        ))(input)
    }
}

impl ToBytes for LinkMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            LinkMessage::LrCommit(p) => p.to_bytes(buf),
            LinkMessage::RelayUpstream(p) => p.to_bytes(buf),
            LinkMessage::RelayDownstream(p) => p.to_bytes(buf),
            LinkMessage::DhtImmediate(p) => p.to_bytes(buf),
        }
    }
}
