/*! DHT messages: router lookup by public key.
*/

use cookie_factory::GenError;
use nom::branch::alt;
use nom::combinator::{map, verify};
use nom::IResult;

use nyx_binary_io::*;
use nyx_crypto::*;

use crate::router_contact::RouterContact;
use crate::{MAX_LINK_MSG_SIZE, PROTO_VERSION};

/** Request to resolve a router identity to its RouterContact.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"R"`
`E` | exploratory flag (0/1)
`I` | iterative flag (0/1)
`K` | target identity key (32 bytes)
`T` | transaction id
`V` | protocol version
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FindRouterMessage {
    /// Whether this lookup only explores the neighbourhood.
    pub exploratory: bool,
    /// Whether the responder should reply with closer peers instead of
    /// relaying the lookup itself.
    pub iterative: bool,
    /// Identity being resolved.
    pub key: RouterId,
    /// Transaction id the reply must echo.
    pub tx_id: u64,
}

impl FromBytes for FindRouterMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"R")(input)?;
        let (input, _) = bencode_key("E")(input)?;
        let (input, exploratory) = bencode_int(input)?;
        let (input, _) = bencode_key("I")(input)?;
        let (input, iterative) = bencode_int(input)?;
        let (input, _) = bencode_key("K")(input)?;
        let (input, key) = verify(bencode_bytes, |b: &[u8]| b.len() == RouterId::SIZE)(input)?;
        let (_, key) = RouterId::from_bytes(key)?;
        let (input, _) = bencode_key("T")(input)?;
        let (input, tx_id) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, FindRouterMessage {
            exploratory: exploratory != 0,
            iterative: iterative != 0,
            key,
            tx_id,
        }))
    }
}

impl ToBytes for FindRouterMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"R") >>
            gen_call!(gen_bencode_key, "E") >>
            gen_call!(gen_bencode_int, self.exploratory as u64) >>
            gen_call!(gen_bencode_key, "I") >>
            gen_call!(gen_bencode_int, self.iterative as u64) >>
            gen_call!(gen_bencode_key, "K") >>
            gen_call!(gen_bencode_bytes, self.key.as_ref()) >>
            gen_call!(gen_bencode_key, "T") >>
            gen_call!(gen_bencode_int, self.tx_id) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/** Reply to a [`FindRouterMessage`](./struct.FindRouterMessage.html),
carrying the matched descriptors (possibly none).

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"S"`
`R` | list of RouterContact dictionaries
`T` | transaction id of the lookup
`V` | protocol version
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GotRouterMessage {
    /// Matched descriptors; empty when the lookup failed.
    pub rcs: Vec<RouterContact>,
    /// Transaction id of the lookup this answers.
    pub tx_id: u64,
}

fn gen_rc_list<'a>(
    buf: (&'a mut [u8], usize),
    rcs: &[RouterContact],
) -> Result<(&'a mut [u8], usize), GenError> {
    let mut buf = gen_put_slice(buf, b"l")?;
    for rc in rcs {
        buf = rc.to_bytes(buf)?;
    }
    gen_put_slice(buf, b"e")
}

impl FromBytes for GotRouterMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"S")(input)?;
        let (input, _) = bencode_key("R")(input)?;
        let (input, rcs) = bencode_list(RouterContact::from_bytes)(input)?;
        let (input, _) = bencode_key("T")(input)?;
        let (input, tx_id) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, GotRouterMessage { rcs, tx_id }))
    }
}

impl ToBytes for GotRouterMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"S") >>
            gen_call!(gen_bencode_key, "R") >>
            gen_call!(gen_rc_list, &self.rcs) >>
            gen_call!(gen_bencode_key, "T") >>
            gen_call!(gen_bencode_int, self.tx_id) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_slice!(b"e") >>
            gen_call!(gen_len_limit, MAX_LINK_MSG_SIZE)
        )
    }
}

/// Any DHT message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DhtMessage {
    /// [`FindRouterMessage`](./struct.FindRouterMessage.html) structure.
    FindRouter(FindRouterMessage),
    /// [`GotRouterMessage`](./struct.GotRouterMessage.html) structure.
    GotRouter(GotRouterMessage),
}

impl FromBytes for DhtMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(FindRouterMessage::from_bytes, DhtMessage::FindRouter),
            map(GotRouterMessage::from_bytes, DhtMessage::GotRouter),
        ))(input)
    }
}

impl ToBytes for DhtMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            DhtMessage::FindRouter(p) => p.to_bytes(buf),
            DhtMessage::GotRouter(p) => p.to_bytes(buf),
        }
    }
}
