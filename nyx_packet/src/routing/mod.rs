/*! Routing messages: the protocol spoken across an established path.

Routing messages travel onion-wrapped inside relay messages. Before
wrapping they are right-padded with random bytes to
[`MESSAGE_PAD_SIZE`](../constant.MESSAGE_PAD_SIZE.html), so parsers ignore
anything past the dictionary.
*/

pub mod exit;

use cookie_factory::GenError;
use nom::branch::alt;
use nom::combinator::{map, verify};
use nom::IResult;

use nyx_binary_io::*;
use nyx_crypto::*;

use crate::dht::DhtMessage;
use crate::{MAX_LINK_MSG_SIZE, PROTO_VERSION};

pub use self::exit::{
    CloseExitMessage, ExitPolicy, GrantExitMessage, ObtainExitMessage, RejectExitMessage,
    UpdateExitMessage, UpdateExitVerifyMessage,
};

/** Confirmation sent by the terminal hop once a path build is accepted.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"P"`
`C` | hop creation time, milliseconds since epoch
`L` | granted lifetime, milliseconds
`S` | sequence number
`V` | protocol version
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathConfirmMessage {
    /// When the terminal hop installed the path.
    pub path_created: u64,
    /// Lifetime the terminal hop granted.
    pub path_lifetime: u64,
    /// Sequence number.
    pub s: u64,
}

impl FromBytes for PathConfirmMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"P")(input)?;
        let (input, _) = bencode_key("C")(input)?;
        let (input, path_created) = bencode_int(input)?;
        let (input, _) = bencode_key("L")(input)?;
        let (input, path_lifetime) = bencode_int(input)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, PathConfirmMessage { path_created, path_lifetime, s }))
    }
}

impl ToBytes for PathConfirmMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"P") >>
            gen_call!(gen_bencode_key, "C") >>
            gen_call!(gen_bencode_int, self.path_created) >>
            gen_call!(gen_bencode_key, "L") >>
            gen_call!(gen_bencode_int, self.path_lifetime) >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/** Latency probe and its echo. A probe carries a random token in `T`; the
endpoint answers with the token echoed in `L`.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"L"`
`L` | echoed token, 0 in a probe
`S` | sequence number
`T` | probe token, 0 in an echo
`V` | protocol version
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathLatencyMessage {
    /// Token echoed back by the endpoint.
    pub l: u64,
    /// Sequence number.
    pub s: u64,
    /// Fresh probe token.
    pub t: u64,
}

impl FromBytes for PathLatencyMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"L")(input)?;
        let (input, _) = bencode_key("L")(input)?;
        let (input, l) = bencode_int(input)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("T")(input)?;
        let (input, t) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, PathLatencyMessage { l, s, t }))
    }
}

impl ToBytes for PathLatencyMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"L") >>
            gen_call!(gen_bencode_key, "L") >>
            gen_call!(gen_bencode_int, self.l) >>
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

/** Notification that a frame for `P` was dropped.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"D"`
`P` | path id whose frame was discarded (16 bytes)
`S` | sequence number
`V` | protocol version
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataDiscardMessage {
    /// Path id whose frame was dropped.
    pub p: PathId,
    /// Sequence number.
    pub s: u64,
}

impl FromBytes for DataDiscardMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"D")(input)?;
        let (input, _) = bencode_key("P")(input)?;
        let (input, p) = verify(bencode_bytes, |b: &[u8]| b.len() == PathId::SIZE)(input)?;
        let (_, p) = PathId::from_bytes(p)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, DataDiscardMessage { p, s }))
    }
}

impl ToBytes for DataDiscardMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"D") >>
            gen_call!(gen_bencode_key, "P") >>
            gen_call!(gen_bencode_bytes, self.p.as_ref()) >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/** Hand a payload over to another path terminating at the same endpoint.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"T"`
`P` | destination path id (16 bytes)
`S` | sequence number
`V` | protocol version
`X` | payload for the destination path
`Y` | tunnel nonce (24 bytes)
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathTransferMessage {
    /// Path the payload should continue on.
    pub p: PathId,
    /// Sequence number.
    pub s: u64,
    /// Payload handed across.
    pub x: Vec<u8>,
    /// Tunnel nonce for the payload.
    pub y: TunnelNonce,
}

impl FromBytes for PathTransferMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"T")(input)?;
        let (input, _) = bencode_key("P")(input)?;
        let (input, p) = verify(bencode_bytes, |b: &[u8]| b.len() == PathId::SIZE)(input)?;
        let (_, p) = PathId::from_bytes(p)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_key("X")(input)?;
        let (input, x) = bencode_bytes(input)?;
        let (input, _) = bencode_key("Y")(input)?;
        let (input, y) = verify(bencode_bytes, |b: &[u8]| b.len() == TunnelNonce::SIZE)(input)?;
        let (_, y) = TunnelNonce::from_bytes(y)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, PathTransferMessage { p, s, x: x.to_vec(), y }))
    }
}

impl ToBytes for PathTransferMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"T") >>
            gen_call!(gen_bencode_key, "P") >>
            gen_call!(gen_bencode_bytes, self.p.as_ref()) >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_call!(gen_bencode_key, "X") >>
            gen_call!(gen_bencode_bytes, self.x.as_slice()) >>
            gen_call!(gen_bencode_key, "Y") >>
            gen_call!(gen_bencode_bytes, self.y.as_ref()) >>
            gen_slice!(b"e")
        )
    }
}

/** Bulk exit traffic: a batch of counter-prefixed IP packets.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"I"`
`S` | sequence number
`V` | protocol version
`X` | list of packets, each an 8-byte counter followed by payload
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferTrafficMessage {
    /// Sequence number.
    pub s: u64,
    /// Counter-prefixed packets.
    pub x: Vec<Vec<u8>>,
}

fn parse_packet(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map(bencode_bytes, |b: &[u8]| b.to_vec())(input)
}

fn gen_packet_list<'a>(
    buf: (&'a mut [u8], usize),
    packets: &[Vec<u8>],
) -> Result<(&'a mut [u8], usize), GenError> {
    let mut buf = gen_put_slice(buf, b"l")?;
    for packet in packets {
        buf = gen_bencode_bytes(buf, packet)?;
    }
    gen_put_slice(buf, b"e")
}

impl FromBytes for TransferTrafficMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"I")(input)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_key("X")(input)?;
        let (input, x) = bencode_list(parse_packet)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, TransferTrafficMessage { s, x }))
    }
}

impl ToBytes for TransferTrafficMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"I") >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_call!(gen_bencode_key, "X") >>
            gen_call!(gen_packet_list, &self.x) >>
            gen_slice!(b"e") >>
            gen_call!(gen_len_limit, MAX_LINK_MSG_SIZE)
        )
    }
}

/** DHT messages carried over a path.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"M"`
`M` | list of DHT message dictionaries
`S` | sequence number
`V` | protocol version
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DhtRoutingMessage {
    /// Carried DHT messages.
    pub m: Vec<DhtMessage>,
    /// Sequence number.
    pub s: u64,
}

fn gen_dht_list<'a>(
    buf: (&'a mut [u8], usize),
    messages: &[DhtMessage],
) -> Result<(&'a mut [u8], usize), GenError> {
    let mut buf = gen_put_slice(buf, b"l")?;
    for message in messages {
        buf = message.to_bytes(buf)?;
    }
    gen_put_slice(buf, b"e")
}

impl FromBytes for DhtRoutingMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = bencode_dict_start(input)?;
        let (input, _) = bencode_key("A")(input)?;
        let (input, _) = verify(bencode_bytes, |b: &[u8]| b == b"M")(input)?;
        let (input, _) = bencode_key("M")(input)?;
        let (input, m) = bencode_list(DhtMessage::from_bytes)(input)?;
        let (input, _) = bencode_key("S")(input)?;
        let (input, s) = bencode_int(input)?;
        let (input, _) = bencode_key("V")(input)?;
        let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
        let (input, _) = bencode_end(input)?;
        Ok((input, DhtRoutingMessage { m, s }))
    }
}

impl ToBytes for DhtRoutingMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_call!(gen_bencode_key, "A") >>
            gen_call!(gen_bencode_bytes, b"M") >>
            gen_call!(gen_bencode_key, "M") >>
            gen_call!(gen_dht_list, &self.m) >>
            gen_call!(gen_bencode_key, "S") >>
            gen_call!(gen_bencode_int, self.s) >>
            gen_call!(gen_bencode_key, "V") >>
            gen_call!(gen_bencode_int, PROTO_VERSION) >>
            gen_slice!(b"e") >>
            gen_call!(gen_len_limit, MAX_LINK_MSG_SIZE)
        )
    }
}

/// Any message that travels over an established path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RoutingMessage {
    /// [`PathConfirmMessage`](./struct.PathConfirmMessage.html) structure.
    PathConfirm(PathConfirmMessage),
    /// [`PathLatencyMessage`](./struct.PathLatencyMessage.html) structure.
    PathLatency(PathLatencyMessage),
    /// [`DataDiscardMessage`](./struct.DataDiscardMessage.html) structure.
    DataDiscard(DataDiscardMessage),
    /// [`PathTransferMessage`](./struct.PathTransferMessage.html) structure.
    PathTransfer(PathTransferMessage),
    /// [`TransferTrafficMessage`](./struct.TransferTrafficMessage.html) structure.
    TransferTraffic(TransferTrafficMessage),
    /// [`DhtRoutingMessage`](./struct.DhtRoutingMessage.html) structure.
    Dht(DhtRoutingMessage),
    /// [`ObtainExitMessage`](./exit/struct.ObtainExitMessage.html) structure.
    ObtainExit(ObtainExitMessage),
    /// [`GrantExitMessage`](./exit/struct.GrantExitMessage.html) structure.
    GrantExit(GrantExitMessage),
    /// [`RejectExitMessage`](./exit/struct.RejectExitMessage.html) structure.
    RejectExit(RejectExitMessage),
    /// [`UpdateExitMessage`](./exit/struct.UpdateExitMessage.html) structure.
    UpdateExit(UpdateExitMessage),
    /// [`CloseExitMessage`](./exit/struct.CloseExitMessage.html) structure.
    CloseExit(CloseExitMessage),
    /// [`UpdateExitVerifyMessage`](./exit/struct.UpdateExitVerifyMessage.html) structure.
    UpdateExitVerify(UpdateExitVerifyMessage),
}

impl FromBytes for RoutingMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(PathConfirmMessage::from_bytes, RoutingMessage::PathConfirm),
            map(PathLatencyMessage::from_bytes, RoutingMessage::PathLatency),
            map(DataDiscardMessage::from_bytes, RoutingMessage::DataDiscard),
            map(PathTransferMessage::from_bytes, RoutingMessage::PathTransfer),
            map(TransferTrafficMessage::from_bytes, RoutingMessage::TransferTraffic),
            map(DhtRoutingMessage::from_bytes, RoutingMessage::Dht),
            map(ObtainExitMessage::from_bytes, RoutingMessage::ObtainExit),
            map(GrantExitMessage::from_bytes, RoutingMessage::GrantExit),
            map(RejectExitMessage::from_bytes, RoutingMessage::RejectExit),
            map(UpdateExitMessage::from_bytes, RoutingMessage::UpdateExit),
            map(CloseExitMessage::from_bytes, RoutingMessage::CloseExit),
            map(UpdateExitVerifyMessage::from_bytes, RoutingMessage::UpdateExitVerify),
        ))(input)
    }
}

impl ToBytes for RoutingMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            RoutingMessage::PathConfirm(p) => p.to_bytes(buf),
            RoutingMessage::PathLatency(p) => p.to_bytes(buf),
            RoutingMessage::DataDiscard(p) => p.to_bytes(buf),
            RoutingMessage::PathTransfer(p) => p.to_bytes(buf),
            RoutingMessage::TransferTraffic(p) => p.to_bytes(buf),
            RoutingMessage::Dht(p) => p.to_bytes(buf),
            RoutingMessage::ObtainExit(p) => p.to_bytes(buf),
            RoutingMessage::GrantExit(p) => p.to_bytes(buf),
            RoutingMessage::RejectExit(p) => p.to_bytes(buf),
            RoutingMessage::UpdateExit(p) => p.to_bytes(buf),
            RoutingMessage::CloseExit(p) => p.to_bytes(buf),
            RoutingMessage::UpdateExitVerify(p) => p.to_bytes(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use super::*;

    encode_decode_test!(
        path_confirm_encode_decode,
        PathConfirmMessage { path_created: 123, path_lifetime: 600_000, s: 0 }
    );

    encode_decode_test!(
        path_latency_encode_decode,
        PathLatencyMessage { l: 0, s: 1, t: 42 }
    );

    encode_decode_test!(
        data_discard_encode_decode,
        DataDiscardMessage { p: PathId::random(&mut thread_rng()), s: 2 }
    );

    encode_decode_test!(
        path_transfer_encode_decode,
        PathTransferMessage {
            p: PathId::random(&mut thread_rng()),
            s: 3,
            x: vec![42; 64],
            y: TunnelNonce::random(&mut thread_rng()),
        }
    );

    encode_decode_test!(
        transfer_traffic_encode_decode,
        TransferTrafficMessage { s: 4, x: vec![vec![0; 16], vec![1; 24]] }
    );

    encode_decode_test!(
        dht_routing_encode_decode,
        DhtRoutingMessage {
            m: vec![crate::dht::DhtMessage::FindRouter(crate::dht::FindRouterMessage {
                exploratory: false,
                iterative: false,
                key: RouterId::random(&mut thread_rng()),
                tx_id: 5,
            })],
            s: 5,
        }
    );

    #[test]
    fn routing_message_dispatches_on_tag() {
        let msg = RoutingMessage::PathLatency(PathLatencyMessage { l: 7, s: 0, t: 0 });
        let mut buf = [0; MAX_LINK_MSG_SIZE];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let (_, parsed) = RoutingMessage::from_bytes(&buf[..size]).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn routing_message_ignores_trailing_padding() {
        let msg = PathConfirmMessage { path_created: 1, path_lifetime: 2, s: 0 };
        let mut buf = [0; MAX_LINK_MSG_SIZE];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let mut padded = buf[..size].to_vec();
        padded.extend_from_slice(&[0xaa; 100]);
        let (rest, parsed) = PathConfirmMessage::from_bytes(&padded).unwrap();
        assert_eq!(rest.len(), 100);
        assert_eq!(parsed, msg);
    }
}
