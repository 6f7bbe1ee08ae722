/*! Relay messages carrying one onion-wrapped payload along a path segment.

Serialized form (bencoded dictionary):

Key | Content
--- | -------
`A` | `"u"` upstream / `"d"` downstream
`P` | path id of the receiving hop (16 bytes)
`V` | protocol version
`X` | onion-wrapped payload
`Y` | tunnel nonce (24 bytes)
*/

use cookie_factory::GenError;
use nom::combinator::verify;
use nom::IResult;

use nyx_binary_io::*;
use nyx_crypto::*;

use crate::{MAX_LINK_MSG_SIZE, PROTO_VERSION};

macro_rules! relay_message (
    ($(#[$attr:meta])* $name:ident, $tag:expr) => (
        $(#[$attr])*
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub struct $name {
            /// Path id the receiving hop knows this segment by.
            pub path_id: PathId,
            /// Onion-wrapped payload.
            pub x: Vec<u8>,
            /// Tunnel nonce for the current outer layer.
            pub y: TunnelNonce,
        }

        impl FromBytes for $name {
            fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
                let (input, _) = bencode_dict_start(input)?;
                let (input, _) = bencode_key("A")(input)?;
                let (input, _) = verify(bencode_bytes, |b: &[u8]| b == $tag)(input)?;
                let (input, _) = bencode_key("P")(input)?;
                let (input, path_id) = verify(bencode_bytes, |b: &[u8]| b.len() == PathId::SIZE)(input)?;
                let (_, path_id) = PathId::from_bytes(path_id)?;
                let (input, _) = bencode_key("V")(input)?;
                let (input, _) = verify(bencode_int, |v| *v == PROTO_VERSION)(input)?;
                let (input, _) = bencode_key("X")(input)?;
                let (input, x) = bencode_bytes(input)?;
                let (input, _) = bencode_key("Y")(input)?;
                let (input, y) = verify(bencode_bytes, |b: &[u8]| b.len() == TunnelNonce::SIZE)(input)?;
                let (_, y) = TunnelNonce::from_bytes(y)?;
                let (input, _) = bencode_end(input)?;
                Ok((input, $name { path_id, x: x.to_vec(), y }))
            }
        }

        impl ToBytes for $name {
            fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
                do_gen!(buf,
                    gen_slice!(b"d") >>
                    gen_call!(gen_bencode_key, "A") >>
                    gen_call!(gen_bencode_bytes, $tag) >>
                    gen_call!(gen_bencode_key, "P") >>
                    gen_call!(gen_bencode_bytes, self.path_id.as_ref()) >>
                    gen_call!(gen_bencode_key, "V") >>
                    gen_call!(gen_bencode_int, PROTO_VERSION) >>
                    gen_call!(gen_bencode_key, "X") >>
                    gen_call!(gen_bencode_bytes, self.x.as_slice()) >>
                    gen_call!(gen_bencode_key, "Y") >>
                    gen_call!(gen_bencode_bytes, self.y.as_ref()) >>
                    gen_slice!(b"e") >>
                    gen_call!(gen_len_limit, MAX_LINK_MSG_SIZE)
                )
            }
        }
    )
);

relay_message!(
    /// Payload travelling from the path owner toward the endpoint.
    RelayUpstream, b"u"
);
relay_message!(
    /// Payload travelling from the endpoint back toward the path owner.
    RelayDownstream, b"d"
);

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use super::*;

    encode_decode_test!(
        relay_upstream_encode_decode,
        RelayUpstream {
            path_id: PathId::random(&mut thread_rng()),
            x: vec![42; 128],
            y: TunnelNonce::random(&mut thread_rng()),
        }
    );

    encode_decode_test!(
        relay_downstream_encode_decode,
        RelayDownstream {
            path_id: PathId::random(&mut thread_rng()),
            x: vec![42; 128],
            y: TunnelNonce::random(&mut thread_rng()),
        }
    );

    #[test]
    fn upstream_is_not_downstream() {
        let msg = RelayUpstream {
            path_id: PathId::random(&mut thread_rng()),
            x: vec![1, 2, 3],
            y: TunnelNonce::random(&mut thread_rng()),
        };
        let mut buf = [0; MAX_LINK_MSG_SIZE];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        assert!(RelayDownstream::from_bytes(&buf[..size]).is_err());
    }
}
