/*!
Serialization and deserialization traits for the nyx wire protocol.

Every protocol object is a bencoded dictionary. Parsing is done with `nom`
combinators via the [`FromBytes`](./trait.FromBytes.html) trait, generation
with `cookie_factory` via the [`ToBytes`](./trait.ToBytes.html) trait.
*/

#![forbid(unsafe_code)]

mod bencode;

pub use crate::bencode::*;

use cookie_factory::GenError;
use nom::IResult;

/// The trait provides method to deserialize struct from raw bytes.
pub trait FromBytes: Sized {
    /// Deserialize struct using `nom` from raw bytes.
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self>;
}

/// The trait provides method to serialize struct into raw bytes.
pub trait ToBytes: Sized {
    /// Serialize struct into raw bytes using `cookie_factory`.
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError>;
}

/// Append a raw slice to the generator buffer.
pub fn gen_put_slice<'a>(
    buf: (&'a mut [u8], usize),
    data: &[u8],
) -> Result<(&'a mut [u8], usize), GenError> {
    let (out, offset) = buf;
    let end = offset + data.len();
    if end > out.len() {
        return Err(GenError::BufferTooSmall(end));
    }
    out[offset..end].copy_from_slice(data);
    Ok((out, end))
}

/// Fail generation if more than `limit` bytes were produced so far.
pub fn gen_len_limit(
    buf: (&mut [u8], usize),
    limit: usize,
) -> Result<(&mut [u8], usize), GenError> {
    if buf.1 <= limit {
        Ok(buf)
    } else {
        Err(GenError::InvalidOffset)
    }
}

/// Unconditional generation failure with a custom code.
pub fn gen_error(_buf: (&mut [u8], usize), code: u32) -> Result<(&mut [u8], usize), GenError> {
    Err(GenError::CustomError(code))
}

/// Helper backing [`encode_decode_test`]: encodes `value`, decodes it back
/// and checks that the result is byte-identical to the origin.
pub fn assert_encode_decode_round_trip<T>(value: T)
where
    T: FromBytes + ToBytes + PartialEq + std::fmt::Debug,
{
    let mut buf = [0; 1024 * 16];
    let (_, size) = value.to_bytes((&mut buf, 0)).unwrap();
    let (rest, decoded_value) = T::from_bytes(&buf[..size]).unwrap();
    assert!(rest.is_empty());
    assert_eq!(decoded_value, value);
}

/** Test that creates a value, encodes it with `ToBytes` and decodes it back
with `FromBytes` checking that the result is byte-identical to the origin.
*/
#[macro_export]
macro_rules! encode_decode_test (
    ($test:ident, $value:expr) => (
        #[test]
        fn $test() {
            $crate::assert_encode_decode_round_trip($value);
        }
    )
);
