/*!
Bencode wire primitives.

The grammar: `i<int>e` integers, `<len>:<bytes>` byte strings, `l…e` lists
and `d…e` dictionaries. Writers emit dictionary keys in ascending byte
order; the reader accepts any order but rejects duplicate keys.
*/

use std::str;

use cookie_factory::GenError;
use nom::bytes::complete::{tag, take, take_while1};
use nom::combinator::{map, recognize, verify};
use nom::error::ErrorKind;
use nom::multi::many_till;
use nom::sequence::terminated;
use nom::IResult;

use crate::gen_put_slice;

fn is_digit(c: u8) -> bool {
    (b'0'..=b'9').contains(&c)
}

fn parse_decimal(input: &[u8]) -> IResult<&[u8], u64> {
    let (rest, digits) = take_while1(is_digit)(input)?;
    // leading zeros are not canonical bencode
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(nom::Err::Error((input, ErrorKind::Digit)));
    }
    let value = str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(nom::Err::Error((input, ErrorKind::Digit)))?;
    Ok((rest, value))
}

/// Parse a bencoded unsigned integer: `i<digits>e`.
pub fn bencode_int(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, _) = tag(&b"i"[..])(input)?;
    let (input, value) = parse_decimal(input)?;
    let (input, _) = tag(&b"e"[..])(input)?;
    Ok((input, value))
}

/// Parse a bencoded byte string: `<len>:<bytes>`.
pub fn bencode_bytes(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = parse_decimal(input)?;
    let (input, _) = tag(&b":"[..])(input)?;
    take(len as usize)(input)
}

/// Parse a specific dictionary key token.
pub fn bencode_key(key: &'static str) -> impl Fn(&[u8]) -> IResult<&[u8], ()> {
    move |input| map(verify(bencode_bytes, |k: &[u8]| k == key.as_bytes()), |_| ())(input)
}

/// Parse the start of a dictionary.
pub fn bencode_dict_start(input: &[u8]) -> IResult<&[u8], ()> {
    map(tag(&b"d"[..]), |_| ())(input)
}

/// Parse the terminator of a dictionary or list.
pub fn bencode_end(input: &[u8]) -> IResult<&[u8], ()> {
    map(tag(&b"e"[..]), |_| ())(input)
}

/// Parse a bencoded list whose elements parse with `f`.
pub fn bencode_list<'a, O, F>(f: F) -> impl Fn(&'a [u8]) -> IResult<&'a [u8], Vec<O>>
where
    F: Fn(&'a [u8]) -> IResult<&'a [u8], O> + Copy,
{
    move |input| {
        let (input, _) = tag(&b"l"[..])(input)?;
        map(many_till(f, tag(&b"e"[..])), |(items, _)| items)(input)
    }
}

/// Recognize exactly one bencoded value of any kind, returning its raw bytes.
pub fn bencode_raw_value(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(skip_value)(input)
}

fn skip_value(input: &[u8]) -> IResult<&[u8], ()> {
    match input.first() {
        Some(b'i') => map(bencode_int, |_| ())(input),
        Some(b'l') => {
            let (input, _) = tag(&b"l"[..])(input)?;
            map(many_till(skip_value, tag(&b"e"[..])), |_| ())(input)
        }
        Some(b'd') => {
            let (input, _) = tag(&b"d"[..])(input)?;
            map(
                many_till(terminated(bencode_bytes, skip_value), tag(&b"e"[..])),
                |_| (),
            )(input)
        }
        Some(c) if is_digit(*c) => map(bencode_bytes, |_| ())(input),
        _ => Err(nom::Err::Error((input, ErrorKind::Char))),
    }
}

/** Read a bencoded dictionary, handing every `(key, raw value)` pair to the
visitor. The visitor returns `true` to continue; returning `false` skips the
remaining entries. Duplicate keys fail the parse.

This is the generic reader used where arbitrary key order must be accepted;
fixed-layout messages parse their keys in canonical order directly.
*/
pub fn read_dict<'a, F>(input: &'a [u8], mut visit: F) -> IResult<&'a [u8], ()>
where
    F: FnMut(&'a [u8], &'a [u8]) -> bool,
{
    let (mut input, _) = tag(&b"d"[..])(input)?;
    let mut seen: Vec<&[u8]> = Vec::new();
    let mut stopped = false;
    loop {
        if let Ok((rest, _)) = tag::<_, _, (&[u8], ErrorKind)>(&b"e"[..])(input) {
            return Ok((rest, ()));
        }
        let (rest, key) = bencode_bytes(input)?;
        let (rest, value) = bencode_raw_value(rest)?;
        if seen.contains(&key) {
            return Err(nom::Err::Error((input, ErrorKind::Verify)));
        }
        seen.push(key);
        if !stopped && !visit(key, value) {
            stopped = true;
        }
        input = rest;
    }
}

/// Write a bencoded unsigned integer.
pub fn gen_bencode_int(
    buf: (&mut [u8], usize),
    n: u64,
) -> Result<(&mut [u8], usize), GenError> {
    let s = format!("i{}e", n);
    gen_put_slice(buf, s.as_bytes())
}

/// Write a bencoded byte string.
pub fn gen_bencode_bytes<'a>(
    buf: (&'a mut [u8], usize),
    bytes: &[u8],
) -> Result<(&'a mut [u8], usize), GenError> {
    let prefix = format!("{}:", bytes.len());
    let buf = gen_put_slice(buf, prefix.as_bytes())?;
    gen_put_slice(buf, bytes)
}

/// Write a one-letter dictionary key token.
pub fn gen_bencode_key<'a>(
    buf: (&'a mut [u8], usize),
    key: &str,
) -> Result<(&'a mut [u8], usize), GenError> {
    gen_bencode_bytes(buf, key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        let mut buf = [0; 32];
        let (_, size) = gen_bencode_int((&mut buf, 0), 1234567890).unwrap();
        let (rest, value) = bencode_int(&buf[..size]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(value, 1234567890);
    }

    #[test]
    fn int_rejects_truncated() {
        assert!(bencode_int(b"i123").is_err());
        assert!(bencode_int(b"i").is_err());
        assert!(bencode_int(b"123e").is_err());
    }

    #[test]
    fn int_rejects_overflow() {
        assert!(bencode_int(b"i99999999999999999999999999e").is_err());
    }

    #[test]
    fn int_rejects_leading_zero() {
        assert!(bencode_int(b"i0123e").is_err());
        assert!(bencode_int(b"i0e").is_ok());
    }

    #[test]
    fn bytes_round_trip() {
        let mut buf = [0; 32];
        let (_, size) = gen_bencode_bytes((&mut buf, 0), b"spam").unwrap();
        assert_eq!(&buf[..size], b"4:spam");
        let (rest, value) = bencode_bytes(&buf[..size]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(value, b"spam");
    }

    #[test]
    fn bytes_rejects_bad_length() {
        assert!(bencode_bytes(b"4:spa").is_err());
        assert!(bencode_bytes(b":spam").is_err());
    }

    #[test]
    fn list_of_ints() {
        let (rest, items) = bencode_list(bencode_int)(b"li1ei2ei3ee").unwrap();
        assert!(rest.is_empty());
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn raw_value_spans_nested() {
        let input = b"d1:ali1e2:abe1:bi2ee tail";
        let (rest, raw) = bencode_raw_value(&input[..]).unwrap();
        assert_eq!(rest, b" tail");
        assert_eq!(raw, &input[..input.len() - 5]);
    }

    #[test]
    fn read_dict_visits_all_entries() {
        let mut keys = Vec::new();
        let (rest, _) = read_dict(b"d1:ai1e1:b4:spam1:ci3ee", |k, _| {
            keys.push(k.to_vec());
            true
        })
        .unwrap();
        assert!(rest.is_empty());
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn read_dict_rejects_duplicate_keys() {
        assert!(read_dict(b"d1:ai1e1:ai2ee", |_, _| true).is_err());
    }

    #[test]
    fn read_dict_stop_skips_rest() {
        let mut count = 0;
        let (rest, _) = read_dict(b"d1:ai1e1:bi2e1:ci3ee", |_, _| {
            count += 1;
            false
        })
        .unwrap();
        assert!(rest.is_empty());
        assert_eq!(count, 1);
    }
}
