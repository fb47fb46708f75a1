//! Base16 and base64 textual encodings.

use crate::PackError;

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Encode bytes as lowercase hex.
pub fn base16_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for &b in data {
        out.push(HEX_DIGITS[(b >> 4) as usize] as char);
        out.push(HEX_DIGITS[(b & 0xF) as usize] as char);
    }
    out
}

/// Decode hex (either case) back to bytes.
pub fn base16_decode(text: &str) -> Result<Vec<u8>, PackError> {
    let bytes = text.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(PackError::BadLength { length: bytes.len() });
    }
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for (index, pair) in bytes.chunks_exact(2).enumerate() {
        let high = hex_value(pair[0]).ok_or(PackError::InvalidCharacter {
            character: pair[0] as char,
            position: index * 2,
        })?;
        let low = hex_value(pair[1]).ok_or(PackError::InvalidCharacter {
            character: pair[1] as char,
            position: index * 2 + 1,
        })?;
        out.push((high << 4) | low);
    }
    Ok(out)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Encode bytes as standard base64 with `=` padding.
pub fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    let mut chunks = data.chunks_exact(3);
    for chunk in &mut chunks {
        let word = (u32::from(chunk[0]) << 16) | (u32::from(chunk[1]) << 8) | u32::from(chunk[2]);
        out.push(BASE64_ALPHABET[(word >> 18) as usize & 0x3F] as char);
        out.push(BASE64_ALPHABET[(word >> 12) as usize & 0x3F] as char);
        out.push(BASE64_ALPHABET[(word >> 6) as usize & 0x3F] as char);
        out.push(BASE64_ALPHABET[word as usize & 0x3F] as char);
    }
    match chunks.remainder() {
        [a] => {
            let word = u32::from(*a) << 16;
            out.push(BASE64_ALPHABET[(word >> 18) as usize & 0x3F] as char);
            out.push(BASE64_ALPHABET[(word >> 12) as usize & 0x3F] as char);
            out.push('=');
            out.push('=');
        }
        [a, b] => {
            let word = (u32::from(*a) << 16) | (u32::from(*b) << 8);
            out.push(BASE64_ALPHABET[(word >> 18) as usize & 0x3F] as char);
            out.push(BASE64_ALPHABET[(word >> 12) as usize & 0x3F] as char);
            out.push(BASE64_ALPHABET[(word >> 6) as usize & 0x3F] as char);
            out.push('=');
        }
        _ => {}
    }
    out
}

/// Decode standard base64, tolerating absent padding.
pub fn base64_decode(text: &str) -> Result<Vec<u8>, PackError> {
    let trimmed = text.trim_end_matches('=');
    let bytes = trimmed.as_bytes();
    if bytes.len() % 4 == 1 {
        return Err(PackError::BadLength { length: text.len() });
    }

    let mut out = Vec::with_capacity(bytes.len() * 3 / 4);
    let mut word: u32 = 0;
    let mut bits = 0u32;
    for (position, &c) in bytes.iter().enumerate() {
        let value = base64_value(c).ok_or(PackError::InvalidCharacter {
            character: c as char,
            position,
        })?;
        word = (word << 6) | u32::from(value);
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((word >> bits) as u8);
        }
    }
    Ok(out)
}

fn base64_value(c: u8) -> Option<u8> {
    match c {
        b'A'..=b'Z' => Some(c - b'A'),
        b'a'..=b'z' => Some(c - b'a' + 26),
        b'0'..=b'9' => Some(c - b'0' + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn base16_round_trip() {
        let data = [0u8, 1, 0xAB, 0xFF, 0x10];
        let text = base16_encode(&data);
        assert_eq!(text, "0001abff10");
        assert_eq!(base16_decode(&text).expect("decode"), data);
        assert_eq!(base16_decode("ABFF").expect("upper"), vec![0xAB, 0xFF]);
    }

    #[test]
    fn base16_rejects_bad_input() {
        assert!(matches!(base16_decode("abc"), Err(PackError::BadLength { .. })));
        assert!(matches!(
            base16_decode("zz"),
            Err(PackError::InvalidCharacter { .. })
        ));
    }

    #[test]
    fn base64_known_vectors() {
        assert_eq!(base64_encode(b""), "");
        assert_eq!(base64_encode(b"f"), "Zg==");
        assert_eq!(base64_encode(b"fo"), "Zm8=");
        assert_eq!(base64_encode(b"foo"), "Zm9v");
        assert_eq!(base64_encode(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn base64_decode_accepts_padded_and_unpadded() {
        assert_eq!(base64_decode("Zg==").expect("padded"), b"f");
        assert_eq!(base64_decode("Zg").expect("unpadded"), b"f");
        assert_eq!(base64_decode("Zm9vYmFy").expect("full"), b"foobar");
    }

    #[test]
    fn base64_rejects_bad_input() {
        assert!(matches!(
            base64_decode("Z!=="),
            Err(PackError::InvalidCharacter { .. })
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn base16_identity(data in proptest::collection::vec(any::<u8>(), 0..200)) {
                prop_assert_eq!(base16_decode(&base16_encode(&data)).expect("decode"), data);
            }

            #[test]
            fn base64_identity(data in proptest::collection::vec(any::<u8>(), 0..200)) {
                prop_assert_eq!(base64_decode(&base64_encode(&data)).expect("decode"), data);
            }
        }
    }
}
