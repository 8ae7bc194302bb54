//! Modified UTF-8, the string encoding of class-file constant pools.
//!
//! It differs from UTF-8 in two ways: NUL is written as `C0 80`, and
//! supplementary characters are written as a surrogate pair, each half
//! encoded as a three-byte sequence.

/// Decode modified UTF-8, returning `None` for malformed input.
pub(crate) fn decode(bytes: &[u8]) -> Option<String> {
    if bytes.iter().all(|b| (1..0x80).contains(b)) {
        return String::from_utf8(bytes.to_vec()).ok();
    }

    let mut units = Vec::with_capacity(bytes.len());
    let mut rest = bytes;
    while let Some((&first, tail)) = rest.split_first() {
        let (unit, consumed) = match first {
            0x01..=0x7F => (u16::from(first), 1),
            0xC0..=0xDF => {
                let second = continuation(tail.first())?;
                ((u16::from(first & 0x1F) << 6) | second, 2)
            }
            0xE0..=0xEF => {
                let second = continuation(tail.first())?;
                let third = continuation(tail.get(1))?;
                ((u16::from(first & 0x0F) << 12) | (second << 6) | third, 3)
            }
            _ => return None,
        };
        units.push(unit);
        rest = rest.get(consumed..)?;
    }
    String::from_utf16(&units).ok()
}

fn continuation(byte: Option<&u8>) -> Option<u16> {
    byte.filter(|b| *b & 0xC0 == 0x80).map(|b| u16::from(b & 0x3F))
}

/// Encode `text` as modified UTF-8.
pub(crate) fn encode(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for unit in text.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(low_byte(unit)),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | low_byte(unit >> 6));
                out.push(0x80 | low_byte(unit & 0x3F));
            }
            _ => {
                out.push(0xE0 | low_byte(unit >> 12));
                out.push(0x80 | low_byte((unit >> 6) & 0x3F));
                out.push(0x80 | low_byte(unit & 0x3F));
            }
        }
    }
    out
}

const fn low_byte(value: u16) -> u8 {
    value.to_be_bytes()[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::ascii("com/lib/A", b"com/lib/A".as_slice())]
    #[case::nul("a\0b", b"a\xC0\x80b".as_slice())]
    #[case::two_byte("\u{e9}", b"\xC3\xA9".as_slice())]
    #[case::supplementary("\u{1F600}", b"\xED\xA0\xBD\xED\xB8\x80".as_slice())]
    fn encodes_java_style(#[case] text: &str, #[case] expected: &[u8]) {
        assert_eq!(encode(text), expected);
        assert_eq!(decode(expected).as_deref(), Some(text));
    }

    #[test]
    fn rejects_truncated_sequences() {
        assert_eq!(decode(b"\xE0\x80"), None);
        assert_eq!(decode(b"\x00"), None);
    }
}
