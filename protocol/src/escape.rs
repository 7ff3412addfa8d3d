//! Escaping of attribute tags and values (RFC 2608 section 5).

use crate::SlpError;
use std::fmt::Write;

const RESERVED: &[char] = &['(', ')', ',', '\\', '!', '<', '=', '>', '~'];

/// Characters that may not appear in an attribute tag, escaped or not.
const ILLEGAL_IN_TAG: &[char] = &['*', '_', '\r', '\n', '\t', '\0'];

fn is_reserved(c: char) -> bool {
    RESERVED.contains(&c) || c.is_ascii_control()
}

fn check_tag(s: &str) -> Result<(), SlpError> {
    if s.contains(ILLEGAL_IN_TAG) {
        Err(SlpError::ParameterBad)
    } else {
        Ok(())
    }
}

/// Replaces every reserved character with a `\HH` escape.
pub fn escape(unescaped: &str, is_tag: bool) -> Result<String, SlpError> {
    if is_tag {
        check_tag(unescaped)?;
    }
    let mut escaped = String::with_capacity(unescaped.len());
    for c in unescaped.chars() {
        if is_reserved(c) {
            let _ = write!(escaped, "\\{:02X}", c as u32);
        } else {
            escaped.push(c);
        }
    }
    Ok(escaped)
}

/// Inverse of [`escape`].
pub fn unescape(escaped: &str, is_tag: bool) -> Result<String, SlpError> {
    let mut bytes = Vec::with_capacity(escaped.len());
    let mut input = escaped.bytes();
    while let Some(b) = input.next() {
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        let high = input.next().and_then(hex_value).ok_or(SlpError::ParseError)?;
        let low = input.next().and_then(hex_value).ok_or(SlpError::ParseError)?;
        bytes.push(high << 4 | low);
    }
    let unescaped = String::from_utf8(bytes).map_err(|_| SlpError::ParseError)?;
    if is_tag {
        check_tag(&unescaped)?;
    }
    Ok(unescaped)
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|v| v as u8)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn escape_reserved() {
        let escaped = escape("a,b(c)=d\\e!f<g>h~", false).unwrap();
        assert_eq!(escaped, r"a\2Cb\28c\29\3Dd\5Ce\21f\3Cg\3Eh\7E");
    }

    #[test]
    fn escape_control_characters() {
        assert_eq!(escape("a\u{7f}b\u{1}", false).unwrap(), r"a\7Fb\01");
    }

    #[test]
    fn escape_adjacent_reserved_characters() {
        assert_eq!(escape("~~é(", false).unwrap(), r"\7E\7Eé\28");
        assert_eq!(escape("((", true).unwrap(), r"\28\28");
    }

    #[test]
    fn round_trip() {
        let samples = [
            "",
            "plain",
            "with space",
            "(x=1),(y=2)",
            r"back\slash",
            "ünïcödé ~ <=>",
            "!!!",
        ];
        for sample in samples {
            for is_tag in [false, true] {
                let escaped = escape(sample, is_tag).unwrap();
                assert_eq!(unescape(&escaped, is_tag).unwrap(), sample);
            }
        }
    }

    #[test]
    fn round_trip_non_tag_with_tag_illegal_characters() {
        let sample = "star*under_score\ttab\nline\0nul";
        let escaped = escape(sample, false).unwrap();
        assert_eq!(unescape(&escaped, false).unwrap(), sample);
    }

    #[test]
    fn illegal_tag_characters() {
        for sample in ["a*b", "a_b", "a\rb", "a\nb", "a\tb", "a\0b"] {
            assert_eq!(escape(sample, true), Err(SlpError::ParameterBad), "{:?}", sample);
        }
    }

    #[test]
    fn unescape_illegal_tag_character() {
        assert_eq!(unescape(r"a\2Ab", true), Err(SlpError::ParameterBad));
        assert_eq!(unescape(r"a\2Ab", false).unwrap(), "a*b");
    }

    #[test]
    fn unescape_lowercase_hex() {
        assert_eq!(unescape(r"\2c", false).unwrap(), ",");
    }

    #[test]
    fn unescape_malformed() {
        assert_eq!(unescape(r"abc\", false), Err(SlpError::ParseError));
        assert_eq!(unescape(r"abc\2", false), Err(SlpError::ParseError));
        assert_eq!(unescape(r"abc\zz", false), Err(SlpError::ParseError));
        assert_eq!(unescape(r"\FF", false), Err(SlpError::ParseError));
    }

    #[test]
    fn unescape_multibyte_sequence() {
        assert_eq!(unescape(r"caf\C3\A9", false).unwrap(), "café");
    }
}
