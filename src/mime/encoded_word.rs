//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailcrypt.
//
// Mailcrypt is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcrypt is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Mailcrypt. If not, see <http://www.gnu.org/licenses/>.

//! RFC 2047 encoded words.

use std::borrow::Cow;

use lazy_static::lazy_static;
use regex::Regex;

use super::content_encoding::convert_charset;
use super::quoted_printable::qp_decode;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"^=\?([!->@-~]*)\?([!->@-~]*)\?([!->@-~]*)\?=$").unwrap();
}

/// Test if `word` (in its entirety) is an RFC 2047 "encoded word".
///
/// If it is, decode it and return its decoded value.
///
/// Returns `None` if it is not an encoded word or if it could not be decoded.
/// The distinction matters to callers since whitespace between adjacent
/// encoded words is deleted.
///
/// Encoded words longer than the 75 characters RFC 2047 permits are
/// accepted, since plenty of agents produce them.
pub fn ew_decode(word: &str) -> Option<Cow<'static, str>> {
    let captures = ENCODED_WORD.captures(word)?;
    let charset = captures.get(1)?.as_str();
    let transfer_encoding = captures.get(2)?.as_str();
    let content = captures.get(3)?.as_str();

    // RFC 2231 allows a language suffix on the charset
    let charset = charset.split('*').next().unwrap_or(charset);

    let raw = match transfer_encoding {
        "q" | "Q" => {
            // _ stands for ASCII space regardless of charset
            let content = content.replace('_', " ");
            qp_decode(content.as_bytes()).into_owned()
        }
        "b" | "B" => base64::decode(content).ok()?,
        _ => return None,
    };

    encoding_rs::Encoding::for_label_no_replacement(charset.as_bytes())?;
    Some(Cow::Owned(convert_charset(&raw, charset)))
}

/// Decode an unstructured header value such as `Subject`.
///
/// Encoded words are decoded; whitespace between two adjacent encoded words
/// is dropped and all other text is kept as-is. Raw 8-bit text is assumed to
/// be UTF-8.
pub fn decode_header_text(value: &[u8]) -> String {
    let text = String::from_utf8_lossy(value);
    if !text.contains("=?") {
        return text.into_owned();
    }

    let mut out = String::with_capacity(text.len());
    let mut pending_space = String::new();
    let mut prev_encoded = false;
    let mut rest = &text[..];
    while !rest.is_empty() {
        let ws_end = rest
            .find(|c: char| !c.is_ascii_whitespace())
            .unwrap_or_else(|| rest.len());
        pending_space.push_str(&rest[..ws_end]);
        rest = &rest[ws_end..];
        if rest.is_empty() {
            break;
        }

        let word_end = rest
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or_else(|| rest.len());
        let word = &rest[..word_end];
        rest = &rest[word_end..];

        match ew_decode(word) {
            Some(decoded) => {
                if !prev_encoded {
                    out.push_str(&pending_space);
                }
                out.push_str(&decoded);
                prev_encoded = true;
            }
            None => {
                out.push_str(&pending_space);
                out.push_str(word);
                prev_encoded = false;
            }
        }
        pending_space.clear();
    }
    out.push_str(&pending_space);
    out
}

/// Encode `text` for use in an unstructured header, if it needs encoding at
/// all.
///
/// Non-ASCII text becomes a sequence of UTF-8 `B` encoded words, each
/// short enough to stay within the RFC 2047 length limit.
pub fn ew_encode(text: &str) -> Cow<'_, str> {
    if text.is_ascii() && !text.contains("=?") {
        return Cow::Borrowed(text);
    }

    // 45 bytes of payload encode to 60 characters; with the 12 bytes of
    // framing this stays below 75.
    const CHUNK: usize = 45;
    let mut words = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + CHUNK).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        words.push(format!(
            "=?UTF-8?B?{}?=",
            base64::encode(&text[start..end])
        ));
        start = end;
    }
    Cow::Owned(words.join(" "))
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_ew_decode() {
        assert_eq!(None, ew_decode("hello world"));

        // Examples from RFC 2047
        assert_eq!(
            "Keith Moore",
            ew_decode("=?US-ASCII?Q?Keith_Moore?=").unwrap()
        );
        assert_eq!("André", ew_decode("=?ISO-8859-1?Q?Andr=E9?=").unwrap());
        assert_eq!(
            "If you can read this yo",
            ew_decode("=?ISO-8859-1?B?SWYgeW91IGNhbiByZWFkIHRoaXMgeW8=?=")
                .unwrap()
        );
        assert_eq!(None, ew_decode("=?x-no-such-charset?Q?abc?="));
        assert_eq!(None, ew_decode("=?utf-8?X?abc?="));
    }

    #[test]
    fn header_text_whitespace_rules() {
        assert_eq!(
            "If you can read this you understand the example.",
            decode_header_text(
                b"=?ISO-8859-1?B?SWYgeW91IGNhbiByZWFkIHRoaXMgeW8=?=\r\n \
                  =?ISO-8859-2?B?dSB1bmRlcnN0YW5kIHRoZSBleGFtcGxlLg==?="
            )
        );
        assert_eq!(
            "(=?ISO-8859-1?Q?a?= b)",
            decode_header_text(b"(=?ISO-8859-1?Q?a?= b)")
        );
        assert_eq!("a b", decode_header_text(b"=?ISO-8859-1?Q?a?= b"));
        assert_eq!("plain  text", decode_header_text(b"plain  text"));
    }

    #[test]
    fn encode_round_trips() {
        assert_eq!("Hello", ew_encode("Hello"));
        let long = "Grüße aus Köln, ".repeat(10);
        let encoded = ew_encode(&long);
        for word in encoded.split(' ') {
            assert!(word.len() <= 75);
        }
        assert_eq!(long, decode_header_text(encoded.as_bytes()));
    }

    proptest! {
        #[test]
        fn ew_decode_never_panics(s in r"=\?.*\?.*\?.*\?=") {
            ew_decode(&s);
        }

        #[test]
        fn ew_encode_decodes_back(s in "\\PC*") {
            let encoded = ew_encode(&s);
            if encoded != s {
                prop_assert_eq!(&s, &decode_header_text(encoded.as_bytes()));
            }
        }
    }
}
