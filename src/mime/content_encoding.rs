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

//! Content transfer encodings and character sets.

use std::borrow::Cow;

use log::warn;

use super::model::Encoding;
use super::quoted_printable::{qp_decode, qp_encode};

/// Undo the transfer encoding of a part's payload.
///
/// Decoding is lenient: invalid base64 characters are skipped and invalid
/// quoted-printable sequences pass through.
pub fn decode_transfer(encoding: Encoding, data: &[u8]) -> Cow<'_, [u8]> {
    match encoding {
        Encoding::SevenBit
        | Encoding::EightBit
        | Encoding::Binary
        | Encoding::Other => Cow::Borrowed(data),
        Encoding::QuotedPrintable => qp_decode(data),
        Encoding::Base64 => Cow::Owned(decode_base64_lenient(data)),
        Encoding::UuEncoded => Cow::Owned(uudecode(data)),
    }
}

fn decode_base64_lenient(data: &[u8]) -> Vec<u8> {
    let mut clean: Vec<u8> = data
        .iter()
        .copied()
        .filter(|&b| b.is_ascii_alphanumeric() || b'+' == b || b'/' == b)
        .collect();
    // Padding carries no information; dropping it lets truncated input decode
    // as far as it goes.
    let usable = match clean.len() % 4 {
        1 => clean.len() - 1,
        _ => clean.len(),
    };
    clean.truncate(usable);

    let mut out = Vec::with_capacity(usable / 4 * 3 + 2);
    if let Err(e) =
        base64::decode_config_buf(&clean, base64::STANDARD_NO_PAD, &mut out)
    {
        // Salvage the complete quanta
        warn!("Invalid base64 content: {}", e);
        out.clear();
        let _ = base64::decode_config_buf(
            &clean[..usable / 4 * 4],
            base64::STANDARD_NO_PAD,
            &mut out,
        );
    }
    out
}

/// Decode the first `begin ... end` block of uuencoded data.
pub fn uudecode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut lines = data.split(|&b| b'\n' == b);
    if !lines.any(|l| l.starts_with(b"begin ")) {
        return out;
    }

    for line in lines {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.starts_with(b"end") {
            break;
        }
        let (len_char, rest) = match line.split_first() {
            Some((&len_char, rest)) => (len_char, rest),
            None => continue,
        };
        let len = usize::from(len_char.wrapping_sub(b' ') & 0x3F);
        if 0 == len {
            continue;
        }

        let mut decoded = Vec::with_capacity(len + 3);
        for chunk in rest.chunks(4) {
            let mut v = [0u8; 4];
            for (dst, &src) in v.iter_mut().zip(chunk) {
                *dst = src.wrapping_sub(b' ') & 0x3F;
            }
            decoded.push(v[0] << 2 | v[1] >> 4);
            decoded.push(v[1] << 4 | v[2] >> 2);
            decoded.push(v[2] << 6 | v[3]);
        }
        decoded.truncate(len);
        out.extend_from_slice(&decoded);
    }
    out
}

/// Apply a transfer encoding to a decoded payload.
///
/// `text` selects line-oriented quoted-printable encoding.
pub fn encode_transfer(encoding: Encoding, data: &[u8], text: bool) -> Vec<u8> {
    match encoding {
        Encoding::QuotedPrintable => qp_encode(data, text),
        Encoding::Base64 => encode_base64_lines(data),
        _ => data.to_vec(),
    }
}

/// Base64 with LF line breaks every 76 characters.
pub fn encode_base64_lines(data: &[u8]) -> Vec<u8> {
    let encoded = base64::encode(data);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / 76 + 1);
    for chunk in encoded.as_bytes().chunks(76) {
        out.extend_from_slice(chunk);
        out.push(b'\n');
    }
    out
}

/// Whether `charset` names UTF-8 (or its subset US-ASCII).
pub fn is_utf8_compatible(charset: &str) -> bool {
    let cs = charset.trim();
    cs.eq_ignore_ascii_case("utf-8")
        || cs.eq_ignore_ascii_case("utf8")
        || cs.eq_ignore_ascii_case("us-ascii")
        || cs.eq_ignore_ascii_case("ascii")
}

/// Whether `charset` names a character set that can be converted from.
pub fn check_charset(charset: &str) -> bool {
    let cs = charset.trim();
    is_utf8_compatible(cs)
        || encoding_rs::Encoding::for_label_no_replacement(cs.as_bytes())
            .is_some()
}

/// Decode `data` in `charset` into a string.
///
/// Unknown charsets are treated as UTF-8; invalid sequences are replaced.
pub fn convert_charset(data: &[u8], charset: &str) -> String {
    if is_utf8_compatible(charset) {
        return String::from_utf8_lossy(data).into_owned();
    }

    match encoding_rs::Encoding::for_label_no_replacement(charset.as_bytes())
    {
        Some(enc) => enc.decode_with_bom_removal(data).0.into_owned(),
        None => String::from_utf8_lossy(data).into_owned(),
    }
}

/// Recode `data` from charset `from` into charset `to`.
pub fn recode(data: &[u8], from: &str, to: &str) -> Vec<u8> {
    let text = convert_charset(data, from);
    encode_charset(&text, to).unwrap_or_else(|| text.into_bytes())
}

/// Encode `text` into `charset`, failing if some character cannot be
/// represented or the charset is unknown.
pub fn encode_charset(text: &str, charset: &str) -> Option<Vec<u8>> {
    let cs = charset.trim();
    if cs.eq_ignore_ascii_case("us-ascii") || cs.eq_ignore_ascii_case("ascii")
    {
        return if text.is_ascii() {
            Some(text.as_bytes().to_vec())
        } else {
            None
        };
    }
    if is_utf8_compatible(cs) {
        return Some(text.as_bytes().to_vec());
    }

    let enc = encoding_rs::Encoding::for_label_no_replacement(cs.as_bytes())?;
    let (out, _, had_errors) = enc.encode(text);
    if had_errors {
        None
    } else {
        Some(out.into_owned())
    }
}

/// Pick the first of `candidates` which can represent `text`.
pub fn choose_charset<'a>(
    text: &str,
    candidates: &'a [String],
) -> Option<&'a str> {
    candidates
        .iter()
        .map(String::as_str)
        .find(|cs| encode_charset(text, cs).is_some())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lenient_base64() {
        assert_eq!(
            b"hello world".to_vec(),
            decode_transfer(Encoding::Base64, b"aGVsbG8g\r\nd29y bGQ=\r\n")
                .into_owned()
        );
        assert_eq!(
            b"hello world".to_vec(),
            decode_transfer(Encoding::Base64, b"aGVsbG8gd29ybGQ").into_owned()
        );
    }

    #[test]
    fn base64_lines_are_wrapped() {
        let encoded = encode_base64_lines(&[0u8; 100]);
        let lines: Vec<&[u8]> = encoded
            .split(|&b| b'\n' == b)
            .filter(|l| !l.is_empty())
            .collect();
        assert_eq!(2, lines.len());
        assert_eq!(76, lines[0].len());
        assert_eq!(
            vec![0u8; 100],
            decode_transfer(Encoding::Base64, &encoded).into_owned()
        );
    }

    #[test]
    fn uuencoded() {
        let data = b"some preamble\n\
                     begin 644 cat.txt\n\
                     #0V%T\n\
                     `\n\
                     end\n";
        assert_eq!(b"Cat".to_vec(), uudecode(data));
        assert!(uudecode(b"no block here").is_empty());
    }

    #[test]
    fn charsets() {
        assert_eq!("fête", convert_charset(b"f\xeate", "ISO-8859-1"));
        assert_eq!("fête", convert_charset("fête".as_bytes(), "utf-8"));
        assert_eq!(
            "f\u{fffd}te",
            convert_charset(b"f\xeate", "x-unknown-charset")
        );
        assert_eq!(
            Some(b"f\xeate".to_vec()),
            encode_charset("fête", "iso-8859-1")
        );
        assert_eq!(None, encode_charset("fête", "us-ascii"));
        assert_eq!(None, encode_charset("日本", "iso-8859-1"));
        assert!(check_charset("ISO-8859-1"));
        assert!(check_charset(" utf8 "));
        assert!(!check_charset("x-unknown-charset"));
        assert!(!check_charset(""));
        assert_eq!(
            b"f\xeate".to_vec(),
            recode("fête".as_bytes(), "utf-8", "iso-8859-1")
        );
    }

    #[test]
    fn charset_choice() {
        let send = vec![
            "us-ascii".to_owned(),
            "iso-8859-1".to_owned(),
            "utf-8".to_owned(),
        ];
        assert_eq!(Some("us-ascii"), choose_charset("plain", &send));
        assert_eq!(Some("iso-8859-1"), choose_charset("café", &send));
        assert_eq!(Some("utf-8"), choose_charset("日本", &send));
    }
}
