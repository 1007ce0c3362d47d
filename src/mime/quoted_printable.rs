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

//! RFC 2045 quoted-printable.

use std::borrow::Cow;

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decodes quoted-printable encoding.
///
/// Encoded bytes and soft line endings are both handled, the latter by
/// discarding. UNIX line endings are handled as well as DOS line endings,
/// and whitespace between a soft-break `=` and the line ending is ignored.
///
/// This never fails. Invalid sequences are passed through untransformed, as
/// are 8-bit characters.
pub fn qp_decode(s: &[u8]) -> Cow<'_, [u8]> {
    if !s.contains(&b'=') {
        return Cow::Borrowed(s);
    }

    let mut out = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        let b = s[i];
        if b'=' != b {
            out.push(b);
            i += 1;
            continue;
        }

        // Soft line break, possibly with trailing whitespace
        let mut j = i + 1;
        while j < s.len() && (b' ' == s[j] || b'\t' == s[j]) {
            j += 1;
        }
        if j < s.len() && b'\n' == s[j] {
            i = j + 1;
            continue;
        }
        if j + 1 < s.len() && b'\r' == s[j] && b'\n' == s[j + 1] {
            i = j + 2;
            continue;
        }
        if j == s.len() {
            // "=" at the very end is a soft break with no line ending
            i = j;
            continue;
        }

        match (
            s.get(i + 1).copied().and_then(hex_value),
            s.get(i + 2).copied().and_then(hex_value),
        ) {
            (Some(hi), Some(lo)) => {
                out.push(hi << 4 | lo);
                i += 3;
            }
            _ => {
                out.push(b'=');
                i += 1;
            }
        }
    }

    Cow::Owned(out)
}

const MAX_LINE: usize = 76;

/// Encode `data` as quoted-printable.
///
/// In text mode, line endings (LF or CRLF) are preserved as hard line breaks
/// written as LF. In binary mode, every CR and LF is encoded.
///
/// Besides what RFC 2045 requires, a `From ` at the start of a line and a
/// lone `.` line are encoded, since both get mangled in transit by some
/// agents, which would break signatures.
pub fn qp_encode(data: &[u8], text: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    let mut line_len = 0;

    let lines: Vec<&[u8]> = if text {
        data.split(|&b| b'\n' == b).collect()
    } else {
        vec![data]
    };

    for (line_ix, line) in lines.iter().enumerate() {
        let mut line = *line;
        if text {
            if line_ix + 1 == lines.len() && line.is_empty() {
                break;
            }
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
        }

        for (ix, &b) in line.iter().enumerate() {
            let at_end = ix + 1 == line.len();
            let must_encode = match b {
                b'=' => true,
                b' ' | b'\t' => at_end,
                b'F' => 0 == line_len && line[ix..].starts_with(b"From "),
                b'.' => 0 == line_len && at_end,
                0x21..=0x7E => false,
                _ => true,
            };

            let width = if must_encode { 3 } else { 1 };
            // Leave room for the soft break, unless this is the last byte
            let limit = if at_end { MAX_LINE } else { MAX_LINE - 1 };
            if line_len + width > limit {
                out.extend_from_slice(b"=\n");
                line_len = 0;
            }

            if must_encode {
                out.extend_from_slice(format!("={:02X}", b).as_bytes());
                line_len += 3;
            } else {
                out.push(b);
                line_len += 1;
            }
        }

        if text && line_ix + 1 < lines.len() {
            out.push(b'\n');
            line_len = 0;
        }
    }

    out
}
