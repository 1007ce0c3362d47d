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

//! Working out the `micalg` parameter of a PGP/MIME signature.
//!
//! GnuPG does not tell us which digest it used, so we look at the signature
//! packet itself.

use log::debug;

const DEFAULT_MICALG: &str = "pgp-sha256";

/// The name RFC 3156 gives a hash algorithm number.
fn hash_name(alg: u8) -> Option<&'static str> {
    match alg {
        1 => Some("md5"),
        2 => Some("sha1"),
        3 => Some("ripemd160"),
        8 => Some("sha256"),
        9 => Some("sha384"),
        10 => Some("sha512"),
        11 => Some("sha224"),
        _ => None,
    }
}

/// The `micalg` for an armored detached signature.
pub fn find_micalg(armored: &[u8]) -> String {
    let text = String::from_utf8_lossy(armored);

    // Clearsigned output says so in the armor header
    for line in text.lines() {
        if let Some(hash) = line.strip_prefix("Hash: ") {
            if let Some(first) = hash.split(',').next() {
                return format!("pgp-{}", first.trim().to_ascii_lowercase());
            }
        }
    }

    match dearmor(&text)
        .as_deref()
        .and_then(signature_hash_algorithm)
        .and_then(hash_name)
    {
        Some(name) => format!("pgp-{}", name),
        None => {
            debug!("Could not determine signature digest, assuming SHA-256");
            DEFAULT_MICALG.to_owned()
        }
    }
}

/// The binary content of the first armor block in `text`.
fn dearmor(text: &str) -> Option<Vec<u8>> {
    let mut lines =
        text.lines().skip_while(|l| !l.starts_with("-----BEGIN PGP"));
    lines.next()?;

    let mut b64 = String::new();
    let mut in_headers = true;
    for line in lines {
        let line = line.trim_end();
        if in_headers {
            if line.is_empty() {
                in_headers = false;
            } else if !line.contains(": ") {
                // No armor headers at all
                in_headers = false;
                b64.push_str(line);
            }
            continue;
        }

        if line.starts_with('=') || line.starts_with("-----END") {
            break;
        }
        b64.push_str(line);
    }

    base64::decode(&b64).ok()
}

/// The hash algorithm field of the signature packet at the start of `data`.
fn signature_hash_algorithm(data: &[u8]) -> Option<u8> {
    let ctb = *data.first()?;
    if 0 == ctb & 0x80 {
        return None;
    }

    let (tag, body_start) = if 0 != ctb & 0x40 {
        // New format
        let tag = ctb & 0x3f;
        let first = *data.get(1)?;
        let len_len = match first {
            0..=191 => 1,
            192..=223 => 2,
            255 => 5,
            // Partial lengths only occur in data packets
            _ => 1,
        };
        (tag, 1 + len_len)
    } else {
        let tag = (ctb >> 2) & 0x0f;
        let len_len = match ctb & 0x03 {
            0 => 1,
            1 => 2,
            2 => 4,
            _ => 0,
        };
        (tag, 1 + len_len)
    };

    if 2 != tag {
        return None;
    }

    let body = data.get(body_start..)?;
    match *body.first()? {
        3 => body.get(16).copied(),
        4 | 5 => body.get(3).copied(),
        _ => None,
    }
}
