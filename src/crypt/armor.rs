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

//! Recognising ASCII-armored OpenPGP blocks in text.

use std::borrow::Cow;

use super::flags::SecurityFlags;
use super::ops::is_application_pgp;
use crate::mime::content_encoding::{decode_transfer, recode};
use crate::mime::model::*;
use crate::mime::state::State;

const BEGIN_PGP: &[u8] = b"-----BEGIN PGP ";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Armor {
    Message,
    Signed,
    PublicKey,
}

impl Armor {
    /// The kind of block a `-----BEGIN PGP ` line opens.
    pub fn classify(line: &[u8]) -> Option<Self> {
        let rest = trim_eol(line.strip_prefix(BEGIN_PGP)?);
        match rest {
            b"MESSAGE-----" => Some(Armor::Message),
            b"SIGNED MESSAGE-----" => Some(Armor::Signed),
            b"PUBLIC KEY BLOCK-----" => Some(Armor::PublicKey),
            _ => None,
        }
    }

    pub fn is_end(self, line: &[u8]) -> bool {
        let line = trim_eol(line);
        match self {
            Armor::Message => b"-----END PGP MESSAGE-----" == line,
            Armor::Signed | Armor::PublicKey => {
                b"-----END PGP SIGNATURE-----" == line
                    || b"-----END PGP PUBLIC KEY BLOCK-----" == line
            }
        }
    }
}

pub fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

pub fn put_prefixed_line(state: &mut State, line: &[u8]) {
    if let Some(prefix) = state.prefix.clone() {
        state.puts(&prefix);
    }
    state.put_bytes(line);
}

/// Write the text of a clearsigned block, without its armor and with dash
/// escaping undone.
pub fn copy_clearsigned(
    block: &[u8],
    state: &mut State,
    charset: &str,
    to: &str,
) {
    let text = recode(block, charset, to);
    let mut armor_header = true;
    for line in text.split_inclusive(|&c| b'\n' == c) {
        if b"-----BEGIN PGP SIGNATURE-----" == trim_eol(line) {
            break;
        }
        if armor_header {
            if trim_eol(line).iter().all(u8::is_ascii_whitespace) {
                armor_header = false;
            }
            continue;
        }

        let line = line.strip_prefix(b"- ").unwrap_or(line);
        put_prefixed_line(state, line);
    }
}

/// Look for inline PGP in `b` (and, unless `just_one`, its children),
/// marking the parts where some is found. Returns whether any was.
pub fn mark_traditional(source: &[u8], b: &mut Body, just_one: bool) -> bool {
    if b.is_multipart() && !just_one {
        let mut any = false;
        for part in &mut b.parts {
            any |= mark_traditional(source, part, false);
        }
        return any;
    }

    if !b.is_text() {
        return false;
    }
    if !is_application_pgp(b).is_empty() {
        return true;
    }

    let data = match b.content {
        Some(ref c) => Cow::Borrowed(&c[..]),
        None => decode_transfer(b.encoding, b.raw(source)),
    };

    let mut kind = SecurityFlags::empty();
    for line in data.split(|&c| b'\n' == c) {
        match Armor::classify(line) {
            Some(Armor::Message) => kind |= SecurityFlags::ENCRYPT,
            Some(Armor::Signed) => kind |= SecurityFlags::SIGN,
            Some(Armor::PublicKey) => kind |= SecurityFlags::KEYBLOCK,
            None => (),
        }
    }

    if kind.is_empty() {
        return false;
    }

    b.params.set("format", "fixed");
    b.params.set(
        "x-action",
        if kind.contains(SecurityFlags::ENCRYPT) {
            "pgp-encrypted"
        } else if kind.contains(SecurityFlags::SIGN) {
            "pgp-signed"
        } else {
            "pgp-keys"
        },
    );
    true
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;
    use crate::mime::state::StateFlags;

    #[test]
    fn clearsigned_text_is_dash_unescaped() {
        let block = b"-----BEGIN PGP SIGNED MESSAGE-----\n\
                      Hash: SHA256\n\
                      \n\
                      before\n\
                      - -----BEGIN ANYTHING-----\n\
                      - - not a list\n\
                      after\n\
                      -----BEGIN PGP SIGNATURE-----\n\
                      AAAA\n\
                      -----END PGP SIGNATURE-----\n";
        let mut state = State::new(Rc::from(&b""[..]), StateFlags::empty());
        copy_clearsigned(block, &mut state, "utf-8", "utf-8");
        assert_eq!(
            "before\n\
             -----BEGIN ANYTHING-----\n\
             - not a list\n\
             after\n",
            state.output_text()
        );
        assert_eq!(None, Armor::classify(b"- -----BEGIN PGP MESSAGE-----\n"));
    }

    #[test]
    fn traditional_detection() {
        let mut b = Body::new_multipart(
            "mixed",
            vec![
                Body::new_leaf(BodyType::Text, "plain", "nothing here\n"),
                Body::new_leaf(
                    BodyType::Text,
                    "plain",
                    "x\n-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA1\n",
                ),
                Body::new_leaf(
                    BodyType::Text,
                    "plain",
                    "-----BEGIN PGP PUBLIC KEY BLOCK-----\n\
                     -----BEGIN PGP MESSAGE-----\n",
                ),
            ],
        );
        assert!(mark_traditional(b"", &mut b, false));
        assert_eq!(None, b.parts[0].param("x-action"));
        assert_eq!(Some("pgp-signed"), b.parts[1].param("x-action"));
        assert_eq!(Some("fixed"), b.parts[1].param("format"));
        assert_eq!(Some("pgp-encrypted"), b.parts[2].param("x-action"));

        // Only the top level when asked for just one
        let mut b = Body::new_multipart("mixed", vec![]);
        assert!(!mark_traditional(b"", &mut b, true));
    }
}
