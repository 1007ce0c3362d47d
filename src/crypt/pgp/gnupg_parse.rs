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

//! Parser for the `--with-colons` key listings GnuPG produces.

use std::rc::Rc;

use chrono::prelude::*;
use log::debug;

use crate::crypt::flags::KeyFlags;
use crate::crypt::key::{KeyInfo, KeyRef, UserId, Validity};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Record {
    Pub,
    Sub,
    Sec,
    Ssb,
    Uid,
    Fpr,
}

impl Record {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "pub" => Some(Record::Pub),
            "sub" => Some(Record::Sub),
            "sec" => Some(Record::Sec),
            "ssb" => Some(Record::Ssb),
            "uid" => Some(Record::Uid),
            "fpr" => Some(Record::Fpr),
            _ => None,
        }
    }

    fn is_subkey(self) -> bool {
        Record::Sub == self || Record::Ssb == self
    }

    fn is_secret(self) -> bool {
        Record::Sec == self || Record::Ssb == self
    }
}

/// The name GnuPG uses for a public key algorithm number.
pub fn algorithm_name(num: u32) -> &'static str {
    match num {
        1 | 2 | 3 => "RSA",
        16 | 20 => "ElG",
        17 => "DSA",
        18 => "ECDH",
        19 => "ECDSA",
        22 => "EdDSA",
        _ => "unk",
    }
}

/// Undo the `\xHH` escaping GnuPG applies to user ids.
fn unescape_uid(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if b'\\' == bytes[i]
            && i + 3 < bytes.len()
            && b'x' == bytes[i + 1]
            && bytes[i + 2].is_ascii_hexdigit()
            && bytes[i + 3].is_ascii_hexdigit()
        {
            let hex = &s[i + 2..i + 4];
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Creation time, either seconds since the epoch or (before GnuPG 2.0.10)
/// `yyyy-mm-dd`.
fn parse_created(s: &str) -> Option<DateTime<Utc>> {
    if s.contains('-') {
        let date = NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok()?;
        Some(DateTime::from_utc(date.and_hms(12, 0, 0), Utc))
    } else {
        let secs = s.parse::<i64>().ok()?;
        Some(Utc.timestamp(secs, 0))
    }
}

struct Builder {
    key: KeyInfo,
    is_subkey: bool,
}

impl Builder {
    fn finish(
        mut self,
        principal: &mut Option<Rc<KeyInfo>>,
        attach: &mut dyn FnMut(&KeyInfo) -> Option<KeyRef>,
    ) -> Rc<KeyInfo> {
        let is_subkey = self.is_subkey;
        self.key.backend_ref = attach(&self.key);
        let key = Rc::new(self.key);
        if !is_subkey {
            *principal = Some(Rc::clone(&key));
        }
        key
    }
}

/// Parse a key listing into keys, principal keys before their subkeys.
///
/// With `ignore_subkeys`, subkeys do not become keys of their own; a
/// usable subkey lends its capabilities to its principal instead.
/// Otherwise, each subkey carries the user ids of its principal.
pub fn parse_key_listing(
    data: &[u8],
    ignore_subkeys: bool,
) -> Vec<Rc<KeyInfo>> {
    parse_key_listing_with(data, ignore_subkeys, &mut |_| None)
}

/// Like `parse_key_listing`, giving each key the handle `attach` returns.
pub fn parse_key_listing_with(
    data: &[u8],
    ignore_subkeys: bool,
    attach: &mut dyn FnMut(&KeyInfo) -> Option<KeyRef>,
) -> Vec<Rc<KeyInfo>> {
    let text = String::from_utf8_lossy(data);
    let mut keys = Vec::new();
    let mut principal: Option<Rc<KeyInfo>> = None;
    let mut current: Option<Builder> = None;

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(':').collect();
        let record = match Record::parse(fields[0]) {
            Some(r) => r,
            None => continue,
        };
        let field = |n: usize| fields.get(n - 1).copied().unwrap_or("");
        let merging = record.is_subkey() && ignore_subkeys;

        if Record::Fpr == record {
            // A subkey fingerprint must not replace the principal's
            if let Some(ref mut b) = current {
                if b.key.fingerprint.is_none() && !field(10).is_empty() {
                    b.key.fingerprint = Some(field(10).to_owned());
                }
            }
            continue;
        }

        let mut trust = Validity::Unknown;
        let mut flags = KeyFlags::empty();
        match field(2).chars().next() {
            Some('d') => flags |= KeyFlags::DISABLED,
            Some('e') => flags |= KeyFlags::EXPIRED,
            Some('r') => flags |= KeyFlags::REVOKED,
            Some('f') => trust = Validity::Full,
            Some('u') => trust = Validity::Ultimate,
            Some('m') => trust = Validity::Marginal,
            Some('n') => trust = Validity::Never,
            _ => (),
        }

        let mut caps = KeyFlags::empty();
        for c in field(12).chars() {
            match c {
                'D' => caps |= KeyFlags::DISABLED,
                'e' => caps |= KeyFlags::CANENCRYPT,
                's' => caps |= KeyFlags::CANSIGN,
                _ => (),
            }
        }

        if Record::Uid == record {
            let b = match current {
                Some(ref mut b) => b,
                None => {
                    debug!("uid record without a key");
                    continue;
                }
            };
            let addr = unescape_uid(field(10));
            if addr.is_empty() {
                continue;
            }
            if addr.contains("ENCR") {
                b.key.flags |= KeyFlags::PREFER_ENCRYPTION;
            }
            if addr.contains("SIGN") {
                b.key.flags |= KeyFlags::PREFER_SIGNING;
            }
            b.key.user_ids.push(UserId {
                addr,
                validity: trust,
                flags,
            });
            continue;
        }

        if merging {
            let b = match current {
                Some(ref mut b) => b,
                None => continue,
            };
            if !(flags | caps).intersects(KeyFlags::CANTUSE) {
                b.key.flags |= caps;
            }
            continue;
        }

        if let Some(b) = current.take() {
            keys.push(b.finish(&mut principal, attach));
        }

        let num_alg = field(4).parse::<u32>().unwrap_or(0);
        let mut key = KeyInfo {
            key_id: field(5).to_owned(),
            algorithm: algorithm_name(num_alg).to_owned(),
            num_alg,
            key_len: field(3).parse().unwrap_or(0),
            gen_time: parse_created(field(6)),
            flags: flags | caps,
            validity: trust,
            ..KeyInfo::default()
        };
        if record.is_secret() {
            key.flags |= KeyFlags::SECRET;
        }

        if record.is_subkey() {
            key.flags |= KeyFlags::SUBKEY;
            if let Some(ref p) = principal {
                key.parent = Some(Rc::downgrade(p));
                key.user_ids = p.user_ids.clone();
            }
        } else {
            principal = None;
            // gpg puts the primary user id on the pub line in old versions
            let name = unescape_uid(field(10));
            if !name.is_empty() {
                key.user_ids.push(UserId {
                    addr: name,
                    validity: trust,
                    flags: KeyFlags::empty(),
                });
            }
        }

        current = Some(Builder {
            key,
            is_subkey: record.is_subkey(),
        });
    }

    if let Some(b) = current.take() {
        keys.push(b.finish(&mut principal, attach));
    }

    keys
}
