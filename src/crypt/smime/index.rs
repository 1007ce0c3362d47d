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

//! The `.index` files describing the S/MIME keys and certificates on disk.
//!
//! Each line names one key or certificate, with whitespace-separated
//! fields: mailbox, hash, label, issuer, trust and purpose. Files written
//! by older tools lack the last three.

use std::fs;
use std::path::Path;

use log::{debug, warn};

use super::SmimeClassic;
use crate::crypt::flags::KeyFlags;
use crate::crypt::Crypt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmimeKey {
    pub email: String,
    /// The file name of the key or certificate within its directory.
    pub hash: String,
    pub label: String,
    /// The hash of the issuing certificate, or `?` if unknown.
    pub issuer: String,
    pub trust: char,
    pub flags: KeyFlags,
}

impl SmimeKey {
    pub fn is_trusted(&self) -> bool {
        't' == self.trust
    }

    pub fn is_valid(&self) -> bool {
        'u' == self.trust || 'v' == self.trust
    }

    fn trust_text(&self) -> &'static str {
        match self.trust {
            'e' => "Expired",
            'i' => "Invalid",
            'r' => "Revoked",
            't' => "Trusted",
            'u' => "Unverified",
            'v' => "Verified",
            _ => "Unknown",
        }
    }

    /// One line of the key selection menu.
    pub fn describe(&self) -> String {
        format!(
            "{} {} <{}> [{}]",
            self.hash,
            self.label,
            self.email,
            self.trust_text()
        )
    }
}

/// Parse one line of an index file.
pub fn parse_key(line: &str) -> Option<SmimeKey> {
    // Hand-maintained files use tabs; runs of separators are one
    let fields = line
        .split(|c: char| ' ' == c || '\t' == c || '\n' == c || '\r' == c)
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>();

    if fields.len() < 3 {
        return None;
    }

    let flags = match fields.get(5) {
        None => KeyFlags::CANENCRYPT | KeyFlags::CANSIGN,
        Some(purpose) => {
            let mut flags = KeyFlags::empty();
            for c in purpose.chars() {
                match c {
                    'e' => flags |= KeyFlags::CANENCRYPT,
                    's' => flags |= KeyFlags::CANSIGN,
                    _ => (),
                }
            }
            flags
        }
    };

    Some(SmimeKey {
        email: fields[0].to_owned(),
        hash: fields[1].to_owned(),
        label: fields[2].to_owned(),
        issuer: fields.get(3).map_or("?", |s| *s).to_owned(),
        trust: fields
            .get(4)
            .and_then(|s| s.chars().next())
            .unwrap_or('t'),
        flags,
    })
}

/// Every entry of `dir/.index` whose line contains `search`,
/// case-insensitively. An empty `search` matches everything.
pub fn read_index(dir: &Path, search: &str) -> Vec<SmimeKey> {
    let path = dir.join(".index");
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) => {
            warn!("Can't read {}: {}", path.display(), e);
            return vec![];
        }
    };

    let search = search.to_lowercase();
    String::from_utf8_lossy(&data)
        .lines()
        .filter(|l| search.is_empty() || l.to_lowercase().contains(&search))
        .filter_map(parse_key)
        .collect()
}

/// Which of the two directories to look in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Store {
    Certificates,
    Keys,
}

impl SmimeClassic {
    fn candidates(&self, store: Store, search: &str) -> Vec<SmimeKey> {
        let dir = match store {
            Store::Certificates => self.certificates_dir(),
            Store::Keys => self.keys_dir(),
        };
        read_index(&dir, search)
    }

    /// The first entry whose hash is `hash`, without checking abilities or
    /// trust.
    pub(super) fn get_key_by_hash(
        &self,
        hash: &str,
        store: Store,
    ) -> Option<SmimeKey> {
        self.candidates(store, hash)
            .into_iter()
            .find(|k| k.hash.eq_ignore_ascii_case(hash))
    }

    fn select(
        &self,
        ctx: &Crypt,
        title: &str,
        mut matches: Vec<SmimeKey>,
    ) -> Option<SmimeKey> {
        let entries =
            matches.iter().map(SmimeKey::describe).collect::<Vec<_>>();
        let ix = ctx.prompt.select_key(title, &entries)?;
        if ix < matches.len() {
            Some(matches.swap_remove(ix))
        } else {
            None
        }
    }

    /// Find the key for `mailbox`.
    ///
    /// A single trusted match is taken as is. In `oppenc` mode the user is
    /// never asked: a trusted match wins, and a merely valid one is
    /// accepted unless only strong keys may be used.
    pub(super) fn get_key_by_addr(
        &self,
        ctx: &Crypt,
        mailbox: &str,
        abilities: KeyFlags,
        store: Store,
        oppenc: bool,
    ) -> Option<SmimeKey> {
        if mailbox.is_empty() {
            return None;
        }

        let mut matches = Vec::new();
        let mut trusted: Option<SmimeKey> = None;
        let mut valid: Option<SmimeKey> = None;
        let mut multi_trusted = false;

        for key in self.candidates(store, mailbox) {
            if !abilities.is_empty() && !key.flags.intersects(abilities) {
                continue;
            }
            if !key.email.eq_ignore_ascii_case(mailbox) {
                continue;
            }

            if key.is_trusted() {
                if let Some(ref t) = trusted {
                    if !t.hash.eq_ignore_ascii_case(&key.hash) {
                        multi_trusted = true;
                    }
                }
                trusted = Some(key.clone());
            } else if key.is_valid() {
                valid = Some(key.clone());
            }
            matches.push(key);
        }

        if matches.is_empty() {
            debug!("No S/MIME key for {}", mailbox);
            return None;
        }

        if oppenc {
            trusted.or_else(|| {
                if ctx.config.crypt.opportunistic_encrypt_strong_keys {
                    None
                } else {
                    valid
                }
            })
        } else if trusted.is_some() && !multi_trusted {
            trusted
        } else {
            self.select(
                ctx,
                &format!("S/MIME certificates matching \"{}\".", mailbox),
                matches,
            )
        }
    }

    /// Find a key by hash, or by a substring of its address or label.
    pub(super) fn get_key_by_str(
        &self,
        ctx: &Crypt,
        s: &str,
        abilities: KeyFlags,
        store: Store,
    ) -> Option<SmimeKey> {
        let needle = s.to_lowercase();
        let mut matches = self
            .candidates(store, s)
            .into_iter()
            .filter(|k| abilities.is_empty() || k.flags.intersects(abilities))
            .filter(|k| {
                k.hash.eq_ignore_ascii_case(s)
                    || k.email.to_lowercase().contains(&needle)
                    || k.label.to_lowercase().contains(&needle)
            })
            .collect::<Vec<_>>();

        match matches.len() {
            0 => None,
            1 => matches.pop(),
            _ => self.select(
                ctx,
                &format!("S/MIME certificates matching \"{}\".", s),
                matches,
            ),
        }
    }

    /// Ask for a key until one is found or the user gives up.
    pub(super) fn ask_for_key(
        &self,
        ctx: &Crypt,
        prompt: &str,
        abilities: KeyFlags,
        store: Store,
    ) -> Option<SmimeKey> {
        let mut last_failed: Option<String> = None;
        loop {
            let resp = ctx.prompt.ask_string(prompt, "")?;
            let resp = resp.trim().to_owned();
            if resp.is_empty() {
                return None;
            }

            if let Some(key) = self.get_key_by_str(ctx, &resp, abilities, store)
            {
                return Some(key);
            }

            ctx.prompt
                .error(&format!("No matching keys found for \"{}\"", resp));
            if last_failed.as_deref() == Some(resp.as_str()) {
                return None;
            }
            last_failed = Some(resp);
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::test::*;
    use super::*;
    use crate::support::prompt::test_prompt::Scripted;

    #[test]
    fn index_lines() {
        assert_eq!(
            Some(SmimeKey {
                email: "alice@example.com".to_owned(),
                hash: "1a2b3c4d.0".to_owned(),
                label: "work".to_owned(),
                issuer: "99887766.0".to_owned(),
                trust: 'v',
                flags: KeyFlags::CANSIGN,
            }),
            parse_key("alice@example.com 1a2b3c4d.0 work 99887766.0 v s\n")
        );

        // Tabs and repeated separators; old files lack the last fields
        let key = parse_key("bob@example.com\t\t5e6f.0  bob").unwrap();
        assert_eq!("5e6f.0", key.hash);
        assert_eq!("?", key.issuer);
        assert_eq!('t', key.trust);
        assert_eq!(KeyFlags::CANENCRYPT | KeyFlags::CANSIGN, key.flags);

        assert_eq!(None, parse_key("carol@example.com 7788.0"));
        assert_eq!(None, parse_key(""));
    }

    const CERTS: &str = "\
alice@example.com aaaa.0 alice ? t es
bob@example.com bbbb.0 bob-old ? u es
bob@example.com bbbb.1 bob-new ? t es
dave@example.com dddd.0 dave ? v es
dave@example.com dddd.1 dave2 ? v es
erin@example.com eeee.0 erin ? t s
";

    #[test]
    fn lookup_by_address() {
        let fx = Fixture::with_certificates(CERTS, Scripted::default());
        let by_addr = |mailbox: &str, oppenc: bool| {
            fx.smime
                .get_key_by_addr(
                    &fx.crypt,
                    mailbox,
                    KeyFlags::CANENCRYPT,
                    Store::Certificates,
                    oppenc,
                )
                .map(|k| k.hash)
        };

        assert_eq!(
            Some("aaaa.0".to_owned()),
            by_addr("ALICE@example.com", false)
        );
        // The trusted one wins without asking
        assert_eq!(
            Some("bbbb.1".to_owned()),
            by_addr("bob@example.com", false)
        );
        // Signing only
        assert_eq!(None, by_addr("erin@example.com", true));
        // Valid but not trusted is fine in oppenc mode
        assert_eq!(
            Some("dddd.1".to_owned()),
            by_addr("dave@example.com", true)
        );
        assert!(fx.prompt_transcript().is_empty());
    }

    #[test]
    fn oppenc_with_strong_keys_only() {
        let fx = Fixture::with_certificates_and(
            CERTS,
            |c| c.crypt.opportunistic_encrypt_strong_keys = true,
            Scripted::default(),
        );
        assert_eq!(
            None,
            fx.smime.get_key_by_addr(
                &fx.crypt,
                "dave@example.com",
                KeyFlags::CANENCRYPT,
                Store::Certificates,
                true
            )
        );
    }

    #[test]
    fn ambiguous_address_asks() {
        let fx =
            Fixture::with_certificates(CERTS, Scripted::default().answer("0"));
        let key = fx.smime.get_key_by_addr(
            &fx.crypt,
            "dave@example.com",
            KeyFlags::CANENCRYPT,
            Store::Certificates,
            false,
        );
        assert_eq!("dddd.0", key.unwrap().hash);
        assert_eq!(
            vec![
                "S/MIME certificates matching \"dave@example.com\"."
                    .to_owned()
            ],
            fx.prompt_transcript()
        );
    }

    #[test]
    fn lookup_by_string() {
        let fx = Fixture::with_certificates(CERTS, Scripted::default());
        let key = fx.smime.get_key_by_str(
            &fx.crypt,
            "bob-new",
            KeyFlags::empty(),
            Store::Certificates,
        );
        assert_eq!("bbbb.1", key.unwrap().hash);
        let key = fx.smime.get_key_by_hash("EEEE.0", Store::Certificates);
        assert_eq!("erin", key.unwrap().label);
        assert_eq!(
            None,
            fx.smime.get_key_by_hash("ffff.0", Store::Certificates)
        );
    }

    #[test]
    fn asking_for_a_key() {
        let fx = Fixture::with_certificates(
            CERTS,
            Scripted::default().answer("nobody").answer("erin"),
        );
        let key = fx.smime.ask_for_key(
            &fx.crypt,
            "Sign as: ",
            KeyFlags::CANSIGN,
            Store::Certificates,
        );
        assert_eq!("eeee.0", key.unwrap().hash);
        assert!(fx
            .prompt_transcript()
            .contains(&"No matching keys found for \"nobody\"".to_owned()));

        let fx = Fixture::with_certificates(CERTS, Scripted::default());
        assert_eq!(
            None,
            fx.smime.ask_for_key(
                &fx.crypt,
                "Sign as: ",
                KeyFlags::CANSIGN,
                Store::Certificates,
            )
        );
    }
}
