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

//! Key lookup and signer selection against the engine's keyring.

use std::collections::HashSet;
use std::rc::Rc;

use log::{debug, warn};

use super::engine::Protocol;
use super::LibraryBackend;
use crate::crypt::flags::KeyFlags;
use crate::crypt::key::*;
use crate::crypt::pgp::keys::hints_from;
use crate::crypt::Crypt;
use crate::mime::model::Address;
use crate::support::error::Error;

impl LibraryBackend {
    /// What the selection menus call the keys of this backend.
    fn key_noun(&self) -> &'static str {
        match self.engine.protocol() {
            Protocol::OpenPgp => "PGP keys",
            Protocol::Cms => "S/MIME certificates",
        }
    }

    /// The keys matching any of `hints`, one entry per key.
    pub(super) fn get_candidates(
        &self,
        hints: &[String],
        secret: bool,
    ) -> Vec<Rc<KeyInfo>> {
        match self.engine.list_keys(hints, secret) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Unable to list {}: {}", self.key_noun(), e);
                vec![]
            }
        }
    }

    fn select(
        &self,
        ctx: &Crypt,
        title: &str,
        mut candidates: Vec<KeyCandidate>,
    ) -> Option<Rc<KeyInfo>> {
        if !self.show_unusable() {
            candidates.retain(KeyCandidate::is_valid);
        }
        if candidates.is_empty() {
            return None;
        }

        let entries = candidates
            .iter()
            .map(KeyCandidate::describe)
            .collect::<Vec<_>>();
        let ix = ctx.prompt.select_key(title, &entries)?;
        candidates.get(ix).map(|c| Rc::clone(&c.key))
    }

    /// Find the key for `addr`, ranking user ids by how well they match.
    ///
    /// A single strong match is taken without asking. In `oppenc` mode the
    /// user is never asked at all.
    pub(super) fn getkeybyaddr(
        &self,
        ctx: &Crypt,
        addr: &Address,
        abilities: KeyFlags,
        oppenc: bool,
    ) -> Option<Rc<KeyInfo>> {
        let mut hints = vec![addr.mailbox.clone()];
        if let Some(ref personal) = addr.personal {
            hints.extend(hints_from(personal));
        }
        if !oppenc {
            ctx.prompt.message(&format!(
                "Looking for keys matching \"{}\"...",
                addr.mailbox
            ));
        }
        let secret = abilities.contains(KeyFlags::CANSIGN);
        let keys = self.get_candidates(&hints, secret);

        let mut matches: Vec<KeyCandidate> = Vec::new();
        let mut strong: Option<Rc<KeyInfo>> = None;
        let mut addr_match: Option<Rc<KeyInfo>> = None;
        let mut multi = false;

        for key in &keys {
            if !abilities.is_empty() && !key.flags.intersects(abilities) {
                continue;
            }

            for (ix, uid) in key.user_ids.iter().enumerate() {
                let uid_addr = match uid.address() {
                    Some(uid_addr) => uid_addr,
                    None => continue,
                };
                let candidate = KeyCandidate {
                    key: Rc::clone(key),
                    uid: ix,
                };
                let m = key_matches_addr(addr, &uid_addr, &candidate);

                if m.intersects(KeyMatch::MATCH) {
                    matches.push(candidate.clone());
                }

                if m.contains(KeyMatch::VALID | KeyMatch::ADDR) {
                    if m.contains(KeyMatch::STRONGID) {
                        if strong
                            .as_ref()
                            .map_or(false, |s| !Rc::ptr_eq(s, key))
                        {
                            multi = true;
                        }
                        strong = Some(Rc::clone(key));
                    } else {
                        addr_match = Some(Rc::clone(key));
                    }
                }
            }
        }

        if oppenc {
            return strong.or_else(|| {
                if ctx.config.crypt.opportunistic_encrypt_strong_keys {
                    None
                } else {
                    addr_match
                }
            });
        }

        if let (Some(key), false) = (strong.as_ref(), multi) {
            debug!("Single strong key {} for {}", key.key_id, addr.mailbox);
            return Some(Rc::clone(key));
        }

        if matches.is_empty() {
            return None;
        }
        self.select(
            ctx,
            &format!("{} matching <{}>.", self.key_noun(), addr.mailbox),
            matches,
        )
    }

    /// Find a key by fingerprint, key id or part of a user id.
    pub(super) fn getkeybystr(
        &self,
        ctx: &Crypt,
        p: &str,
        abilities: KeyFlags,
        secret: bool,
    ) -> Option<Rc<KeyInfo>> {
        let p = p.strip_suffix('!').unwrap_or(p);
        let spec = get_fingerprint_or_id(p);
        let hint = spec
            .fingerprint
            .clone()
            .or_else(|| spec.long_id.clone())
            .or_else(|| spec.short_id.clone())
            .unwrap_or_else(|| spec.hint.clone());
        let keys = self.get_candidates(&[hint], secret);

        let mut matches: Vec<KeyCandidate> = Vec::new();
        for key in &keys {
            if !abilities.is_empty() && !key.flags.intersects(abilities) {
                continue;
            }

            let hit = key
                .user_ids
                .iter()
                .position(|uid| spec.matches(key, &uid.addr))
                .or_else(|| {
                    if key.user_ids.is_empty() && spec.matches(key, "") {
                        Some(0)
                    } else {
                        None
                    }
                });
            if let Some(uid) = hit {
                matches.push(KeyCandidate {
                    key: Rc::clone(key),
                    uid,
                });
            }
        }

        match matches.len() {
            0 => None,
            1 => Some(Rc::clone(&matches[0].key)),
            _ => self.select(
                ctx,
                &format!("{} matching \"{}\".", self.key_noun(), p),
                matches,
            ),
        }
    }

    /// Ask the user for a key until one is found or they give up.
    pub(super) fn ask_for_key(
        &self,
        ctx: &Crypt,
        tag: &str,
        whatfor: Option<&str>,
        abilities: KeyFlags,
        secret: bool,
    ) -> Option<Rc<KeyInfo>> {
        let default = whatfor
            .and_then(|w| self.id_defaults.borrow().get(w).cloned())
            .unwrap_or_default();
        let mut last_failed: Option<String> = None;

        loop {
            let resp = ctx.prompt.ask_string(tag, &default)?;
            let resp = resp.trim().to_owned();
            if resp.is_empty() {
                return None;
            }

            if let Some(w) = whatfor {
                self.id_defaults
                    .borrow_mut()
                    .insert(w.to_owned(), resp.clone());
            }

            if let Some(key) = self.getkeybystr(ctx, &resp, abilities, secret)
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

    /// The one secret key for `address`.
    ///
    /// More than one distinct usable key is ambiguous and an error, not a
    /// question for the user.
    pub(super) fn set_signer_from_address(
        &self,
        address: &str,
    ) -> Result<String, Error> {
        let keys = self
            .engine
            .list_keys(&[address.to_owned()], true)?
            .into_iter()
            .filter(|k| k.can_sign() && k.is_usable())
            .collect::<Vec<_>>();

        let distinct = keys
            .iter()
            .map(|k| k.fpr_or_long_id().to_owned())
            .collect::<HashSet<_>>();
        match distinct.len() {
            0 => Err(Error::KeyNotFound(address.to_owned())),
            1 => Ok(keys[0].fpr_or_long_id().to_owned()),
            _ => Err(Error::KeyAmbiguous(address.to_owned())),
        }
    }

    /// The key to sign with: the one chosen in the send menu, then the
    /// configured one, then the first From address with a key.
    pub(super) fn signer(
        &self,
        ctx: &Crypt,
        from: Option<&Address>,
    ) -> Result<String, Error> {
        let configured = self
            .sign_as
            .borrow()
            .clone()
            .or_else(|| self.configured_signer());

        if let Some(id) = configured {
            return match self.set_signer_from_address(&id) {
                Ok(fpr) => Ok(fpr),
                Err(e) => {
                    ctx.prompt.error(&signer_error(&id, &e));
                    Err(e)
                }
            };
        }

        if let Some(addr) = from {
            match self.set_signer_from_address(&addr.mailbox) {
                Ok(fpr) => return Ok(fpr),
                Err(e @ Error::KeyAmbiguous(_)) => {
                    ctx.prompt.error(&signer_error(&addr.mailbox, &e));
                    return Err(e);
                }
                Err(e) => debug!("No signing key for {}: {}", addr.mailbox, e),
            }
        }

        // Let the engine pick its default key
        Ok(String::new())
    }
}

fn signer_error(id: &str, e: &Error) -> String {
    match *e {
        Error::KeyAmbiguous(_) => {
            format!("ambiguous specification of secret key '{}'", id)
        }
        Error::KeyNotFound(_) => format!("secret key '{}' not found", id),
        ref e => format!("error setting secret key '{}': {}", id, e),
    }
}

#[cfg(test)]
mod test {
    use super::super::test::*;
    use super::*;
    use crate::support::prompt::test_prompt::Scripted;

    #[test]
    fn strong_key_is_taken_without_asking() {
        let fx = Fixture::pgp(Scripted::default());
        let alice =
            fx.engine.add_key("Alice <alice@example.com>", Validity::Full);
        fx.engine.add_key("Mallory <mallory@example.com>", Validity::Full);

        let key = fx
            .backend
            .getkeybyaddr(
                &fx.crypt,
                &Address::new("alice@example.com"),
                KeyFlags::CANENCRYPT,
                false,
            )
            .unwrap();
        assert_eq!(Some(alice.as_str()), key.fingerprint.as_deref());
    }

    #[test]
    fn weak_keys_are_offered() {
        let fx = Fixture::pgp(Scripted::default().answer("1"));
        fx.engine.add_key("Bob <bob@example.com>", Validity::Marginal);
        let second =
            fx.engine.add_key("Bob Work <bob@example.com>", Validity::Unknown);

        let key = fx
            .backend
            .getkeybyaddr(
                &fx.crypt,
                &Address::new("bob@example.com"),
                KeyFlags::CANENCRYPT,
                false,
            )
            .unwrap();
        assert_eq!(Some(second.as_str()), key.fingerprint.as_deref());
        assert!(fx
            .prompt_transcript()
            .contains(&"PGP keys matching <bob@example.com>.".to_owned()));

        // Without a strong key, opportunistic mode still takes an address
        // match unless told otherwise
        assert!(fx
            .backend
            .getkeybyaddr(
                &fx.crypt,
                &Address::new("bob@example.com"),
                KeyFlags::CANENCRYPT,
                true,
            )
            .is_some());
    }

    #[test]
    fn unusable_keys_are_hidden() {
        let fx = Fixture::pgp(Scripted::default());
        fx.engine.add_key_with(
            "Carol <carol@example.com>",
            Validity::Full,
            KeyFlags::REVOKED,
        );
        assert!(fx
            .backend
            .getkeybyaddr(
                &fx.crypt,
                &Address::new("carol@example.com"),
                KeyFlags::CANENCRYPT,
                false,
            )
            .is_none());
    }

    #[test]
    fn lookup_by_string() {
        let fx = Fixture::pgp(Scripted::default());
        let alice =
            fx.engine.add_key("Alice <alice@example.com>", Validity::Full);

        let key = fx
            .backend
            .getkeybystr(
                &fx.crypt,
                &format!("0x{}!", &alice[24..]),
                KeyFlags::empty(),
                false,
            )
            .unwrap();
        assert_eq!(Some(alice.as_str()), key.fingerprint.as_deref());
        assert!(fx
            .backend
            .getkeybystr(&fx.crypt, "nobody", KeyFlags::empty(), false)
            .is_none());
    }

    #[test]
    fn signer_selection() {
        let fx = Fixture::pgp(Scripted::default());
        let alice =
            fx.engine.add_key("Alice <alice@example.com>", Validity::Full);
        assert_eq!(
            alice,
            fx.backend
                .signer(&fx.crypt, Some(&Address::new("alice@example.com")))
                .unwrap()
        );

        // No key for the sender leaves the choice to the engine
        assert_eq!(
            "",
            fx.backend
                .signer(&fx.crypt, Some(&Address::new("zed@example.com")))
                .unwrap()
        );

        fx.engine.add_key("Alice Two <alice@example.com>", Validity::Full);
        assert_matches!(
            Err(Error::KeyAmbiguous(_)),
            fx.backend
                .signer(&fx.crypt, Some(&Address::new("alice@example.com")))
        );
        assert!(fx.prompt_transcript().contains(
            &"ambiguous specification of secret key 'alice@example.com'"
                .to_owned()
        ));
    }

    #[test]
    fn configured_signer_takes_precedence() {
        let fx = Fixture::pgp_with(
            |c| c.pgp.sign_as = "nobody@example.com".to_owned(),
            Scripted::default(),
        );
        fx.engine.add_key("Alice <alice@example.com>", Validity::Full);
        assert_matches!(
            Err(Error::KeyNotFound(_)),
            fx.backend
                .signer(&fx.crypt, Some(&Address::new("alice@example.com")))
        );
        assert!(fx.prompt_transcript().contains(
            &"secret key 'nobody@example.com' not found".to_owned()
        ));
    }
}
