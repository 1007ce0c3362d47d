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

//! Key lookup against the keyrings of the external PGP program.

use std::rc::Rc;

use log::{debug, warn};

use super::gnupg_parse::parse_key_listing;
use super::invoke::{self, Vars};
use super::PgpClassic;
use crate::crypt::flags::KeyFlags;
use crate::crypt::key::*;
use crate::crypt::Crypt;
use crate::mime::model::Address;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ring {
    Public,
    Secret,
}

/// The search terms `s` contributes to a key listing. Very short words
/// would match nearly everything and are dropped.
pub fn hints_from(s: &str) -> Vec<String> {
    s.split(|c: char| " ,.:\"()<>\n".contains(c))
        .filter(|t| t.len() > 3)
        .map(str::to_owned)
        .collect()
}

impl PgpClassic {
    /// The keys in `ring` matching any of `hints`, or every key if there
    /// are none.
    pub(super) fn get_candidates(
        &self,
        ring: Ring,
        hints: &[String],
    ) -> Vec<Rc<KeyInfo>> {
        let template = match ring {
            Ring::Public => &self.commands.list_pubring,
            Ring::Secret => &self.commands.list_secring,
        };
        let recipients = invoke::quote_hints(hints);
        let vars = Vars {
            recipients: Some(&recipients),
            ..Vars::default()
        };

        match invoke::run(template, &vars, self.config.use_gpg_agent, None) {
            Ok(out) => {
                parse_key_listing(&out.stdout, self.config.ignore_subkeys)
            }
            Err(e) => {
                warn!("Unable to list PGP keys: {}", e);
                vec![]
            }
        }
    }

    /// Let the user choose among `candidates`.
    fn select(
        &self,
        ctx: &Crypt,
        title: &str,
        mut candidates: Vec<KeyCandidate>,
    ) -> Option<Rc<KeyInfo>> {
        if !self.config.show_unusable {
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

    /// Find the key for `addr`.
    ///
    /// In `oppenc` mode the user is never asked, and only a key whose
    /// user id is a valid match for the address qualifies.
    pub(super) fn getkeybyaddr(
        &self,
        ctx: &Crypt,
        addr: &Address,
        abilities: KeyFlags,
        ring: Ring,
        oppenc: bool,
    ) -> Option<Rc<KeyInfo>> {
        let mut hints = hints_from(&addr.mailbox);
        if let Some(ref personal) = addr.personal {
            hints.extend(hints_from(personal));
        }
        if !oppenc {
            ctx.prompt.message(&format!(
                "Looking for keys matching \"{}\"...",
                addr.mailbox
            ));
        }
        let keys = self.get_candidates(ring, &hints);

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
            &format!("PGP keys matching <{}>.", addr.mailbox),
            matches,
        )
    }

    /// Find a key by a user-supplied string: a fingerprint, key id or part
    /// of a user id.
    pub(super) fn getkeybystr(
        &self,
        ctx: &Crypt,
        p: &str,
        abilities: KeyFlags,
        ring: Ring,
    ) -> Option<Rc<KeyInfo>> {
        let p = p.strip_suffix('!').unwrap_or(p);
        let spec = get_fingerprint_or_id(p);
        let keys = self.get_candidates(ring, &hints_from(&spec.hint));

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
                &format!("PGP keys matching \"{}\".", p),
                matches,
            ),
        }
    }

    /// Ask the user for a key until one is found or they give up.
    ///
    /// Answers are remembered per `whatfor` and offered as the default next
    /// time.
    pub(super) fn ask_for_key(
        &self,
        ctx: &Crypt,
        tag: &str,
        whatfor: Option<&str>,
        abilities: KeyFlags,
        ring: Ring,
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

            if let Some(key) = self.getkeybystr(ctx, &resp, abilities, ring) {
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
