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

//! Learning peer keys from inbound mail.

use chrono::prelude::*;
use log::{debug, info};

use super::header::AutocryptHeader;
use super::store::{normalize_addr, GossipHistory, Peer, PeerHistory};
use super::Autocrypt;
use crate::mime::model::*;
use crate::support::error::Error;

const DAY_SECS: i64 = 24 * 60 * 60;
/// Messages dated further ahead than this are not believed.
const MAX_FUTURE_SECS: i64 = 7 * DAY_SECS;
/// A peer not sending Autocrypt headers for this long has its key reset.
pub const RESET_SECS: i64 = 35 * DAY_SECS;

fn date_of(email: &Email) -> i64 {
    email.date_sent.map_or(0, |d| d.timestamp())
}

fn from_the_future(date: i64) -> bool {
    date > Utc::now().timestamp() + MAX_FUTURE_SECS
}

impl Autocrypt {
    /// Learn everything an inbound message offers.
    ///
    /// `email` must already have been rendered so that protected headers of
    /// an encrypted message are available. Gossip is only believed when it
    /// was decrypted with the Autocrypt keyring.
    pub fn ingest(&self, email: &Email) -> Result<(), Error> {
        self.process_autocrypt_header(email)?;
        if email.body.is_autocrypt {
            if let Some(ref protected) = email.body.mime_headers {
                self.process_gossip_header(email, protected)?;
            }
        }
        Ok(())
    }

    /// Update the peer record of the sender of `email` from its `Autocrypt:`
    /// header, or from the absence of one.
    ///
    /// Mail with other than exactly one From address, reports and mail dated
    /// more than a week in the future are ignored. Everything learnt from one
    /// message is written in a single transaction.
    pub fn process_autocrypt_header(&self, email: &Email) -> Result<(), Error> {
        let from = match email.env.from.as_slice() {
            [from] => from,
            _ => return Ok(()),
        };
        if email.body.is(BodyType::Multipart, "report") {
            return Ok(());
        }

        let date = date_of(email);
        if from_the_future(date) {
            debug!("Not ingesting Autocrypt from future message ({})", date);
            return Ok(());
        }

        let mut valid: Option<AutocryptHeader> = None;
        for value in &email.env.autocrypt {
            let header = match AutocryptHeader::parse(value) {
                Some(h) if h.addr.eq_ignore_ascii_case(&from.mailbox) => h,
                _ => continue,
            };
            // More than one valid header voids them all
            if valid.is_some() {
                valid = None;
                break;
            }
            valid = Some(header);
        }

        let mut store = self.store.borrow_mut();
        let tx = store.write_tx()?;

        let mut peer = match tx.peer(&from.mailbox)? {
            Some(peer) => peer,
            None => {
                let header = match valid {
                    Some(header) => header,
                    None => return Ok(()),
                };
                let peer = Peer {
                    email_addr: normalize_addr(&from.mailbox),
                    last_seen: date,
                    autocrypt_timestamp: date,
                    keyid: self.import_keydata(&header.keydata)?,
                    keydata: header.keydata,
                    prefer_encrypt: header.prefer_encrypt,
                    ..Peer::default()
                };
                tx.insert_peer(&peer)?;
                tx.add_peer_history(&PeerHistory {
                    peer_email_addr: peer.email_addr.clone(),
                    email_msgid: email
                        .env
                        .message_id
                        .clone()
                        .unwrap_or_default(),
                    timestamp: date,
                    keydata: peer.keydata.clone(),
                })?;
                info!("New Autocrypt peer {}", peer.email_addr);
                return tx.commit();
            }
        };

        if date <= peer.autocrypt_timestamp {
            return Ok(());
        }

        let mut changed = false;
        if date > peer.last_seen {
            peer.last_seen = date;
            changed = true;
        }

        match valid {
            Some(header) => {
                peer.autocrypt_timestamp = date;
                peer.prefer_encrypt = header.prefer_encrypt;
                changed = true;

                if peer.keydata != header.keydata {
                    peer.keyid = self.import_keydata(&header.keydata)?;
                    peer.keydata = header.keydata;
                    tx.add_peer_history(&PeerHistory {
                        peer_email_addr: peer.email_addr.clone(),
                        email_msgid: email
                            .env
                            .message_id
                            .clone()
                            .unwrap_or_default(),
                        timestamp: date,
                        keydata: peer.keydata.clone(),
                    })?;
                    info!("Autocrypt peer {} changed key", peer.email_addr);
                }
            }

            None => {
                if !peer.keydata.is_empty()
                    && peer.last_seen - peer.autocrypt_timestamp >= RESET_SECS
                {
                    info!(
                        "Autocrypt peer {} stopped sending headers, \
                         resetting",
                        peer.email_addr
                    );
                    peer.keydata.clear();
                    peer.keyid.clear();
                    changed = true;
                }
            }
        }

        if changed {
            tx.update_peer(&peer)?;
            tx.commit()?;
        }
        Ok(())
    }

    /// Learn keys of the other recipients of `email` from the
    /// `Autocrypt-Gossip:` headers among `protected`, the headers found
    /// inside its encrypted part.
    pub fn process_gossip_header(
        &self,
        email: &Email,
        protected: &Envelope,
    ) -> Result<(), Error> {
        let env = &email.env;
        let from = match env.from.first() {
            Some(from) => from,
            None => return Ok(()),
        };

        let date = date_of(email);
        if from_the_future(date) {
            return Ok(());
        }

        let senders = env
            .from
            .iter()
            .map(|a| normalize_addr(&a.mailbox))
            .collect::<Vec<_>>();
        let recipients = env
            .to
            .iter()
            .chain(&env.cc)
            .chain(&env.reply_to)
            .map(|a| normalize_addr(&a.mailbox))
            .filter(|a| !senders.contains(a))
            .collect::<Vec<_>>();

        let mut store = self.store.borrow_mut();
        let tx = store.write_tx()?;

        for value in &protected.autocrypt_gossip {
            let header = match AutocryptHeader::parse(value) {
                Some(header) => header,
                None => continue,
            };
            let addr = normalize_addr(&header.addr);
            if !recipients.contains(&addr) {
                debug!("Ignoring gossip about non-recipient {}", addr);
                continue;
            }

            let (peer, is_new) = match tx.peer(&addr)? {
                Some(mut peer) => {
                    if date <= peer.gossip_timestamp {
                        continue;
                    }
                    peer.gossip_timestamp = date;

                    // Don't copy the peer's own key into empty gossip
                    let current = if peer.gossip_keydata.is_empty() {
                        &peer.keydata
                    } else {
                        &peer.gossip_keydata
                    };
                    if *current == header.keydata {
                        tx.update_peer(&peer)?;
                        continue;
                    }
                    (peer, false)
                }
                None => (
                    Peer {
                        email_addr: addr.clone(),
                        gossip_timestamp: date,
                        ..Peer::default()
                    },
                    true,
                ),
            };

            let peer = Peer {
                gossip_keyid: self.import_keydata(&header.keydata)?,
                gossip_keydata: header.keydata,
                ..peer
            };
            if is_new {
                tx.insert_peer(&peer)?;
            } else {
                tx.update_peer(&peer)?;
            }
            tx.add_gossip_history(&GossipHistory {
                peer_email_addr: addr,
                sender_email_addr: from.mailbox.clone(),
                email_msgid: env.message_id.clone().unwrap_or_default(),
                timestamp: date,
                gossip_keydata: peer.gossip_keydata.clone(),
            })?;
            info!("Learnt gossip key for {}", peer.email_addr);
        }

        tx.commit()
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::super::test_support::*;
    use super::*;
    use crate::mime::parse::parse_message;
    use crate::support::prompt::test_prompt::Scripted;

    fn message(from: &str, date: &str, headers: &str) -> Email {
        parse_message(Rc::from(
            format!(
                "From: {}\r\n\
                 To: me@example.com, carol@example.com\r\n\
                 Date: {}\r\n\
                 Message-ID: <msg@example.com>\r\n\
                 {}\
                 \r\n\
                 hello\r\n",
                from, date, headers
            )
            .into_bytes(),
        ))
    }

    fn autocrypt(addr: &str, prefer: &str, keydata: &str) -> String {
        format!(
            "Autocrypt: addr={}; prefer-encrypt={}; keydata={}\r\n",
            addr, prefer, keydata
        )
    }

    const MAY_1: &str = "Fri, 01 May 2020 12:00:00 +0000";
    const MAY_2: &str = "Sat, 02 May 2020 12:00:00 +0000";
    const JUN_30: &str = "Tue, 30 Jun 2020 12:00:00 +0000";

    #[test]
    fn first_contact_and_idempotence() {
        let fx = Fixture::new(Scripted::default());
        let keydata = fx.foreign_keydata("bob@example.com");
        let email = message(
            "Bob <Bob@Example.com>",
            MAY_1,
            &autocrypt("bob@example.com", "mutual", &keydata),
        );

        fx.ac().process_autocrypt_header(&email).unwrap();
        let peer = fx.peer("bob@example.com").unwrap();
        assert_eq!(keydata, peer.keydata);
        assert!(peer.prefer_encrypt);
        assert!(fx.ac().is_valid_key(&peer.keyid));
        assert_eq!(peer.last_seen, peer.autocrypt_timestamp);

        fx.ac().process_autocrypt_header(&email).unwrap();
        assert_eq!(Some(peer), fx.peer("bob@example.com"));
        let history = fx
            .ac()
            .store
            .borrow()
            .peer_history("bob@example.com")
            .unwrap();
        assert_eq!(1, history.len());
        assert_eq!(keydata, history[0].keydata);
    }

    #[test]
    fn headers_which_do_not_count() {
        let fx = Fixture::new(Scripted::default());
        let keydata = fx.foreign_keydata("bob@example.com");

        // Not the sender
        fx.ac()
            .process_autocrypt_header(&message(
                "bob@example.com",
                MAY_1,
                &autocrypt("mallory@example.com", "mutual", &keydata),
            ))
            .unwrap();
        // Two of them
        fx.ac()
            .process_autocrypt_header(&message(
                "bob@example.com",
                MAY_1,
                &format!(
                    "{}{}",
                    autocrypt("bob@example.com", "mutual", &keydata),
                    autocrypt("bob@example.com", "nopreference", &keydata)
                ),
            ))
            .unwrap();
        // Two senders
        fx.ac()
            .process_autocrypt_header(&message(
                "bob@example.com, eve@example.com",
                MAY_1,
                &autocrypt("bob@example.com", "mutual", &keydata),
            ))
            .unwrap();
        // From the future
        fx.ac()
            .process_autocrypt_header(&message(
                "bob@example.com",
                "Fri, 01 Jan 2100 00:00:00 +0000",
                &autocrypt("bob@example.com", "mutual", &keydata),
            ))
            .unwrap();

        assert_eq!(None, fx.peer("bob@example.com"));
        assert_eq!(None, fx.peer("mallory@example.com"));
    }

    #[test]
    fn key_changes_and_reset() {
        let fx = Fixture::new(Scripted::default());
        let old_key = fx.foreign_keydata("bob@example.com");
        let new_key = fx.foreign_keydata("bob@example.com");

        fx.ac()
            .process_autocrypt_header(&message(
                "bob@example.com",
                MAY_1,
                &autocrypt("bob@example.com", "mutual", &old_key),
            ))
            .unwrap();
        fx.ac()
            .process_autocrypt_header(&message(
                "bob@example.com",
                MAY_2,
                &autocrypt("bob@example.com", "nopreference", &new_key),
            ))
            .unwrap();

        let peer = fx.peer("bob@example.com").unwrap();
        assert_eq!(new_key, peer.keydata);
        assert!(!peer.prefer_encrypt);
        assert!(peer.autocrypt_timestamp > 0);

        // An older message changes nothing
        fx.ac()
            .process_autocrypt_header(&message(
                "bob@example.com",
                MAY_1,
                &autocrypt("bob@example.com", "mutual", &old_key),
            ))
            .unwrap();
        assert_eq!(Some(peer.clone()), fx.peer("bob@example.com"));

        // Mail without a header soon after only updates last_seen
        let mut plain = message("bob@example.com", MAY_2, "");
        plain.date_sent = plain
            .date_sent
            .map(|d| d + chrono::Duration::hours(1));
        fx.ac().process_autocrypt_header(&plain).unwrap();
        let peer = fx.peer("bob@example.com").unwrap();
        assert_eq!(new_key, peer.keydata);
        assert_eq!(3600, peer.last_seen - peer.autocrypt_timestamp);

        // Much later, the key is forgotten
        fx.ac()
            .process_autocrypt_header(&message("bob@example.com", JUN_30, ""))
            .unwrap();
        let peer = fx.peer("bob@example.com").unwrap();
        assert!(peer.keydata.is_empty());
        assert!(peer.keyid.is_empty());

        assert_eq!(
            2,
            fx.ac()
                .store
                .borrow()
                .peer_history("bob@example.com")
                .unwrap()
                .len()
        );
    }

    #[test]
    fn gossip() {
        let fx = Fixture::new(Scripted::default());
        let carol_key = fx.foreign_keydata("carol@example.com");
        let dave_key = fx.foreign_keydata("dave@example.com");
        let email = message("alice@example.com", MAY_1, "");

        let mut protected = Envelope::default();
        protected.autocrypt_gossip = vec![
            AutocryptHeader::new("Carol@example.com", true, carol_key.clone())
                .to_header_value(),
            // Not a recipient
            AutocryptHeader::new("dave@example.com", false, dave_key)
                .to_header_value(),
            // The sender
            AutocryptHeader::new("alice@example.com", false, carol_key.clone())
                .to_header_value(),
        ];

        fx.ac().process_gossip_header(&email, &protected).unwrap();
        let carol = fx.peer("carol@example.com").unwrap();
        assert_eq!(carol_key, carol.gossip_keydata);
        assert!(fx.ac().is_valid_key(&carol.gossip_keyid));
        assert!(carol.keydata.is_empty());
        assert!(!carol.prefer_encrypt);
        assert_eq!(None, fx.peer("dave@example.com"));
        assert_eq!(None, fx.peer("alice@example.com"));

        // The same gossip again is not news
        fx.ac().process_gossip_header(&email, &protected).unwrap();
        let history = fx
            .ac()
            .store
            .borrow()
            .gossip_history("carol@example.com")
            .unwrap();
        assert_eq!(1, history.len());
        assert_eq!("alice@example.com", history[0].sender_email_addr);
    }

    #[test]
    fn bad_keydata_writes_nothing() {
        let fx = Fixture::new(Scripted::default());
        let email = message(
            "bob@example.com",
            MAY_1,
            &autocrypt("bob@example.com", "mutual", "not*base64"),
        );
        assert_matches!(
            Err(Error::BadInput(_)),
            fx.ac().process_autocrypt_header(&email)
        );
        assert_eq!(None, fx.peer("bob@example.com"));
    }
}
