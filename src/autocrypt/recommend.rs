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

//! Deciding whether outbound mail should be encrypted with Autocrypt keys.

use super::header::AutocryptHeader;
use super::ingest::RESET_SECS;
use super::store::{normalize_addr, Peer};
use super::Autocrypt;
use crate::crypt::flags::SecurityFlags;
use crate::mime::model::*;
use crate::support::error::Error;

/// Ordered from least to most encouraging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Recommendation {
    /// Autocrypt cannot be used for this message at all.
    Off,
    /// Some recipient has no usable key.
    No,
    /// Encryption is possible but might not be readable.
    Discourage,
    Available,
    /// Everyone involved asked for encryption.
    Yes,
}

impl Recommendation {
    pub fn as_str(self) -> &'static str {
        match self {
            Recommendation::Off => "off",
            Recommendation::No => "no",
            Recommendation::Discourage => "discourage",
            Recommendation::Available => "available",
            Recommendation::Yes => "yes",
        }
    }
}

impl Autocrypt {
    /// The usable key of `peer`, and whether it came from gossip.
    fn peer_key<'a>(&self, peer: &'a Peer) -> Option<(&'a str, bool)> {
        if self.is_valid_key(&peer.keyid) {
            Some((&peer.keyid, false))
        } else if self.is_valid_key(&peer.gossip_keyid) {
            Some((&peer.gossip_keyid, true))
        } else {
            None
        }
    }

    /// Recommend whether to encrypt `email` with Autocrypt.
    ///
    /// When the recommendation is better than `No`, also returns the key
    /// ids to encrypt to, space separated, starting with the sender's own.
    pub fn ui_recommendation(
        &self,
        email: &Email,
    ) -> Result<(Recommendation, Option<String>), Error> {
        if email.security.contains(SecurityFlags::APPLICATION_SMIME) {
            return Ok((Recommendation::Off, None));
        }
        let account = match self.sender_account(&email.env)? {
            Some(account) => account,
            None => return Ok((Recommendation::Off, None)),
        };

        let env = &email.env;
        let mut recipients = Vec::<String>::new();
        for addr in env.to.iter().chain(&env.cc).chain(&env.bcc) {
            let addr = normalize_addr(&addr.mailbox);
            if !recipients.contains(&addr) {
                recipients.push(addr);
            }
        }
        if recipients.is_empty() {
            return Ok((Recommendation::No, None));
        }

        let mut keylist = account.keyid.clone();
        let mut all_encrypt = true;
        let mut discourage = false;

        let store = self.store.borrow();
        for recipient in &recipients {
            let peer = match store.peer(recipient)? {
                Some(peer) => peer,
                None => return Ok((Recommendation::No, None)),
            };
            let (key, gossip) = match self.peer_key(&peer) {
                Some((key, gossip)) => (key, gossip),
                None => return Ok((Recommendation::No, None)),
            };

            if gossip {
                discourage = true;
                all_encrypt = false;
            } else {
                if 0 == peer.last_seen
                    || 0 == peer.autocrypt_timestamp
                    || peer.last_seen - peer.autocrypt_timestamp > RESET_SECS
                {
                    discourage = true;
                    all_encrypt = false;
                }
                if !account.prefer_encrypt || !peer.prefer_encrypt {
                    all_encrypt = false;
                }
            }

            if !keylist.is_empty() {
                keylist.push(' ');
            }
            keylist.push_str(key);
        }

        let rec = if all_encrypt {
            Recommendation::Yes
        } else if discourage {
            Recommendation::Discourage
        } else {
            Recommendation::Available
        };
        Ok((rec, Some(keylist)))
    }

    /// `Autocrypt-Gossip:` header values for the To and Cc recipients, and
    /// for any Reply-To address, to go among the protected headers of
    /// `email`.
    ///
    /// Recipients without a usable key are skipped.
    pub fn generate_gossip_list(
        &self,
        email: &Email,
    ) -> Result<Vec<String>, Error> {
        let store = self.store.borrow();
        let mut gossip = Vec::new();

        for addr in email.env.to.iter().chain(&email.env.cc) {
            if let Some(peer) = store.peer(&addr.mailbox)? {
                if let Some((_, from_gossip)) = self.peer_key(&peer) {
                    gossip.push(peer_gossip(peer, from_gossip));
                }
            }
        }

        for addr in &email.env.reply_to {
            if let Some(account) = store.account(&addr.mailbox)? {
                gossip.push(AutocryptHeader::new(
                    account.email_addr,
                    false,
                    account.keydata,
                ));
            } else if let Some(peer) = store.peer(&addr.mailbox)? {
                if let Some((_, from_gossip)) = self.peer_key(&peer) {
                    gossip.push(peer_gossip(peer, from_gossip));
                }
            }
        }

        Ok(gossip.iter().map(AutocryptHeader::to_header_value).collect())
    }

    /// Put the gossip headers for `email` into `protected`. Returns whether
    /// there was anything to gossip.
    pub fn write_gossip_headers(
        &self,
        email: &Email,
        protected: &mut Envelope,
    ) -> Result<bool, Error> {
        let gossip = self.generate_gossip_list(email)?;
        if gossip.is_empty() {
            return Ok(false);
        }

        protected.autocrypt_gossip = gossip;
        Ok(true)
    }
}

fn peer_gossip(peer: Peer, from_gossip: bool) -> AutocryptHeader {
    let keydata = if from_gossip {
        peer.gossip_keydata
    } else {
        peer.keydata
    };
    // Gossip never carries prefer-encrypt
    AutocryptHeader::new(peer.email_addr, false, keydata)
}
