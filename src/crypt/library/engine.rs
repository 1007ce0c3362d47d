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

//! The interface to an in-process crypto library.
//!
//! An `Engine` speaks one protocol (OpenPGP or CMS) and hands back native
//! results: signatures are structured values rather than text to scrape, and
//! keys are reference-counted handles into the engine's own key objects.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use chrono::prelude::*;
use log::{debug, warn};
use secstr::SecStr;

use crate::crypt::key::{KeyInfo, KeyRef, KeyStore, Validity};
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    OpenPgp,
    Cms,
}

bitflags! {
    /// The summary of one signature's verification, as the library sees it.
    pub struct SigSummary: u32 {
        /// The signature is fully valid.
        const VALID = 1 << 0;
        /// The signature is good, though validity may be uncertain.
        const GREEN = 1 << 1;
        /// The signature is bad.
        const RED = 1 << 2;
        const KEY_REVOKED = 1 << 3;
        const KEY_EXPIRED = 1 << 4;
        const SIG_EXPIRED = 1 << 5;
        const KEY_MISSING = 1 << 6;
        const CRL_MISSING = 1 << 7;
        const CRL_TOO_OLD = 1 << 8;
        const BAD_POLICY = 1 << 9;
        const SYS_ERROR = 1 << 10;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SigStatus {
    Good,
    Bad,
    NoPublicKey,
    Error(String),
}

/// What a PKA lookup said about the signer's address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pka {
    Verified(String),
    Mismatch(String),
}

#[derive(Clone, Debug)]
pub struct Signature {
    /// Fingerprint (or, lacking one, key id) of the signing key.
    pub fpr: String,
    pub status: SigStatus,
    pub summary: SigSummary,
    /// Validity of the signer's binding to the user id; `None` if the
    /// library cannot tell.
    pub validity: Option<Validity>,
    pub timestamp: Option<DateTime<Utc>>,
    pub exp_timestamp: Option<DateTime<Utc>>,
    pub wrong_key_usage: bool,
    /// `(name, value)` notations carried by the signature.
    pub notations: Vec<(String, String)>,
    pub pka: Option<Pka>,
    /// The signing key, when the library learnt it from the message itself.
    pub signer: Option<Rc<KeyInfo>>,
}

impl Signature {
    pub fn new(fpr: impl Into<String>, status: SigStatus) -> Self {
        Signature {
            fpr: fpr.into(),
            status,
            summary: SigSummary::empty(),
            validity: None,
            timestamp: None,
            exp_timestamp: None,
            wrong_key_usage: false,
            notations: vec![],
            pka: None,
            signer: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Verification {
    /// The signed content, for signatures which enclose it.
    pub plaintext: Option<Vec<u8>>,
    pub signatures: Vec<Signature>,
}

#[derive(Clone, Debug, Default)]
pub struct Decryption {
    pub plaintext: Vec<u8>,
    /// Signatures found inside the encrypted data.
    pub signatures: Vec<Signature>,
    /// Long key ids of the keys the data was encrypted to.
    pub recipients: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Signed {
    pub signature: Vec<u8>,
    /// The `micalg` parameter describing the digest used.
    pub micalg: String,
}

pub trait Engine {
    fn protocol(&self) -> Protocol;

    /// Every key matching any of `patterns`, or every key at all if there
    /// are none. With `secret`, only keys whose secret part is available.
    fn list_keys(
        &self,
        patterns: &[String],
        secret: bool,
    ) -> Result<Vec<Rc<KeyInfo>>, Error>;

    /// Make a detached signature over `data`.
    fn sign(
        &self,
        data: &[u8],
        signer: &str,
        passphrase: Option<&SecStr>,
    ) -> Result<Signed, Error>;

    /// Wrap `data` in a clear-signed text block.
    fn clearsign(
        &self,
        _data: &[u8],
        _signer: &str,
        _passphrase: Option<&SecStr>,
    ) -> Result<Vec<u8>, Error> {
        Err(Error::Unsupported)
    }

    /// Verify `sig` over `signed`, or an opaque/clear-signed `sig` which
    /// carries its own content when `signed` is `None`.
    fn verify(
        &self,
        sig: &[u8],
        signed: Option<&[u8]>,
    ) -> Result<Verification, Error>;

    /// Encrypt `data` to every key in `recipients`, signing it as well if a
    /// signer is given.
    fn encrypt(
        &self,
        data: &[u8],
        recipients: &[String],
        signer: Option<&str>,
        passphrase: Option<&SecStr>,
    ) -> Result<Vec<u8>, Error>;

    /// Decrypt `data`, verifying any signature inside.
    ///
    /// Data which turns out not to be encrypted at all fails with
    /// `NotActuallyEncrypted`.
    fn decrypt(
        &self,
        data: &[u8],
        passphrase: Option<&SecStr>,
    ) -> Result<Decryption, Error>;

    /// Import keys, returning how many were taken.
    fn import(&self, data: &[u8]) -> Result<usize, Error>;

    /// The public key `key` in transportable form.
    fn export(&self, key: &str) -> Result<Vec<u8>, Error>;

    /// Create a new key pair for `uid`, returning its fingerprint.
    fn generate_key(&self, uid: &str) -> Result<String, Error>;

    /// Import one transferable key, returning its fingerprint. A key which
    /// is already present still reports its fingerprint.
    fn import_key(&self, _data: &[u8]) -> Result<String, Error> {
        Err(Error::Unsupported)
    }

    /// `key` reduced to what another party needs to encrypt to it, in the
    /// form carried by Autocrypt headers (before base64).
    fn export_minimal(&self, key: &str) -> Result<Vec<u8>, Error> {
        self.export(key)
    }

    /// Whether secret key operations need a passphrase from us, rather than
    /// one obtained by the library itself.
    fn needs_passphrase(&self) -> bool {
        false
    }

    /// Look up exactly one key by fingerprint or key id.
    fn get_key(
        &self,
        id: &str,
        secret: bool,
    ) -> Result<Option<Rc<KeyInfo>>, Error> {
        let id = id.strip_prefix("0x").unwrap_or(id);
        Ok(self
            .list_keys(&[id.to_owned()], secret)?
            .into_iter()
            .find(|k| key_has_id(k, id)))
    }
}

/// Whether `id` is the fingerprint, long id or short id of `key`.
pub fn key_has_id(key: &KeyInfo, id: &str) -> bool {
    let id = id.strip_prefix("0x").unwrap_or(id);
    key.fingerprint
        .as_deref()
        .map_or(false, |f| f.eq_ignore_ascii_case(id))
        || key.long_id().eq_ignore_ascii_case(id)
        || key.short_id().eq_ignore_ascii_case(id)
}

/// The way engines without a query language of their own match keys: by id,
/// or by case-insensitive substring of a user id.
pub fn pattern_matches(key: &KeyInfo, pattern: &str) -> bool {
    if key_has_id(key, pattern) {
        return true;
    }
    let pattern = pattern.to_lowercase();
    key.user_ids
        .iter()
        .any(|u| u.addr.to_lowercase().contains(&pattern))
}

/// Reference counts of the key objects an engine has handed out.
///
/// Each key the engine lists gets a fresh handle; the library's object is
/// released when the last `KeyRef` to it is dropped.
#[derive(Debug, Default)]
pub struct HandleTable {
    next: Cell<u64>,
    live: RefCell<HashMap<u64, usize>>,
}

impl HandleTable {
    pub fn new() -> Rc<Self> {
        Rc::new(HandleTable::default())
    }

    /// Create a handle for a newly obtained key object.
    pub fn attach(this: &Rc<Self>) -> KeyRef {
        let id = this.next.get() + 1;
        this.next.set(id);
        this.live.borrow_mut().insert(id, 0);
        KeyRef::new(Rc::clone(this) as Rc<dyn KeyStore>, id)
    }

    /// The number of key objects still referenced.
    pub fn live(&self) -> usize {
        self.live.borrow().len()
    }
}

impl KeyStore for HandleTable {
    fn key_ref(&self, id: u64) {
        match self.live.borrow_mut().get_mut(&id) {
            Some(count) => *count += 1,
            None => warn!("Reference to released key handle {}", id),
        }
    }

    fn key_unref(&self, id: u64) {
        let mut live = self.live.borrow_mut();
        let released = match live.get_mut(&id) {
            Some(count) => {
                *count -= 1;
                0 == *count
            }
            None => {
                warn!("Double release of key handle {}", id);
                false
            }
        };
        if released {
            live.remove(&id);
            debug!("Released key handle {}", id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypt::key::UserId;

    #[test]
    fn handles_are_released_once() {
        let table = HandleTable::new();
        let a = HandleTable::attach(&table);
        let b = HandleTable::attach(&table);
        assert_eq!(2, table.live());

        let a2 = a.clone();
        drop(a);
        assert_eq!(2, table.live());
        drop(a2);
        assert_eq!(1, table.live());

        let key = Rc::new(KeyInfo {
            key_id: "0123456789ABCDEF".to_owned(),
            backend_ref: Some(b),
            ..KeyInfo::default()
        });
        let copy = Rc::clone(&key);
        drop(key);
        assert_eq!(1, table.live());
        drop(copy);
        assert_eq!(0, table.live());
    }

    #[test]
    fn key_patterns() {
        let key = KeyInfo {
            key_id: "0123456789ABCDEF".to_owned(),
            fingerprint: Some(
                "AAAABBBBCCCCDDDDEEEEFFFF0123456789ABCDEF".to_owned(),
            ),
            user_ids: vec![UserId::new(
                "Alice <alice@example.com>",
                Validity::Full,
            )],
            ..KeyInfo::default()
        };

        assert!(pattern_matches(&key, "0x89abcdef"));
        assert!(pattern_matches(&key, "0123456789ABCDEF"));
        assert!(pattern_matches(
            &key,
            "aaaabbbbccccddddeeeeffff0123456789abcdef"
        ));
        assert!(pattern_matches(&key, "ALICE@example"));
        assert!(!pattern_matches(&key, "bob"));
    }
}
