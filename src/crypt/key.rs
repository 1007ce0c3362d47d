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

//! The uniform key model shared by every backend.

use std::fmt;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use chrono::prelude::*;

use super::flags::KeyFlags;
use crate::mime::header::parse_address;
use crate::mime::model::Address;

/// How far a key or user id is trusted to belong to its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Validity {
    Unknown,
    Never,
    Marginal,
    Full,
    Ultimate,
}

impl Default for Validity {
    fn default() -> Self {
        Validity::Unknown
    }
}

impl Validity {
    /// The trust level, 0 to 3, shown in key listings.
    pub fn trust(self) -> u8 {
        match self {
            Validity::Unknown | Validity::Never => 0,
            Validity::Marginal => 1,
            Validity::Full => 2,
            Validity::Ultimate => 3,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UserId {
    /// The user id as it appears on the key, usually `Name <mailbox>`.
    pub addr: String,
    pub validity: Validity,
    pub flags: KeyFlags,
}

impl UserId {
    pub fn new(addr: impl Into<String>, validity: Validity) -> Self {
        UserId {
            addr: addr.into(),
            validity,
            flags: KeyFlags::empty(),
        }
    }

    pub fn trust(&self) -> u8 {
        self.validity.trust()
    }

    /// The user id interpreted as an address, if it is one.
    pub fn address(&self) -> Option<Address> {
        parse_address(&self.addr)
    }
}

/// Reference counting of a backend's native key objects.
pub trait KeyStore {
    fn key_ref(&self, id: u64);
    fn key_unref(&self, id: u64);
}

/// An owned reference to a native key object.
///
/// Cloning takes another reference; dropping releases exactly the one this
/// value holds.
pub struct KeyRef {
    store: Rc<dyn KeyStore>,
    id: u64,
}

impl KeyRef {
    pub fn new(store: Rc<dyn KeyStore>, id: u64) -> Self {
        store.key_ref(id);
        KeyRef { store, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Clone for KeyRef {
    fn clone(&self) -> Self {
        KeyRef::new(Rc::clone(&self.store), self.id)
    }
}

impl Drop for KeyRef {
    fn drop(&mut self) {
        self.store.key_unref(self.id);
    }
}

impl fmt::Debug for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyRef({})", self.id)
    }
}

#[derive(Clone, Debug, Default)]
pub struct KeyInfo {
    /// The long (16 hex digit) key id, or the certificate hash for S/MIME.
    pub key_id: String,
    pub fingerprint: Option<String>,
    pub algorithm: String,
    pub num_alg: u32,
    pub key_len: u32,
    pub gen_time: Option<DateTime<Utc>>,
    pub flags: KeyFlags,
    pub validity: Validity,
    pub user_ids: Vec<UserId>,
    /// The principal key, for subkeys.
    pub parent: Option<Weak<KeyInfo>>,
    pub backend_ref: Option<KeyRef>,
}

impl KeyInfo {
    pub fn long_id(&self) -> &str {
        &self.key_id
    }

    pub fn short_id(&self) -> &str {
        let len = self.key_id.len();
        if len > 8 {
            &self.key_id[len - 8..]
        } else {
            &self.key_id
        }
    }

    /// The id to show or pass around, honouring the long-ids preference.
    pub fn keyid(&self, long_ids: bool) -> &str {
        if long_ids {
            self.long_id()
        } else {
            self.short_id()
        }
    }

    pub fn fpr_or_long_id(&self) -> &str {
        self.fingerprint.as_deref().unwrap_or(&self.key_id)
    }

    pub fn principal(&self) -> Option<Rc<KeyInfo>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Flags of this key combined with the restrictions of its principal.
    pub fn effective_flags(&self) -> KeyFlags {
        let inherited = self
            .principal()
            .map_or(KeyFlags::empty(), |p| p.flags & KeyFlags::RESTRICTIONS);
        self.flags | inherited
    }

    /// Usable iff neither this key nor its principal is expired, revoked or
    /// disabled.
    pub fn is_usable(&self) -> bool {
        !self.effective_flags().intersects(KeyFlags::CANTUSE)
    }

    /// Whether the key's binding to its owner is strongly established.
    pub fn is_strong(&self) -> bool {
        self.flags.contains(KeyFlags::ISX509)
            || self.validity >= Validity::Full
    }

    pub fn can_encrypt(&self) -> bool {
        self.flags.contains(KeyFlags::CANENCRYPT)
    }

    pub fn can_sign(&self) -> bool {
        self.flags.contains(KeyFlags::CANSIGN)
    }

    pub fn is_secret(&self) -> bool {
        self.flags.contains(KeyFlags::SECRET)
    }

    /// The highest validity of any of the user ids.
    pub fn best_validity(&self) -> Validity {
        self.user_ids
            .iter()
            .map(|u| u.validity)
            .max()
            .unwrap_or(self.validity)
    }
}

/// One user id of one key, as offered to the user for selection.
#[derive(Clone, Debug)]
pub struct KeyCandidate {
    pub key: Rc<KeyInfo>,
    pub uid: usize,
}

impl KeyCandidate {
    pub fn user_id(&self) -> Option<&UserId> {
        self.key.user_ids.get(self.uid)
    }

    pub fn uid_str(&self) -> &str {
        self.user_id().map_or("", |u| u.addr.as_str())
    }

    /// Key flags together with those of the user id.
    pub fn flags(&self) -> KeyFlags {
        self.key.effective_flags()
            | self.user_id().map_or(KeyFlags::empty(), |u| u.flags)
    }

    pub fn validity(&self) -> Validity {
        self.user_id().map_or(self.key.validity, |u| u.validity)
    }

    pub fn is_valid(&self) -> bool {
        !self.flags().intersects(KeyFlags::CANTUSE)
    }

    pub fn is_strong(&self) -> bool {
        self.key.flags.contains(KeyFlags::ISX509)
            || self.validity() >= Validity::Full
    }

    /// A one-line description for selection menus.
    pub fn describe(&self) -> String {
        format!(
            "{} {}/0x{} {}",
            match self.validity() {
                Validity::Ultimate => 'u',
                Validity::Full => 'f',
                Validity::Marginal => 'm',
                Validity::Never => 'n',
                Validity::Unknown => '?',
            },
            self.key.algorithm,
            self.key.short_id(),
            self.uid_str()
        )
    }
}

bitflags! {
    /// How well a key's user id matches a wanted address.
    pub struct KeyMatch: u8 {
        const VALID = 1 << 0;
        const ADDR = 1 << 1;
        const STRING = 1 << 2;
        const STRONGID = 1 << 3;
        const MATCH = Self::ADDR.bits | Self::STRING.bits;
    }
}

/// Compare `addr` with the address of a user id of `key`.
pub fn key_matches_addr(
    addr: &Address,
    uid_addr: &Address,
    key: &KeyCandidate,
) -> KeyMatch {
    let mut m = KeyMatch::empty();
    if key.is_valid() {
        m |= KeyMatch::VALID;
    }
    if key.is_strong() {
        m |= KeyMatch::STRONGID;
    }
    if !addr.mailbox.is_empty()
        && addr.mailbox.eq_ignore_ascii_case(&uid_addr.mailbox)
    {
        m |= KeyMatch::ADDR;
    }
    if let (Some(a), Some(b)) =
        (addr.personal.as_ref(), uid_addr.personal.as_ref())
    {
        if a.eq_ignore_ascii_case(b) {
            m |= KeyMatch::STRING;
        }
    }
    m
}

/// Whether `s` looks like a key id (optionally `0x`-prefixed hex whose
/// length is a multiple of 8).
pub fn is_numerical_keyid(s: &str) -> bool {
    let s = s.strip_prefix("0x").unwrap_or(s);
    0 == s.len() % 8 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// The interpretation of a key specification typed by the user.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySpec {
    /// What to hand the backend as a search pattern.
    pub hint: String,
    /// The fingerprint, with blanks removed, if the spec is one.
    pub fingerprint: Option<String>,
    pub long_id: Option<String>,
    pub short_id: Option<String>,
}

/// Classify `p` as a fingerprint, long or short key id, or free text.
///
/// Fingerprints are 40 or 32 hex digits, optionally in groups of four
/// separated by blanks.
pub fn get_fingerprint_or_id(p: &str) -> KeySpec {
    let trimmed = p.trim_start();
    let pf = if trimmed
        .get(..2)
        .map_or(false, |s| s.eq_ignore_ascii_case("0x"))
    {
        &trimmed[2..]
    } else {
        trimmed
    };

    let mut hexdigits = 0;
    let mut is_id = true;
    let mut well_formed = true;
    for c in pf.chars() {
        if c.is_ascii_hexdigit() {
            hexdigits += 1;
        } else {
            is_id = false;
            if ' ' != c || 0 != hexdigits % 4 {
                well_formed = false;
                break;
            }
        }
    }

    if well_formed && (40 == hexdigits || 32 == hexdigits) {
        let fpr: String = pf.chars().filter(|c| !c.is_whitespace()).collect();
        return KeySpec {
            hint: fpr.clone(),
            fingerprint: Some(fpr),
            long_id: None,
            short_id: None,
        };
    }

    let mut spec = KeySpec {
        hint: p.to_owned(),
        ..KeySpec::default()
    };
    if is_id && well_formed {
        match pf.len() {
            16 => spec.long_id = Some(pf.to_owned()),
            8 => spec.short_id = Some(pf.to_owned()),
            _ => (),
        }
    }
    spec
}

impl KeySpec {
    /// Whether `key` is what this spec designates. Free text matches as a
    /// case-insensitive substring of `uid`.
    pub fn matches(&self, key: &KeyInfo, uid: &str) -> bool {
        if let Some(ref fpr) = self.fingerprint {
            return key
                .fingerprint
                .as_ref()
                .map_or(false, |f| f.eq_ignore_ascii_case(fpr));
        }
        if self.hint.trim().is_empty() {
            return true;
        }
        self.long_id
            .as_ref()
            .map_or(false, |l| l.eq_ignore_ascii_case(key.long_id()))
            || self
                .short_id
                .as_ref()
                .map_or(false, |s| s.eq_ignore_ascii_case(key.short_id()))
            || uid
                .to_ascii_lowercase()
                .contains(&self.hint.trim().to_ascii_lowercase())
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use super::*;

    #[test]
    fn numerical_key_ids() {
        assert!(is_numerical_keyid("0xDEADBEEF"));
        assert!(is_numerical_keyid("0123456789abcdef"));
        assert!(!is_numerical_keyid("DEADBEE"));
        assert!(!is_numerical_keyid("alice@example.com"));
    }

    #[test]
    fn key_spec_classification() {
        let spec = get_fingerprint_or_id(
            "0x1234 5678 9ABC DEF0 1234 5678 9ABC DEF0 1234 5678",
        );
        assert_eq!(
            Some("123456789ABCDEF0123456789ABCDEF012345678".to_owned()),
            spec.fingerprint
        );

        let spec = get_fingerprint_or_id("0x0123456789ABCDEF");
        assert_eq!(Some("0123456789ABCDEF".to_owned()), spec.long_id);
        assert_eq!("0x0123456789ABCDEF", spec.hint);

        let spec = get_fingerprint_or_id("DEADBEEF");
        assert_eq!(Some("DEADBEEF".to_owned()), spec.short_id);

        let spec = get_fingerprint_or_id("Alice");
        assert_eq!(KeySpec {
            hint: "Alice".to_owned(),
            ..KeySpec::default()
        }, spec);
    }

    #[test]
    fn spec_matching() {
        let key = KeyInfo {
            key_id: "0123456789ABCDEF".to_owned(),
            fingerprint: Some(
                "AAAA0123456789ABCDEF0123456789ABCDEF0000".to_owned(),
            ),
            ..KeyInfo::default()
        };
        assert!(get_fingerprint_or_id("89abcdef").matches(&key, ""));
        assert!(get_fingerprint_or_id("alice").matches(&key, "Alice <a@b>"));
        assert!(!get_fingerprint_or_id("bob").matches(&key, "Alice <a@b>"));
    }

    #[test]
    fn usability_inherits_from_principal() {
        let principal = Rc::new(KeyInfo {
            key_id: "1111111111111111".to_owned(),
            flags: KeyFlags::REVOKED,
            ..KeyInfo::default()
        });
        let sub = KeyInfo {
            key_id: "2222222222222222".to_owned(),
            flags: KeyFlags::CANENCRYPT | KeyFlags::SUBKEY,
            parent: Some(Rc::downgrade(&principal)),
            ..KeyInfo::default()
        };
        assert!(!sub.is_usable());
        assert_eq!("22222222", sub.short_id());
    }

    #[test]
    fn address_matching() {
        let key = KeyCandidate {
            key: Rc::new(KeyInfo {
                validity: Validity::Full,
                user_ids: vec![UserId::new(
                    "Alice <alice@example.com>",
                    Validity::Full,
                )],
                ..KeyInfo::default()
            }),
            uid: 0,
        };
        let uid_addr = key.user_id().unwrap().address().unwrap();
        let m = key_matches_addr(
            &Address::new("ALICE@example.com"),
            &uid_addr,
            &key,
        );
        assert!(m.contains(
            KeyMatch::VALID | KeyMatch::ADDR | KeyMatch::STRONGID
        ));
        assert!(!m.contains(KeyMatch::STRING));
    }

    #[derive(Default)]
    struct Counter(RefCell<i32>);

    impl KeyStore for Counter {
        fn key_ref(&self, _: u64) {
            *self.0.borrow_mut() += 1;
        }

        fn key_unref(&self, _: u64) {
            *self.0.borrow_mut() -= 1;
        }
    }

    #[test]
    fn key_refs_balance() {
        let counter = Rc::new(Counter::default());
        let store: Rc<dyn KeyStore> = counter.clone();
        {
            let a = KeyRef::new(Rc::clone(&store), 7);
            let b = a.clone();
            assert_eq!(7, b.id());
            assert_eq!(2, *counter.0.borrow());
        }
        assert_eq!(0, *counter.0.borrow());
    }
}
