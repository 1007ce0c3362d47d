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

//! The cached passphrase of one crypto scheme.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use log::debug;
use secstr::SecStr;

/// A passphrase remembered for a limited time.
///
/// The secret is held in a `SecStr`, which zeroes its buffer when dropped,
/// so voiding the cache also wipes the memory.
#[derive(Debug)]
pub struct PassphraseCache {
    scheme: &'static str,
    timeout: Duration,
    entry: RefCell<Option<(SecStr, Instant)>>,
}

impl PassphraseCache {
    pub fn new(scheme: &'static str, timeout_secs: u64) -> Self {
        PassphraseCache {
            scheme,
            timeout: Duration::from_secs(timeout_secs),
            entry: RefCell::new(None),
        }
    }

    /// The cached passphrase, if there is one which has not expired.
    pub fn get(&self) -> Option<SecStr> {
        let mut entry = self.entry.borrow_mut();
        let expired = match *entry {
            Some((_, expiry)) => Instant::now() >= expiry,
            None => return None,
        };
        if expired {
            debug!("{} passphrase expired", self.scheme);
            *entry = None;
            return None;
        }
        entry.as_ref().map(|&(ref pass, _)| pass.clone())
    }

    pub fn is_valid(&self) -> bool {
        self.get().is_some()
    }

    pub fn set(&self, passphrase: SecStr) {
        let expiry = Instant::now() + self.timeout;
        *self.entry.borrow_mut() = Some((passphrase, expiry));
    }

    /// Forget the passphrase.
    pub fn void(&self) {
        if self.entry.borrow_mut().take().is_some() {
            debug!("Forgot {} passphrase", self.scheme);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_get_void() {
        let cache = PassphraseCache::new("PGP", 300);
        assert!(!cache.is_valid());
        cache.set(SecStr::from("hunter2"));
        assert_eq!(b"hunter2", cache.get().unwrap().unsecure());
        cache.void();
        assert!(cache.get().is_none());
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        let cache = PassphraseCache::new("S/MIME", 0);
        cache.set(SecStr::from("x"));
        assert!(!cache.is_valid());
    }
}
