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

//! Autocrypt Level 1.1.
//!
//! Autocrypt keeps its own keyring and database under `autocrypt.dir`. Keys
//! of peers are learnt from the `Autocrypt:` headers of their mail and from
//! gossip in encrypted mail; our own accounts advertise a key the same way.

use std::cell::RefCell;
use std::fs;

use log::{info, warn};

use crate::crypt::backend::CryptBackend;
use crate::crypt::expando::Template;
use crate::crypt::library::engine::Engine;
use crate::crypt::library::LibraryBackend;
use crate::crypt::Crypt;
use crate::mime::model::*;
use crate::support::error::Error;
use crate::support::file_ops::private_dir;
use crate::support::system_config::{expand_path, AutocryptConfig, SystemConfig};

pub mod header;
mod ingest;
mod recommend;
pub mod store;

pub use self::header::AutocryptHeader;
pub use self::recommend::Recommendation;
use self::store::{Account, Store};

const DB_NAME: &str = "autocrypt.db";

pub struct Autocrypt {
    config: AutocryptConfig,
    store: RefCell<Store>,
    backend: LibraryBackend,
}

impl Autocrypt {
    /// Open the Autocrypt directory and database, creating them if `create`
    /// is set.
    pub fn init(config: &SystemConfig, create: bool) -> Result<Self, Error> {
        if !config.autocrypt.enabled {
            return Err(Error::AutocryptDisabled);
        }

        let dir = expand_path(&config.autocrypt.dir);
        if !dir.is_dir() {
            if !create {
                return Err(Error::SchemaError(format!(
                    "{} does not exist",
                    dir.display()
                )));
            }
            info!("Creating Autocrypt directory {}", dir.display());
            private_dir(&dir)?;
        }

        let store = Store::open(&dir.join(DB_NAME), create)?;
        let backend = LibraryBackend::autocrypt(config, dir);
        Ok(Autocrypt::with_parts(config.autocrypt.clone(), store, backend))
    }

    pub fn with_parts(
        config: AutocryptConfig,
        store: Store,
        backend: LibraryBackend,
    ) -> Self {
        Autocrypt {
            config,
            store: RefCell::new(store),
            backend,
        }
    }

    /// The backend over the Autocrypt keyring.
    pub fn backend(&self) -> &dyn CryptBackend {
        &self.backend
    }

    pub fn config(&self) -> &AutocryptConfig {
        &self.config
    }

    /// Whether a usable encryption key with this id is in the keyring.
    fn is_valid_key(&self, keyid: &str) -> bool {
        if keyid.is_empty() {
            return false;
        }

        match self.backend.engine().get_key(keyid, false) {
            Ok(Some(key)) => key.is_usable() && key.can_encrypt(),
            Ok(None) => false,
            Err(e) => {
                warn!("Autocrypt key {} could not be looked up: {}", keyid, e);
                false
            }
        }
    }

    /// Import base64 `keydata` into the keyring, returning the key id.
    fn import_keydata(&self, keydata: &str) -> Result<String, Error> {
        let raw = base64::decode(keydata).map_err(|e| {
            Error::BadInput(format!("Autocrypt keydata: {}", e))
        })?;
        self.backend.engine().import_key(&raw)
    }

    /// The account of the single From address of `env`, if enabled.
    fn sender_account(&self, env: &Envelope) -> Result<Option<Account>, Error> {
        let from = match env.from.as_slice() {
            [from] => from,
            _ => return Ok(None),
        };
        Ok(self
            .store
            .borrow()
            .account(&from.mailbox)?
            .filter(|a| a.enabled))
    }

    /// Create an account for `addr`, with a new key or one selected from
    /// the Autocrypt keyring.
    pub fn account_init(
        &self,
        crypt: &Crypt,
        addr: &Address,
    ) -> Result<Account, Error> {
        let result = self.create_account(crypt, addr);
        match result {
            Ok(_) => {
                crypt.prompt.message("Autocrypt account creation succeeded")
            }
            Err(ref e) => {
                warn!("Autocrypt account for {}: {}", addr.mailbox, e);
                crypt.prompt.error("Autocrypt account creation aborted");
            }
        }
        result
    }

    fn create_account(
        &self,
        crypt: &Crypt,
        addr: &Address,
    ) -> Result<Account, Error> {
        if addr.mailbox.is_empty() || !addr.mailbox.contains('@') {
            crypt.prompt.error("Please enter a single email address");
            return Err(Error::BadInput(addr.mailbox.clone()));
        }

        if self.store.borrow().account(&addr.mailbox)?.is_some() {
            crypt
                .prompt
                .error("That email address already has an autocrypt account");
            return Err(Error::KeyAmbiguous(addr.mailbox.clone()));
        }

        let keyid = self.select_or_create_key(crypt, addr)?;
        let keydata =
            base64::encode(self.backend.engine().export_minimal(&keyid)?);
        let prefer_encrypt = crypt
            .prompt
            .yes_or_no("Prefer encryption?", false)
            .ok_or(Error::Cancelled)?;

        let account = Account {
            email_addr: addr.mailbox.clone(),
            keyid,
            keydata,
            prefer_encrypt,
            enabled: true,
        };
        self.store.borrow_mut().insert_account(&account)?;
        info!("Created Autocrypt account {}", account.email_addr);
        Ok(account)
    }

    fn select_or_create_key(
        &self,
        crypt: &Crypt,
        addr: &Address,
    ) -> Result<String, Error> {
        let choice = crypt
            .prompt
            .multi_choice("(c)reate new, or (s)elect existing GPG key?", "cs");
        if Some('s') == choice {
            match self.select_key(crypt) {
                Ok(keyid) => return Ok(keyid),
                Err(e) => {
                    info!("No existing key selected: {}", e);
                    let create = crypt.prompt.yes_or_no(
                        "Create a new GPG key for this account, instead?",
                        true,
                    );
                    if Some(true) != create {
                        return Err(e);
                    }
                }
            }
        }

        crypt.prompt.message("Generating autocrypt key...");
        let keyid = self.backend.engine().generate_key(&addr.to_string())?;
        info!("Generated Autocrypt key {}", keyid);
        Ok(keyid)
    }

    fn select_key(&self, crypt: &Crypt) -> Result<String, Error> {
        let keys = self.backend.engine().list_keys(&[], true)?;
        let entries = keys
            .iter()
            .map(|k| {
                let uid = k.user_ids.first().map_or("", |u| u.addr.as_str());
                format!("0x{} {}", k.long_id(), uid)
            })
            .collect::<Vec<_>>();
        let ix = crypt
            .prompt
            .select_key("Select a key for the account", &entries)
            .ok_or(Error::Cancelled)?;
        let key = keys.get(ix).ok_or(Error::Cancelled)?;
        let keyid = key.fpr_or_long_id().to_owned();

        if !key.is_usable() || !key.can_encrypt() || !key.can_sign() {
            crypt.prompt.error(&format!(
                "The key {} is not usable for autocrypt",
                keyid
            ));
            return Err(Error::KeyNotFound(keyid));
        }
        Ok(keyid)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, Error> {
        self.store.borrow().accounts()
    }

    pub fn account_set_enabled(
        &self,
        addr: &str,
        enabled: bool,
    ) -> Result<(), Error> {
        self.modify_account(addr, |a| a.enabled = enabled)
    }

    pub fn account_set_prefer_encrypt(
        &self,
        addr: &str,
        prefer_encrypt: bool,
    ) -> Result<(), Error> {
        self.modify_account(addr, |a| a.prefer_encrypt = prefer_encrypt)
    }

    fn modify_account(
        &self,
        addr: &str,
        f: impl FnOnce(&mut Account),
    ) -> Result<(), Error> {
        let mut store = self.store.borrow_mut();
        let mut account = store
            .account(addr)?
            .ok_or_else(|| Error::KeyNotFound(addr.to_owned()))?;
        f(&mut account);
        store.update_account(&account)
    }

    /// Returns whether there was such an account.
    pub fn account_delete(&self, addr: &str) -> Result<bool, Error> {
        self.store.borrow_mut().delete_account(addr)
    }

    /// One line of the account list, according to `acct_format`.
    pub fn format_account(&self, n: usize, account: &Account) -> String {
        Template::compile(&self.config.acct_format).render(&|c| match c {
            'a' => Some(account.email_addr.clone()),
            'k' => Some(account.keyid.clone()),
            'n' => Some(n.to_string()),
            'p' => Some(
                if account.prefer_encrypt {
                    "prefer encrypt"
                } else {
                    "manual encrypt"
                }
                .to_owned(),
            ),
            's' => Some(
                if account.enabled { "active" } else { "inactive" }.to_owned(),
            ),
            _ => None,
        })
    }

    /// Sign as the key of the account `email` is from. Returns whether there
    /// is such an account.
    pub fn set_sign_as_default_key(
        &self,
        email: &Email,
    ) -> Result<bool, Error> {
        match self.sender_account(&email.env)? {
            Some(account) if !account.keyid.is_empty() => {
                self.backend.set_sign_as(Some(account.keyid));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Add the `Autocrypt:` header advertising the sender's account key.
    /// Returns whether there is an account to advertise.
    pub fn write_autocrypt_header(
        &self,
        env: &mut Envelope,
    ) -> Result<bool, Error> {
        let account = match self.sender_account(env)? {
            Some(account) if !account.keydata.is_empty() => account,
            _ => return Ok(false),
        };

        let header = AutocryptHeader::new(
            account.email_addr,
            account.prefer_encrypt,
            account.keydata,
        );
        env.autocrypt = vec![header.to_header_value()];
        Ok(true)
    }

    /// Remove the database, for tests of first-time setup.
    #[cfg(test)]
    fn wipe(config: &SystemConfig) {
        let dir = expand_path(&config.autocrypt.dir);
        let _ = fs::remove_file(dir.join(DB_NAME));
    }
}

/// Whether `dir` looks like an initialised Autocrypt directory.
pub fn is_initialised(config: &SystemConfig) -> bool {
    fs::metadata(expand_path(&config.autocrypt.dir).join(DB_NAME))
        .map(|md| md.is_file())
        .unwrap_or(false)
}


#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::test_support::*;
    use super::*;
    use crate::support::prompt::test_prompt::Scripted;

    #[test]
    fn init_creates_directory_and_database() {
        let dir = TempDir::new().unwrap();
        let mut config = SystemConfig::default();
        config.autocrypt.dir = dir.path().join("ac");

        assert_matches!(
            Err(Error::AutocryptDisabled),
            Autocrypt::init(&config, true).map(|_| ())
        );

        config.autocrypt.enabled = true;
        assert!(Autocrypt::init(&config, false).is_err());
        assert!(!is_initialised(&config));

        Autocrypt::init(&config, true).unwrap();
        assert!(is_initialised(&config));
        Autocrypt::init(&config, false).unwrap();

        Autocrypt::wipe(&config);
        assert!(!is_initialised(&config));
        assert!(Autocrypt::init(&config, false).is_err());
    }

    #[test]
    fn account_creation() {
        let fx = Fixture::new(Scripted::default().answer("c").answer("y"));
        let account = fx
            .ac()
            .account_init(&fx.crypt, &Address::new("me@example.com"))
            .unwrap();
        assert!(account.prefer_encrypt);
        assert!(account.enabled);
        assert!(fx.ac().is_valid_key(&account.keyid));
        assert_eq!(
            fx.engine.export_minimal(&account.keyid).unwrap(),
            base64::decode(&account.keydata).unwrap()
        );

        assert_eq!(vec![account], fx.ac().list_accounts().unwrap());

        assert!(fx
            .ac()
            .account_init(&fx.crypt, &Address::new("ME@example.com"))
            .is_err());
        assert!(fx
            .ac()
            .account_init(&fx.crypt, &Address::new("not an address"))
            .is_err());
    }

    #[test]
    fn account_from_existing_key() {
        let fx = Fixture::new(
            Scripted::default().answer("s").answer("0").answer("n"),
        );
        let keyid = fx.engine.add_key("me@example.com", Default::default());
        let account = fx
            .ac()
            .account_init(&fx.crypt, &Address::new("me@example.com"))
            .unwrap();
        assert_eq!(keyid, account.keyid);
        assert!(!account.prefer_encrypt);
    }

    #[test]
    fn account_management() {
        let fx = Fixture::new(Scripted::default());
        let account = fx.account("me@example.com", false);

        fx.ac()
            .account_set_prefer_encrypt("me@example.com", true)
            .unwrap();
        fx.ac().account_set_enabled("me@example.com", false).unwrap();
        let listed = &fx.ac().list_accounts().unwrap()[0];
        assert!(listed.prefer_encrypt);
        assert!(!listed.enabled);

        assert_eq!(
            "   1 me@example.com                       \
             prefer encrypt   inactive",
            fx.ac().format_account(1, listed)
        );
        assert!(fx.ac().format_account(1, &account).ends_with("    active"));

        assert_matches!(
            Err(Error::KeyNotFound(_)),
            fx.ac().account_set_enabled("you@example.com", true)
        );
        assert!(fx.ac().account_delete("me@example.com").unwrap());
        assert!(fx.ac().list_accounts().unwrap().is_empty());
    }

    #[test]
    fn autocrypt_header_and_signer() {
        let fx = Fixture::new(Scripted::default());
        let account = fx.account("me@example.com", true);

        let mut email = Email::new(Envelope::default(), Body::default());
        email.env.from = vec![Address::with_personal("Me", "Me@Example.com")];
        assert!(fx.ac().write_autocrypt_header(&mut email.env).unwrap());
        assert_eq!(1, email.env.autocrypt.len());
        let header = AutocryptHeader::parse(&email.env.autocrypt[0]).unwrap();
        assert_eq!("me@example.com", header.addr);
        assert!(header.prefer_encrypt);
        assert_eq!(account.keydata, header.keydata);
        assert!(fx.ac().set_sign_as_default_key(&email).unwrap());

        fx.ac().account_set_enabled("me@example.com", false).unwrap();
        let mut env = email.env.clone();
        env.autocrypt.clear();
        assert!(!fx.ac().write_autocrypt_header(&mut env).unwrap());
        assert!(env.autocrypt.is_empty());
        assert!(!fx.ac().set_sign_as_default_key(&email).unwrap());

        email.env.from.push(Address::new("other@example.com"));
        assert!(!fx.ac().write_autocrypt_header(&mut email.env).unwrap());
    }
}
