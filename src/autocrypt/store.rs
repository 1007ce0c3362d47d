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

//! The Autocrypt database.
//!
//! One SQLite file holds our accounts, what we know about peers, and the
//! history of keys seen for each peer. The `schema` table records which
//! migrations have been applied; they are applied in order whenever the
//! database is opened.

use std::path::Path;
use std::time::Duration;

use chrono::prelude::*;
use log::info;
use rusqlite::OptionalExtension as _;

use crate::support::error::Error;

static MIGRATIONS: &[&str] = &[
    include_str!("store.v1.sql"),
    include_str!("store.v2.sql"),
];

/// Addresses are stored and compared lower-cased.
pub fn normalize_addr(addr: &str) -> String {
    addr.trim().to_lowercase()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    pub email_addr: String,
    pub keyid: String,
    /// Base64 of the exported public key.
    pub keydata: String,
    pub prefer_encrypt: bool,
    pub enabled: bool,
}

impl Account {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            email_addr: row.get("email_addr")?,
            keyid: row.get("keyid")?,
            keydata: row.get("keydata")?,
            prefer_encrypt: row.get("prefer_encrypt")?,
            enabled: row.get("enabled")?,
        })
    }
}

/// What we know about a correspondent. Timestamps are UNIX seconds, with 0
/// meaning never. Empty key fields mean no key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Peer {
    pub email_addr: String,
    pub last_seen: i64,
    pub autocrypt_timestamp: i64,
    pub keyid: String,
    pub keydata: String,
    pub prefer_encrypt: bool,
    pub gossip_timestamp: i64,
    pub gossip_keyid: String,
    pub gossip_keydata: String,
}

impl Peer {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            email_addr: row.get("email_addr")?,
            last_seen: row.get("last_seen")?,
            autocrypt_timestamp: row.get("autocrypt_timestamp")?,
            keyid: row.get("keyid")?,
            keydata: row.get("keydata")?,
            prefer_encrypt: row.get("prefer_encrypt")?,
            gossip_timestamp: row.get("gossip_timestamp")?,
            gossip_keyid: row.get("gossip_keyid")?,
            gossip_keydata: row.get("gossip_keydata")?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerHistory {
    pub peer_email_addr: String,
    pub email_msgid: String,
    pub timestamp: i64,
    pub keydata: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GossipHistory {
    pub peer_email_addr: String,
    pub sender_email_addr: String,
    pub email_msgid: String,
    pub timestamp: i64,
    pub gossip_keydata: String,
}

pub struct Store {
    cxn: rusqlite::Connection,
}

impl Store {
    /// Open the database at `path`, creating it only if `create` is set.
    pub fn open(path: &Path, create: bool) -> Result<Self, Error> {
        let mut flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE;
        if !path.exists() {
            if !create {
                return Err(Error::SchemaError(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
            info!("Creating Autocrypt database {}", path.display());
            flags |= rusqlite::OpenFlags::SQLITE_OPEN_CREATE;
        }

        Self::with_connection(rusqlite::Connection::open_with_flags(
            path, flags,
        )?)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, Error> {
        Self::with_connection(rusqlite::Connection::open_in_memory()?)
    }

    fn with_connection(mut cxn: rusqlite::Connection) -> Result<Self, Error> {
        cxn.pragma_update(None, "foreign_keys", true)?;
        cxn.busy_timeout(Duration::from_secs(10))?;
        apply_migrations(&mut cxn)?;
        Ok(Self { cxn })
    }

    pub fn schema_version(&self) -> Result<usize, Error> {
        Ok(self
            .cxn
            .query_row("SELECT MAX(`version`) FROM `schema`", (), |row| {
                row.get::<_, Option<usize>>(0)
            })?
            .unwrap_or(0))
    }

    pub fn account(&self, addr: &str) -> Result<Option<Account>, Error> {
        Ok(self
            .cxn
            .query_row(
                "SELECT * FROM `account` WHERE `email_addr` = ?",
                (normalize_addr(addr),),
                Account::from_row,
            )
            .optional()?)
    }

    pub fn accounts(&self) -> Result<Vec<Account>, Error> {
        let mut stmt = self
            .cxn
            .prepare("SELECT * FROM `account` ORDER BY `email_addr`")?;
        let accounts = stmt
            .query_map((), Account::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    pub fn insert_account(&mut self, account: &Account) -> Result<(), Error> {
        self.cxn.execute(
            "INSERT INTO `account` \
             (`email_addr`, `keyid`, `keydata`, `prefer_encrypt`, `enabled`) \
             VALUES (?, ?, ?, ?, ?)",
            (
                normalize_addr(&account.email_addr),
                &account.keyid,
                &account.keydata,
                account.prefer_encrypt,
                account.enabled,
            ),
        )?;
        Ok(())
    }

    pub fn update_account(&mut self, account: &Account) -> Result<(), Error> {
        let n = self.cxn.execute(
            "UPDATE `account` SET \
             `keyid` = ?, `keydata` = ?, `prefer_encrypt` = ?, `enabled` = ? \
             WHERE `email_addr` = ?",
            (
                &account.keyid,
                &account.keydata,
                account.prefer_encrypt,
                account.enabled,
                normalize_addr(&account.email_addr),
            ),
        )?;
        if 0 == n {
            return Err(Error::KeyNotFound(account.email_addr.clone()));
        }
        Ok(())
    }

    /// Returns whether there was such an account.
    pub fn delete_account(&mut self, addr: &str) -> Result<bool, Error> {
        Ok(0 != self.cxn.execute(
            "DELETE FROM `account` WHERE `email_addr` = ?",
            (normalize_addr(addr),),
        )?)
    }

    pub fn peer(&self, addr: &str) -> Result<Option<Peer>, Error> {
        get_peer(&self.cxn, addr)
    }

    /// Start a transaction in which a message's headers are ingested.
    pub fn write_tx(&mut self) -> Result<WriteTx<'_>, Error> {
        Ok(WriteTx {
            txn: self.cxn.transaction_with_behavior(
                rusqlite::TransactionBehavior::Immediate,
            )?,
        })
    }

    #[cfg(test)]
    pub fn peer_history(&self, addr: &str) -> Result<Vec<PeerHistory>, Error> {
        let mut stmt = self.cxn.prepare(
            "SELECT * FROM `peer_history` WHERE `peer_email_addr` = ? \
             ORDER BY `rowid`",
        )?;
        let rows = stmt
            .query_map((normalize_addr(addr),), |row| {
                Ok(PeerHistory {
                    peer_email_addr: row.get("peer_email_addr")?,
                    email_msgid: row.get("email_msgid")?,
                    timestamp: row.get("timestamp")?,
                    keydata: row.get("keydata")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub fn gossip_history(
        &self,
        addr: &str,
    ) -> Result<Vec<GossipHistory>, Error> {
        let mut stmt = self.cxn.prepare(
            "SELECT * FROM `gossip_history` WHERE `peer_email_addr` = ? \
             ORDER BY `rowid`",
        )?;
        let rows = stmt
            .query_map((normalize_addr(addr),), |row| {
                Ok(GossipHistory {
                    peer_email_addr: row.get("peer_email_addr")?,
                    sender_email_addr: row.get("sender_email_addr")?,
                    email_msgid: row.get("email_msgid")?,
                    timestamp: row.get("timestamp")?,
                    gossip_keydata: row.get("gossip_keydata")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Peer updates made on behalf of one message. Dropping it without calling
/// `commit` discards them all.
pub struct WriteTx<'a> {
    txn: rusqlite::Transaction<'a>,
}

impl WriteTx<'_> {
    pub fn peer(&self, addr: &str) -> Result<Option<Peer>, Error> {
        get_peer(&self.txn, addr)
    }

    pub fn insert_peer(&self, peer: &Peer) -> Result<(), Error> {
        self.txn.execute(
            "INSERT INTO `peer` \
             (`email_addr`, `last_seen`, `autocrypt_timestamp`, `keyid`, \
              `keydata`, `prefer_encrypt`, `gossip_timestamp`, \
              `gossip_keyid`, `gossip_keydata`) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                normalize_addr(&peer.email_addr),
                peer.last_seen,
                peer.autocrypt_timestamp,
                &peer.keyid,
                &peer.keydata,
                peer.prefer_encrypt,
                peer.gossip_timestamp,
                &peer.gossip_keyid,
                &peer.gossip_keydata,
            ),
        )?;
        Ok(())
    }

    pub fn update_peer(&self, peer: &Peer) -> Result<(), Error> {
        self.txn.execute(
            "UPDATE `peer` SET \
             `last_seen` = ?, `autocrypt_timestamp` = ?, `keyid` = ?, \
             `keydata` = ?, `prefer_encrypt` = ?, `gossip_timestamp` = ?, \
             `gossip_keyid` = ?, `gossip_keydata` = ? \
             WHERE `email_addr` = ?",
            (
                peer.last_seen,
                peer.autocrypt_timestamp,
                &peer.keyid,
                &peer.keydata,
                peer.prefer_encrypt,
                peer.gossip_timestamp,
                &peer.gossip_keyid,
                &peer.gossip_keydata,
                normalize_addr(&peer.email_addr),
            ),
        )?;
        Ok(())
    }

    pub fn add_peer_history(&self, entry: &PeerHistory) -> Result<(), Error> {
        self.txn.execute(
            "INSERT INTO `peer_history` \
             (`peer_email_addr`, `email_msgid`, `timestamp`, `keydata`) \
             VALUES (?, ?, ?, ?)",
            (
                normalize_addr(&entry.peer_email_addr),
                &entry.email_msgid,
                entry.timestamp,
                &entry.keydata,
            ),
        )?;
        Ok(())
    }

    pub fn add_gossip_history(
        &self,
        entry: &GossipHistory,
    ) -> Result<(), Error> {
        self.txn.execute(
            "INSERT INTO `gossip_history` \
             (`peer_email_addr`, `sender_email_addr`, `email_msgid`, \
              `timestamp`, `gossip_keydata`) \
             VALUES (?, ?, ?, ?, ?)",
            (
                normalize_addr(&entry.peer_email_addr),
                normalize_addr(&entry.sender_email_addr),
                &entry.email_msgid,
                entry.timestamp,
                &entry.gossip_keydata,
            ),
        )?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), Error> {
        self.txn.commit()?;
        Ok(())
    }
}

fn get_peer(
    cxn: &rusqlite::Connection,
    addr: &str,
) -> Result<Option<Peer>, Error> {
    Ok(cxn
        .query_row(
            "SELECT * FROM `peer` WHERE `email_addr` = ?",
            (normalize_addr(addr),),
            Peer::from_row,
        )
        .optional()?)
}

fn apply_migrations(cxn: &mut rusqlite::Connection) -> Result<(), Error> {
    let latest_version = MIGRATIONS.len();

    let txn = cxn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Exclusive)?;
    txn.execute(
        "CREATE TABLE IF NOT EXISTS `schema` (\
         `version` INTEGER NOT NULL PRIMARY KEY, \
         `applied_at` INTEGER NOT NULL\
         ) STRICT",
        (),
    )?;

    let current_version = txn
        .query_row("SELECT MAX(`version`) FROM `schema`", (), |row| {
            row.get::<_, Option<usize>>(0)
        })?
        .unwrap_or(0);

    if current_version > latest_version {
        return Err(Error::SchemaError(format!(
            "database is at version {}, but only {} is understood",
            current_version, latest_version
        )));
    }

    for (version, migration) in MIGRATIONS
        .iter()
        .copied()
        .enumerate()
        .map(|(ix, migration)| (ix + 1, migration))
        .skip(current_version)
    {
        info!("Applying #{} migration to Autocrypt DB", version);
        txn.execute_batch(migration)?;
        txn.execute(
            "INSERT INTO `schema` (`version`, `applied_at`) VALUES (?, ?)",
            (version, Utc::now().timestamp()),
        )?;
    }

    txn.commit()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    fn peer(addr: &str) -> Peer {
        Peer {
            email_addr: addr.to_owned(),
            last_seen: 100,
            autocrypt_timestamp: 100,
            keyid: "AAAA".to_owned(),
            keydata: "Zm9v".to_owned(),
            prefer_encrypt: true,
            ..Peer::default()
        }
    }

    #[test]
    fn open_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("autocrypt.db");

        assert_matches!(
            Err(Error::SchemaError(_)),
            Store::open(&path, false).map(|_| ())
        );

        {
            let mut store = Store::open(&path, true).unwrap();
            assert_eq!(MIGRATIONS.len(), store.schema_version().unwrap());
            store
                .insert_account(&Account {
                    email_addr: "Me@Example.com".to_owned(),
                    keyid: "K".to_owned(),
                    keydata: "D".to_owned(),
                    prefer_encrypt: false,
                    enabled: true,
                })
                .unwrap();
        }

        let store = Store::open(&path, false).unwrap();
        assert_eq!(MIGRATIONS.len(), store.schema_version().unwrap());
        let account = store.account("me@EXAMPLE.com").unwrap().unwrap();
        assert_eq!("me@example.com", account.email_addr);
        assert!(account.enabled);
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("autocrypt.db");
        drop(Store::open(&path, true).unwrap());

        {
            let cxn = rusqlite::Connection::open(&path).unwrap();
            cxn.execute(
                "INSERT INTO `schema` (`version`, `applied_at`) \
                 VALUES (99, 0)",
                (),
            )
            .unwrap();
        }

        assert_matches!(
            Err(Error::SchemaError(_)),
            Store::open(&path, false).map(|_| ())
        );
    }

    #[test]
    fn account_crud() {
        let mut store = Store::in_memory().unwrap();
        let mut account = Account {
            email_addr: "me@example.com".to_owned(),
            keyid: "K".to_owned(),
            keydata: "D".to_owned(),
            prefer_encrypt: false,
            enabled: true,
        };
        store.insert_account(&account).unwrap();
        assert!(store.insert_account(&account).is_err());

        account.prefer_encrypt = true;
        store.update_account(&account).unwrap();
        assert_eq!(
            vec![account.clone()],
            store.accounts().unwrap()
        );

        assert!(store.delete_account("ME@example.com").unwrap());
        assert!(!store.delete_account("me@example.com").unwrap());
        assert_matches!(
            Err(Error::KeyNotFound(_)),
            store.update_account(&account)
        );
        assert!(store.accounts().unwrap().is_empty());
    }

    #[test]
    fn uncommitted_writes_are_discarded() {
        let mut store = Store::in_memory().unwrap();
        {
            let tx = store.write_tx().unwrap();
            tx.insert_peer(&peer("bob@example.com")).unwrap();
            assert!(tx.peer("bob@example.com").unwrap().is_some());
        }
        assert_eq!(None, store.peer("bob@example.com").unwrap());

        let tx = store.write_tx().unwrap();
        tx.insert_peer(&peer("Bob@Example.com")).unwrap();
        tx.add_peer_history(&PeerHistory {
            peer_email_addr: "Bob@Example.com".to_owned(),
            email_msgid: "<1@example.com>".to_owned(),
            timestamp: 100,
            keydata: "Zm9v".to_owned(),
        })
        .unwrap();
        tx.commit().unwrap();

        let stored = store.peer("bob@example.com").unwrap().unwrap();
        assert_eq!("bob@example.com", stored.email_addr);
        assert_eq!(1, store.peer_history("bob@example.com").unwrap().len());
    }

    #[test]
    fn peer_update() {
        let mut store = Store::in_memory().unwrap();
        let mut p = peer("carol@example.com");
        let tx = store.write_tx().unwrap();
        tx.insert_peer(&p).unwrap();
        p.last_seen = 200;
        p.gossip_keyid = "GGGG".to_owned();
        tx.update_peer(&p).unwrap();
        tx.add_gossip_history(&GossipHistory {
            peer_email_addr: p.email_addr.clone(),
            sender_email_addr: "Alice@example.com".to_owned(),
            email_msgid: "<2@example.com>".to_owned(),
            timestamp: 200,
            gossip_keydata: "YmFy".to_owned(),
        })
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(Some(p), store.peer("carol@example.com").unwrap());
        let gossip = store.gossip_history("carol@example.com").unwrap();
        assert_eq!("alice@example.com", gossip[0].sender_email_addr);
    }
}
