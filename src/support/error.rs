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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed input: {0}")]
    BadInput(String),
    #[error("No backend is registered for this scheme")]
    BackendUnavailable,
    #[error("Operation not supported by this backend")]
    Unsupported,
    #[error("Passphrase required")]
    PassphraseRequired,
    #[error("Signature did not verify")]
    VerifyFailed,
    #[error("Signature made by an unknown key")]
    VerifyMissingKey,
    #[error("Decryption failed")]
    DecryptFailed,
    #[error("Message was not actually encrypted")]
    NotActuallyEncrypted,
    #[error("Backend refused to decrypt the message")]
    BackendRefused,
    #[error("No key found for {0}")]
    KeyNotFound(String),
    #[error("Ambiguous key specification {0}")]
    KeyAmbiguous(String),
    #[error("Interrupted")]
    Interrupted,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Unable to run '{0}'")]
    SpawnFailed(String),
    #[error("Command exited with status {0}")]
    CommandFailed(i32),
    #[error("No output from crypto backend")]
    NoOutput,
    #[error("Autocrypt database inconsistency: {0}")]
    SchemaError(String),
    #[error("Autocrypt is not enabled")]
    AutocryptDisabled,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// The integer status used at the C-style handler boundary.
    pub fn rc(&self) -> i32 {
        match *self {
            Error::Interrupted => -2,
            _ => -1,
        }
    }

    /// Whether the error indicates a decryption failure of some kind.
    pub fn is_decrypt_failure(&self) -> bool {
        matches!(
            *self,
            Error::DecryptFailed
                | Error::NotActuallyEncrypted
                | Error::BackendRefused
        )
    }
}
