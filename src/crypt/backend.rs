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

//! The capability table every backend implements.
//!
//! The multiplexor holds one backend per scheme and routes every operation
//! through these traits. Operations specific to one scheme live in the
//! optional `PgpOps` and `SmimeOps` parts; a backend which lacks one simply
//! does not provide it.
//!
//! Every method receives the multiplexor as context, which is how a backend
//! reaches configuration, the user prompt and, when rendering decrypted
//! content, the MIME walker.

use std::fmt;
use std::path::Path;
use std::rc::Rc;

use super::flags::SecurityFlags;
use super::Crypt;
use crate::mime::model::*;
use crate::mime::state::State;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Pgp,
    Smime,
}

impl Scheme {
    pub fn application_flag(self) -> SecurityFlags {
        match self {
            Scheme::Pgp => SecurityFlags::APPLICATION_PGP,
            Scheme::Smime => SecurityFlags::APPLICATION_SMIME,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Scheme::Pgp => write!(f, "PGP"),
            Scheme::Smime => write!(f, "S/MIME"),
        }
    }
}

/// The result of decrypting a part: the plaintext entity and its parsed
/// body, whose offsets refer to `source`.
#[derive(Debug)]
pub struct Decrypted {
    pub source: Rc<[u8]>,
    pub body: Body,
}

pub trait CryptBackend {
    fn scheme(&self) -> Scheme;

    fn init(&self, _ctx: &Crypt) {}

    fn cleanup(&self) {}

    /// Forget any cached passphrase.
    fn void_passphrase(&self, ctx: &Crypt);

    /// Ensure a passphrase is available, asking for one if needed.
    fn valid_passphrase(&self, ctx: &Crypt) -> bool;

    /// Decrypt the encrypted part `body`, whose payload is in `source`.
    fn decrypt_mime(
        &self,
        ctx: &Crypt,
        source: &[u8],
        body: &Body,
    ) -> Result<Decrypted, Error>;

    /// Render a part of one of the scheme's application types.
    fn application_handler(
        &self,
        ctx: &Crypt,
        body: &mut Body,
        state: &mut State,
    ) -> i32;

    /// Render a `multipart/encrypted` part.
    fn encrypted_handler(
        &self,
        _ctx: &Crypt,
        _body: &mut Body,
        _state: &mut State,
    ) -> i32 {
        -1
    }

    /// Look up encryption keys for `addrs`, returning a space-separated
    /// key list. `Ok(None)` means the user cancelled or, in opportunistic
    /// mode, that some key could not be found without asking.
    fn find_keys(
        &self,
        ctx: &Crypt,
        addrs: &[Address],
        oppenc_mode: bool,
    ) -> Result<Option<String>, Error>;

    /// Wrap `body` in a signature.
    fn sign_message(
        &self,
        ctx: &Crypt,
        body: Body,
        from: Option<&Address>,
    ) -> Result<Body, Error>;

    /// Verify one detached signature over the content in `signed_file`.
    ///
    /// Returns 0 for a good signature, 1 for a bad one, 2 if it is good but
    /// comes with warnings, and -1 if it could not be checked at all.
    fn verify_one(
        &self,
        ctx: &Crypt,
        sig: &Body,
        state: &mut State,
        signed_file: &Path,
    ) -> i32;

    /// Let the user adjust the security flags of `email`.
    fn send_menu(&self, ctx: &Crypt, email: &mut Email) -> SecurityFlags;

    /// Remember the sender address for signer selection.
    fn set_sender(&self, _ctx: &Crypt, _sender: &str) {}

    fn pgp(&self) -> Option<&dyn PgpOps> {
        None
    }

    fn smime(&self) -> Option<&dyn SmimeOps> {
        None
    }
}

/// Operations only meaningful for OpenPGP.
pub trait PgpOps {
    fn encrypt_message(
        &self,
        ctx: &Crypt,
        body: Body,
        keylist: &str,
        sign: bool,
        from: Option<&Address>,
    ) -> Result<Body, Error>;

    /// A `application/pgp-keys` part holding a key the user picks.
    fn make_key_attachment(&self, ctx: &Crypt) -> Result<Option<Body>, Error>;

    /// Detect inline PGP in the text parts of `body`, marking the parts
    /// found. Returns whether any was found.
    fn check_traditional(
        &self,
        ctx: &Crypt,
        source: &[u8],
        body: &mut Body,
        just_one: bool,
    ) -> bool;

    /// Inline-sign and/or encrypt the text part `body`.
    fn traditional_encryptsign(
        &self,
        ctx: &Crypt,
        body: &Body,
        flags: SecurityFlags,
        keylist: &str,
    ) -> Result<Option<Body>, Error>;

    fn invoke_getkeys(&self, ctx: &Crypt, addr: &Address);

    fn invoke_import(&self, ctx: &Crypt, path: &Path) -> Result<(), Error>;

    fn extract_key_from_attachment(
        &self,
        ctx: &Crypt,
        source: &[u8],
        body: &Body,
    ) -> Result<(), Error>;
}

/// Operations only meaningful for S/MIME.
pub trait SmimeOps {
    /// Fetch certificates for the recipients of a message.
    fn getkeys(&self, ctx: &Crypt, env: &Envelope);

    /// Check that the signer of `email` is its sender.
    fn verify_sender(&self, ctx: &Crypt, email: &Email) -> Result<(), Error>;

    fn build_smime_entity(
        &self,
        ctx: &Crypt,
        body: Body,
        keylist: &str,
    ) -> Result<Body, Error>;

    fn invoke_import(
        &self,
        ctx: &Crypt,
        path: &Path,
        mailbox: Option<&str>,
    ) -> Result<(), Error>;
}
