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

//! End-to-end message security.
//!
//! `Crypt` is the multiplexor: it owns at most one backend per scheme and is
//! the single entry point through which the rest of the program signs,
//! encrypts, decrypts and verifies. Which implementation backs a scheme
//! (external programs or the in-process library) is decided once, when the
//! backends are registered.

pub mod armor;
pub mod backend;
pub mod expando;
pub mod flags;
pub mod handler;
pub mod key;
pub mod library;
pub mod ops;
pub mod pgp;
pub mod smime;

use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use self::backend::*;
use self::flags::SecurityFlags;
use crate::autocrypt::Autocrypt;
use crate::mime::model::*;
use crate::mime::state::State;
use crate::support::error::Error;
use crate::support::file_ops::scratch_dir;
use crate::support::prompt::Prompt;
use crate::support::system_config::SystemConfig;

pub struct Crypt {
    pub config: SystemConfig,
    pub prompt: Box<dyn Prompt>,
    pgp: Option<Box<dyn CryptBackend>>,
    smime: Option<Box<dyn CryptBackend>>,
    /// Present when Autocrypt is enabled and its store could be opened.
    pub autocrypt: Option<Autocrypt>,
}

impl Crypt {
    /// A multiplexor with no backends registered.
    pub fn new(config: SystemConfig, prompt: Box<dyn Prompt>) -> Self {
        Crypt {
            config,
            prompt,
            pgp: None,
            smime: None,
            autocrypt: None,
        }
    }

    /// A multiplexor with the backends the configuration asks for.
    pub fn with_configured_backends(
        config: SystemConfig,
        prompt: Box<dyn Prompt>,
    ) -> Result<Self, Error> {
        let mut this = Crypt::new(config, prompt);
        if this.config.crypt.use_gpgme {
            info!("Using library backends");
            this.register(Box::new(library::LibraryBackend::gnupg(
                &this.config,
            )));
            this.register(Box::new(library::LibraryBackend::openssl_smime(
                &this.config,
            )));
        } else {
            info!("Using classic backends");
            this.register(Box::new(pgp::PgpClassic::new(&this.config)?));
            this.register(Box::new(smime::SmimeClassic::new(&this.config)?));
        }

        if this.config.autocrypt.enabled {
            match Autocrypt::init(&this.config, false) {
                Ok(ac) => this.autocrypt = Some(ac),
                Err(e) => warn!("Autocrypt unavailable: {}", e),
            }
        }
        Ok(this)
    }

    /// Install `backend` for its scheme, replacing any previous one.
    pub fn register(&mut self, backend: Box<dyn CryptBackend>) {
        let scheme = backend.scheme();
        let slot = match scheme {
            Scheme::Pgp => &mut self.pgp,
            Scheme::Smime => &mut self.smime,
        };
        if let Some(old) = slot.replace(backend) {
            old.cleanup();
        }
        if let Some(b) = self.slot(scheme) {
            b.init(self);
        }
    }

    fn slot(&self, scheme: Scheme) -> Option<&dyn CryptBackend> {
        match scheme {
            Scheme::Pgp => self.pgp.as_deref(),
            Scheme::Smime => self.smime.as_deref(),
        }
    }

    pub fn has_backend(&self, scheme: Scheme) -> bool {
        self.slot(scheme).is_some()
    }

    pub fn backend(&self, scheme: Scheme) -> Result<&dyn CryptBackend, Error> {
        self.slot(scheme).ok_or(Error::BackendUnavailable)
    }

    pub fn pgp_ops(&self) -> Result<&dyn PgpOps, Error> {
        self.backend(Scheme::Pgp)?.pgp().ok_or(Error::Unsupported)
    }

    pub fn smime_ops(&self) -> Result<&dyn SmimeOps, Error> {
        self.backend(Scheme::Smime)?.smime().ok_or(Error::Unsupported)
    }

    /// The directory temporary files go into.
    pub fn scratch(&self) -> PathBuf {
        scratch_dir(&self.config.crypt.tmp_dir)
    }

    pub fn void_passphrase(&self, scheme: Scheme) {
        if let Some(b) = self.slot(scheme) {
            b.void_passphrase(self);
        }
    }

    pub fn valid_passphrase(&self, scheme: Scheme) -> bool {
        self.slot(scheme).map_or(false, |b| b.valid_passphrase(self))
    }

    /// Decrypt an encrypted part, preferring the Autocrypt keyring for PGP.
    pub fn decrypt_mime(
        &self,
        scheme: Scheme,
        source: &[u8],
        body: &Body,
    ) -> Result<Decrypted, Error> {
        if let (Scheme::Pgp, Some(ac)) = (scheme, self.autocrypt.as_ref()) {
            match ac.backend().decrypt_mime(self, source, body) {
                Ok(mut dec) => {
                    dec.body.is_autocrypt = true;
                    return Ok(dec);
                }
                Err(e) => debug!("Autocrypt decryption failed: {}", e),
            }
        }
        self.backend(scheme)?.decrypt_mime(self, source, body)
    }

    pub fn application_handler(
        &self,
        scheme: Scheme,
        body: &mut Body,
        state: &mut State,
    ) -> i32 {
        match self.slot(scheme) {
            Some(b) => b.application_handler(self, body, state),
            None => -1,
        }
    }

    /// Render a `multipart/encrypted` part, trying the Autocrypt keyring
    /// first for PGP.
    pub fn encrypted_handler(
        &self,
        scheme: Scheme,
        body: &mut Body,
        state: &mut State,
    ) -> i32 {
        if let (Scheme::Pgp, Some(ac)) = (scheme, self.autocrypt.as_ref()) {
            let mark = state.out.len();
            if 0 == ac.backend().encrypted_handler(self, body, state) {
                body.is_autocrypt = true;
                return 0;
            }
            state.out.truncate(mark);
        }

        match self.slot(scheme) {
            Some(b) => b.encrypted_handler(self, body, state),
            None => -1,
        }
    }

    pub fn find_keys(
        &self,
        scheme: Scheme,
        addrs: &[Address],
        oppenc_mode: bool,
    ) -> Result<Option<String>, Error> {
        self.backend(scheme)?.find_keys(self, addrs, oppenc_mode)
    }

    pub fn sign_message(
        &self,
        scheme: Scheme,
        body: Body,
        from: Option<&Address>,
    ) -> Result<Body, Error> {
        self.backend(scheme)?.sign_message(self, body, from)
    }

    /// Mark the text parts of `body` which carry inline PGP, so they are
    /// rendered by the PGP backend.
    pub fn check_traditional(
        &self,
        source: &[u8],
        body: &mut Body,
        just_one: bool,
    ) -> bool {
        match self.pgp_ops() {
            Ok(ops) => ops.check_traditional(self, source, body, just_one),
            Err(_) => false,
        }
    }

    pub fn verify_one(
        &self,
        scheme: Scheme,
        sig: &Body,
        state: &mut State,
        signed_file: &Path,
    ) -> i32 {
        match self.slot(scheme) {
            Some(b) => b.verify_one(self, sig, state, signed_file),
            None => -1,
        }
    }

    pub fn send_menu(
        &self,
        scheme: Scheme,
        email: &mut Email,
    ) -> SecurityFlags {
        match self.slot(scheme) {
            Some(b) => b.send_menu(self, email),
            None => email.security,
        }
    }

    pub fn set_sender(&self, scheme: Scheme, sender: &str) {
        if let Some(b) = self.slot(scheme) {
            b.set_sender(self, sender);
        }
    }

    pub fn cleanup(&mut self) {
        for backend in self.pgp.take().into_iter().chain(self.smime.take()) {
            backend.cleanup();
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::support::prompt::test_prompt::Scripted;

    /// A multiplexor without backends, using a scripted prompt.
    pub fn bare_crypt(prompt: Scripted) -> Crypt {
        Crypt::new(SystemConfig::default(), Box::new(prompt))
    }

    /// A backend which "decrypts" to a fixed plaintext and reports a fixed
    /// verification result.
    pub struct Canned {
        pub scheme: Scheme,
        /// `None` makes decryption fail.
        pub plaintext: Option<Vec<u8>>,
        pub verify_rc: i32,
    }

    impl Default for Canned {
        fn default() -> Self {
            Canned {
                scheme: Scheme::Pgp,
                plaintext: None,
                verify_rc: 0,
            }
        }
    }

    impl CryptBackend for Canned {
        fn scheme(&self) -> Scheme {
            self.scheme
        }

        fn void_passphrase(&self, _: &Crypt) {}

        fn valid_passphrase(&self, _: &Crypt) -> bool {
            true
        }

        fn decrypt_mime(
            &self,
            _: &Crypt,
            _: &[u8],
            _: &Body,
        ) -> Result<Decrypted, Error> {
            let plaintext =
                self.plaintext.clone().ok_or(Error::DecryptFailed)?;
            let source: std::rc::Rc<[u8]> = plaintext.into();
            let body = crate::mime::parse::parse_entity_bytes(
                std::rc::Rc::clone(&source),
            );
            Ok(Decrypted { source, body })
        }

        fn application_handler(
            &self,
            _: &Crypt,
            _: &mut Body,
            _: &mut State,
        ) -> i32 {
            -1
        }

        fn encrypted_handler(
            &self,
            ctx: &Crypt,
            body: &mut Body,
            state: &mut State,
        ) -> i32 {
            if state.has(crate::mime::state::StateFlags::DISPLAY) {
                ctx.current_time_banner(state, "PGP");
            }
            let source = std::rc::Rc::clone(&state.fp_in);
            match self.decrypt_mime(ctx, &source, body) {
                Ok(dec) => {
                    let (opening, closing) = handler::PGP_ENCRYPTED_BANNERS;
                    ctx.render_decrypted(body, state, dec, opening, closing)
                }
                Err(_) => -1,
            }
        }

        fn find_keys(
            &self,
            _: &Crypt,
            _: &[Address],
            _: bool,
        ) -> Result<Option<String>, Error> {
            Ok(None)
        }

        fn sign_message(
            &self,
            _: &Crypt,
            _: Body,
            _: Option<&Address>,
        ) -> Result<Body, Error> {
            Err(Error::Unsupported)
        }

        fn verify_one(
            &self,
            _: &Crypt,
            _: &Body,
            state: &mut State,
            _: &Path,
        ) -> i32 {
            state.puts(&format!("[-- canned verify {} --]\n", self.verify_rc));
            self.verify_rc
        }

        fn send_menu(&self, _: &Crypt, email: &mut Email) -> SecurityFlags {
            email.security
        }
    }
}
