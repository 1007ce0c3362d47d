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

//! The library backends.
//!
//! Where the classic backends run user-configurable command templates, these
//! drive a crypto engine directly and act on its structured results: key
//! listings with validity, and per-signature status summaries. There is one
//! backend type for both schemes; which scheme it serves is a property of
//! its engine.

pub mod engine;
mod gnupg;
mod inline;
mod keys;
mod openssl_smime;
mod sigstatus;
#[cfg(test)]
pub mod test_engine;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info, warn};

use self::engine::{Decryption, Engine, Protocol};
use self::gnupg::GnupgEngine;
use self::inline::recipients;
use self::openssl_smime::OpensslSmime;
use super::armor::mark_traditional;
use super::backend::*;
use super::flags::{KeyFlags, SecurityFlags};
use super::handler::{crlf_to_lf, payload, PGP_ENCRYPTED_BANNERS};
use super::key::{is_numerical_keyid, KeyInfo};
use super::ops::{convert_to_7bit, is_application_smime, pgp_encrypted_payload};
use super::Crypt;
use crate::mime::content_encoding::decode_transfer;
use crate::mime::header::parse_address;
use crate::mime::model::*;
use crate::mime::parse::parse_entity_bytes;
use crate::mime::state::{State, StateFlags};
use crate::mime::write::{assign_boundaries, entity_to_vec};
use crate::support::error::Error;
use crate::support::file_ops::scratch_dir;
use crate::support::passphrase::PassphraseCache;
use crate::support::system_config::{PgpConfig, SmimeConfig, SystemConfig};

const PGP_SIGNED_ENCRYPTED_BANNERS: (&str, &str) = (
    "[-- The following data is PGP/MIME signed and encrypted --]\n",
    "[-- End of PGP/MIME signed and encrypted data --]\n",
);
const SMIME_ENCRYPTED_BANNERS: (&str, &str) = (
    "[-- The following data is S/MIME encrypted --]\n",
    "[-- End of S/MIME encrypted data --]\n",
);
const SMIME_SIGNED_BANNERS: (&str, &str) = (
    "[-- The following data is S/MIME signed --]\n",
    "[-- End of S/MIME signed data --]\n",
);
const BEGIN_SIGNATURE_INFO: &str = "[-- Begin signature information --]\n";
const END_SIGNATURE_INFO: &str = "[-- End signature information --]\n\n";

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

/// Canonicalise bare LF line endings to CRLF.
fn to_crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut prev = 0u8;
    for &c in data {
        if b'\n' == c && b'\r' != prev {
            out.push(b'\r');
        }
        out.push(c);
        prev = c;
    }
    out
}

/// Whether `a` and `b` are the same mailbox: the local part compares exactly,
/// the domain without regard to case.
fn same_mailbox(a: &str, b: &str) -> bool {
    match (a.rsplit_once('@'), b.rsplit_once('@')) {
        (Some((la, da)), Some((lb, db))) => {
            la == lb && da.eq_ignore_ascii_case(db)
        }
        _ => a == b,
    }
}

pub struct LibraryBackend {
    engine: Rc<dyn Engine>,
    pgp: PgpConfig,
    smime: SmimeConfig,
    passphrase: PassphraseCache,
    /// The signing key chosen in the send menu.
    sign_as: RefCell<Option<String>>,
    /// The sender set by the composer, for signer selection.
    sender: RefCell<Option<String>>,
    /// Previous answers to "which key" questions, keyed by what they were
    /// for.
    id_defaults: RefCell<HashMap<String, String>>,
    /// The key of the first signature shown since the last verification,
    /// for checking it against the sender.
    signature_key: RefCell<Option<Rc<KeyInfo>>>,
    /// Whether this backend serves the Autocrypt keyring, whose failures are
    /// not the user's concern.
    autocrypt: bool,
}

impl LibraryBackend {
    /// The OpenPGP backend, over the user's GnuPG keyring.
    pub fn gnupg(config: &SystemConfig) -> Self {
        let engine = GnupgEngine::new(
            &config.pgp.gpg_program,
            None,
            scratch_dir(&config.crypt.tmp_dir),
            config.pgp.ignore_subkeys,
        );
        LibraryBackend::with_engine(Rc::new(engine), config)
    }

    /// The OpenPGP backend of the Autocrypt keyring in `home`.
    pub fn autocrypt(config: &SystemConfig, home: PathBuf) -> Self {
        let engine = GnupgEngine::new(
            &config.pgp.gpg_program,
            Some(home),
            scratch_dir(&config.crypt.tmp_dir),
            false,
        );
        LibraryBackend::with_engine(Rc::new(engine), config).for_autocrypt()
    }

    /// Mark this backend as serving the Autocrypt keyring.
    pub fn for_autocrypt(mut self) -> Self {
        self.autocrypt = true;
        self
    }

    /// The S/MIME backend, over the configured key and certificate stores.
    pub fn openssl_smime(config: &SystemConfig) -> Self {
        LibraryBackend::with_engine(
            Rc::new(OpensslSmime::new(&config.smime)),
            config,
        )
    }

    pub fn with_engine(engine: Rc<dyn Engine>, config: &SystemConfig) -> Self {
        let passphrase = match engine.protocol() {
            Protocol::OpenPgp => {
                PassphraseCache::new("PGP", config.pgp.timeout)
            }
            Protocol::Cms => {
                PassphraseCache::new("S/MIME", config.smime.timeout)
            }
        };
        LibraryBackend {
            engine,
            pgp: config.pgp.clone(),
            smime: config.smime.clone(),
            passphrase,
            sign_as: RefCell::new(None),
            sender: RefCell::new(None),
            id_defaults: RefCell::new(HashMap::new()),
            signature_key: RefCell::new(None),
            autocrypt: false,
        }
    }

    pub fn engine(&self) -> &Rc<dyn Engine> {
        &self.engine
    }

    pub fn set_sign_as(&self, key: Option<String>) {
        *self.sign_as.borrow_mut() = key;
    }

    fn is_cms(&self) -> bool {
        Protocol::Cms == self.engine.protocol()
    }

    fn show_unusable(&self) -> bool {
        !self.is_cms() && self.pgp.show_unusable
    }

    /// The signing key from the configuration, if any.
    fn configured_signer(&self) -> Option<String> {
        let (sign_as, default_key) = if self.is_cms() {
            (&self.smime.sign_as, &self.smime.default_key)
        } else {
            (&self.pgp.sign_as, &self.pgp.default_key)
        };
        non_empty(sign_as).or_else(|| non_empty(default_key))
    }

    fn ensure_passphrase(&self, ctx: &Crypt) -> bool {
        if !self.engine.needs_passphrase() || self.passphrase.is_valid() {
            return true;
        }

        self.passphrase.void();
        let question = if self.is_cms() {
            "Enter S/MIME passphrase:"
        } else {
            "Enter PGP passphrase:"
        };
        match ctx.prompt.ask_passphrase(question) {
            Some(pass) => {
                self.passphrase.set(pass);
                true
            }
            None => false,
        }
    }

    /// Decrypt `data` into a MIME entity, writing what is learnt about its
    /// signatures to `state`.
    ///
    /// The returned status is 0 if there were no signatures, 1 if they are
    /// all good, 2 if good with warnings, and -1 otherwise.
    fn decrypt_part(
        &self,
        ctx: &Crypt,
        data: &[u8],
        state: &mut State,
    ) -> Result<(Decrypted, i32), Error> {
        let display = state.has(StateFlags::DISPLAY);
        if !self.ensure_passphrase(ctx) {
            return Err(Error::PassphraseRequired);
        }
        let pass = self.passphrase.get();

        let result = match self.engine.decrypt(data, pass.as_ref()) {
            // Opaque signed data, sent as enveloped data
            Err(Error::NotActuallyEncrypted) if self.is_cms() => {
                self.engine.verify(data, None).map(|v| Decryption {
                    plaintext: v.plaintext.unwrap_or_default(),
                    signatures: v.signatures,
                    recipients: vec![],
                })
            }
            r => r,
        };
        let dec = match result {
            Ok(dec) => dec,
            Err(e) => {
                if display {
                    state.attach_puts(&format!(
                        "[-- Error: decryption failed: {} --]\n\n",
                        e
                    ));
                }
                if let Error::DecryptFailed | Error::PassphraseRequired = e {
                    self.passphrase.void();
                }
                return Err(e);
            }
        };

        let mut is_signed = 0;
        let mut anywarn = false;
        if !dec.signatures.is_empty() {
            is_signed = -1;
            *self.signature_key.borrow_mut() = None;
            state.attach_puts(BEGIN_SIGNATURE_INFO);
            let (all_good, warn) = self.show_signatures(&dec.signatures, state);
            anywarn = warn;
            if all_good {
                is_signed = if anywarn { 2 } else { 1 };
            }
            state.attach_puts(END_SIGNATURE_INFO);
        }

        let source: Rc<[u8]> = Rc::from(crlf_to_lf(&dec.plaintext));
        let mut body = parse_entity_bytes(Rc::clone(&source));
        body.warnsig = anywarn;
        Ok((Decrypted { source, body }, is_signed))
    }

    /// The key tokens for one recipient, consulting crypt hooks first.
    /// `None` means no key could be determined.
    fn find_keys_for(
        &self,
        ctx: &Crypt,
        addr: &Address,
        oppenc: bool,
    ) -> Option<Vec<String>> {
        let hooks = ctx.crypt_hook_keys(&addr.mailbox);
        let mut tokens = Vec::new();
        let mut key_selected = false;
        let mut ix = 0;

        loop {
            let mut lookup = addr.clone();
            let mut key: Option<Rc<KeyInfo>> = None;
            let mut direct_id: Option<String> = None;

            if let Some(hook) = hooks.get(ix) {
                let answer = if ctx.config.crypt.confirm_hook && !oppenc {
                    ctx.prompt.yes_or_no(
                        &format!(
                            "Use keyID = \"{}\" for {}?",
                            hook, addr.mailbox
                        ),
                        true,
                    )
                } else {
                    Some(true)
                };

                match answer {
                    Some(true) => {
                        if is_numerical_keyid(hook) {
                            let id = hook.strip_prefix("0x").unwrap_or(hook);
                            direct_id = Some(id.to_owned());
                        } else if hook.contains('@') {
                            if let Some(a) = parse_address(hook) {
                                lookup = a;
                            }
                        } else if !oppenc {
                            key = self.getkeybystr(
                                ctx,
                                hook,
                                KeyFlags::CANENCRYPT,
                                false,
                            );
                        }
                    }
                    Some(false) => {
                        if key_selected || ix + 1 < hooks.len() {
                            ix += 1;
                            if ix >= hooks.len() {
                                return Some(tokens);
                            }
                            continue;
                        }
                    }
                    None => return None,
                }
            }

            let id = match direct_id {
                Some(id) => id,
                None => {
                    if key.is_none() {
                        key = self.getkeybyaddr(
                            ctx,
                            &lookup,
                            KeyFlags::CANENCRYPT,
                            oppenc,
                        );
                    }
                    if key.is_none() && !oppenc {
                        key = self.ask_for_key(
                            ctx,
                            &format!("Enter keyID for {}: ", lookup.mailbox),
                            Some(&lookup.mailbox),
                            KeyFlags::CANENCRYPT,
                            false,
                        );
                    }
                    key?.fpr_or_long_id().to_owned()
                }
            };

            tokens.push(format!("0x{}", id));
            key_selected = true;
            ix += 1;
            if ix >= hooks.len() {
                return Some(tokens);
            }
        }
    }

    /// Sign `data` with the key for `from`, asking for a passphrase if the
    /// engine wants one.
    fn sign_data(
        &self,
        ctx: &Crypt,
        data: &[u8],
        from: Option<&Address>,
    ) -> Result<engine::Signed, Error> {
        let sender = self.sender.borrow().as_deref().map(Address::new);
        let signer = self.signer(ctx, from.or(sender.as_ref()))?;
        if signer.is_empty() && self.is_cms() {
            ctx.prompt.error("Can't sign: No key specified. Use Sign As.");
            return Err(Error::KeyNotFound("S/MIME signing key".to_owned()));
        }
        if !self.ensure_passphrase(ctx) {
            return Err(Error::PassphraseRequired);
        }

        let pass = self.passphrase.get();
        match self.engine.sign(data, &signer, pass.as_ref()) {
            Ok(signed) => {
                info!("Signed message as {}", signer);
                Ok(signed)
            }
            Err(e) => {
                ctx.prompt.error(&format!("error signing data: {}", e));
                self.passphrase.void();
                Err(e)
            }
        }
    }

    fn import_file(&self, ctx: &Crypt, path: &Path) -> Result<(), Error> {
        let data = fs::read(path)?;
        match self.engine.import(&data) {
            Ok(n) => {
                let noun = if self.is_cms() { "certificates" } else { "keys" };
                ctx.prompt.message(&format!("{} {} imported", n, noun));
                info!("Imported {} {} from {}", n, noun, path.display());
                Ok(())
            }
            Err(e) => {
                ctx.prompt.error(&format!("Error importing key: {}", e));
                Err(e)
            }
        }
    }

    fn send_menu_choices(
        &self,
        ctx: &Crypt,
        email: &Email,
    ) -> (String, &'static str, &'static str) {
        let crypto = SecurityFlags::ENCRYPT | SecurityFlags::SIGN;
        let has_crypto = email.security.intersects(crypto);
        let oppenc_option = ctx.config.crypt.opportunistic_encrypt;
        let oppenc_on = oppenc_option
            && email.security.contains(SecurityFlags::OPPENCRYPT);

        if self.is_cms() {
            return if oppenc_on {
                (
                    "S/MIME (s)ign, sign (a)s, (p)gp, (c)lear, \
                     or (o)ppenc mode off?"
                        .to_owned(),
                    "sapco",
                    "SapCo",
                )
            } else if oppenc_option {
                (
                    "S/MIME (e)ncrypt, (s)ign, sign (a)s, (b)oth, (p)gp, \
                     (c)lear, or (o)ppenc mode?"
                        .to_owned(),
                    "esabpco",
                    "esabpcO",
                )
            } else {
                (
                    "S/MIME (e)ncrypt, (s)ign, sign (a)s, (b)oth, (p)gp \
                     or (c)lear?"
                        .to_owned(),
                    "esabpc",
                    "esabpc",
                )
            };
        }

        let mime_inline = if email.security.contains(SecurityFlags::INLINE) {
            "PGP/M(i)ME"
        } else {
            "(i)nline"
        };
        match (oppenc_on, oppenc_option, has_crypto) {
            (true, _, true) => (
                format!(
                    "PGP (s)ign, sign (a)s, {} format, s/(m)ime, (c)lear, \
                     or (o)ppenc mode off?",
                    mime_inline
                ),
                "saimco",
                "SaimCo",
            ),
            (true, _, false) => (
                "PGP (s)ign, sign (a)s, s/(m)ime, (c)lear, \
                 or (o)ppenc mode off?"
                    .to_owned(),
                "samco",
                "SamCo",
            ),
            (false, true, true) => (
                format!(
                    "PGP (e)ncrypt, (s)ign, sign (a)s, (b)oth, {} format, \
                     s/(m)ime, (c)lear, or (o)ppenc mode?",
                    mime_inline
                ),
                "esabimco",
                "esabimcO",
            ),
            (false, true, false) => (
                "PGP (e)ncrypt, (s)ign, sign (a)s, (b)oth, s/(m)ime, \
                 (c)lear, or (o)ppenc mode?"
                    .to_owned(),
                "esabmco",
                "esabmcO",
            ),
            (false, false, true) => (
                format!(
                    "PGP (e)ncrypt, (s)ign, sign (a)s, (b)oth, {} format, \
                     s/(m)ime, or (c)lear?",
                    mime_inline
                ),
                "esabimc",
                "esabimc",
            ),
            (false, false, false) => (
                "PGP (e)ncrypt, (s)ign, sign (a)s, (b)oth, s/(m)ime \
                 or (c)lear?"
                    .to_owned(),
                "esabmc",
                "esabmc",
            ),
        }
    }
}

impl CryptBackend for LibraryBackend {
    fn scheme(&self) -> Scheme {
        match self.engine.protocol() {
            Protocol::OpenPgp => Scheme::Pgp,
            Protocol::Cms => Scheme::Smime,
        }
    }

    fn void_passphrase(&self, _: &Crypt) {
        self.passphrase.void();
    }

    fn valid_passphrase(&self, ctx: &Crypt) -> bool {
        self.ensure_passphrase(ctx)
    }

    fn decrypt_mime(
        &self,
        ctx: &Crypt,
        source: &[u8],
        body: &Body,
    ) -> Result<Decrypted, Error> {
        let data = if self.is_cms() {
            let kind = is_application_smime(body);
            if kind.is_empty() || !body.parts.is_empty() {
                return Err(Error::BadInput("not an S/MIME entity".to_owned()));
            }
            decode_transfer(body.encoding, payload(body, source))
        } else {
            let part = pgp_encrypted_payload(body).ok_or_else(|| {
                Error::BadInput("not a PGP/MIME encrypted message".to_owned())
            })?;
            decode_transfer(part.encoding, payload(part, source))
        };

        let mut quiet = State::new(Rc::from(&b""[..]), StateFlags::empty());
        let (mut dec, is_signed) = self.decrypt_part(ctx, &data, &mut quiet)?;
        dec.body.goodsig = is_signed > 0;
        Ok(dec)
    }

    fn application_handler(
        &self,
        ctx: &Crypt,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        if !self.is_cms() {
            return self.inline_handler(ctx, b, state);
        }

        // Anything before this point claiming to be protected is spoofed
        b.mime_headers = None;
        b.warnsig = false;

        let kind = is_application_smime(b);
        if kind.is_empty() {
            return -1;
        }

        let data = payload(b, &state.fp_in).to_vec();
        match self.decrypt_part(ctx, &data, state) {
            Ok((dec, is_signed)) => {
                let (opening, closing) = if 0 != is_signed {
                    SMIME_SIGNED_BANNERS
                } else {
                    SMIME_ENCRYPTED_BANNERS
                };
                b.goodsig = is_signed > 0;
                b.warnsig = 2 == is_signed;
                b.badsig = is_signed < 0;
                ctx.render_decrypted(b, state, dec, opening, closing)
            }
            Err(e) => {
                debug!("S/MIME entity could not be opened: {}", e);
                if kind.contains(SecurityFlags::ENCRYPT) {
                    ctx.prompt.error("Decryption failed");
                }
                -1
            }
        }
    }

    fn encrypted_handler(
        &self,
        ctx: &Crypt,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        if self.is_cms() {
            return -1;
        }

        let ciphertext = payload(b, &state.fp_in).to_vec();
        match self.decrypt_part(ctx, &ciphertext, state) {
            Ok((dec, is_signed)) => {
                b.goodsig = is_signed > 0;
                let (opening, closing) = if 0 != is_signed {
                    PGP_SIGNED_ENCRYPTED_BANNERS
                } else {
                    PGP_ENCRYPTED_BANNERS
                };
                let rc = ctx.render_decrypted(b, state, dec, opening, closing);
                ctx.prompt.message("PGP message successfully decrypted");
                rc
            }
            Err(e) => {
                debug!("PGP/MIME decryption failed: {}", e);
                if !self.autocrypt {
                    ctx.prompt.error("Could not decrypt PGP message");
                }
                -1
            }
        }
    }

    fn find_keys(
        &self,
        ctx: &Crypt,
        addrs: &[Address],
        oppenc_mode: bool,
    ) -> Result<Option<String>, Error> {
        let mut keylist = Vec::new();
        for addr in addrs {
            match self.find_keys_for(ctx, addr, oppenc_mode) {
                Some(tokens) => keylist.extend(tokens),
                None => {
                    if self.is_cms() && !oppenc_mode {
                        ctx.prompt.message(&format!(
                            "No (valid) certificate found for {}",
                            addr.mailbox
                        ));
                    }
                    debug!("No {} key for {}", self.scheme(), addr.mailbox);
                    return Ok(None);
                }
            }
        }

        if keylist.is_empty() {
            Ok(None)
        } else {
            Ok(Some(keylist.join(" ")))
        }
    }

    fn sign_message(
        &self,
        ctx: &Crypt,
        mut body: Body,
        from: Option<&Address>,
    ) -> Result<Body, Error> {
        let cms = self.is_cms();
        convert_to_7bit(&mut body, !cms && self.pgp.strict_enc);
        assign_boundaries(&mut body);
        let signed = to_crlf(&entity_to_vec(&body, None));
        let out = self.sign_data(ctx, &signed, from)?;

        let (protocol, sig) = if cms {
            let mut sig = Body::new_leaf(
                BodyType::Application,
                "pkcs7-signature",
                out.signature,
            );
            sig.d_filename = Some("smime.p7s".to_owned());
            sig.use_disp = true;
            sig.disposition = Disposition::Attach;
            sig.encoding = Encoding::Base64;
            ("application/pkcs7-signature", sig)
        } else {
            let mut sig = Body::new_leaf(
                BodyType::Application,
                "pgp-signature",
                out.signature,
            );
            sig.encoding = Encoding::SevenBit;
            sig.disposition = Disposition::None;
            sig.use_disp = false;
            sig.params.set("name", "signature.asc");
            ("application/pgp-signature", sig)
        };

        let mut multipart = Body::new_multipart("signed", vec![body, sig]);
        multipart.use_disp = false;
        multipart.params.set("protocol", protocol);
        multipart.params.set("micalg", &out.micalg);
        assign_boundaries(&mut multipart);
        Ok(multipart)
    }

    fn verify_one(
        &self,
        _: &Crypt,
        sig: &Body,
        state: &mut State,
        signed_file: &Path,
    ) -> i32 {
        let sig_data = decode_transfer(sig.encoding, payload(sig, &state.fp_in))
            .into_owned();
        let signed = match fs::read(signed_file) {
            Ok(data) => data,
            Err(e) => {
                warn!("Can't read {}: {}", signed_file.display(), e);
                return -1;
            }
        };

        state.attach_puts(BEGIN_SIGNATURE_INFO);
        *self.signature_key.borrow_mut() = None;
        let mut badsig = true;
        let mut anywarn = false;
        match self.engine.verify(&sig_data, Some(&signed)) {
            Ok(v) => {
                let (all_good, warn) =
                    self.show_signatures(&v.signatures, state);
                badsig = !all_good;
                anywarn = warn;
                if all_good {
                    self.show_notations(&v.signatures, state);
                }
            }
            Err(e) => {
                state.puts(&format!("Error: verification failed: {}\n", e))
            }
        }
        state.attach_puts(END_SIGNATURE_INFO);

        if badsig {
            1
        } else if anywarn {
            2
        } else {
            0
        }
    }

    fn send_menu(&self, ctx: &Crypt, email: &mut Email) -> SecurityFlags {
        let crypto = SecurityFlags::ENCRYPT | SecurityFlags::SIGN;
        let own = self.scheme().application_flag();

        if !self.is_cms()
            && self.pgp.auto_inline
            && !(email.security.contains(SecurityFlags::APPLICATION_PGP)
                && email.security.intersects(crypto))
        {
            email.security.insert(SecurityFlags::INLINE);
        }
        email.security.insert(own);

        let (prompt, letters, choices) = self.send_menu_choices(ctx, email);
        let choice = ctx
            .prompt
            .multi_choice(&prompt, letters)
            .and_then(|c| letters.find(c))
            .and_then(|ix| choices.chars().nth(ix));

        match choice {
            Some('a') => {
                if let Some(key) = self.ask_for_key(
                    ctx,
                    "Sign as: ",
                    None,
                    KeyFlags::CANSIGN,
                    true,
                ) {
                    self.set_sign_as(Some(format!(
                        "0x{}",
                        key.fpr_or_long_id()
                    )));
                    email.security.insert(SecurityFlags::SIGN);
                    // Probably needs a different passphrase
                    self.passphrase.void();
                }
            }
            Some('b') => email.security.insert(crypto),
            Some('C') => email.security.remove(SecurityFlags::SIGN),
            Some('c') => email.security.remove(crypto),
            Some('e') => {
                email.security.insert(SecurityFlags::ENCRYPT);
                email.security.remove(SecurityFlags::SIGN);
            }
            Some('i') => email.security.toggle(SecurityFlags::INLINE),
            Some('m') | Some('p') => {
                let other = (SecurityFlags::APPLICATION_PGP
                    | SecurityFlags::APPLICATION_SMIME)
                    - own;
                email.security.remove(own | SecurityFlags::INLINE);
                email.security.insert(other);
                ctx.opportunistic_encrypt(email);
            }
            Some('O') => {
                email.security.insert(SecurityFlags::OPPENCRYPT);
                ctx.opportunistic_encrypt(email);
            }
            Some('o') => email.security.remove(SecurityFlags::OPPENCRYPT),
            Some('S') => email.security.insert(SecurityFlags::SIGN),
            Some('s') => {
                email.security.remove(SecurityFlags::ENCRYPT);
                email.security.insert(SecurityFlags::SIGN);
            }
            _ => (),
        }

        email.security
    }

    fn set_sender(&self, _: &Crypt, sender: &str) {
        *self.sender.borrow_mut() = non_empty(sender);
    }

    fn pgp(&self) -> Option<&dyn PgpOps> {
        if self.is_cms() {
            None
        } else {
            Some(self)
        }
    }

    fn smime(&self) -> Option<&dyn SmimeOps> {
        if self.is_cms() {
            Some(self)
        } else {
            None
        }
    }
}

impl PgpOps for LibraryBackend {
    fn encrypt_message(
        &self,
        ctx: &Crypt,
        mut body: Body,
        keylist: &str,
        sign: bool,
        from: Option<&Address>,
    ) -> Result<Body, Error> {
        if sign {
            convert_to_7bit(&mut body, self.pgp.strict_enc);
        }
        assign_boundaries(&mut body);
        let plaintext = entity_to_vec(&body, None);

        let signer = if sign {
            let sender = self.sender.borrow().as_deref().map(Address::new);
            Some(self.signer(ctx, from.or(sender.as_ref()))?)
        } else {
            None
        };
        let pass = self.passphrase.get();
        let ciphertext = self
            .engine
            .encrypt(
                &plaintext,
                &recipients(keylist),
                signer.as_deref(),
                pass.as_ref(),
            )
            .map_err(|e| {
                ctx.prompt.error(&format!("error encrypting data: {}", e));
                if sign {
                    self.passphrase.void();
                }
                e
            })?;

        let mut version = Body::new_leaf(
            BodyType::Application,
            "pgp-encrypted",
            "Version: 1\n",
        );
        version.encoding = Encoding::SevenBit;
        version.use_disp = false;
        version.description =
            Some("PGP/MIME version identification".to_owned());

        let mut data =
            Body::new_leaf(BodyType::Application, "octet-stream", ciphertext);
        data.encoding = Encoding::SevenBit;
        data.disposition = Disposition::Attach;
        data.use_disp = true;
        data.d_filename = Some("msg.asc".to_owned());
        data.description = Some("OpenPGP encrypted message".to_owned());

        let mut multipart =
            Body::new_multipart("encrypted", vec![version, data]);
        multipart.use_disp = false;
        multipart.params.set("protocol", "application/pgp-encrypted");
        assign_boundaries(&mut multipart);
        Ok(multipart)
    }

    fn make_key_attachment(&self, ctx: &Crypt) -> Result<Option<Body>, Error> {
        let key = match self.ask_for_key(
            ctx,
            "Please enter the key ID: ",
            None,
            KeyFlags::empty(),
            false,
        ) {
            Some(key) => key,
            None => return Ok(None),
        };

        let id = key.fpr_or_long_id().to_owned();
        let block = self.engine.export(&id)?;
        if block.is_empty() {
            return Err(Error::NoOutput);
        }

        let mut att = Body::new_leaf(BodyType::Application, "pgp-keys", block);
        att.encoding = Encoding::SevenBit;
        att.description = Some(format!("PGP Key 0x{}", id));
        att.disposition = Disposition::Inline;
        Ok(Some(att))
    }

    fn check_traditional(
        &self,
        _: &Crypt,
        source: &[u8],
        body: &mut Body,
        just_one: bool,
    ) -> bool {
        mark_traditional(source, body, just_one)
    }

    fn traditional_encryptsign(
        &self,
        ctx: &Crypt,
        body: &Body,
        flags: SecurityFlags,
        keylist: &str,
    ) -> Result<Option<Body>, Error> {
        self.inline_protect(ctx, body, flags, keylist)
    }

    fn invoke_getkeys(&self, _: &Crypt, addr: &Address) {
        // Key servers are the engine's business
        debug!("Not fetching keys for {}", addr.mailbox);
    }

    fn invoke_import(&self, ctx: &Crypt, path: &Path) -> Result<(), Error> {
        self.import_file(ctx, path)
    }

    fn extract_key_from_attachment(
        &self,
        ctx: &Crypt,
        source: &[u8],
        body: &Body,
    ) -> Result<(), Error> {
        let mut state = State::new(Rc::from(source), StateFlags::empty());
        let mut body = body.clone();
        ctx.handle_body(&mut body, &mut state);

        let imported = self.engine.import(&state.out);
        match imported {
            Ok(n) => {
                ctx.prompt.message(&format!("{} keys imported", n));
                Ok(())
            }
            Err(e) => {
                ctx.prompt.error(&format!("Error importing key: {}", e));
                Err(e)
            }
        }
    }
}

impl SmimeOps for LibraryBackend {
    fn getkeys(&self, _: &Crypt, _: &Envelope) {
        // The engine tries every private key it holds
    }

    fn verify_sender(&self, ctx: &Crypt, email: &Email) -> Result<(), Error> {
        let env = &email.env;
        let sender = match env.from.first().or_else(|| env.sender.first()) {
            Some(sender) => sender,
            None => {
                ctx.prompt.error("Failed to figure out sender");
                return Err(Error::BadInput("message has no sender".to_owned()));
            }
        };

        let key = match self.signature_key.borrow_mut().take() {
            Some(key) => key,
            None => {
                ctx.prompt.error("Failed to verify sender");
                return Err(Error::VerifyMissingKey);
            }
        };

        let matched = key.user_ids.iter().any(|uid| {
            uid.address()
                .map_or(false, |a| same_mailbox(&a.mailbox, &sender.mailbox))
        });
        if matched {
            Ok(())
        } else {
            ctx.prompt
                .error("S/MIME certificate owner does not match sender.");
            Err(Error::VerifyFailed)
        }
    }

    fn build_smime_entity(
        &self,
        ctx: &Crypt,
        mut body: Body,
        keylist: &str,
    ) -> Result<Body, Error> {
        assign_boundaries(&mut body);
        let plaintext = to_crlf(&entity_to_vec(&body, None));
        let ciphertext = self
            .engine
            .encrypt(&plaintext, &recipients(keylist), None, None)
            .map_err(|e| {
                ctx.prompt.error(&format!("error encrypting data: {}", e));
                e
            })?;

        let mut enc =
            Body::new_leaf(BodyType::Application, "pkcs7-mime", ciphertext);
        enc.params.set("name", "smime.p7m");
        enc.params.set("smime-type", "enveloped-data");
        enc.encoding = Encoding::Base64;
        enc.use_disp = true;
        enc.disposition = Disposition::Attach;
        enc.d_filename = Some("smime.p7m".to_owned());
        Ok(enc)
    }

    fn invoke_import(
        &self,
        ctx: &Crypt,
        path: &Path,
        _mailbox: Option<&str>,
    ) -> Result<(), Error> {
        self.import_file(ctx, path)
    }
}
