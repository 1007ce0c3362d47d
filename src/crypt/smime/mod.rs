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

//! The classic S/MIME backend, driving the `openssl` command line tool.
//!
//! Keys and certificates live as files in two directories, each described
//! by an `.index` file (see `index`). Operations write their input to a
//! scratch file and run one of the configured command templates over it.

mod command;
mod index;

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info, warn};
use secstr::SecStr;

use self::command::{Commands, Vars};
use self::index::Store;
use super::backend::*;
use super::expando::Template;
use super::flags::{KeyFlags, SecurityFlags};
use super::handler::{crlf_to_lf, payload};
use super::ops::{convert_to_7bit, is_application_smime};
use super::Crypt;
use crate::mime::content_encoding::decode_transfer;
use crate::mime::model::*;
use crate::mime::parse::parse_entity_bytes;
use crate::mime::state::{State, StateFlags};
use crate::mime::write::{assign_boundaries, entity_to_vec};
use crate::support::error::Error;
use crate::support::file_ops::scratch_file;
use crate::support::filter::FilterOutput;
use crate::support::passphrase::PassphraseCache;
use crate::support::system_config::{expand_path, SmimeConfig, SystemConfig};

const ENCRYPTED_BANNERS: (&str, &str) = (
    "[-- The following data is S/MIME encrypted --]\n",
    "[-- End of S/MIME encrypted data --]\n",
);
const SIGNED_BANNERS: (&str, &str) = (
    "[-- The following data is S/MIME signed --]\n",
    "[-- End of S/MIME signed data --]\n",
);
const END_OF_OUTPUT: &str = "[-- End of OpenSSL output --]\n\n";
const NO_SUBPROCESS: &str =
    "[-- Error: unable to create OpenSSL subprocess --]\n";

/// `micalg` wants hyphens where `openssl -md` has none.
fn micalg_for(digest: &str) -> String {
    if digest.len() >= 3 && digest[..3].eq_ignore_ascii_case("sha") {
        format!("sha-{}", &digest[3..])
    } else {
        digest.to_owned()
    }
}

/// Whether the first line of `diagnostics` is OpenSSL's success message.
fn verification_successful(diagnostics: &[u8]) -> bool {
    String::from_utf8_lossy(diagnostics)
        .lines()
        .next()
        .map_or(false, |l| {
            l.trim().eq_ignore_ascii_case("verification successful")
        })
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

pub struct SmimeClassic {
    config: SmimeConfig,
    commands: Commands,
    passphrase: PassphraseCache,
    /// The hash of the key to decrypt with, as chosen by `getkeys`.
    key_to_use: RefCell<Option<String>>,
    /// The signing key chosen in the send menu.
    sign_as: RefCell<Option<String>>,
    /// The cipher chosen in the send menu.
    encrypt_with: RefCell<String>,
}

impl SmimeClassic {
    pub fn new(config: &SystemConfig) -> Result<Self, Error> {
        let smime = &config.smime;
        Ok(SmimeClassic {
            config: smime.clone(),
            commands: Commands::compile(smime),
            passphrase: PassphraseCache::new("S/MIME", smime.timeout),
            key_to_use: RefCell::new(None),
            sign_as: RefCell::new(None),
            encrypt_with: RefCell::new(smime.encrypt_with.clone()),
        })
    }

    fn keys_dir(&self) -> PathBuf {
        expand_path(&self.config.keys)
    }

    fn certificates_dir(&self) -> PathBuf {
        expand_path(&self.config.certificates)
    }

    fn run(
        &self,
        template: &Template,
        vars: &Vars<'_>,
        input: Option<&[u8]>,
    ) -> Result<FilterOutput, Error> {
        command::run(template, vars, &self.config.ca_location, input)
    }

    fn signer(&self) -> Option<String> {
        self.sign_as
            .borrow()
            .clone()
            .or_else(|| non_empty(&self.config.sign_as))
            .or_else(|| non_empty(&self.config.default_key))
    }

    fn ensure_passphrase(&self, ctx: &Crypt) -> bool {
        if self.passphrase.is_valid() {
            return true;
        }

        self.passphrase.void();
        match ctx.prompt.ask_passphrase("Enter S/MIME passphrase:") {
            Some(pass) => {
                self.passphrase.set(pass);
                true
            }
            None => false,
        }
    }

    /// The passphrase line fed to commands using a private key.
    fn passphrase_input(&self) -> SecStr {
        let mut input = self
            .passphrase
            .get()
            .map(|p| p.unsecure().to_vec())
            .unwrap_or_default();
        input.push(b'\n');
        SecStr::new(input)
    }

    /// Show diagnostics and wait for the user, if there are any.
    fn show_stderr(&self, ctx: &Crypt, stderr: &[u8]) -> bool {
        if stderr.is_empty() {
            return false;
        }
        ctx.prompt.message(&String::from_utf8_lossy(stderr));
        ctx.prompt.any_key_to_continue();
        true
    }

    /// Select the private key for `mailbox` for upcoming decryptions.
    fn select_decryption_key(&self, ctx: &Crypt, mailbox: &str) {
        let key = self
            .get_key_by_addr(
                ctx,
                mailbox,
                KeyFlags::CANENCRYPT,
                Store::Keys,
                false,
            )
            .or_else(|| {
                self.ask_for_key(
                    ctx,
                    &format!("Enter keyID for {}: ", mailbox),
                    KeyFlags::CANENCRYPT,
                    Store::Keys,
                )
            });

        let hash = match key {
            Some(key) => key.hash,
            None => self.config.default_key.clone(),
        };

        let mut current = self.key_to_use.borrow_mut();
        if current
            .as_ref()
            .map_or(true, |k| !k.eq_ignore_ascii_case(&hash))
        {
            // A different key probably has a different passphrase
            self.passphrase.void();
            *current = Some(hash);
        }
    }

    /// Run the decryption or opaque verification of a `pkcs7-mime` part.
    fn open_entity(
        &self,
        ctx: &Crypt,
        kind: SecurityFlags,
        data: &[u8],
    ) -> Result<FilterOutput, Error> {
        let tf = scratch_file(&ctx.scratch(), "", data)?;

        if kind.contains(SecurityFlags::ENCRYPT) {
            if !self.ensure_passphrase(ctx) {
                self.passphrase.void();
            }

            let hash = self
                .key_to_use
                .borrow()
                .clone()
                .or_else(|| non_empty(&self.config.default_key));
            let key = hash.as_ref().map(|h| self.keys_dir().join(h));
            let certs = hash
                .iter()
                .map(|h| self.certificates_dir().join(h))
                .collect::<Vec<_>>();
            let vars = Vars {
                file: Some(tf.path()),
                key: key.as_deref(),
                certificates: &certs,
                ..Vars::default()
            };
            let input = self.passphrase_input();
            self.run(&self.commands.decrypt, &vars, Some(input.unsecure()))
        } else {
            let vars = Vars {
                sig_file: Some(tf.path()),
                ..Vars::default()
            };
            self.run(&self.commands.verify_opaque, &vars, None)
        }
    }

    /// The certificates contained in the signature or certificate bundle at
    /// `infile`, as PEM in a scratch file.
    fn extract_certificate(
        &self,
        ctx: &Crypt,
        infile: &Path,
    ) -> Result<Option<tempfile::NamedTempFile>, Error> {
        // The full chain is only available from the PKCS#7 structure
        let out = self.run(&self.commands.pk7out, &Vars::file(infile), None)?;
        if out.stdout.is_empty() {
            self.show_stderr(ctx, &out.stderr);
            return Ok(None);
        }
        let pk7 = scratch_file(&ctx.scratch(), ".p7", &out.stdout)?;

        let out =
            self.run(&self.commands.get_cert, &Vars::file(pk7.path()), None)?;
        if out.stdout.is_empty() {
            self.show_stderr(ctx, &out.stderr);
            return Ok(None);
        }
        Ok(Some(scratch_file(&ctx.scratch(), ".pem", &out.stdout)?))
    }

    /// The certificate of whoever signed the message in `infile`.
    fn extract_signer_certificate(
        &self,
        ctx: &Crypt,
        infile: &Path,
    ) -> Result<Option<Vec<u8>>, Error> {
        let certfile = scratch_file(&ctx.scratch(), ".pem", b"")?;
        let certs = vec![certfile.path().to_owned()];
        let vars = Vars {
            file: Some(infile),
            certificates: &certs,
            ..Vars::default()
        };
        let out = self.run(&self.commands.get_signer_cert, &vars, None)?;
        let cert = fs::read(certfile.path())?;
        if cert.is_empty() {
            self.show_stderr(ctx, &out.stderr);
            return Ok(None);
        }
        Ok(Some(cert))
    }

    /// Whether the certificate in `certfile` was issued to `mailbox`.
    fn cert_matches_mailbox(
        &self,
        ctx: &Crypt,
        certfile: &Path,
        mailbox: &str,
    ) -> Result<bool, Error> {
        let out = self.run(
            &self.commands.get_cert_email,
            &Vars::file(certfile),
            None,
        )?;
        let text = String::from_utf8_lossy(&out.stdout);
        let mut emails = text.lines().peekable();
        if emails.peek().is_none() {
            self.show_stderr(ctx, &out.stderr);
            return Ok(false);
        }

        let mailbox = mailbox.to_lowercase();
        Ok(emails.any(|e| e.trim().to_lowercase().starts_with(&mailbox)))
    }
}

impl CryptBackend for SmimeClassic {
    fn scheme(&self) -> Scheme {
        Scheme::Smime
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
        let kind = is_application_smime(body);
        if kind.is_empty() || !body.parts.is_empty() {
            return Err(Error::BadInput("not an S/MIME entity".to_owned()));
        }

        let data = decode_transfer(body.encoding, payload(body, source));
        let out = self.open_entity(ctx, kind, &data)?;
        if out.stdout.is_empty() {
            if kind.contains(SecurityFlags::ENCRYPT) {
                ctx.prompt.error("Decryption failed");
                self.passphrase.void();
                return Err(Error::DecryptFailed);
            }
            return Err(Error::NoOutput);
        }

        let source: Rc<[u8]> = Rc::from(crlf_to_lf(&out.stdout));
        let mut body = parse_entity_bytes(Rc::clone(&source));
        if kind.contains(SecurityFlags::SIGNOPAQUE) {
            body.goodsig = verification_successful(&out.stderr);
        }
        Ok(Decrypted { source, body })
    }

    fn application_handler(
        &self,
        ctx: &Crypt,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        // Anything before this point claiming to be protected is spoofed
        b.mime_headers = None;

        let kind = is_application_smime(b);
        if kind.is_empty() {
            return -1;
        }
        let display = state.has(StateFlags::DISPLAY);

        let data = payload(b, &state.fp_in).to_vec();
        let out = match self.open_entity(ctx, kind, &data) {
            Ok(out) => out,
            Err(e) => {
                warn!("Unable to run OpenSSL: {}", e);
                if display {
                    state.attach_puts(NO_SUBPROCESS);
                }
                return -1;
            }
        };

        if display && !out.stderr.is_empty() {
            ctx.current_time_banner(state, "OpenSSL");
            state.put_bytes(&out.stderr);
            state.attach_puts(END_OF_OUTPUT);
        }

        let encrypted = kind.contains(SecurityFlags::ENCRYPT);
        if out.stdout.is_empty() {
            if encrypted {
                ctx.prompt.error("Decryption failed");
                self.passphrase.void();
            }
            return -1;
        }

        let source: Rc<[u8]> = Rc::from(crlf_to_lf(&out.stdout));
        let body = parse_entity_bytes(Rc::clone(&source));
        let (opening, closing) = if encrypted {
            ENCRYPTED_BANNERS
        } else {
            SIGNED_BANNERS
        };
        let rc = ctx.render_decrypted(
            b,
            state,
            Decrypted { source, body },
            opening,
            closing,
        );

        if kind.contains(SecurityFlags::SIGNOPAQUE) {
            b.goodsig = verification_successful(&out.stderr);
            b.badsig = !b.goodsig;
        }
        rc
    }

    fn find_keys(
        &self,
        ctx: &Crypt,
        addrs: &[Address],
        oppenc_mode: bool,
    ) -> Result<Option<String>, Error> {
        let mut keylist = Vec::new();
        for addr in addrs {
            let key = self
                .get_key_by_addr(
                    ctx,
                    &addr.mailbox,
                    KeyFlags::CANENCRYPT,
                    Store::Certificates,
                    oppenc_mode,
                )
                .or_else(|| {
                    if oppenc_mode {
                        None
                    } else {
                        self.ask_for_key(
                            ctx,
                            &format!("Enter keyID for {}: ", addr.mailbox),
                            KeyFlags::CANENCRYPT,
                            Store::Certificates,
                        )
                    }
                });

            match key {
                Some(key) => keylist.push(key.hash),
                None => {
                    if !oppenc_mode {
                        ctx.prompt.message(&format!(
                            "No (valid) certificate found for {}",
                            addr.mailbox
                        ));
                    }
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
        _from: Option<&Address>,
    ) -> Result<Body, Error> {
        let signas = match self.signer() {
            Some(s) => s,
            None => {
                ctx.prompt.error("Can't sign: No key specified. Use Sign As.");
                return Err(Error::KeyNotFound("S/MIME signing key".to_owned()));
            }
        };

        convert_to_7bit(&mut body, false);
        assign_boundaries(&mut body);
        let tf = scratch_file(&ctx.scratch(), "", &entity_to_vec(&body, None))?;

        let key = self.keys_dir().join(&signas);
        let certs = vec![self.certificates_dir().join(&signas)];
        let issuer = self.get_key_by_hash(&signas, Store::Certificates);
        let intermediates = match issuer {
            Some(ref k) if "?" != k.issuer => k.issuer.clone(),
            // Any existing file keeps openssl happy
            _ => signas.clone(),
        };
        let intermediates = self.certificates_dir().join(intermediates);

        let vars = Vars {
            file: Some(tf.path()),
            digestalg: Some(&self.config.sign_digest_alg),
            key: Some(&key),
            certificates: &certs,
            intermediates: Some(&intermediates),
            ..Vars::default()
        };
        let input = self.passphrase_input();
        let out = self.run(&self.commands.sign, &vars, Some(input.unsecure()))?;
        self.show_stderr(ctx, &out.stderr);

        if out.stdout.is_empty() {
            ctx.prompt.message("No output from OpenSSL...");
            ctx.prompt.any_key_to_continue();
            return Err(Error::NoOutput);
        }

        let mut sig = Body::new_leaf(
            BodyType::Application,
            "pkcs7-signature",
            out.stdout,
        );
        sig.d_filename = Some("smime.p7s".to_owned());
        sig.use_disp = true;
        sig.disposition = Disposition::Attach;
        sig.encoding = Encoding::Base64;

        let mut multipart = Body::new_multipart("signed", vec![body, sig]);
        multipart.encoding = Encoding::SevenBit;
        multipart.use_disp = false;
        multipart.disposition = Disposition::Inline;
        multipart
            .params
            .set("micalg", micalg_for(&self.config.sign_digest_alg));
        multipart.params.set("protocol", "application/pkcs7-signature");
        assign_boundaries(&mut multipart);
        info!("Signed message as S/MIME key {}", signas);
        Ok(multipart)
    }

    fn verify_one(
        &self,
        ctx: &Crypt,
        sig: &Body,
        state: &mut State,
        signed_file: &Path,
    ) -> i32 {
        let data = decode_transfer(sig.encoding, payload(sig, &state.fp_in))
            .into_owned();
        let dir = signed_file
            .parent()
            .map_or_else(|| ctx.scratch(), Path::to_owned);
        let sig_file = match scratch_file(&dir, ".sig", &data) {
            Ok(tf) => tf,
            Err(e) => {
                warn!("Can't create signature file: {}", e);
                return -1;
            }
        };

        ctx.current_time_banner(state, "OpenSSL");

        let vars = Vars {
            file: Some(signed_file),
            sig_file: Some(sig_file.path()),
            ..Vars::default()
        };
        let mut badsig = -1;
        match self.run(&self.commands.verify, &vars, None) {
            Ok(out) => {
                if 0 == out.status && verification_successful(&out.stderr) {
                    badsig = 0;
                } else {
                    debug!("S/MIME verify exited with {}", out.status);
                }
                state.put_bytes(&out.stderr);
            }
            Err(e) => warn!("Unable to run S/MIME verify: {}", e),
        }

        state.attach_puts(END_OF_OUTPUT);
        badsig
    }

    fn send_menu(&self, ctx: &Crypt, email: &mut Email) -> SecurityFlags {
        email.security.insert(SecurityFlags::APPLICATION_SMIME);

        let oppenc_option = ctx.config.crypt.opportunistic_encrypt;
        let (prompt, letters, choices) = if oppenc_option
            && email.security.contains(SecurityFlags::OPPENCRYPT)
        {
            (
                "S/MIME (s)ign, encrypt (w)ith, sign (a)s, (c)lear, \
                 or (o)ppenc mode off?",
                "swaco",
                "SwaCo",
            )
        } else if oppenc_option {
            (
                "S/MIME (e)ncrypt, (s)ign, encrypt (w)ith, sign (a)s, (b)oth, \
                 (c)lear, or (o)ppenc mode?",
                "eswabco",
                "eswabcO",
            )
        } else {
            (
                "S/MIME (e)ncrypt, (s)ign, encrypt (w)ith, sign (a)s, (b)oth, \
                 or (c)lear?",
                "eswabc",
                "eswabc",
            )
        };

        let choice = ctx
            .prompt
            .multi_choice(prompt, letters)
            .and_then(|c| letters.find(c))
            .and_then(|ix| choices.chars().nth(ix));

        let crypto = SecurityFlags::ENCRYPT | SecurityFlags::SIGN;
        match choice {
            Some('a') => {
                if let Some(key) = self.ask_for_key(
                    ctx,
                    "Sign as: ",
                    KeyFlags::CANSIGN,
                    Store::Keys,
                ) {
                    *self.sign_as.borrow_mut() = Some(key.hash);
                    email.security.insert(SecurityFlags::SIGN);
                    // Probably needs a different passphrase
                    self.passphrase.void();
                }
            }
            Some('b') => email.security.insert(crypto),
            Some('c') => email.security.remove(crypto),
            Some('C') => email.security.remove(SecurityFlags::SIGN),
            Some('e') => {
                email.security.insert(SecurityFlags::ENCRYPT);
                email.security.remove(SecurityFlags::SIGN);
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
            Some('w') => {
                email.security.insert(SecurityFlags::ENCRYPT);
                if let Some(alg) = self.choose_algorithm(ctx) {
                    *self.encrypt_with.borrow_mut() = alg;
                }
            }
            _ => (),
        }

        email.security
    }

    fn smime(&self) -> Option<&dyn SmimeOps> {
        Some(self)
    }
}

impl SmimeClassic {
    /// The "encrypt (w)ith" submenu. "(c)lear" returns to the configured
    /// cipher.
    fn choose_algorithm(&self, ctx: &Crypt) -> Option<String> {
        loop {
            let family = ctx.prompt.multi_choice(
                "Choose algorithm family: (1) DES, (2) RC2, (3) AES, \
                 or (c)lear?",
                "123c",
            )?;

            let (question, letters, algs): (&str, &str, &[&str]) = match family
            {
                '1' => ("(1) DES, (2) Triple-DES?", "12", &["des", "des3"][..]),
                '2' => (
                    "(1) RC2-40, (2) RC2-64, (3) RC2-128?",
                    "123",
                    &["rc2-40", "rc2-64", "rc2-128"][..],
                ),
                '3' => (
                    "(1) AES128, (2) AES192, (3) AES256?",
                    "123",
                    &["aes128", "aes192", "aes256"][..],
                ),
                'c' => return Some(self.config.encrypt_with.clone()),
                _ => return None,
            };

            // Backing out of the second question returns to the first
            if let Some(alg) = ctx
                .prompt
                .multi_choice(question, letters)
                .and_then(|c| letters.find(c))
                .and_then(|ix| algs.get(ix))
            {
                return Some((*alg).to_owned());
            }
        }
    }
}

impl SmimeOps for SmimeClassic {
    fn getkeys(&self, ctx: &Crypt, env: &Envelope) {
        if self.config.decrypt_use_default_key
            && !self.config.default_key.is_empty()
        {
            *self.key_to_use.borrow_mut() =
                Some(self.config.default_key.clone());
            return;
        }

        // The first recipient we hold a private key for
        let own = env.to.iter().chain(&env.cc).find(|a| {
            self.get_key_by_addr(
                ctx,
                &a.mailbox,
                KeyFlags::CANENCRYPT,
                Store::Keys,
                true,
            )
            .is_some()
        });
        let mailbox = own
            .map(|a| a.mailbox.clone())
            .or_else(|| ctx.config.crypt.envelope_from_address.clone());

        match mailbox {
            Some(mailbox) => self.select_decryption_key(ctx, &mailbox),
            None => debug!("No own address among the recipients"),
        }
    }

    fn verify_sender(&self, ctx: &Crypt, email: &Email) -> Result<(), Error> {
        let env = &email.env;
        let mailbox = match env.from.first().or_else(|| env.sender.first()) {
            Some(a) => a.mailbox.clone(),
            None => {
                ctx.prompt.message("no mbox");
                ctx.prompt.any_key_to_continue();
                return Err(Error::BadInput("message has no sender".to_owned()));
            }
        };
        let source = email
            .source
            .as_ref()
            .ok_or_else(|| {
                Error::BadInput("message has no source".to_owned())
            })?;

        let data = if email.security.contains(SecurityFlags::ENCRYPT) {
            let dec = ctx.decrypt_mime(Scheme::Smime, source, &email.body)?;
            dec.body.raw_entity(&dec.source).to_vec()
        } else {
            source.to_vec()
        };
        let tf = scratch_file(&ctx.scratch(), "", &data)?;

        let cert = match self.extract_signer_certificate(ctx, tf.path())? {
            Some(cert) => cert,
            None => {
                ctx.prompt.message("no certfile");
                ctx.prompt.any_key_to_continue();
                return Err(Error::VerifyMissingKey);
            }
        };
        let certfile = scratch_file(&ctx.scratch(), ".pem", &cert)?;

        if self.cert_matches_mailbox(ctx, certfile.path(), &mailbox)? {
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
        let certs = keylist
            .split(' ')
            .filter(|k| !k.is_empty())
            .map(|k| self.certificates_dir().join(k))
            .collect::<Vec<_>>();

        assign_boundaries(&mut body);
        let tf = scratch_file(&ctx.scratch(), "", &entity_to_vec(&body, None))?;
        let alg = self.encrypt_with.borrow().clone();
        let vars = Vars {
            file: Some(tf.path()),
            cryptalg: Some(&alg),
            certificates: &certs,
            ..Vars::default()
        };
        let out = self.run(&self.commands.encrypt, &vars, None)?;
        let complained = self.show_stderr(ctx, &out.stderr);

        if out.stdout.is_empty() {
            if !complained {
                ctx.prompt.message("No output from OpenSSL...");
                ctx.prompt.any_key_to_continue();
            }
            return Err(Error::NoOutput);
        }

        let mut enc =
            Body::new_leaf(BodyType::Application, "pkcs7-mime", out.stdout);
        enc.params.set("name", "smime.p7m");
        enc.params.set("smime-type", "enveloped-data");
        // OpenSSL output is binary
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
        let mut label = String::new();
        if self.config.ask_cert_label {
            match ctx.prompt.ask_string("Label for certificate: ", "") {
                Some(l) if !l.is_empty() => label = l,
                _ => return Ok(()),
            }
        }

        let certfile = match self.extract_certificate(ctx, path)? {
            Some(f) => f,
            None => return Ok(()),
        };

        label.push('\n');
        let out = self.run(
            &self.commands.import_cert,
            &Vars::file(certfile.path()),
            Some(label.as_bytes()),
        )?;
        let mut report = out.stdout;
        report.extend_from_slice(&out.stderr);
        if !report.is_empty() {
            ctx.prompt.message(&String::from_utf8_lossy(&report));
        }
        info!("Imported S/MIME certificate from {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use tempfile::TempDir;

    use super::*;
    use crate::crypt::expando::quote_filename;
    use crate::crypt::handler::test_support::*;
    use crate::support::prompt::test_prompt::Scripted;

    pub struct Fixture {
        pub dir: TempDir,
        pub smime: SmimeClassic,
        pub crypt: Crypt,
        transcript: Rc<RefCell<Vec<String>>>,
    }

    impl Fixture {
        pub fn new(
            tweak: impl FnOnce(&mut SystemConfig),
            prompt: Scripted,
        ) -> Self {
            Fixture::with_certificates_and("", tweak, prompt)
        }

        /// A fixture whose key and certificate directories are both
        /// described by `index`.
        pub fn with_certificates(index: &str, prompt: Scripted) -> Self {
            Fixture::with_certificates_and(index, |_| (), prompt)
        }

        pub fn with_certificates_and(
            index: &str,
            tweak: impl FnOnce(&mut SystemConfig),
            prompt: Scripted,
        ) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = SystemConfig::default();
            config.crypt.tmp_dir = dir.path().to_owned();
            config.crypt.timestamp = false;
            config.smime.keys = dir.path().join("keys");
            config.smime.certificates = dir.path().join("certificates");
            config.smime.ca_location = dir.path().join("ca.crt");
            for sub in &["keys", "certificates"] {
                fs::create_dir(dir.path().join(sub)).unwrap();
                fs::write(dir.path().join(sub).join(".index"), index).unwrap();
            }
            tweak(&mut config);

            let transcript = Rc::clone(&prompt.transcript);
            let smime = SmimeClassic::new(&config).unwrap();
            let mut crypt = Crypt::new(config.clone(), Box::new(prompt));
            crypt.register(Box::new(SmimeClassic::new(&config).unwrap()));
            Fixture {
                dir,
                smime,
                crypt,
                transcript,
            }
        }

        pub fn prompt_transcript(&self) -> Vec<String> {
            self.transcript.borrow().clone()
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    const CERTS: &str = "\
alice@example.com aaaa.0 alice ? t es
bob@example.com bbbb.0 bob ? t es
me@example.com mine.0 me issuer.0 t es
";

    #[test]
    fn micalg_names() {
        assert_eq!("sha-256", micalg_for("sha256"));
        assert_eq!("sha-1", micalg_for("SHA1"));
        assert_eq!("md5", micalg_for("md5"));
    }

    #[test]
    fn detached_signature() {
        let fx = Fixture::with_certificates_and(
            CERTS,
            |c| {
                c.smime.sign_as = "mine.0".to_owned();
                c.smime.sign_command =
                    "echo %i; read pass; echo \"$pass\"".to_owned();
            },
            Scripted::with_passphrase("sesame"),
        );
        assert!(fx.smime.ensure_passphrase(&fx.crypt));

        let body = Body::new_leaf(BodyType::Text, "plain", "hello\n");
        let signed = fx.smime.sign_message(&fx.crypt, body, None).unwrap();
        assert!(signed.is(BodyType::Multipart, "signed"));
        assert_eq!(Some("sha-256"), signed.param("micalg"));
        assert_eq!(
            Some("application/pkcs7-signature"),
            signed.param("protocol")
        );
        assert!(signed.param("boundary").is_some());

        let sig = &signed.parts[1];
        assert!(sig.is(BodyType::Application, "pkcs7-signature"));
        assert_eq!(Some("smime.p7s"), sig.d_filename.as_deref());
        assert_eq!(Encoding::Base64, sig.encoding);
        assert_eq!(
            format!(
                "{}\nsesame\n",
                fx.path("certificates").join("issuer.0").display()
            ),
            String::from_utf8_lossy(sig.content.as_ref().unwrap())
        );
    }

    #[test]
    fn signing_needs_a_key() {
        let fx = Fixture::new(|_| (), Scripted::default());
        let body = Body::new_leaf(BodyType::Text, "plain", "hello\n");
        assert!(matches!(
            fx.smime.sign_message(&fx.crypt, body, None),
            Err(Error::KeyNotFound(_))
        ));
        assert_eq!(
            vec!["Can't sign: No key specified. Use Sign As.".to_owned()],
            fx.prompt_transcript()
        );
    }

    #[test]
    fn enveloped_entity() {
        let fx = Fixture::new(
            |c| c.smime.encrypt_command = "echo %a %c".to_owned(),
            Scripted::default(),
        );
        let body = Body::new_leaf(BodyType::Text, "plain", "hello\n");
        let enc = fx
            .smime
            .build_smime_entity(&fx.crypt, body, "aaaa.0 bbbb.0")
            .unwrap();
        assert!(enc.is(BodyType::Application, "pkcs7-mime"));
        assert_eq!(Some("enveloped-data"), enc.param("smime-type"));
        assert_eq!(Some("smime.p7m"), enc.param("name"));
        assert_eq!(Disposition::Attach, enc.disposition);
        let certs = fx.path("certificates");
        assert_eq!(
            format!(
                "aes256 {} {}\n",
                certs.join("aaaa.0").display(),
                certs.join("bbbb.0").display()
            ),
            String::from_utf8_lossy(enc.content.as_ref().unwrap())
        );

        let fx = Fixture::new(
            |c| c.smime.encrypt_command = "echo bad cert >&2".to_owned(),
            Scripted::default(),
        );
        let body = Body::new_leaf(BodyType::Text, "plain", "hello\n");
        assert!(matches!(
            fx.smime.build_smime_entity(&fx.crypt, body, "aaaa.0"),
            Err(Error::NoOutput)
        ));
        assert_eq!(vec!["bad cert\n".to_owned()], fx.prompt_transcript());
    }

    #[test]
    fn verification() {
        let fx = Fixture::new(
            |c| {
                c.smime.verify_command =
                    "test -f %s && echo 'Verification successful' >&2"
                        .to_owned()
            },
            Scripted::default(),
        );
        let signed = fx.path("signed");
        fs::write(&signed, "data\r\n").unwrap();
        let mut sig =
            Body::new_leaf(BodyType::Application, "pkcs7-signature", "AAAA");
        sig.encoding = Encoding::Base64;

        let mut state = State::new(Rc::from(&b""[..]), StateFlags::DISPLAY);
        assert_eq!(
            0,
            fx.smime.verify_one(&fx.crypt, &sig, &mut state, &signed)
        );
        assert_eq!(
            "[-- OpenSSL output follows --]\n\
             Verification successful\n\
             [-- End of OpenSSL output --]\n\n",
            state.output_text()
        );

        let fx = Fixture::new(
            |c| {
                c.smime.verify_command =
                    "echo 'Verification failure' >&2; exit 4".to_owned()
            },
            Scripted::default(),
        );
        let mut state = State::new(Rc::from(&b""[..]), StateFlags::DISPLAY);
        assert_eq!(
            -1,
            fx.smime.verify_one(&fx.crypt, &sig, &mut state, &signed)
        );
    }

    const OPAQUE: &str = "Content-Type: application/pkcs7-mime; \
                          smime-type=signed-data; name=smime.p7m\n\
                          Content-Transfer-Encoding: base64\n\
                          \n\
                          AAAA\n";

    #[test]
    fn opaque_signed_message_is_rendered() {
        let fx = Fixture::new(
            |c| {
                c.smime.verify_opaque_command =
                    "echo 'Verification successful' >&2; \
                     printf 'Content-Type: text/plain\\r\\n\\r\\n\
                     signed text\\r\\n'"
                        .to_owned()
            },
            Scripted::default(),
        );
        let mut email = parsed(OPAQUE);
        let (rc, out) = fx.crypt.render(&mut email, StateFlags::DISPLAY, None);
        assert_eq!(0, rc);
        assert_eq!(
            "[-- OpenSSL output follows --]\n\
             Verification successful\n\
             [-- End of OpenSSL output --]\n\
             \n\
             [-- The following data is S/MIME signed --]\n\
             \n\
             signed text\n\
             [-- End of S/MIME signed data --]\n",
            String::from_utf8_lossy(&out)
        );
    }

    const ENVELOPED: &str = "Content-Type: application/pkcs7-mime; \
                             smime-type=enveloped-data; name=smime.p7m\n\
                             Content-Transfer-Encoding: base64\n\
                             \n\
                             AAAA\n";

    #[test]
    fn decryption() {
        let fx = Fixture::new(
            |c| {
                c.smime.default_key = "mine.0".to_owned();
                c.smime.decrypt_command =
                    "read p; test \"$p\" = hunter2 || exit 1; \
                     printf 'Content-Type: text/plain\\r\\n\\r\\n\
                     secret\\r\\n'"
                        .to_owned();
            },
            Scripted::with_passphrase("hunter2"),
        );
        let email = parsed(ENVELOPED);
        let source = email.source.clone().unwrap();
        let dec = fx
            .smime
            .decrypt_mime(&fx.crypt, &source, &email.body)
            .unwrap();
        assert!(dec.body.is(BodyType::Text, "plain"));
        assert_eq!(b"secret\n", dec.body.raw(&dec.source));
    }

    #[test]
    fn decryption_failure() {
        let fx = Fixture::new(
            |c| c.smime.decrypt_command = "echo 'bad decrypt' >&2".to_owned(),
            Scripted::with_passphrase("hunter2"),
        );
        let mut email = parsed(ENVELOPED);
        let source = email.source.clone().unwrap();
        assert!(matches!(
            fx.smime.decrypt_mime(&fx.crypt, &source, &email.body),
            Err(Error::DecryptFailed)
        ));
        assert!(fx
            .prompt_transcript()
            .contains(&"Decryption failed".to_owned()));

        let (rc, out) = fx.crypt.render(&mut email, StateFlags::DISPLAY, None);
        assert_eq!(-1, rc);
        assert!(out.starts_with(
            b"[-- OpenSSL output follows --]\nbad decrypt\n\
              [-- End of OpenSSL output --]\n\n"
        ));
    }

    #[test]
    fn keys_for_recipients() {
        let fx = Fixture::with_certificates(CERTS, Scripted::default());
        let addrs = [
            Address::new("alice@example.com"),
            Address::new("bob@example.com"),
        ];
        assert_eq!(
            Some("aaaa.0 bbbb.0".to_owned()),
            fx.smime.find_keys(&fx.crypt, &addrs, false).unwrap()
        );

        let addrs = [
            Address::new("alice@example.com"),
            Address::new("carol@example.com"),
        ];
        assert_eq!(None, fx.smime.find_keys(&fx.crypt, &addrs, true).unwrap());
        assert!(fx.prompt_transcript().is_empty());

        assert_eq!(None, fx.smime.find_keys(&fx.crypt, &addrs, false).unwrap());
        assert_eq!(
            vec![
                "Enter keyID for carol@example.com: ".to_owned(),
                "No (valid) certificate found for carol@example.com".to_owned(),
            ],
            fx.prompt_transcript()
        );
    }

    #[test]
    fn decryption_key_selection() {
        let fx = Fixture::with_certificates_and(
            CERTS,
            |c| c.smime.default_key = "dflt.0".to_owned(),
            Scripted::default(),
        );
        fx.smime.getkeys(&fx.crypt, &Envelope::default());
        assert_eq!(Some("dflt.0".to_owned()), *fx.smime.key_to_use.borrow());

        let fx = Fixture::with_certificates(CERTS, Scripted::default());
        let mut env = Envelope::default();
        env.to = vec![
            Address::new("someone@example.com"),
            Address::new("me@example.com"),
        ];
        fx.smime.getkeys(&fx.crypt, &env);
        assert_eq!(Some("mine.0".to_owned()), *fx.smime.key_to_use.borrow());
    }

    #[test]
    fn sender_verification() {
        let make = |from: &str| {
            let mut env = Envelope::default();
            env.from = vec![Address::new(from)];
            let mut email = Email::new(env, Body::default());
            email.source = Some(Rc::from(&b"signed message\n"[..]));
            email
        };
        let fx = Fixture::new(
            |c| {
                c.smime.get_signer_cert_command = "echo cert > %c".to_owned();
                c.smime.get_cert_email_command =
                    "echo Alice@Example.com".to_owned();
            },
            Scripted::default(),
        );
        fx.smime
            .verify_sender(&fx.crypt, &make("alice@example.com"))
            .unwrap();
        assert!(matches!(
            fx.smime.verify_sender(&fx.crypt, &make("mallory@example.com")),
            Err(Error::VerifyFailed)
        ));

        let fx = Fixture::new(
            |c| c.smime.get_signer_cert_command = "true".to_owned(),
            Scripted::default(),
        );
        assert!(matches!(
            fx.smime.verify_sender(&fx.crypt, &make("alice@example.com")),
            Err(Error::VerifyMissingKey)
        ));
    }

    #[test]
    fn certificate_import() {
        let out_dir = TempDir::new().unwrap();
        let out = out_dir.path().join("imported");
        let quoted = quote_filename(&out.to_string_lossy());
        let fx = Fixture::new(
            move |c| {
                c.smime.pk7out_command = "cat %f".to_owned();
                c.smime.get_cert_command = "cat %f".to_owned();
                c.smime.import_cert_command =
                    format!("cat > {0}; cat %f >> {0}", quoted);
            },
            Scripted::default().answer("work"),
        );
        let input = fx.path("bundle");
        fs::write(&input, "CERT\n").unwrap();
        fx.smime.invoke_import(&fx.crypt, &input, None).unwrap();
        assert_eq!("work\nCERT\n", fs::read_to_string(&out).unwrap());

        // No label, no import
        let fx = Fixture::new(|_| (), Scripted::default());
        fx.smime.invoke_import(&fx.crypt, &input, None).unwrap();
    }

    #[test]
    fn send_menu_choices() {
        let fx = Fixture::new(
            |_| (),
            Scripted::default().answer("w").answer("1").answer("2"),
        );
        let mut email = Email::new(Envelope::default(), Body::default());
        let flags = fx.smime.send_menu(&fx.crypt, &mut email);
        assert_eq!(
            SecurityFlags::APPLICATION_SMIME | SecurityFlags::ENCRYPT,
            flags
        );
        assert_eq!("des3", *fx.smime.encrypt_with.borrow());

        let fx = Fixture::with_certificates(
            CERTS,
            Scripted::default().answer("a").answer("me@example"),
        );
        let mut email = Email::new(Envelope::default(), Body::default());
        let flags = fx.smime.send_menu(&fx.crypt, &mut email);
        assert!(flags.contains(SecurityFlags::SIGN));
        assert_eq!(Some("mine.0".to_owned()), fx.smime.signer());

        let fx = Fixture::new(
            |c| c.crypt.opportunistic_encrypt = true,
            Scripted::default().answer("c"),
        );
        let mut email = Email::new(Envelope::default(), Body::default());
        email.security = SecurityFlags::OPPENCRYPT
            | SecurityFlags::ENCRYPT
            | SecurityFlags::SIGN;
        let flags = fx.smime.send_menu(&fx.crypt, &mut email);
        // Clearing in oppenc mode only drops the signature
        assert!(flags.contains(SecurityFlags::ENCRYPT));
        assert!(!flags.contains(SecurityFlags::SIGN));
    }
}
