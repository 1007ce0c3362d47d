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

//! The classic PGP backend.
//!
//! Every operation is carried out by running one of the configured command
//! templates (by default, GnuPG) over scratch files, and interpreting its
//! output, exit status and status lines.

pub mod gnupg_parse;
mod inline;
mod invoke;
pub mod keys;
mod micalg;
mod status;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use log::{debug, info, warn};
use regex::Regex;
use secstr::SecStr;

use self::invoke::{Commands, Vars};
use self::keys::Ring;
use self::status::{check_decryption_okay, copy_checksig};
use super::armor::mark_traditional;
use super::backend::*;
use super::expando::{quote_filename, Template};
use super::flags::{KeyFlags, SecurityFlags};
use super::handler::{crlf_to_lf, payload, PGP_ENCRYPTED_BANNERS};
use super::key::{is_numerical_keyid, KeyInfo};
use super::ops::{convert_to_7bit, pgp_encrypted_payload};
use super::Crypt;
use crate::mime::content_encoding::decode_transfer;
use crate::mime::header::parse_address;
use crate::mime::model::*;
use crate::mime::parse::parse_entity_bytes;
use crate::mime::state::{State, StateFlags};
use crate::mime::write::{assign_boundaries, entity_to_vec};
use crate::support::error::Error;
use crate::support::file_ops::scratch_file;
use crate::support::passphrase::PassphraseCache;
use crate::support::system_config::{PgpConfig, SystemConfig};

fn optional_regex(pattern: &str) -> Result<Option<Regex>, Error> {
    if pattern.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Regex::new(pattern)?))
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

pub struct PgpClassic {
    config: PgpConfig,
    commands: Commands,
    good_sign: Option<Regex>,
    decryption_okay: Option<Regex>,
    passphrase: PassphraseCache,
    /// The signing key chosen in the send menu, which takes precedence over
    /// the configured one.
    sign_as: RefCell<Option<String>>,
    /// Previous answers to "which key" questions, keyed by what they were
    /// for.
    id_defaults: RefCell<HashMap<String, String>>,
}

impl PgpClassic {
    pub fn new(config: &SystemConfig) -> Result<Self, Error> {
        let pgp = &config.pgp;
        Ok(PgpClassic {
            config: pgp.clone(),
            commands: Commands::compile(pgp),
            good_sign: optional_regex(&pgp.good_sign)?,
            decryption_okay: optional_regex(&pgp.decryption_okay)?,
            passphrase: PassphraseCache::new("PGP", pgp.timeout),
            sign_as: RefCell::new(None),
            id_defaults: RefCell::new(HashMap::new()),
        })
    }

    /// The key to sign with, if any is configured.
    fn signer(&self) -> Option<String> {
        self.sign_as
            .borrow()
            .clone()
            .or_else(|| non_empty(&self.config.sign_as))
            .or_else(|| non_empty(&self.config.default_key))
    }

    fn ensure_passphrase(&self, ctx: &Crypt) -> bool {
        if self.config.use_gpg_agent {
            debug!("Relying on the agent for the PGP passphrase");
            return true;
        }
        if self.passphrase.is_valid() {
            return true;
        }

        self.passphrase.void();
        match ctx.prompt.ask_passphrase("Enter PGP passphrase:") {
            Some(pass) => {
                self.passphrase.set(pass);
                true
            }
            None => false,
        }
    }

    /// What to write to the standard input of a command: the passphrase
    /// line if it needs one, or an empty line.
    fn passphrase_input(&self, need_pass: bool) -> SecStr {
        let mut input = Vec::new();
        if need_pass && !self.config.use_gpg_agent {
            if let Some(pass) = self.passphrase.get() {
                input.extend_from_slice(pass.unsecure());
            }
        }
        input.push(b'\n');
        SecStr::new(input)
    }

    /// Report the diagnostics of a command which produced some.
    fn show_stderr(&self, ctx: &Crypt, stderr: &[u8]) {
        if !stderr.is_empty() {
            ctx.prompt.message(&String::from_utf8_lossy(stderr));
            ctx.prompt.any_key_to_continue();
        }
    }

    /// Decrypt one PGP/MIME payload into a MIME entity.
    ///
    /// When `display` is given, the diagnostics of the decryption are
    /// written to it. The returned flag tells whether an embedded signature
    /// was good.
    fn decrypt_part(
        &self,
        ctx: &Crypt,
        ciphertext: &[u8],
        mut display: Option<&mut State>,
    ) -> Result<(Decrypted, bool), Error> {
        let tf = scratch_file(&ctx.scratch(), "", ciphertext)?;
        let vars = Vars {
            file: Some(tf.path()),
            need_pass: true,
            ..Vars::default()
        };
        let input = self.passphrase_input(true);

        let out = match invoke::run(
            &self.commands.decrypt,
            &vars,
            self.config.use_gpg_agent,
            Some(input.unsecure()),
        ) {
            Ok(out) => out,
            Err(e) => {
                if let Some(state) = display.as_mut() {
                    state.attach_puts(
                        "[-- Error: could not create a PGP subprocess --]\n\n",
                    );
                }
                return Err(e);
            }
        };
        drop(tf);

        let plaintext = crlf_to_lf(&out.stdout);
        let okay = check_decryption_okay(
            self.config.check_gpg_decrypt_status_fd,
            self.decryption_okay.as_ref(),
            &out.stderr,
        );
        if okay < 0 {
            ctx.prompt.error("Decryption failed");
            self.passphrase.void();
            return Err(match okay {
                -2 => Error::NotActuallyEncrypted,
                -3 => Error::BackendRefused,
                _ => Error::DecryptFailed,
            });
        }

        let mut goodsig = false;
        if let Some(state) = display {
            goodsig = 0
                == copy_checksig(self.good_sign.as_ref(), &out.stderr, state)
                && 0 == out.status;
            state.attach_puts("[-- End of PGP output --]\n\n");
        }

        if plaintext.is_empty() {
            ctx.prompt.error("Decryption failed");
            self.passphrase.void();
            return Err(Error::DecryptFailed);
        }

        let source: Rc<[u8]> = Rc::from(plaintext);
        let body = parse_entity_bytes(Rc::clone(&source));
        Ok((Decrypted { source, body }, goodsig))
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
                                Ring::Public,
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
                        self.getkeys(ctx, &lookup);
                        key = self.getkeybyaddr(
                            ctx,
                            &lookup,
                            KeyFlags::CANENCRYPT,
                            Ring::Public,
                            oppenc,
                        );
                    }
                    if key.is_none() && !oppenc {
                        key = self.ask_for_key(
                            ctx,
                            &format!("Enter keyID for {}: ", lookup.mailbox),
                            Some(&lookup.mailbox),
                            KeyFlags::CANENCRYPT,
                            Ring::Public,
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

    /// Run the key fetching command for `addr`, if there is one.
    fn getkeys(&self, ctx: &Crypt, addr: &Address) {
        let template = match self.commands.get_keys {
            Some(ref template) => template,
            None => return,
        };

        let mailbox = quote_filename(&addr.mailbox);
        let vars = Vars {
            recipients: Some(&mailbox),
            ..Vars::default()
        };
        ctx.prompt.message("Fetching PGP key...");
        if let Err(e) =
            invoke::run(template, &vars, self.config.use_gpg_agent, None)
        {
            warn!("Fetching PGP key for {} failed: {}", addr.mailbox, e);
        }
    }

    /// Run `template` with the message in a scratch file, failing if the
    /// command produces nothing or (if checked) exits unsuccessfully.
    fn run_protect(
        &self,
        ctx: &Crypt,
        template: &Template,
        data: &[u8],
        keylist: Option<&str>,
        sign: bool,
    ) -> Result<Vec<u8>, Error> {
        let tf = scratch_file(&ctx.scratch(), "", data)?;
        let signer = if sign { self.signer() } else { None };
        let vars = Vars {
            file: Some(tf.path()),
            signer: signer.as_deref(),
            recipients: keylist,
            need_pass: sign,
            ..Vars::default()
        };
        let input = self.passphrase_input(sign);

        let out = invoke::run(
            template,
            &vars,
            self.config.use_gpg_agent,
            Some(input.unsecure()),
        )?;
        self.show_stderr(ctx, &out.stderr);

        if self.config.check_exit && 0 != out.status {
            if sign {
                self.passphrase.void();
            }
            return Err(Error::CommandFailed(out.status));
        }
        if out.stdout.is_empty() {
            if sign {
                self.passphrase.void();
            }
            return Err(Error::NoOutput);
        }
        Ok(out.stdout)
    }
}

impl CryptBackend for PgpClassic {
    fn scheme(&self) -> Scheme {
        Scheme::Pgp
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
        let part = pgp_encrypted_payload(body).ok_or_else(|| {
            Error::BadInput("not a PGP/MIME encrypted message".to_owned())
        })?;
        let ciphertext = decode_transfer(part.encoding, payload(part, source));
        self.decrypt_part(ctx, &ciphertext, None).map(|(dec, _)| dec)
    }

    fn application_handler(
        &self,
        ctx: &Crypt,
        body: &mut Body,
        state: &mut State,
    ) -> i32 {
        self.inline_handler(ctx, body, state)
    }

    fn encrypted_handler(
        &self,
        ctx: &Crypt,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let display = state.has(StateFlags::DISPLAY);
        if display {
            ctx.current_time_banner(state, "PGP");
        }

        let ciphertext = payload(b, &state.fp_in).to_vec();
        let result = self.decrypt_part(
            ctx,
            &ciphertext,
            if display { Some(&mut *state) } else { None },
        );

        match result {
            Ok((dec, goodsig)) => {
                b.goodsig = goodsig;
                let (opening, closing) = PGP_ENCRYPTED_BANNERS;
                let rc = ctx.render_decrypted(b, state, dec, opening, closing);
                ctx.prompt.message("PGP message successfully decrypted");
                rc
            }
            Err(e) => {
                debug!("PGP/MIME decryption failed: {}", e);
                ctx.prompt.error("Could not decrypt PGP message");
                self.passphrase.void();
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
                    debug!("No PGP key for {}", addr.mailbox);
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
        convert_to_7bit(&mut body, self.config.strict_enc);
        assign_boundaries(&mut body);
        let signed = entity_to_vec(&body, None);

        let output =
            self.run_protect(ctx, &self.commands.sign, &signed, None, true)?;

        // Some implementations label detached signatures as messages
        let mut sig = Vec::with_capacity(output.len());
        for line in output.split_inclusive(|&c| b'\n' == c) {
            match line {
                b"-----BEGIN PGP MESSAGE-----\n" => {
                    sig.extend_from_slice(b"-----BEGIN PGP SIGNATURE-----\n")
                }
                b"-----END PGP MESSAGE-----\n" => {
                    sig.extend_from_slice(b"-----END PGP SIGNATURE-----\n")
                }
                _ => sig.extend_from_slice(line),
            }
        }

        let micalg = micalg::find_micalg(&sig);
        let mut sig_part =
            Body::new_leaf(BodyType::Application, "pgp-signature", sig);
        sig_part.encoding = Encoding::SevenBit;
        sig_part.disposition = Disposition::None;
        sig_part.use_disp = false;
        sig_part.params.set("name", "signature.asc");

        let mut multipart = Body::new_multipart("signed", vec![body, sig_part]);
        multipart.use_disp = false;
        multipart.params.set("protocol", "application/pgp-signature");
        multipart.params.set("micalg", micalg);
        assign_boundaries(&mut multipart);
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
        let sig_file = match scratch_file(&dir, ".asc", &data) {
            Ok(tf) => tf,
            Err(e) => {
                warn!("Can't create signature file: {}", e);
                return -1;
            }
        };

        ctx.current_time_banner(state, "PGP");

        let vars = Vars {
            file: Some(signed_file),
            sig_file: Some(sig_file.path()),
            ..Vars::default()
        };
        let mut badsig = -1;
        match invoke::run(
            &self.commands.verify,
            &vars,
            self.config.use_gpg_agent,
            None,
        ) {
            Ok(out) => {
                if copy_checksig(self.good_sign.as_ref(), &out.stdout, state)
                    >= 0
                {
                    badsig = 0;
                }
                if copy_checksig(self.good_sign.as_ref(), &out.stderr, state)
                    >= 0
                {
                    badsig = 0;
                }
                if 0 != out.status {
                    debug!("PGP verify exited with {}", out.status);
                    badsig = -1;
                }
            }
            Err(e) => warn!("Unable to run PGP verify: {}", e),
        }

        state.attach_puts("[-- End of PGP output --]\n\n");
        badsig
    }

    fn send_menu(&self, ctx: &Crypt, email: &mut Email) -> SecurityFlags {
        let crypto = SecurityFlags::ENCRYPT | SecurityFlags::SIGN;

        if self.config.auto_inline
            && !(email.security.contains(SecurityFlags::APPLICATION_PGP)
                && email.security.intersects(crypto))
        {
            email.security.insert(SecurityFlags::INLINE);
        }
        email.security.insert(SecurityFlags::APPLICATION_PGP);

        let mime_inline = if email.security.contains(SecurityFlags::INLINE) {
            "PGP/M(i)ME"
        } else {
            "(i)nline"
        };
        let has_crypto = email.security.intersects(crypto);
        let oppenc_option = ctx.config.crypt.opportunistic_encrypt;

        let (prompt, letters, choices) = if oppenc_option
            && email.security.contains(SecurityFlags::OPPENCRYPT)
        {
            if has_crypto {
                (
                    format!(
                        "PGP (s)ign, sign (a)s, {} format, (c)lear, \
                         or (o)ppenc mode off?",
                        mime_inline
                    ),
                    "saico",
                    "SaiCo",
                )
            } else {
                (
                    "PGP (s)ign, sign (a)s, (c)lear, or (o)ppenc mode off?"
                        .to_owned(),
                    "saco",
                    "SaCo",
                )
            }
        } else if oppenc_option {
            if has_crypto {
                (
                    format!(
                        "PGP (e)ncrypt, (s)ign, sign (a)s, (b)oth, {} format, \
                         (c)lear, or (o)ppenc mode?",
                        mime_inline
                    ),
                    "esabico",
                    "esabicO",
                )
            } else {
                (
                    "PGP (e)ncrypt, (s)ign, sign (a)s, (b)oth, (c)lear, \
                     or (o)ppenc mode?"
                        .to_owned(),
                    "esabco",
                    "esabcO",
                )
            }
        } else if has_crypto {
            (
                format!(
                    "PGP (e)ncrypt, (s)ign, sign (a)s, (b)oth, {} format, \
                     or (c)lear?",
                    mime_inline
                ),
                "esabic",
                "esabic",
            )
        } else {
            (
                "PGP (e)ncrypt, (s)ign, sign (a)s, (b)oth, or (c)lear?"
                    .to_owned(),
                "esabc",
                "esabc",
            )
        };

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
                    KeyFlags::empty(),
                    Ring::Secret,
                ) {
                    *self.sign_as.borrow_mut() =
                        Some(format!("0x{}", key.fpr_or_long_id()));
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

    fn pgp(&self) -> Option<&dyn PgpOps> {
        Some(self)
    }
}

impl PgpOps for PgpClassic {
    fn encrypt_message(
        &self,
        ctx: &Crypt,
        mut body: Body,
        keylist: &str,
        sign: bool,
        _from: Option<&Address>,
    ) -> Result<Body, Error> {
        if sign {
            convert_to_7bit(&mut body, self.config.strict_enc);
        }
        assign_boundaries(&mut body);
        let plaintext = entity_to_vec(&body, None);

        let template = if sign {
            &self.commands.encrypt_sign
        } else {
            &self.commands.encrypt_only
        };
        let ciphertext =
            self.run_protect(ctx, template, &plaintext, Some(keylist), sign)?;

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
            Ring::Public,
        ) {
            Some(key) => key,
            None => return Ok(None),
        };

        let id = format!("0x{}", key.fpr_or_long_id());
        let vars = Vars {
            recipients: Some(&id),
            ..Vars::default()
        };
        let out = invoke::run(
            &self.commands.export,
            &vars,
            self.config.use_gpg_agent,
            None,
        )?;
        if out.stdout.is_empty() {
            self.show_stderr(ctx, &out.stderr);
            return Err(Error::NoOutput);
        }

        let mut att =
            Body::new_leaf(BodyType::Application, "pgp-keys", out.stdout);
        att.encoding = Encoding::SevenBit;
        att.description = Some(format!("PGP Key {}", id));
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

    fn invoke_getkeys(&self, ctx: &Crypt, addr: &Address) {
        self.getkeys(ctx, addr);
    }

    fn invoke_import(&self, ctx: &Crypt, path: &Path) -> Result<(), Error> {
        match invoke::run(
            &self.commands.import,
            &Vars::file(path),
            self.config.use_gpg_agent,
            None,
        ) {
            Ok(out) => {
                if 0 != out.status {
                    warn!("PGP import exited with {}", out.status);
                }
                let mut report = out.stdout;
                report.extend_from_slice(&out.stderr);
                if !report.is_empty() {
                    ctx.prompt.message(&String::from_utf8_lossy(&report));
                }
                info!("Imported PGP keys from {}", path.display());
            }
            Err(e) => warn!("Unable to run PGP import: {}", e),
        }
        Ok(())
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

        let tf = scratch_file(&ctx.scratch(), "", &state.out)?;
        self.invoke_import(ctx, tf.path())?;
        ctx.prompt.any_key_to_continue();
        Ok(())
    }
}
