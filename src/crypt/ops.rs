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

//! Scheme-independent security operations.
//!
//! Recognising which kind of protection a MIME tree carries, applying
//! protection to an outgoing message, and the bookkeeping around recipient
//! keys. Everything scheme-specific is delegated to the registered backends
//! through the multiplexor.

use std::rc::Rc;

use log::{debug, info, warn};
use regex::RegexBuilder;

use super::backend::{CryptBackend, Scheme};
use super::flags::SecurityFlags;
use super::Crypt;
use crate::autocrypt::Recommendation;
use crate::mime::content_encoding::decode_transfer;
use crate::mime::model::*;
use crate::mime::write::{assign_boundaries, detach, write_message};
use crate::support::error::Error;
use crate::support::file_ops::scratch_file;

/// The scheme a set of security flags selects.
pub fn scheme_of(flags: SecurityFlags) -> Scheme {
    if flags.contains(SecurityFlags::APPLICATION_SMIME) {
        Scheme::Smime
    } else {
        Scheme::Pgp
    }
}

pub fn is_multipart_signed(b: &Body) -> SecurityFlags {
    if !b.is(BodyType::Multipart, "signed") {
        return SecurityFlags::empty();
    }

    match b.param("protocol").map(str::to_ascii_lowercase).as_deref() {
        Some("multipart/mixed") => SecurityFlags::SIGN,
        Some("application/pgp-signature") => SecurityFlags::PGP_SIGN,
        Some("application/x-pkcs7-signature")
        | Some("application/pkcs7-signature") => SecurityFlags::SMIME_SIGN,
        _ => SecurityFlags::empty(),
    }
}

pub fn is_multipart_encrypted(b: &Body) -> SecurityFlags {
    let pgp = b.is(BodyType::Multipart, "encrypted")
        && b.param("protocol").map_or(false, |p| {
            p.eq_ignore_ascii_case("application/pgp-encrypted")
        });
    if pgp {
        SecurityFlags::PGP_ENCRYPT
    } else {
        SecurityFlags::empty()
    }
}

/// A PGP/MIME encrypted part with the two parts RFC 3156 requires.
pub fn is_valid_multipart_pgp_encrypted(b: &Body) -> SecurityFlags {
    if is_multipart_encrypted(b).is_empty() {
        return SecurityFlags::empty();
    }

    match b.parts.as_slice() {
        [control, data, ..]
            if control.is(BodyType::Application, "pgp-encrypted")
                && data.is(BodyType::Application, "octet-stream") =>
        {
            SecurityFlags::PGP_ENCRYPT
        }
        _ => SecurityFlags::empty(),
    }
}

/// The layout some versions of Exchange turn PGP/MIME messages into: a
/// `multipart/mixed` of an empty text part, the control part and the data.
pub fn is_malformed_multipart_pgp_encrypted(b: &Body) -> SecurityFlags {
    if !b.is(BodyType::Multipart, "mixed") {
        return SecurityFlags::empty();
    }

    match b.parts.as_slice() {
        [empty, control, data]
            if empty.is(BodyType::Text, "plain")
                && 0 == empty.size()
                && control.is(BodyType::Application, "pgp-encrypted")
                && data.is(BodyType::Application, "octet-stream") =>
        {
            SecurityFlags::PGP_ENCRYPT
        }
        _ => SecurityFlags::empty(),
    }
}

/// The part holding the ciphertext of a PGP/MIME message, in either layout.
/// A bare `application/octet-stream` is its own payload.
pub fn pgp_encrypted_payload(b: &Body) -> Option<&Body> {
    if !is_valid_multipart_pgp_encrypted(b).is_empty() {
        b.parts.get(1)
    } else if !is_malformed_multipart_pgp_encrypted(b).is_empty() {
        b.parts.get(2)
    } else if b.is(BodyType::Application, "octet-stream") {
        Some(b)
    } else {
        None
    }
}

/// Classify a part carrying PGP data without a PGP/MIME wrapper.
pub fn is_application_pgp(b: &Body) -> SecurityFlags {
    let mut t = SecurityFlags::empty();

    if BodyType::Application == b.body_type {
        let st = b.subtype.as_str();
        if "pgp" == st || "x-pgp-message" == st {
            if b.param("x-action").map_or(false, |p| {
                p.eq_ignore_ascii_case("sign")
                    || p.eq_ignore_ascii_case("signclear")
            }) {
                t |= SecurityFlags::PGP_SIGN;
            }
            if b.param("format")
                .map_or(false, |p| p.eq_ignore_ascii_case("keys-only"))
            {
                t |= SecurityFlags::PGP_KEY;
            }
            if t.is_empty() {
                // Not necessarily right, but the best guess
                t |= SecurityFlags::PGP_ENCRYPT;
            }
        }
        if "pgp-signed" == st {
            t |= SecurityFlags::PGP_SIGN;
        }
        if "pgp-keys" == st {
            t |= SecurityFlags::PGP_KEY;
        }
    } else if b.is(BodyType::Text, "plain") {
        let action = b
            .param("x-mutt-action")
            .or_else(|| b.param("x-action"))
            .or_else(|| b.param("action"))
            .map(str::to_ascii_lowercase);
        if let Some(action) = action {
            if action.starts_with("pgp-sign") {
                t |= SecurityFlags::PGP_SIGN;
            } else if action.starts_with("pgp-encrypt") {
                t |= SecurityFlags::PGP_ENCRYPT;
            } else if action.starts_with("pgp-keys") {
                t |= SecurityFlags::PGP_KEY;
            }
        }
    }

    if !t.is_empty() {
        t |= SecurityFlags::PGP_INLINE;
    }
    t
}

pub fn is_application_smime(b: &Body) -> SecurityFlags {
    if BodyType::Application != b.body_type {
        return SecurityFlags::empty();
    }

    let st = b.subtype.as_str();
    if "x-pkcs7-mime" == st || "pkcs7-mime" == st {
        if let Some(t) = b.param("smime-type") {
            return if t.eq_ignore_ascii_case("enveloped-data") {
                SecurityFlags::SMIME_ENCRYPT
            } else if t.eq_ignore_ascii_case("signed-data") {
                SecurityFlags::SMIME_SIGN | SecurityFlags::SMIME_OPAQUE
            } else {
                SecurityFlags::empty()
            };
        }

        // Netscape 4.7 only says so in the description
        if b.description.as_ref().map_or(false, |d| {
            d.eq_ignore_ascii_case("S/MIME Encrypted Message")
        }) {
            return SecurityFlags::SMIME_ENCRYPT;
        }
    } else if "octet-stream" != st {
        return SecurityFlags::empty();
    }

    let name = b
        .param("name")
        .or_else(|| b.d_filename.as_deref())
        .or_else(|| b.filename.as_deref());
    let name = match name {
        Some(n) => n.to_ascii_lowercase(),
        None => {
            debug!("S/MIME part without any hint on its content");
            return SecurityFlags::empty();
        }
    };

    if name.len() > 4 && (name.ends_with(".p7m") || name.ends_with(".p7s")) {
        SecurityFlags::SMIME_SIGN | SecurityFlags::SMIME_OPAQUE
    } else {
        SecurityFlags::empty()
    }
}

/// The security properties of a MIME tree.
///
/// Flags found on every child of a container carry over to the container;
/// flags found on only some carry over except for `GOODSIGN`, which is then
/// reported as `PARTSIGN`.
pub fn crypt_query(b: &Body) -> SecurityFlags {
    let mut rc = SecurityFlags::empty();

    match b.body_type {
        BodyType::Application => {
            rc |= is_application_pgp(b);
            rc |= is_application_smime(b);
            if !rc.is_empty() && b.goodsig {
                rc |= SecurityFlags::GOODSIGN;
            }
            if !rc.is_empty() && b.badsig {
                rc |= SecurityFlags::BADSIGN;
            }
        }
        BodyType::Text => {
            rc |= is_application_pgp(b);
            if !rc.is_empty() && b.goodsig {
                rc |= SecurityFlags::GOODSIGN;
            }
        }
        BodyType::Multipart => {
            rc |= is_multipart_encrypted(b);
            rc |= is_multipart_signed(b);
            rc |= is_malformed_multipart_pgp_encrypted(b);
            if !rc.is_empty() && b.goodsig {
                rc |= SecurityFlags::GOODSIGN;
            }
            if !rc.is_empty() && b.is_autocrypt {
                rc |= SecurityFlags::AUTOCRYPT;
            }
        }
        _ => (),
    }

    if b.is_multipart() || BodyType::Message == b.body_type {
        let children: Vec<&Body> = if b.is_multipart() {
            b.parts.iter().collect()
        } else {
            b.email.iter().map(|e| &e.body).collect()
        };

        let mut all = if children.is_empty() {
            SecurityFlags::empty()
        } else {
            SecurityFlags::all()
        };
        let mut any = SecurityFlags::empty();
        for child in children {
            let v = crypt_query(child);
            all &= v;
            any |= v;
        }
        rc |= all | (any - SecurityFlags::GOODSIGN);

        if any.contains(SecurityFlags::GOODSIGN)
            && !all.contains(SecurityFlags::GOODSIGN)
        {
            rc |= SecurityFlags::PARTSIGN;
        }
    }

    rc
}

/// The signed payload of a `multipart/signed`, headers included, with line
/// endings canonicalised to CRLF.
pub fn write_signed(b: &Body, source: &[u8]) -> Vec<u8> {
    let data = b.raw_entity(source);
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

/// Every non-multipart part of the tree under `b`, in document order.
pub fn fetch_signatures(b: &Body) -> Vec<&Body> {
    let mut out = Vec::new();
    fn walk<'a>(b: &'a Body, out: &mut Vec<&'a Body>) {
        if b.is_multipart() {
            for part in &b.parts {
                walk(part, out);
            }
        } else {
            out.push(b);
        }
    }
    walk(b, &mut out);
    out
}

/// Give every part of an in-memory tree a transfer encoding that survives
/// 7-bit transports.
///
/// With `strict`, text containing lines that are commonly mangled in
/// transit (a `From ` at the start, trailing whitespace) is also
/// quoted-printable encoded.
pub fn convert_to_7bit(b: &mut Body, strict: bool) {
    if b.is_multipart() {
        if Encoding::SevenBit != b.encoding || strict {
            b.encoding = Encoding::SevenBit;
            for part in &mut b.parts {
                convert_to_7bit(part, strict);
            }
        }
        return;
    }

    if BodyType::Message == b.body_type
        && !b.subtype.eq_ignore_ascii_case("delivery-status")
    {
        if Encoding::SevenBit != b.encoding {
            b.encoding = Encoding::SevenBit;
        }
        if let Some(ref mut email) = b.email {
            convert_to_7bit(&mut email.body, strict);
        }
        return;
    }

    match b.encoding {
        Encoding::EightBit => b.encoding = Encoding::QuotedPrintable,
        Encoding::Binary => b.encoding = Encoding::Base64,
        Encoding::SevenBit => {
            let fragile = b.content.as_ref().map_or(false, |c| {
                c.split(|&c| b'\n' == c).any(|line| {
                    line.starts_with(b"From ")
                        || (strict
                            && line
                                .strip_suffix(b"\r")
                                .unwrap_or(line)
                                .last()
                                .map_or(false, |&c| b' ' == c || b'\t' == c))
                })
            });
            if fragile {
                b.encoding = Encoding::QuotedPrintable;
            }
        }
        _ => (),
    }
}

/// To, Cc and Bcc, without duplicates.
fn recipient_list(env: &Envelope) -> Vec<Address> {
    let mut out: Vec<Address> = Vec::new();
    for addr in env.to.iter().chain(&env.cc).chain(&env.bcc) {
        if addr.mailbox.is_empty() {
            continue;
        }
        if !out.iter().any(|a| a.mailbox_eq(addr)) {
            out.push(addr.clone());
        }
    }
    out
}

impl Crypt {
    /// Forget the passphrases of every scheme.
    pub fn forget_passphrase(&self) {
        self.void_passphrase(Scheme::Pgp);
        self.void_passphrase(Scheme::Smime);
        self.prompt.message("Passphrases forgotten");
    }

    /// The mailbox signers should be identified by.
    pub fn sender_mailbox(&self, env: &Envelope) -> Option<String> {
        env.from
            .first()
            .map(|a| a.mailbox.clone())
            .filter(|m| !m.is_empty())
            .or_else(|| self.config.crypt.envelope_from_address.clone())
    }

    /// Sign and/or encrypt `email` as its security flags request.
    ///
    /// `keylist` holds the recipient keys, as produced by `get_keys`. When
    /// `postpone` is set the message is being saved as a draft, which is
    /// never signed. On failure, `email` is left as it was.
    pub fn protect(
        &self,
        email: &mut Email,
        keylist: &str,
        postpone: bool,
    ) -> Result<(), Error> {
        let mut security = email.security;
        let mut sign = security
            .intersects(SecurityFlags::AUTOCRYPT | SecurityFlags::SIGN);
        if postpone {
            sign = false;
            security.remove(SecurityFlags::SIGN);
        }

        if !security
            .intersects(SecurityFlags::ENCRYPT | SecurityFlags::AUTOCRYPT)
            && !sign
        {
            return Ok(());
        }

        let scheme = scheme_of(security);
        if sign
            && !security.contains(SecurityFlags::AUTOCRYPT)
            && !self.valid_passphrase(scheme)
        {
            return Err(Error::PassphraseRequired);
        }

        let autocrypt = if security.contains(SecurityFlags::AUTOCRYPT) {
            let ac = self.autocrypt.as_ref().ok_or(Error::AutocryptDisabled)?;
            if !ac.set_sign_as_default_key(email)? {
                return Err(Error::KeyNotFound(
                    self.sender_mailbox(&email.env).unwrap_or_default(),
                ));
            }
            Some(ac)
        } else {
            None
        };

        let mut body = match email.source {
            Some(ref source) => detach(&email.body, source),
            None => email.body.clone(),
        };

        if !security.contains(SecurityFlags::AUTOCRYPT)
            && security.contains(SecurityFlags::PGP_INLINE)
        {
            if let Some(inline) = self.protect_inline(&body, security, keylist)?
            {
                email.body = inline;
                email.source = None;
                return Ok(());
            }
        }

        if sign {
            match self.sender_mailbox(&email.env) {
                Some(mailbox) => self.set_sender(scheme, &mailbox),
                None => {
                    self.prompt.error("Failed to figure out sender");
                    return Err(Error::BadInput(
                        "message has no sender".to_owned(),
                    ));
                }
            }
        }

        let mut protected = if self.config.crypt.protected_headers_write {
            Some(self.protected_envelope(&email.env))
        } else {
            None
        };

        if !postpone && security.contains(SecurityFlags::AUTOCRYPT) {
            if let Some(ref ac) = self.autocrypt {
                let mut env = protected.take().unwrap_or_default();
                let gossiped = ac.write_gossip_headers(email, &mut env)?;
                if gossiped || self.config.crypt.protected_headers_write {
                    protected = Some(env);
                }
            }
        }

        if let Some(env) = protected {
            body.mime_headers = Some(Box::new(env));
            body.params.set("protected-headers", "v1");
        }
        assign_boundaries(&mut body);

        let from = email.env.from.first();
        let mut pgp_sign = sign;
        let wants_encryption = security
            .intersects(SecurityFlags::ENCRYPT | SecurityFlags::AUTOCRYPT);

        if sign {
            if Scheme::Smime == scheme {
                body = self.sign_message(Scheme::Smime, body, from)?;
            } else if !wants_encryption || self.config.crypt.retainable_sigs {
                body = match autocrypt {
                    Some(ac) => ac.backend().sign_message(self, body, from)?,
                    None => self.sign_message(Scheme::Pgp, body, from)?,
                };
                pgp_sign = false;
            }
        }

        if wants_encryption {
            body = match scheme {
                Scheme::Smime => {
                    self.smime_ops()?.build_smime_entity(self, body, keylist)?
                }
                Scheme::Pgp => {
                    let ops = match autocrypt {
                        Some(_) => self.autocrypt_pgp_ops()?,
                        None => self.pgp_ops()?,
                    };
                    ops.encrypt_message(self, body, keylist, pgp_sign, from)?
                }
            };
        }

        email.body = body;
        email.source = None;
        Ok(())
    }

    /// Try to protect `body` as inline PGP. `Ok(None)` means the user agreed
    /// to fall back to PGP/MIME.
    fn protect_inline(
        &self,
        body: &Body,
        security: SecurityFlags,
        keylist: &str,
    ) -> Result<Option<Body>, Error> {
        let fallback = self.config.crypt.pgp_mime_auto;
        let (question, refusal) = if !body.is(BodyType::Text, "plain") {
            (
                "Inline PGP can't be used with attachments.  \
                 Revert to PGP/MIME?",
                "Mail not sent: inline PGP can't be used with attachments",
            )
        } else if body.is_flowed() {
            (
                "Inline PGP can't be used with format=flowed.  \
                 Revert to PGP/MIME?",
                "Mail not sent: inline PGP can't be used with format=flowed",
            )
        } else {
            if let Some(inline) = self
                .pgp_ops()?
                .traditional_encryptsign(self, body, security, keylist)?
            {
                return Ok(Some(inline));
            }
            (
                "Message can't be sent inline.  Revert to using PGP/MIME?",
                "Mail not sent",
            )
        };

        if Some(true) == self.prompt.query_quadoption(fallback, question) {
            Ok(None)
        } else {
            self.prompt.error(refusal);
            Err(Error::Cancelled)
        }
    }

    /// The headers to protect inside the signed or encrypted part.
    fn protected_envelope(&self, env: &Envelope) -> Envelope {
        let mut protected = Envelope {
            subject: env.subject.clone(),
            ..Envelope::default()
        };
        if self.config.crypt.protected_headers_devel {
            protected.return_path = env.return_path.clone();
            protected.from = env.from.clone();
            protected.to = env.to.clone();
            protected.cc = env.cc.clone();
            protected.sender = env.sender.clone();
            protected.reply_to = env.reply_to.clone();
            protected.mail_followup_to = env.mail_followup_to.clone();
            protected.x_original_to = env.x_original_to.clone();
            protected.references = env.references.clone();
            protected.in_reply_to = env.in_reply_to.clone();
        }
        protected
    }

    /// The PGP operations of the Autocrypt keyring.
    fn autocrypt_pgp_ops(&self) -> Result<&dyn super::backend::PgpOps, Error> {
        let ac = self.autocrypt.as_ref().ok_or(Error::AutocryptDisabled)?;
        ac.backend().pgp().ok_or(Error::Unsupported)
    }

    /// Whether the real subject should be replaced in the clear headers.
    pub fn should_hide_protected_subject(&self, email: &Email) -> bool {
        self.config.crypt.protected_headers_write
            && email
                .security
                .intersects(SecurityFlags::ENCRYPT | SecurityFlags::AUTOCRYPT)
            && !email.security.contains(SecurityFlags::INLINE)
            && !self.config.crypt.protected_headers_subject.is_empty()
    }

    /// Keys configured for `mailbox` through crypt hooks.
    pub fn crypt_hook_keys(&self, mailbox: &str) -> Vec<String> {
        if !self.config.crypt.use_hook {
            return vec![];
        }

        let mut keys = Vec::new();
        for hook in &self.config.crypt.crypt_hooks {
            match RegexBuilder::new(&hook.pattern)
                .case_insensitive(true)
                .build()
            {
                Ok(re) if re.is_match(mailbox) => keys.push(hook.key.clone()),
                Ok(_) => (),
                Err(e) => warn!("Bad crypt hook '{}': {}", hook.pattern, e),
            }
        }
        keys
    }

    /// Work out the keys the recipients of `email` need.
    ///
    /// In `oppenc_mode` nothing is asked of the user and `Ok(None)` means
    /// some recipient has no key which could be determined automatically.
    /// Otherwise `Ok(None)` means there is nothing to encrypt to.
    pub fn get_keys(
        &self,
        email: &Email,
        oppenc_mode: bool,
    ) -> Result<Option<String>, Error> {
        if !oppenc_mode && email.security.contains(SecurityFlags::AUTOCRYPT) {
            let ac = self.autocrypt.as_ref().ok_or(Error::AutocryptDisabled)?;
            let (rec, keylist) = ac.ui_recommendation(email)?;
            if rec <= Recommendation::No {
                return Err(Error::KeyNotFound(
                    "Autocrypt recipients".to_owned(),
                ));
            }
            return Ok(keylist);
        }

        let addrs = recipient_list(&email.env);
        if !oppenc_mode && !email.security.contains(SecurityFlags::ENCRYPT) {
            return Ok(None);
        }

        let (scheme, self_key) =
            if email.security.contains(SecurityFlags::APPLICATION_SMIME) {
                (Scheme::Smime, &self.config.smime.default_key)
            } else if email.security.contains(SecurityFlags::APPLICATION_PGP) {
                (Scheme::Pgp, &self.config.pgp.default_key)
            } else {
                return Ok(None);
            };

        let mut keylist = match self.find_keys(scheme, &addrs, oppenc_mode)? {
            Some(k) => k,
            None if oppenc_mode => return Ok(None),
            None => return Err(Error::Cancelled),
        };

        if !oppenc_mode && self.config.crypt.self_encrypt {
            let own = match scheme {
                Scheme::Pgp => &self.config.pgp.self_encrypt_as,
                Scheme::Smime => &self.config.smime.self_encrypt_as,
            };
            let own = if own.is_empty() { self_key } else { own };
            if !own.is_empty() {
                keylist.push(' ');
                keylist.push_str(own);
            }
        }

        Ok(Some(keylist))
    }

    /// Turn `ENCRYPT` on if every recipient key can be found without asking,
    /// and off otherwise.
    pub fn opportunistic_encrypt(&self, email: &mut Email) {
        if !(self.config.crypt.opportunistic_encrypt
            && email.security.contains(SecurityFlags::OPPENCRYPT))
        {
            return;
        }

        match self.get_keys(email, true) {
            Ok(Some(_)) => email.security.insert(SecurityFlags::ENCRYPT),
            Ok(None) => email.security.remove(SecurityFlags::ENCRYPT),
            Err(e) => {
                debug!("Opportunistic key lookup failed: {}", e);
                email.security.remove(SecurityFlags::ENCRYPT);
            }
        }
    }

    /// Import whatever keys and certificates can be found in `emails`.
    pub fn extract_keys_from_messages(
        &self,
        emails: &[Email],
    ) -> Result<(), Error> {
        for email in emails {
            let source = match email.source {
                Some(ref s) => Rc::clone(s),
                None => {
                    let mut out = Vec::new();
                    write_message(&mut out, email);
                    Rc::from(out)
                }
            };
            let security = email.security | crypt_query(&email.body);
            if security.contains(SecurityFlags::ENCRYPT)
                && !self.valid_passphrase(scheme_of(security))
            {
                break;
            }

            if security.contains(SecurityFlags::APPLICATION_PGP) {
                let mut decoded = Vec::new();
                decoded_text(&email.body, &source, &mut decoded);
                let tf = scratch_file(&self.scratch(), "", &decoded)?;
                info!("Trying to extract PGP keys");
                self.pgp_ops()?.invoke_import(self, tf.path())?;
            }

            if security.contains(SecurityFlags::APPLICATION_SMIME) {
                let data = if security.contains(SecurityFlags::ENCRYPT) {
                    let dec =
                        self.decrypt_mime(Scheme::Smime, &source, &email.body)?;
                    dec.body.raw_entity(&dec.source).to_vec()
                } else {
                    source.to_vec()
                };
                let mailbox = email
                    .env
                    .from
                    .first()
                    .or_else(|| email.env.sender.first())
                    .map(|a| a.mailbox.clone());
                if let Some(mailbox) = mailbox {
                    let tf = scratch_file(&self.scratch(), "", &data)?;
                    info!("Trying to extract S/MIME certificates");
                    self.smime_ops()?.invoke_import(
                        self,
                        tf.path(),
                        Some(&mailbox),
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// The decoded payloads of every leaf under `b`.
fn decoded_text(b: &Body, source: &[u8], out: &mut Vec<u8>) {
    if b.is_multipart() {
        for part in &b.parts {
            decoded_text(part, source, out);
        }
    } else if let Some(ref email) = b.email {
        let inner = email.source.as_deref().unwrap_or(source);
        decoded_text(&email.body, inner, out);
    } else {
        match b.content {
            Some(ref c) => out.extend_from_slice(c),
            None => out.extend_from_slice(&decode_transfer(
                b.encoding,
                b.raw(source),
            )),
        }
        if out.last() != Some(&b'\n') {
            out.push(b'\n');
        }
    }
}
