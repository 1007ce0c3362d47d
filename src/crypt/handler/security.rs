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

//! Handlers for signed and encrypted structure, and the pieces backends use
//! to render what they decrypt.

use std::rc::Rc;

use chrono::Local;
use log::{debug, warn};

use super::Handler;
use crate::crypt::backend::{Decrypted, Scheme};
use crate::crypt::flags::SecurityFlags;
use crate::crypt::ops::{fetch_signatures, is_multipart_signed, write_signed};
use crate::crypt::Crypt;
use crate::mime::model::*;
use crate::mime::state::{State, StateFlags};
use crate::support::file_ops::scratch_file;

/// The banners framing decrypted PGP/MIME content.
pub const PGP_ENCRYPTED_BANNERS: (&str, &str) = (
    "[-- The following data is PGP/MIME encrypted --]\n",
    "[-- End of PGP/MIME encrypted data --]\n",
);

impl Crypt {
    pub(super) fn signed_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        if b.parts.is_empty() {
            return -1;
        }

        let signed_type = is_multipart_signed(b);
        if signed_type.is_empty() {
            state.puts(&format!(
                "[-- Error: Unknown multipart/signed protocol {} --]\n\n",
                b.param("protocol").unwrap_or_default()
            ));
            return self.handle_body(&mut b.parts[0], state);
        }

        let consistent = match b.parts.get(1) {
            None => false,
            Some(sig) => {
                if signed_type == SecurityFlags::SIGN {
                    sig.is(BodyType::Multipart, "mixed")
                } else if signed_type == SecurityFlags::PGP_SIGN {
                    sig.is(BodyType::Application, "pgp-signature")
                } else if signed_type == SecurityFlags::SMIME_SIGN {
                    sig.is(BodyType::Application, "x-pkcs7-signature")
                        || sig.is(BodyType::Application, "pkcs7-signature")
                } else {
                    false
                }
            }
        };
        if !consistent {
            state.attach_puts(
                "[-- Error: Missing or bad-format multipart/signed \
                 signature --]\n\n",
            );
            return self.handle_body(&mut b.parts[0], state);
        }

        let display = state.has(StateFlags::DISPLAY);
        let mut any_signatures = false;
        if display {
            let signatures = fetch_signatures(&b.parts[1]);
            any_signatures = !signatures.is_empty();

            if any_signatures {
                let goodsig = self.verify_signatures(
                    &b.parts[0],
                    &signatures,
                    state,
                );
                b.goodsig = goodsig;
                b.badsig = !goodsig;

                state.attach_puts("[-- The following data is signed --]\n");
                self.protected_headers_handler(&b.parts[0], state);
            } else {
                state.attach_puts(
                    "[-- Warning: Can't find any signatures --]\n\n",
                );
            }
        }

        let rc = self.handle_body(&mut b.parts[0], state);

        if display && any_signatures {
            state.attach_puts("[-- End of signed data --]\n");
        }
        rc
    }

    /// Check every signature in `signatures` over `signed`. Returns whether
    /// all of those that could be attempted were good.
    fn verify_signatures(
        &self,
        signed: &Body,
        signatures: &[&Body],
        state: &mut State,
    ) -> bool {
        let data = write_signed(signed, &state.fp_in);
        let tf = match scratch_file(&self.scratch(), "", &data) {
            Ok(tf) => tf,
            Err(e) => {
                warn!("Can't write signed data to scratch file: {}", e);
                return false;
            }
        };

        let mut goodsig = true;
        for sig in signatures {
            let scheme = if sig.is(BodyType::Application, "pgp-signature") {
                Scheme::Pgp
            } else if sig.is(BodyType::Application, "x-pkcs7-signature")
                || sig.is(BodyType::Application, "pkcs7-signature")
            {
                Scheme::Smime
            } else {
                state.puts(&format!(
                    "[-- Warning: We can't verify {} signatures --]\n\n",
                    sig.mime_type()
                ));
                continue;
            };

            if 0 != self.verify_one(scheme, sig, state, tf.path()) {
                goodsig = false;
            }
        }
        goodsig
    }

    /// Show the headers carried inside a signed or encrypted part, if
    /// reading them is enabled.
    pub fn protected_headers_handler(&self, b: &Body, state: &mut State) {
        if !self.config.crypt.protected_headers_read {
            return;
        }

        if let Some(ref env) = b.mime_headers {
            let display = state.has(StateFlags::DISPLAY);
            let devel = self.config.crypt.protected_headers_devel;
            let mut weed = display && self.config.display.weed;
            if devel {
                weed &= self.config.crypt.protected_headers_weed;
            }
            let show =
                |name: &str| !weed || !self.config.display.matches_ignore(name);

            let mut headers: Vec<(&str, String)> = Vec::new();
            if devel {
                if let Some(ref date) = env.date {
                    if !display
                        || !self.config.display.weed
                        || !self.config.display.matches_ignore("date")
                    {
                        headers.push(("Date", date.clone()));
                    }
                }
                for &(name, list) in &[
                    ("Return-Path", &env.return_path),
                    ("From", &env.from),
                    ("To", &env.to),
                    ("Cc", &env.cc),
                    ("Sender", &env.sender),
                    ("Reply-To", &env.reply_to),
                    ("Mail-Followup-To", &env.mail_followup_to),
                    ("X-Original-To", &env.x_original_to),
                ] {
                    if !list.is_empty() && show(name) {
                        headers.push((name, format_address_list(list)));
                    }
                }
            }

            if let Some(ref subject) = env.subject {
                if show("subject") {
                    headers.push(("Subject", subject.clone()));
                }
            }

            if devel {
                if let Some(ref message_id) = env.message_id {
                    if show("message-id") {
                        headers.push(("Message-ID", message_id.clone()));
                    }
                }
                if !env.references.is_empty() && show("references") {
                    headers.push(("References", env.references.join(" ")));
                }
                if !env.in_reply_to.is_empty() && show("in-reply-to") {
                    headers.push(("In-Reply-To", env.in_reply_to.join(" ")));
                }
            }

            for (name, value) in headers {
                if let Some(prefix) = state.prefix.clone() {
                    state.puts(&prefix);
                }
                state.puts(&format!("{}: {}\n", name, value));
            }
        }

        state.puts("\n");
    }

    /// The banner written before the output of a backend, so that the user
    /// can tell genuine verification results from forged ones.
    pub fn current_time_banner(&self, state: &mut State, app_name: &str) {
        let now = if self.config.crypt.timestamp {
            format!(" (current time: {})", Local::now().format("%c"))
        } else {
            String::new()
        };
        state.attach_puts(&format!(
            "[-- {} output follows{} --]\n",
            app_name, now
        ));
    }

    /// Render the result of decrypting `b` between `opening` and `closing`
    /// banners.
    ///
    /// Protected headers found inside move onto `b`, with those of an inner
    /// signed part taking precedence. A good signature on a signed payload
    /// carries over to `b`.
    pub fn render_decrypted(
        &self,
        b: &mut Body,
        state: &mut State,
        dec: Decrypted,
        opening: &str,
        closing: &str,
    ) -> i32 {
        let Decrypted { source, mut body } = dec;
        let display = state.has(StateFlags::DISPLAY);
        if display {
            state.attach_puts(opening);
            state.with_input(Rc::clone(&source), |state| {
                self.protected_headers_handler(&body, state)
            });
        }

        // Moved before recursing so a nested encrypted part cannot discard
        // them
        b.mime_headers = body.mime_headers.take();

        let rc = state
            .with_input(source, |state| self.handle_body(&mut body, state));

        let signed = !is_multipart_signed(&body).is_empty();
        if signed {
            if let Some(headers) =
                body.parts.get_mut(0).and_then(|p| p.mime_headers.take())
            {
                b.mime_headers = Some(headers);
            }
            b.goodsig |= body.goodsig;
        }

        if display {
            state.attach_puts(closing);
        }
        rc
    }

    pub(super) fn valid_pgp_encrypted_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        self.pgp_encrypted_wrapper(b, state, 1)
    }

    /// The Exchange layout, whose data part is routinely transfer-encoded.
    pub(super) fn malformed_pgp_encrypted_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        self.pgp_encrypted_wrapper(b, state, 2)
    }

    fn pgp_encrypted_wrapper(
        &self,
        b: &mut Body,
        state: &mut State,
        data_ix: usize,
    ) -> i32 {
        // Anything claiming to be protected headers before decryption is
        // spoofed
        b.mime_headers = None;
        let data = match b.parts.get_mut(data_ix) {
            Some(data) => data,
            None => return -1,
        };
        data.mime_headers = None;

        let handler = Handler::Encrypted(Scheme::Pgp);
        let rc = if Encoding::SevenBit != data.encoding {
            self.run_decode_and_handler(data, state, Some(handler), false)
        } else {
            self.run_handler(handler, data, state)
        };

        let goodsig = data.goodsig;
        let is_autocrypt = data.is_autocrypt;
        let headers = if 0 == rc { data.mime_headers.take() } else { None };
        b.goodsig |= goodsig;
        b.is_autocrypt |= is_autocrypt;
        if headers.is_some() {
            b.mime_headers = headers;
        }
        if 0 != rc {
            debug!("PGP/MIME payload not rendered: {}", rc);
        }
        rc
    }
}

#[cfg(test)]
mod test {
    use super::super::test_support::*;
    use super::*;
    use crate::crypt::key::Validity;
    use crate::crypt::library::engine::Engine;
    use crate::crypt::library::test::Fixture as LibraryFixture;
    use crate::crypt::ops::is_malformed_multipart_pgp_encrypted;
    use crate::crypt::test_support::*;
    use crate::support::prompt::test_prompt::Scripted;

    const SIGNED: &str = "Content-Type: multipart/signed; micalg=pgp-sha256;\n \
                          protocol=\"application/pgp-signature\"; boundary=SS\n\
                          \n\
                          --SS\n\
                          Content-Type: text/plain\n\
                          \n\
                          signed text\n\
                          --SS\n\
                          Content-Type: application/pgp-signature\n\
                          \n\
                          -----BEGIN PGP SIGNATURE-----\n\
                          -----END PGP SIGNATURE-----\n\
                          --SS--\n";

    fn verifying_crypt(rc: i32) -> Crypt {
        let mut crypt = bare_crypt(Scripted::default());
        crypt.register(Box::new(Canned {
            verify_rc: rc,
            ..Canned::default()
        }));
        crypt
    }

    #[test]
    fn good_signature() {
        let crypt = verifying_crypt(0);
        let mut email = parsed(SIGNED);
        let (rc, out) = crypt.render(
            &mut email,
            StateFlags::DISPLAY | StateFlags::VERIFY,
            None,
        );
        assert_eq!(0, rc);
        assert_eq!(
            "[-- canned verify 0 --]\n\
             [-- The following data is signed --]\n\
             \n\
             signed text\n\
             [-- End of signed data --]\n",
            String::from_utf8_lossy(&out)
        );
        assert!(email.body.goodsig);
        assert!(email.security.contains(SecurityFlags::GOODSIGN));
    }

    #[test]
    fn bad_signature() {
        let crypt = verifying_crypt(1);
        let mut email = parsed(SIGNED);
        let flags = StateFlags::DISPLAY | StateFlags::VERIFY;
        crypt.render(&mut email, flags, None);
        assert!(email.body.badsig);
        assert!(email.security.contains(SecurityFlags::BADSIGN));
    }

    #[test]
    fn one_bad_signature_taints_the_part() {
        let mut crypt = verifying_crypt(0);
        crypt.register(Box::new(Canned {
            scheme: Scheme::Smime,
            verify_rc: 1,
            ..Canned::default()
        }));
        let raw = "Content-Type: multipart/signed; \
                   protocol=\"multipart/mixed\"; boundary=SS\n\
                   \n\
                   --SS\n\
                   Content-Type: text/plain\n\
                   \n\
                   signed text\n\
                   --SS\n\
                   Content-Type: multipart/mixed; boundary=GG\n\
                   \n\
                   --GG\n\
                   Content-Type: application/pkcs7-signature\n\
                   \n\
                   AAAA\n\
                   --GG\n\
                   Content-Type: application/pgp-signature\n\
                   \n\
                   BBBB\n\
                   --GG--\n\
                   --SS--\n";
        let mut email = parsed(raw);
        let (_, out) = crypt.render(
            &mut email,
            StateFlags::DISPLAY | StateFlags::VERIFY,
            None,
        );
        assert_eq!(
            "[-- canned verify 1 --]\n\
             [-- canned verify 0 --]\n\
             [-- The following data is signed --]\n\
             \n\
             signed text\n\
             [-- End of signed data --]\n",
            String::from_utf8_lossy(&out)
        );
        assert!(email.body.badsig);
        assert!(!email.body.goodsig);
        assert!(email.security.contains(SecurityFlags::BADSIGN));
        assert!(!email.security.contains(SecurityFlags::GOODSIGN));
    }

    #[test]
    fn signature_not_checked_unless_displaying() {
        let crypt = verifying_crypt(1);
        let (_, out) = render_with(&crypt, SIGNED, StateFlags::VERIFY);
        assert_eq!("signed text\n", out);
    }

    #[test]
    fn unknown_protocol_and_missing_signature() {
        let crypt = verifying_crypt(0);
        let raw = "Content-Type: multipart/signed; \
                   protocol=\"application/x-foo\";\n \
                   boundary=SS\n\
                   \n\
                   --SS\n\
                   Content-Type: text/plain\n\
                   \n\
                   body\n\
                   --SS--\n";
        let (_, out) = render_with(
            &crypt,
            raw,
            StateFlags::DISPLAY | StateFlags::VERIFY,
        );
        assert_eq!(
            "[-- Error: Unknown multipart/signed protocol application/x-foo \
             --]\n\nbody\n",
            out
        );

        let raw = raw.replace("application/x-foo", "application/pgp-signature");
        let (_, out) = render_with(
            &crypt,
            &raw,
            StateFlags::DISPLAY | StateFlags::VERIFY,
        );
        assert_eq!(
            "[-- Error: Missing or bad-format multipart/signed \
             signature --]\n\nbody\n",
            out
        );
    }

    const ENCRYPTED: &str =
        "Content-Type: multipart/encrypted;\n \
         protocol=\"application/pgp-encrypted\"; boundary=EE\n\
         \n\
         --EE\n\
         Content-Type: application/pgp-encrypted\n\
         \n\
         Version: 1\n\
         --EE\n\
         Content-Type: application/octet-stream\n\
         \n\
         -----BEGIN PGP MESSAGE-----\n\
         -----END PGP MESSAGE-----\n\
         --EE--\n";

    fn decrypting_crypt(plaintext: &str) -> Crypt {
        let mut crypt = bare_crypt(Scripted::default());
        crypt.config.crypt.timestamp = false;
        crypt.register(Box::new(Canned {
            plaintext: Some(plaintext.as_bytes().to_vec()),
            ..Canned::default()
        }));
        crypt
    }

    #[test]
    fn pgp_mime_decryption_with_protected_subject() {
        let crypt = decrypting_crypt(
            "Content-Type: text/plain\n\
             Subject: real subject\n\
             \n\
             hidden\n",
        );
        let mut email = parsed(ENCRYPTED);
        let (rc, out) = crypt.render(&mut email, StateFlags::DISPLAY, None);
        assert_eq!(0, rc);
        assert_eq!(
            "[-- PGP output follows --]\n\
             [-- The following data is PGP/MIME encrypted --]\n\
             Subject: real subject\n\
             \n\
             hidden\n\
             [-- End of PGP/MIME encrypted data --]\n",
            String::from_utf8_lossy(&out)
        );
        assert_eq!(
            Some("real subject"),
            email
                .body
                .mime_headers
                .as_ref()
                .and_then(|env| env.subject.as_deref())
        );
    }

    #[test]
    fn signed_inside_encrypted() {
        let crypt = decrypting_crypt(
            "Content-Type: multipart/signed;\n \
             protocol=\"application/pgp-signature\"; boundary=IS\n\
             \n\
             --IS\n\
             Content-Type: text/plain\n\
             Subject: inner\n\
             \n\
             both\n\
             --IS\n\
             Content-Type: application/pgp-signature\n\
             \n\
             sig\n\
             --IS--\n",
        );
        let mut email = parsed(ENCRYPTED);
        let (_, out) = crypt.render(
            &mut email,
            StateFlags::DISPLAY | StateFlags::VERIFY,
            None,
        );
        let out = String::from_utf8_lossy(&out);
        assert!(out.contains("[-- The following data is signed --]\n"));
        assert!(out.contains("both\n"));
        assert!(email.body.goodsig);
        assert_eq!(
            Some("inner"),
            email
                .body
                .mime_headers
                .as_ref()
                .and_then(|env| env.subject.as_deref())
        );
    }

    #[test]
    fn exchange_layout_is_decoded_and_decrypted() {
        let fx = LibraryFixture::pgp(Scripted::default());
        let bob = fx.engine.add_key("Bob <bob@example.com>", Validity::Full);
        let block = fx
            .engine
            .encrypt(
                b"Content-Type: text/plain\r\n\r\nrepaired\r\n",
                &[bob],
                None,
                None,
            )
            .unwrap();
        let raw = format!(
            "Content-Type: multipart/mixed; boundary=XX\n\
             \n\
             --XX\n\
             Content-Type: text/plain; charset=us-ascii\n\
             \n\
             \n\
             --XX\n\
             Content-Type: application/pgp-encrypted\n\
             Content-Transfer-Encoding: base64\n\
             \n\
             VmVyc2lvbjogMQ==\n\
             --XX\n\
             Content-Type: application/octet-stream\n\
             Content-Transfer-Encoding: base64\n\
             \n\
             {}\n\
             --XX--\n",
            base64::encode(&block)
        );

        let mut email = parsed(&raw);
        assert_eq!(
            SecurityFlags::PGP_ENCRYPT,
            is_malformed_multipart_pgp_encrypted(&email.body)
        );
        let (rc, out) = fx.crypt.render(&mut email, StateFlags::DISPLAY, None);
        assert_eq!(0, rc);
        let out = String::from_utf8_lossy(&out);
        assert!(out.contains(
            "[-- The following data is PGP/MIME encrypted --]\n\
             \n\
             repaired\n\
             [-- End of PGP/MIME encrypted data --]\n"
        ));
        assert!(email.security.contains(SecurityFlags::PGP_ENCRYPT));
    }

    #[test]
    fn failed_decryption() {
        let mut crypt = bare_crypt(Scripted::default());
        crypt.register(Box::new(Canned::default()));
        let mut email = parsed(ENCRYPTED);
        let (rc, _) = crypt.render(&mut email, StateFlags::DISPLAY, None);
        assert_eq!(-1, rc);
        assert!(email.body.mime_headers.is_none());
    }

    #[test]
    fn time_banner() {
        let mut crypt = bare_crypt(Scripted::default());
        let mut state = State::new(Rc::from(&b""[..]), StateFlags::DISPLAY);
        crypt.current_time_banner(&mut state, "S/MIME");
        assert!(state
            .output_text()
            .starts_with("[-- S/MIME output follows (current time: "));

        crypt.config.crypt.timestamp = false;
        let mut state = State::new(Rc::from(&b""[..]), StateFlags::DISPLAY);
        crypt.current_time_banner(&mut state, "PGP");
        assert_eq!("[-- PGP output follows --]\n", state.output_text());
    }
}
