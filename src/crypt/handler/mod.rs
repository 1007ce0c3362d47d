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

//! Rendering a MIME tree for display or quoting.
//!
//! `handle_body` picks a handler for each part by its type, undoes the
//! transfer encoding where the handler needs the plain payload, and recurses
//! into containers. Everything the user should see about the structure of
//! the message (attachment notices, signature verification, decryption) is
//! written inline into the `State` sink as `[-- ... --]` banners.

mod security;
mod structure;
mod text;

use std::rc::Rc;

use log::{debug, warn};

pub use self::security::PGP_ENCRYPTED_BANNERS;

use super::backend::Scheme;
use super::flags::SecurityFlags;
use super::ops::*;
use super::Crypt;
use crate::mime::content_encoding::{decode_transfer, recode};
use crate::mime::model::*;
use crate::mime::state::{State, StateFlags};
use crate::mime::write::write_message;

/// How deeply parts may nest before the walker gives up.
pub const MAX_DEPTH: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Handler {
    Autoview,
    TextPlain,
    Flowed,
    Enriched,
    Message,
    ExternalBody,
    Alternative,
    Multilingual,
    Multipart,
    Signed,
    ValidPgpEncrypted,
    MalformedPgpEncrypted,
    /// The backend's handler for its application types.
    Application(Scheme),
    /// The backend's handler for the payload of `multipart/encrypted`.
    Encrypted(Scheme),
}

impl Handler {
    fn is_encrypted(self) -> bool {
        match self {
            Handler::ValidPgpEncrypted
            | Handler::MalformedPgpEncrypted
            | Handler::Application(_)
            | Handler::Encrypted(_) => true,
            _ => false,
        }
    }
}

/// The payload of `b` as handlers see it: the in-memory content if there is
/// any, else the bytes it occupies in `source`.
pub fn payload<'a>(b: &'a Body, source: &'a [u8]) -> &'a [u8] {
    match b.content {
        Some(ref c) => c,
        None => b.raw(source),
    }
}

/// Parts whose payload is text, and which therefore undergo line ending and
/// character set conversion.
pub fn is_text_part(b: &Body) -> bool {
    match b.body_type {
        BodyType::Text => true,
        BodyType::Message => "delivery-status" == b.subtype,
        BodyType::Application => "pgp" == b.subtype,
        _ => false,
    }
}

/// Render `size` the way part summaries show it: bytes up to 999, then
/// kilobytes and megabytes.
pub fn pretty_size(size: usize) -> String {
    let n = size as f64;
    if size < 1000 {
        size.to_string()
    } else if size < 10189 {
        format!("{:.1}K", n / 1024.0)
    } else if size < 1_023_949 {
        format!("{}K", (size + 51) / 1024)
    } else if size < 10_433_332 {
        format!("{:.1}M", n / 1_048_576.0)
    } else {
        format!("{}M", (size + 52428) / 1_048_576)
    }
}

impl Crypt {
    /// Render `email` into a fresh output buffer.
    ///
    /// Returns the status of the top-level handler along with the output.
    /// Signature results found on the top-level body are folded into the
    /// message's security flags.
    pub fn render(
        &self,
        email: &mut Email,
        flags: StateFlags,
        prefix: Option<&str>,
    ) -> (i32, Vec<u8>) {
        let source = match email.source {
            Some(ref s) => Rc::clone(s),
            None => {
                let mut out = Vec::new();
                write_message(&mut out, email);
                let source: Rc<[u8]> = Rc::from(out);
                email.body = crate::mime::parse::parse_message(Rc::clone(
                    &source,
                ))
                .body;
                email.source = Some(Rc::clone(&source));
                source
            }
        };

        if self.config.pgp.auto_decode
            && !email.security.contains(SecurityFlags::TRADITIONAL_CHECKED)
        {
            self.check_traditional(&source, &mut email.body, false);
            email.security.insert(SecurityFlags::TRADITIONAL_CHECKED);
        }

        let mut state = State::new(source, flags);
        if let Some(prefix) = prefix {
            state.prefix = Some(prefix.to_owned());
            state.flags.insert(StateFlags::PENDINGPREFIX);
        }
        let rc = self.handle_body(&mut email.body, &mut state);

        email.security |= crypt_query(&email.body);
        if email.body.goodsig {
            email.security.insert(SecurityFlags::GOODSIGN);
        }
        if email.body.badsig {
            email.security.insert(SecurityFlags::BADSIGN);
        }
        (rc, state.out)
    }

    /// Render `b`, whose payload lies in `state.fp_in`.
    ///
    /// Returns 0 on success, 1 if some part could not be fully rendered and
    /// -1 on failure.
    pub fn handle_body(&self, b: &mut Body, state: &mut State) -> i32 {
        if state.depth >= MAX_DEPTH {
            warn!(
                "MIME structure nested deeper than {}, not rendering {}",
                MAX_DEPTH,
                b.mime_type()
            );
            return 0;
        }

        let oflags = state.flags;
        state.depth += 1;
        let rc = self.dispatch(b, state);
        state.depth -= 1;
        state.flags = oflags | (state.flags & StateFlags::FIRSTDONE);

        if 0 != rc {
            debug!("Bailing on attachment of type {}", b.mime_type());
        }
        rc
    }

    fn dispatch(&self, b: &mut Body, state: &mut State) -> i32 {
        let display = &self.config.display;
        let mut plaintext = false;
        let mut handler = None;

        if self.is_autoview(b) {
            handler = Some(Handler::Autoview);
            state.flags.remove(StateFlags::CHARCONV);
        } else {
            match b.body_type {
                BodyType::Text => {
                    if "plain" == b.subtype {
                        handler = Some(if !is_application_pgp(b).is_empty() {
                            Handler::Application(Scheme::Pgp)
                        } else if display.reflow_text && b.is_flowed() {
                            Handler::Flowed
                        } else {
                            Handler::TextPlain
                        });
                    } else if "enriched" == b.subtype {
                        handler = Some(Handler::Enriched);
                    }
                }

                BodyType::Message => match b.subtype.as_str() {
                    "rfc822" | "news" | "global" => {
                        handler = Some(Handler::Message)
                    }
                    "delivery-status" => plaintext = true,
                    "external-body" => handler = Some(Handler::ExternalBody),
                    _ => (),
                },

                BodyType::Multipart => {
                    let inline_alternatives =
                        "inline" == display.show_multipart_alternative;
                    if !inline_alternatives && "alternative" == b.subtype {
                        handler = Some(Handler::Alternative);
                    } else if !inline_alternatives
                        && "multilingual" == b.subtype
                    {
                        handler = Some(Handler::Multilingual);
                    } else if "signed" == b.subtype {
                        if b.param("protocol").is_none() {
                            self.prompt.error(
                                "Error: multipart/signed has no protocol",
                            );
                        } else if state.has(StateFlags::VERIFY) {
                            handler = Some(Handler::Signed);
                        }
                    } else if !is_valid_multipart_pgp_encrypted(b).is_empty() {
                        handler = Some(Handler::ValidPgpEncrypted);
                    } else if !is_malformed_multipart_pgp_encrypted(b)
                        .is_empty()
                    {
                        handler = Some(Handler::MalformedPgpEncrypted);
                    }

                    if handler.is_none() {
                        handler = Some(Handler::Multipart);
                    }

                    if !b.encoding.is_identity() {
                        debug!(
                            "Bad encoding {} for multipart entity, \
                             assuming 7bit",
                            b.encoding.as_str()
                        );
                        b.encoding = Encoding::SevenBit;
                    }
                }

                BodyType::Application => {
                    if !is_application_pgp(b).is_empty() {
                        handler = Some(Handler::Application(Scheme::Pgp));
                    } else if !is_application_smime(b).is_empty() {
                        handler = Some(Handler::Application(Scheme::Smime));
                    }
                }

                _ => (),
            }
        }

        let attachment_display = state.has(StateFlags::DISPLAY_ATTACH);
        if (plaintext || handler.is_some())
            && (attachment_display || !self.prefer_as_attachment(b))
        {
            let encrypted = handler.map_or(false, Handler::is_encrypted);
            if encrypted
                && state.has(StateFlags::REPLYING)
                && state.has(StateFlags::FIRSTDONE)
                && !self.config.crypt.include_encrypted
            {
                return 0;
            }
            self.run_decode_and_handler(b, state, handler, plaintext)
        } else {
            if state.has(StateFlags::DISPLAY) {
                let attached = display.honor_disposition
                    && Disposition::Attach == b.disposition;
                let msg = match (attachment_display, attached) {
                    (true, true) => {
                        "[-- This is an attachment --]\n".to_owned()
                    }
                    (true, false) => {
                        format!("[-- {} is unsupported --]\n", b.mime_type())
                    }
                    (false, true) => "[-- This is an attachment \
                         (need 'view-attachments' bound to key) --]\n"
                        .to_owned(),
                    (false, false) => format!(
                        "[-- {} is unsupported \
                         (need 'view-attachments' bound to key) --]\n",
                        b.mime_type()
                    ),
                };
                state.puts(&msg);
            }
            0
        }
    }

    /// Undo the transfer encoding of `b` where needed, then run `handler`
    /// over the result. Plain text is written straight out instead.
    fn run_decode_and_handler(
        &self,
        b: &mut Body,
        state: &mut State,
        handler: Option<Handler>,
        plaintext: bool,
    ) -> i32 {
        let text = plaintext || is_text_part(b);
        let rc = if b.content.is_some() || !b.encoding.is_identity() || text {
            // Inline PGP does its own charset handling from the armor
            let convert = text
                && state.has(StateFlags::CHARCONV)
                && Some(Handler::Application(Scheme::Pgp)) != handler;
            let decoded = self.decode_attachment(b, &state.fp_in, convert);

            if plaintext {
                state.prefix_put(&decoded);
                0
            } else {
                let saved = (b.offset, b.length, b.encoding, b.content.take());
                b.offset = 0;
                b.length = decoded.len();
                b.encoding = Encoding::Binary;

                let rc = state.with_input(Rc::from(decoded), |state| {
                    handler.map_or(0, |h| self.run_handler(h, b, state))
                });

                b.offset = saved.0;
                b.length = saved.1;
                b.encoding = saved.2;
                b.content = saved.3;
                rc
            }
        } else {
            handler.map_or(0, |h| self.run_handler(h, b, state))
        };

        state.flags.insert(StateFlags::FIRSTDONE);
        rc
    }

    fn run_handler(&self, h: Handler, b: &mut Body, state: &mut State) -> i32 {
        match h {
            Handler::Autoview => self.autoview_handler(b, state),
            Handler::TextPlain => self.text_plain_handler(b, state),
            Handler::Flowed => self.flowed_handler(b, state),
            Handler::Enriched => self.enriched_handler(b, state),
            Handler::Message => self.message_handler(b, state),
            Handler::ExternalBody => self.external_body_handler(b, state),
            Handler::Alternative => self.alternative_handler(b, state),
            Handler::Multilingual => self.multilingual_handler(b, state),
            Handler::Multipart => self.multipart_handler(b, state),
            Handler::Signed => self.signed_handler(b, state),
            Handler::ValidPgpEncrypted => {
                self.valid_pgp_encrypted_handler(b, state)
            }
            Handler::MalformedPgpEncrypted => {
                self.malformed_pgp_encrypted_handler(b, state)
            }
            Handler::Application(scheme) => {
                self.application_handler(scheme, b, state)
            }
            Handler::Encrypted(scheme) => {
                self.encrypted_handler(scheme, b, state)
            }
        }
    }

    /// The decoded payload of `b`. Inline text parts get their line endings
    /// normalised and, if `convert`, are recoded into the display charset.
    pub fn decode_attachment(
        &self,
        b: &Body,
        source: &[u8],
        convert: bool,
    ) -> Vec<u8> {
        let text = is_text_part(b) && Disposition::Inline == b.disposition;
        let mut data = match b.content {
            Some(ref c) => c.clone(),
            None => decode_transfer(b.encoding, b.raw(source)).into_owned(),
        };

        if text {
            data = crlf_to_lf(&data);
            if convert {
                let from = b.charset().unwrap_or("us-ascii");
                data = recode(&data, from, &self.config.crypt.charset);
            }
        }
        data
    }

    /// Whether `b` is rendered through a mailcap filter.
    pub fn is_autoview(&self, b: &Body) -> bool {
        let mime_type = b.mime_type();
        let listed = self.config.display.auto_view.iter().any(|av| {
            if let Some(base) = av.strip_suffix("/*") {
                mime_type.len() > base.len()
                    && mime_type[..base.len()].eq_ignore_ascii_case(base)
                    && b'/' == mime_type.as_bytes()[base.len()]
            } else {
                mime_type.eq_ignore_ascii_case(av)
            }
        });

        (listed || is_mmnoask(&mime_type)) && self.mailcap_command(b).is_some()
    }

    /// The mailcap command for the type of `b`, by exact type first and then
    /// by `type/*`.
    fn mailcap_command(&self, b: &Body) -> Option<&str> {
        let mailcap = &self.config.display.mailcap;
        let wild = format!("{}/*", b.type_name());
        mailcap
            .iter()
            .find(|&(k, _)| k.eq_ignore_ascii_case(&b.mime_type()))
            .or_else(|| {
                mailcap.iter().find(|&(k, _)| k.eq_ignore_ascii_case(&wild))
            })
            .map(|(_, v)| v.as_str())
    }

    /// Whether the walker knows how to render `b` at all.
    pub fn can_decode(&self, b: &Body) -> bool {
        if self.is_autoview(b) {
            return true;
        }

        match b.body_type {
            BodyType::Text | BodyType::Message => true,
            BodyType::Multipart => {
                "signed" == b.subtype
                    || "encrypted" == b.subtype
                    || b.parts.iter().any(|p| self.can_decode(p))
            }
            BodyType::Application => {
                !is_application_pgp(b).is_empty()
                    || !is_application_smime(b).is_empty()
            }
            _ => false,
        }
    }

    /// Whether `b` is shown as an attachment notice rather than inline.
    pub fn prefer_as_attachment(&self, b: &Body) -> bool {
        !self.can_decode(b)
            || (Disposition::Attach == b.disposition
                && self.config.display.honor_disposition)
    }

    /// The one-line summary of a part used in multipart listings.
    fn print_part_line(&self, state: &mut State, b: &Body, n: usize) {
        let charset = b
            .charset()
            .map(|c| format!("; charset={}", c))
            .unwrap_or_default();
        let size = pretty_size(b.size());
        if 0 == n {
            state.puts(&format!(
                "[-- Type: {}{}, Encoding: {}, Size: {} --]\n",
                b.mime_type(),
                charset,
                b.encoding.as_str(),
                size
            ));
        } else {
            state.puts(&format!(
                "[-- Alternative Type #{}: {}{}, Encoding: {}, Size: {} --]\n",
                n,
                b.mime_type(),
                charset,
                b.encoding.as_str(),
                size
            ));
        }
    }
}

/// Replace CRLF line endings with LF.
pub fn crlf_to_lf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut it = data.iter().peekable();
    while let Some(&c) = it.next() {
        if b'\r' == c && Some(&&b'\n') == it.peek() {
            continue;
        }
        out.push(c);
    }
    out
}

/// The `MM_NOASK` convention: a comma-separated list of types (or `1` for
/// all) which may be rendered through mailcap without asking.
fn is_mmnoask(mime_type: &str) -> bool {
    let val = match std::env::var("MM_NOASK") {
        Ok(v) => v,
        Err(_) => return false,
    };
    if "1" == val {
        return true;
    }

    val.split(',').any(|entry| match entry.rfind('/') {
        Some(slash) if entry[slash + 1..].starts_with('*') => {
            mime_type.len() >= slash
                && mime_type[..slash].eq_ignore_ascii_case(&entry[..slash])
        }
        Some(_) => mime_type.eq_ignore_ascii_case(entry),
        None => {
            mime_type.len() > entry.len()
                && mime_type[..entry.len()].eq_ignore_ascii_case(entry)
                && b'/' == mime_type.as_bytes()[entry.len()]
        }
    })
}


#[cfg(test)]
mod test {
    use super::test_support::*;
    use super::*;
    use crate::crypt::key::Validity;
    use crate::crypt::library::engine::Engine;
    use crate::crypt::library::test::Fixture as LibraryFixture;
    use crate::crypt::test_support::*;
    use crate::support::prompt::test_prompt::Scripted;

    fn crypt() -> Crypt {
        bare_crypt(Scripted::default())
    }

    #[test]
    fn pretty_sizes() {
        assert_eq!("5", pretty_size(5));
        assert_eq!("999", pretty_size(999));
        assert_eq!("1.0K", pretty_size(1000));
        assert_eq!("10K", pretty_size(10189));
        assert_eq!("1.0M", pretty_size(1_023_949));
        assert_eq!("10M", pretty_size(10_433_332));
    }

    #[test]
    fn base64_text_is_decoded_and_quoted() {
        let mut email = parsed(
            "Subject: x\n\
             Content-Type: text/plain; charset=utf-8\n\
             Content-Transfer-Encoding: base64\n\
             \n\
             b25lCnR3bwo=\n",
        );
        let (rc, out) =
            crypt().render(&mut email, StateFlags::empty(), Some("> "));
        assert_eq!(0, rc);
        assert_eq!("> one\n> two\n", String::from_utf8_lossy(&out));
        // The body is restored after decoding
        assert_eq!(Encoding::Base64, email.body.encoding);
    }

    #[test]
    fn latin1_is_converted_when_asked() {
        let raw = "Content-Type: text/plain; charset=iso-8859-1\n\
                   Content-Transfer-Encoding: quoted-printable\n\
                   \n\
                   caf=E9\n";
        let (_, out) = render_with(&crypt(), raw, StateFlags::CHARCONV);
        assert_eq!("café\n", out);
    }

    #[test]
    fn inline_pgp_is_detected_when_auto_decoding() {
        let fx = LibraryFixture::pgp_with(
            |c| c.pgp.auto_decode = true,
            Scripted::default(),
        );
        let bob = fx.engine.add_key("Bob <bob@example.com>", Validity::Full);
        let block = fx.engine.encrypt(b"secret\n", &[bob], None, None).unwrap();
        let raw = format!(
            "Subject: x\nContent-Type: text/plain\n\n{}",
            String::from_utf8(block).unwrap()
        );

        let mut email = parsed(&raw);
        let (rc, out) = fx.crypt.render(&mut email, StateFlags::DISPLAY, None);
        assert_eq!(0, rc);
        assert_eq!(
            "[-- BEGIN PGP MESSAGE --]\n\n\
             secret\n\n\
             [-- END PGP MESSAGE --]\n",
            String::from_utf8_lossy(&out)
        );
        assert!(email.security.contains(
            SecurityFlags::TRADITIONAL_CHECKED | SecurityFlags::PGP_ENCRYPT
        ));

        // Without auto-decoding the armor is shown as it is
        let fx = LibraryFixture::pgp(Scripted::default());
        let mut email = parsed(&raw);
        let (_, out) = fx.crypt.render(&mut email, StateFlags::DISPLAY, None);
        assert!(String::from_utf8_lossy(&out)
            .starts_with("-----BEGIN PGP MESSAGE-----\n"));
        assert!(!email.security.contains(SecurityFlags::TRADITIONAL_CHECKED));
    }

    #[test]
    fn unsupported_parts_get_a_notice() {
        let raw = "Content-Type: application/octet-stream\n\
                   \n\
                   xyz\n";
        let (rc, out) = render_with(
            &crypt(),
            raw,
            StateFlags::DISPLAY | StateFlags::DISPLAY_ATTACH,
        );
        assert_eq!(0, rc);
        assert_eq!("[-- application/octet-stream is unsupported --]\n", out);

        let (_, out) = render_with(&crypt(), raw, StateFlags::DISPLAY);
        assert!(out.contains("need 'view-attachments' bound to key"));

        let (_, out) = render_with(&crypt(), raw, StateFlags::empty());
        assert!(out.is_empty());
    }

    #[test]
    fn honoured_disposition_hides_text() {
        let mut crypt = crypt();
        crypt.config.display.honor_disposition = true;
        let raw = "Content-Type: text/plain\n\
                   Content-Disposition: attachment; filename=a.txt\n\
                   \n\
                   secret\n";
        let (_, out) = render_with(
            &crypt,
            raw,
            StateFlags::DISPLAY | StateFlags::DISPLAY_ATTACH,
        );
        assert_eq!("secret\n", out);
        let (_, out) = render_with(&crypt, raw, StateFlags::DISPLAY);
        assert!(out.starts_with("[-- This is an attachment"));
    }

    #[test]
    fn delivery_status_is_plain_text() {
        let raw = "Content-Type: message/delivery-status\n\
                   \n\
                   Reporting-MTA: dns; mx\n";
        let (_, out) = render_with(&crypt(), raw, StateFlags::DISPLAY);
        assert_eq!("Reporting-MTA: dns; mx\n", out);
    }

    #[test]
    fn depth_limit_stops_recursion() {
        let mut body = Body::new_leaf(BodyType::Text, "plain", "deep\n");
        for _ in 0..(MAX_DEPTH + 5) {
            body = Body::new_multipart("mixed", vec![body]);
        }
        let mut state = State::new(Rc::from(&b""[..]), StateFlags::empty());
        assert_eq!(0, crypt().handle_body(&mut body, &mut state));
        assert!(!state.output_text().contains("deep"));
        assert_eq!(0, state.depth);
    }

    #[test]
    fn autoview_decision() {
        let mut crypt = crypt();
        let html = Body::new_leaf(BodyType::Text, "html", "");
        assert!(!crypt.is_autoview(&html));
        assert!(!crypt.can_decode(&Body::new_leaf(
            BodyType::Image,
            "png",
            ""
        )));

        crypt.config.display.auto_view = vec!["text/*".to_owned()];
        assert!(!crypt.is_autoview(&html));
        crypt
            .config
            .display
            .mailcap
            .insert("text/html".to_owned(), "cat".to_owned());
        assert!(crypt.is_autoview(&html));
        assert!(!crypt.is_autoview(&Body::new_leaf(
            BodyType::Application,
            "html",
            ""
        )));
    }

    #[test]
    fn encrypted_parts_skipped_in_replies() {
        let mut body = Body::new_leaf(
            BodyType::Application,
            "pgp",
            "-----BEGIN PGP MESSAGE-----\n",
        );
        let mut state = State::new(
            Rc::from(&b""[..]),
            StateFlags::REPLYING | StateFlags::FIRSTDONE,
        );
        // No backend: would be -1 if it were attempted
        assert_eq!(0, crypt().handle_body(&mut body, &mut state));
        state.flags.remove(StateFlags::FIRSTDONE);
        assert_eq!(-1, crypt().handle_body(&mut body, &mut state));
    }

    #[test]
    fn crlf_normalisation() {
        assert_eq!(b"a\nb\r\rc\n".to_vec(), crlf_to_lf(b"a\r\nb\r\rc\r\n"));
    }
}
