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

//! Inline PGP blocks, decrypted and verified in-process.

use log::{debug, warn};

use super::engine::Signature;
use super::LibraryBackend;
use crate::crypt::armor::{copy_clearsigned, put_prefixed_line, Armor};
use crate::crypt::flags::SecurityFlags;
use crate::crypt::handler::payload;
use crate::crypt::Crypt;
use crate::mime::content_encoding::recode;
use crate::mime::model::*;
use crate::mime::state::{State, StateFlags};
use crate::support::error::Error;

impl LibraryBackend {
    /// Decrypt or verify one armored block, giving the text inside (if it
    /// is not a clearsigned one) and the signatures found.
    fn open_block(
        &self,
        armor: Armor,
        block: &[u8],
    ) -> Result<(Option<Vec<u8>>, Vec<Signature>), Error> {
        match armor {
            Armor::Signed => {
                let v = self.engine.verify(block, None)?;
                Ok((None, v.signatures))
            }
            Armor::Message => match self.engine.decrypt(block, None) {
                Ok(dec) => Ok((Some(dec.plaintext), dec.signatures)),
                // Signed but not encrypted
                Err(Error::NotActuallyEncrypted) => {
                    let v = self.engine.verify(block, None)?;
                    Ok((v.plaintext, v.signatures))
                }
                Err(e) => Err(e),
            },
            Armor::PublicKey => Ok((Some(block.to_vec()), vec![])),
        }
    }

    pub(super) fn inline_handler(
        &self,
        ctx: &Crypt,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let data = payload(b, &state.fp_in).to_vec();
        let body_charset = b.charset().unwrap_or("iso-8859-1").to_owned();
        let display = state.has(StateFlags::DISPLAY);

        let mut found = false;
        let mut maybe_goodsig = true;
        let mut have_any_sigs = false;
        let mut lines = data.split_inclusive(|&c| b'\n' == c);

        while let Some(line) = lines.next() {
            let armor = match Armor::classify(line) {
                Some(armor) => armor,
                None => {
                    put_prefixed_line(state, line);
                    continue;
                }
            };
            found = true;
            let clearsign = Armor::Signed == armor;
            have_any_sigs |= clearsign && state.has(StateFlags::VERIFY);

            let mut block = line.to_vec();
            for line in lines.by_ref() {
                block.extend_from_slice(line);
                if armor.is_end(line) {
                    break;
                }
            }

            let mut plaintext: Option<Vec<u8>> = None;
            if !clearsign || state.has(StateFlags::VERIFY) {
                match self.open_block(armor, &block) {
                    Err(e) => {
                        debug!("Inline PGP block failed: {}", e);
                        state.puts(&format!(
                            "Error: decryption/verification failed: {}\n",
                            e
                        ));
                    }
                    Ok((text, signatures)) => {
                        if Armor::Message == armor {
                            ctx.prompt
                                .message("PGP message successfully decrypted");
                        }
                        plaintext = text;
                        have_any_sigs = false;
                        maybe_goodsig = false;
                        if display && !signatures.is_empty() {
                            state.attach_puts(
                                "[-- Begin signature information --]\n",
                            );
                            have_any_sigs = true;
                            let (good, _) =
                                self.show_signatures(&signatures, state);
                            maybe_goodsig = good;
                            state.attach_puts(
                                "[-- End signature information --]\n\n",
                            );
                        }
                    }
                }
            }

            if display {
                state.attach_puts(match armor {
                    Armor::Message => "[-- BEGIN PGP MESSAGE --]\n\n",
                    Armor::PublicKey => "[-- BEGIN PGP PUBLIC KEY BLOCK --]\n",
                    Armor::Signed => "[-- BEGIN PGP SIGNED MESSAGE --]\n\n",
                });
            }

            if clearsign {
                copy_clearsigned(
                    &block,
                    state,
                    &body_charset,
                    &ctx.config.crypt.charset,
                );
            } else if let Some(text) = plaintext {
                let text = recode(&text, "utf-8", &ctx.config.crypt.charset);
                if state.prefix.is_some() {
                    state.flags.insert(StateFlags::PENDINGPREFIX);
                }
                state.prefix_put(&text);
            }

            if display {
                state.puts("\n");
                state.attach_puts(match armor {
                    Armor::Message => "[-- END PGP MESSAGE --]\n",
                    Armor::PublicKey => "[-- END PGP PUBLIC KEY BLOCK --]\n",
                    Armor::Signed => "[-- END PGP SIGNED MESSAGE --]\n",
                });
            }
        }

        b.goodsig = maybe_goodsig && have_any_sigs;

        if !found {
            state.attach_puts(
                "[-- Error: could not find beginning of PGP message --]\n\n",
            );
            return 1;
        }
        0
    }

    /// Sign and/or encrypt a `text/plain` body as inline PGP.
    pub(super) fn inline_protect(
        &self,
        ctx: &Crypt,
        body: &Body,
        flags: SecurityFlags,
        keylist: &str,
    ) -> Result<Option<Body>, Error> {
        if !body.is(BodyType::Text, "plain") {
            return Ok(None);
        }

        let encrypt = flags.contains(SecurityFlags::ENCRYPT);
        let sign = flags.contains(SecurityFlags::SIGN);
        let content = body.content.clone().unwrap_or_default();
        let body_charset = body.charset().unwrap_or("us-ascii");
        let (text, send_charset) =
            if body_charset.eq_ignore_ascii_case("us-ascii") {
                (content, "us-ascii")
            } else {
                (
                    recode(&content, body_charset, "utf-8"),
                    if encrypt { "us-ascii" } else { "utf-8" },
                )
            };

        let signer = if sign {
            Some(self.signer(ctx, None)?)
        } else {
            None
        };
        let pass = self.passphrase.get();
        let result = if encrypt {
            self.engine.encrypt(
                &text,
                &recipients(keylist),
                signer.as_deref(),
                pass.as_ref(),
            )
        } else {
            self.engine.clearsign(
                &text,
                signer.as_deref().unwrap_or(""),
                pass.as_ref(),
            )
        };

        let out = match result {
            Ok(out) => out,
            Err(e) => {
                warn!("Inline PGP failed: {}", e);
                if sign {
                    self.passphrase.void();
                }
                return Ok(None);
            }
        };

        let mut b = Body::new_leaf(BodyType::Text, "plain", out);
        b.encoding = if encrypt {
            Encoding::SevenBit
        } else {
            body.encoding
        };
        b.params.set("charset", send_charset);
        b.params.set(
            "x-action",
            if encrypt { "pgp-encrypted" } else { "pgp-signed" },
        );
        b.disposition = Disposition::None;
        b.use_disp = false;
        Ok(Some(b))
    }
}

/// The key ids of a key list, as the engine wants them.
pub(super) fn recipients(keylist: &str) -> Vec<String> {
    keylist
        .split_whitespace()
        .map(|k| {
            let k = k.strip_prefix("0x").unwrap_or(k);
            k.strip_suffix('!').unwrap_or(k).to_owned()
        })
        .collect()
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::super::engine::Engine;
    use super::super::test::*;
    use super::*;
    use crate::crypt::key::Validity;
    use crate::support::prompt::test_prompt::Scripted;

    fn text_part(text: &[u8]) -> (Body, Rc<[u8]>) {
        let source: Rc<[u8]> = text.into();
        let b = Body {
            length: source.len(),
            ..Body::default()
        };
        (b, source)
    }

    #[test]
    fn key_list_tokens() {
        assert_eq!(
            vec!["AAAA".to_owned(), "BBBB".to_owned()],
            recipients(" 0xAAAA  BBBB! ")
        );
    }

    #[test]
    fn clearsigned_block_is_verified() {
        let fx = Fixture::pgp(Scripted::default());
        let alice =
            fx.engine.add_key("Alice <alice@example.com>", Validity::Full);
        let block =
            fx.engine.clearsign(b"signed text\n", &alice, None).unwrap();
        let mut text = b"Hi,\n".to_vec();
        text.extend_from_slice(&block);
        text.extend_from_slice(b"Bye\n");

        let (mut b, source) = text_part(&text);
        let mut state =
            State::new(source, StateFlags::DISPLAY | StateFlags::VERIFY);
        assert_eq!(0, fx.backend.inline_handler(&fx.crypt, &mut b, &mut state));
        assert!(b.goodsig);
        assert_eq!(
            "Hi,\n\
             [-- Begin signature information --]\n\
             Good signature from: Alice <alice@example.com>\n\
             [-- End signature information --]\n\
             \n\
             [-- BEGIN PGP SIGNED MESSAGE --]\n\
             \n\
             signed text\n\
             \n\
             [-- END PGP SIGNED MESSAGE --]\n\
             Bye\n",
            state.output_text()
        );
    }

    #[test]
    fn tampered_clearsigned_block() {
        let fx = Fixture::pgp(Scripted::default());
        let alice =
            fx.engine.add_key("Alice <alice@example.com>", Validity::Full);
        let block = fx.engine.clearsign(b"pay me $1\n", &alice, None).unwrap();
        let block = String::from_utf8(block).unwrap().replace("$1", "$1000");

        let (mut b, source) = text_part(block.as_bytes());
        let mut state =
            State::new(source, StateFlags::DISPLAY | StateFlags::VERIFY);
        assert_eq!(0, fx.backend.inline_handler(&fx.crypt, &mut b, &mut state));
        assert!(!b.goodsig);
        assert!(state
            .output_text()
            .contains("*BAD* signature from: Alice <alice@example.com>\n"));
    }

    #[test]
    fn encrypted_block_is_decrypted() {
        let fx = Fixture::pgp(Scripted::default());
        let bob = fx.engine.add_key("Bob <bob@example.com>", Validity::Full);
        let block = fx
            .engine
            .encrypt(b"secret\nstuff\n", &[bob], None, None)
            .unwrap();

        let (mut b, source) = text_part(&block);
        let mut state = State::new(source, StateFlags::DISPLAY);
        assert_eq!(0, fx.backend.inline_handler(&fx.crypt, &mut b, &mut state));
        assert_eq!(
            "[-- BEGIN PGP MESSAGE --]\n\n\
             secret\nstuff\n\n\
             [-- END PGP MESSAGE --]\n",
            state.output_text()
        );
        assert!(!b.goodsig);
        assert!(fx
            .prompt_transcript()
            .contains(&"PGP message successfully decrypted".to_owned()));
    }

    #[test]
    fn undecryptable_block() {
        let fx = Fixture::pgp(Scripted::default());
        let carol =
            fx.engine.add_key("Carol <carol@example.com>", Validity::Full);
        let block = fx.engine.encrypt(b"x\n", &[carol.clone()], None, None);
        fx.engine.drop_secret(&carol);

        let (mut b, source) = text_part(&block.unwrap());
        let mut state = State::new(source, StateFlags::DISPLAY);
        assert_eq!(0, fx.backend.inline_handler(&fx.crypt, &mut b, &mut state));
        assert!(state
            .output_text()
            .starts_with("Error: decryption/verification failed: "));
    }

    #[test]
    fn no_block_at_all() {
        let fx = Fixture::pgp(Scripted::default());
        let (mut b, source) = text_part(b"just text\n");
        let mut state = State::new(source, StateFlags::DISPLAY);
        assert_eq!(1, fx.backend.inline_handler(&fx.crypt, &mut b, &mut state));
        assert_eq!(
            "just text\n\
             [-- Error: could not find beginning of PGP message --]\n\n",
            state.output_text()
        );
    }

    #[test]
    fn inline_signing_and_encryption() {
        let fx = Fixture::pgp(Scripted::default());
        let alice =
            fx.engine.add_key("Alice <alice@example.com>", Validity::Full);
        let bob = fx.engine.add_key("Bob <bob@example.com>", Validity::Full);
        fx.backend.set_sign_as(Some(format!("0x{}", alice)));

        let body = Body::new_leaf(BodyType::Text, "plain", "hello\n");
        let signed = fx
            .backend
            .inline_protect(&fx.crypt, &body, SecurityFlags::PGP_SIGN, "")
            .unwrap()
            .unwrap();
        assert_eq!(Some("pgp-signed"), signed.param("x-action"));
        let content = signed.content.unwrap();
        assert!(content.starts_with(b"-----BEGIN PGP SIGNED MESSAGE-----\n"));
        let verified = fx.engine.verify(&content, None).unwrap();
        assert_eq!(1, verified.signatures.len());

        let encrypted = fx
            .backend
            .inline_protect(
                &fx.crypt,
                &body,
                SecurityFlags::PGP_ENCRYPT,
                &format!("0x{}", bob),
            )
            .unwrap()
            .unwrap();
        assert_eq!(Some("pgp-encrypted"), encrypted.param("x-action"));
        assert_eq!(Encoding::SevenBit, encrypted.encoding);
        let dec = fx
            .engine
            .decrypt(encrypted.content.as_ref().unwrap(), None)
            .unwrap();
        assert_eq!(b"hello\n".to_vec(), dec.plaintext);

        let html = Body::new_leaf(BodyType::Text, "html", "<p>");
        assert!(fx
            .backend
            .inline_protect(&fx.crypt, &html, SecurityFlags::PGP_SIGN, "")
            .unwrap()
            .is_none());
    }
}
