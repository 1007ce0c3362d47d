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

//! Traditional ("inline") PGP: armored blocks embedded in plain text.

use log::{debug, warn};

use super::invoke::{self, Vars};
use super::status::{check_decryption_okay, copy_checksig};
use super::PgpClassic;
use crate::crypt::armor::{
    copy_clearsigned, put_prefixed_line, trim_eol, Armor,
};
use crate::crypt::flags::SecurityFlags;
use crate::crypt::handler::payload;
use crate::crypt::Crypt;
use crate::mime::content_encoding::{check_charset, recode};
use crate::mime::model::*;
use crate::mime::state::{State, StateFlags};
use crate::support::error::Error;
use crate::support::file_ops::scratch_file;

impl PgpClassic {
    /// Render a part containing inline PGP blocks, decrypting and verifying
    /// each block as it comes.
    pub(super) fn inline_handler(
        &self,
        ctx: &Crypt,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let data = payload(b, &state.fp_in).to_vec();
        let body_charset = b.charset().unwrap_or("us-ascii").to_owned();
        let display = state.has(StateFlags::DISPLAY);

        let mut found = false;
        let mut maybe_goodsig = true;
        let mut have_any_sigs = false;
        let mut lines = data.split_inclusive(|&c| b'\n' == c);

        while let Some(line) = lines.next() {
            let armor = match Armor::classify(line) {
                Some(a) => a,
                None => {
                    // Mixed content, or a kind of block we do not handle
                    put_prefixed_line(state, line);
                    continue;
                }
            };
            found = true;
            let needpass = Armor::Message == armor;
            let clearsign = Armor::Signed == armor;
            have_any_sigs |= clearsign && state.has(StateFlags::VERIFY);

            let mut block = line.to_vec();
            let mut gpg_charset: Option<String> = None;
            for line in lines.by_ref() {
                block.extend_from_slice(line);
                if armor.is_end(line) {
                    break;
                }
                if let Some(cs) = line.strip_prefix(b"Charset: ") {
                    let cs = String::from_utf8_lossy(trim_eol(cs))
                        .trim()
                        .to_owned();
                    gpg_charset = Some(if check_charset(&cs) {
                        cs
                    } else {
                        debug!("Unknown armor charset {:?}, using UTF-8", cs);
                        "utf-8".to_owned()
                    });
                }
            }

            let mut pgpout: Vec<u8> = Vec::new();
            let mut decrypt_okay_rc = 0;
            let mut could_not_decrypt = false;

            if !clearsign || state.has(StateFlags::VERIFY) {
                let tf = match scratch_file(&ctx.scratch(), "", &block) {
                    Ok(tf) => tf,
                    Err(e) => {
                        warn!("Can't create temporary file: {}", e);
                        b.goodsig = false;
                        return -1;
                    }
                };

                if needpass && !self.ensure_passphrase(ctx) {
                    self.passphrase.void();
                }
                let input = self.passphrase_input(needpass);
                let vars = Vars {
                    file: Some(tf.path()),
                    need_pass: needpass,
                    ..Vars::default()
                };

                match invoke::run(
                    &self.commands.decode,
                    &vars,
                    self.config.use_gpg_agent,
                    Some(input.unsecure()),
                ) {
                    Err(e) => {
                        debug!("PGP decode failed to start: {}", e);
                        maybe_goodsig = false;
                        state.attach_puts(
                            "[-- Error: unable to create PGP subprocess --]\n",
                        );
                    }
                    Ok(out) => {
                        if needpass {
                            decrypt_okay_rc = check_decryption_okay(
                                self.config.check_gpg_decrypt_status_fd,
                                self.decryption_okay.as_ref(),
                                &out.stderr,
                            );
                        }
                        if decrypt_okay_rc > -3 {
                            pgpout = out.stdout;
                        }

                        if display {
                            ctx.current_time_banner(state, "PGP");
                            let rc = copy_checksig(
                                self.good_sign.as_ref(),
                                &out.stderr,
                                state,
                            );
                            if 0 == rc {
                                have_any_sigs = true;
                            }
                            if -1 == rc || 0 != out.status {
                                maybe_goodsig = false;
                            }
                            state.attach_puts("[-- End of PGP output --]\n\n");
                        }
                    }
                }

                if !clearsign && pgpout.is_empty() {
                    could_not_decrypt = true;
                    self.passphrase.void();
                }

                if (could_not_decrypt || decrypt_okay_rc <= -3) && !display {
                    ctx.prompt.error("Could not decrypt PGP message");
                    b.goodsig = maybe_goodsig && have_any_sigs;
                    return -1;
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
            } else if !pgpout.is_empty() {
                let from = gpg_charset
                    .as_deref()
                    .filter(|cs| !cs.is_empty())
                    .unwrap_or("utf-8");
                let text = recode(&pgpout, from, &ctx.config.crypt.charset);
                if state.prefix.is_some() {
                    state.flags.insert(StateFlags::PENDINGPREFIX);
                }
                state.prefix_put(&text);
            }

            if display {
                state.puts("\n");
                match armor {
                    Armor::Message => {
                        state.attach_puts("[-- END PGP MESSAGE --]\n");
                        if could_not_decrypt || decrypt_okay_rc <= -3 {
                            ctx.prompt.error("Could not decrypt PGP message");
                        } else if decrypt_okay_rc < 0 {
                            ctx.prompt.error("PGP message is not encrypted");
                        } else {
                            ctx.prompt
                                .message("PGP message successfully decrypted");
                        }
                    }
                    Armor::PublicKey => {
                        state.attach_puts("[-- END PGP PUBLIC KEY BLOCK --]\n")
                    }
                    Armor::Signed => {
                        state.attach_puts("[-- END PGP SIGNED MESSAGE --]\n")
                    }
                }
            }
        }

        b.goodsig = maybe_goodsig && have_any_sigs;

        if !found {
            state.attach_puts(
                "[-- Error: could not find beginning of PGP message --]\n\n",
            );
            return -1;
        }
        0
    }

    /// Sign and/or encrypt a `text/plain` body as inline PGP.
    ///
    /// `Ok(None)` means the body cannot be protected this way.
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

        let ascii = body_charset.eq_ignore_ascii_case("us-ascii");
        let (text, send_charset) = if ascii {
            (content, "us-ascii")
        } else {
            (
                recode(&content, body_charset, "utf-8"),
                if encrypt { "us-ascii" } else { "utf-8" },
            )
        };

        let tf = scratch_file(&ctx.scratch(), "", &text)?;
        let template = if encrypt && sign {
            &self.commands.encrypt_sign
        } else if encrypt {
            &self.commands.encrypt_only
        } else {
            &self.commands.clear_sign
        };
        let signer = self.signer();
        let vars = Vars {
            file: Some(tf.path()),
            signer: signer.as_deref(),
            recipients: Some(keylist),
            need_pass: sign,
            ..Vars::default()
        };
        let input = self.passphrase_input(sign);

        let out = match invoke::run(
            template,
            &vars,
            self.config.use_gpg_agent,
            Some(input.unsecure()),
        ) {
            Ok(out) => out,
            Err(e) => {
                warn!("Inline PGP failed: {}", e);
                if sign {
                    self.passphrase.void();
                }
                return Ok(None);
            }
        };

        if !out.stderr.is_empty() {
            ctx.prompt.message(&String::from_utf8_lossy(&out.stderr));
            ctx.prompt.any_key_to_continue();
        }
        if out.stdout.is_empty()
            || (self.config.check_exit && 0 != out.status)
        {
            if sign {
                self.passphrase.void();
            }
            return Ok(None);
        }

        let mut b = Body::new_leaf(BodyType::Text, "plain", out.stdout);
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
