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

//! The OpenPGP engine, speaking GnuPG's machine interface.
//!
//! Every operation runs the GnuPG executable in batch mode with the status
//! stream on standard error and builds native results from the status
//! lines, the way GPGME itself does. Passphrases are the agent's business.

use std::path::PathBuf;
use std::rc::Rc;

use chrono::prelude::*;
use log::{debug, info, warn};
use secstr::SecStr;

use super::engine::*;
use crate::crypt::expando::quote_filename;
use crate::crypt::key::{KeyInfo, Validity};
use crate::crypt::pgp::gnupg_parse::parse_key_listing_with;
use crate::support::error::Error;
use crate::support::file_ops::scratch_file;
use crate::support::filter::{self, FilterOutput};

/// What the status stream of one GnuPG run reported.
#[derive(Debug, Default)]
pub struct StatusReport {
    pub signatures: Vec<Signature>,
    pub micalg: Option<String>,
    pub recipients: Vec<String>,
    pub invalid_recipients: Vec<String>,
    pub begin_decryption: bool,
    pub decryption_okay: bool,
    pub decryption_failed: bool,
    pub no_data: bool,
    pub imported: Option<usize>,
    pub import_ok: Vec<String>,
    pub key_created: Option<String>,
}

/// The `micalg` name of an OpenPGP hash algorithm number.
pub fn micalg_name(hash_algo: &str) -> Option<&'static str> {
    match hash_algo {
        "1" => Some("pgp-md5"),
        "2" => Some("pgp-sha1"),
        "3" => Some("pgp-ripemd160"),
        "8" => Some("pgp-sha256"),
        "9" => Some("pgp-sha384"),
        "10" => Some("pgp-sha512"),
        "11" => Some("pgp-sha224"),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    match s.parse::<i64>() {
        Ok(0) | Err(_) => None,
        Ok(secs) => Some(Utc.timestamp(secs, 0)),
    }
}

/// Undo the percent-escaping of notation data.
fn unescape_notation(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if b'%' == bytes[i] && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Interpret the `[GNUPG:]` lines in `data`.
pub fn parse_status(data: &[u8]) -> StatusReport {
    let text = String::from_utf8_lossy(data);
    let mut report = StatusReport::default();
    let mut current: Option<Signature> = None;
    // Whether `current` was opened by NEWSIG and awaits its verdict
    let mut awaiting_verdict = false;

    for line in text.lines() {
        let rest = match line.strip_prefix("[GNUPG:] ") {
            Some(rest) => rest,
            None => continue,
        };
        let mut words = rest.split(' ');
        let keyword = words.next().unwrap_or("");
        let args = words.collect::<Vec<_>>();
        let arg = |n: usize| args.get(n).copied().unwrap_or("");

        match keyword {
            "NEWSIG" => {
                report.signatures.extend(current.take());
                current = Some(Signature::new("", SigStatus::Good));
                awaiting_verdict = true;
            }

            "GOODSIG" | "EXPSIG" | "EXPKEYSIG" | "REVKEYSIG" | "BADSIG"
            | "ERRSIG" => {
                if !awaiting_verdict {
                    report.signatures.extend(current.take());
                }
                awaiting_verdict = false;

                let mut sig = current
                    .take()
                    .unwrap_or_else(|| Signature::new("", SigStatus::Good));
                sig.fpr = arg(0).to_owned();
                match keyword {
                    "GOODSIG" => sig.summary |= SigSummary::GREEN,
                    "EXPSIG" => {
                        sig.status =
                            SigStatus::Error("signature expired".to_owned());
                        sig.summary |= SigSummary::SIG_EXPIRED;
                    }
                    "EXPKEYSIG" => {
                        sig.status = SigStatus::Error("key expired".to_owned());
                        sig.summary |= SigSummary::KEY_EXPIRED;
                    }
                    "REVKEYSIG" => {
                        sig.status = SigStatus::Error("key revoked".to_owned());
                        sig.summary |= SigSummary::KEY_REVOKED;
                    }
                    "BADSIG" => {
                        sig.status = SigStatus::Bad;
                        sig.summary |= SigSummary::RED;
                    }
                    _ => {
                        sig.timestamp = parse_timestamp(arg(4));
                        if !arg(6).is_empty() && "-" != arg(6) {
                            sig.fpr = arg(6).to_owned();
                        }
                        if "9" == arg(5) {
                            sig.status = SigStatus::NoPublicKey;
                            sig.summary |= SigSummary::KEY_MISSING;
                        } else {
                            sig.status =
                                SigStatus::Error(format!("error {}", arg(5)));
                            sig.summary |= SigSummary::SYS_ERROR;
                        }
                    }
                }
                current = Some(sig);
            }

            "VALIDSIG" => {
                if let Some(ref mut sig) = current {
                    // The primary key's fingerprint finds the key again
                    sig.fpr = if arg(9).is_empty() {
                        arg(0).to_owned()
                    } else {
                        arg(9).to_owned()
                    };
                    sig.timestamp = parse_timestamp(arg(2));
                    sig.exp_timestamp = parse_timestamp(arg(3));
                }
            }

            "TRUST_UNDEFINED" | "TRUST_NEVER" | "TRUST_MARGINAL"
            | "TRUST_FULLY" | "TRUST_ULTIMATE" => {
                if let Some(ref mut sig) = current {
                    sig.validity = match keyword {
                        "TRUST_NEVER" => Some(Validity::Never),
                        "TRUST_MARGINAL" => Some(Validity::Marginal),
                        "TRUST_FULLY" => Some(Validity::Full),
                        "TRUST_ULTIMATE" => Some(Validity::Ultimate),
                        _ => None,
                    };
                    if SigStatus::Good == sig.status
                        && sig.validity >= Some(Validity::Full)
                    {
                        sig.summary |= SigSummary::VALID;
                    }
                }
            }

            "PKA_TRUST_GOOD" | "PKA_TRUST_BAD" => {
                if let Some(ref mut sig) = current {
                    let addr = arg(0).to_owned();
                    sig.pka = Some(if "PKA_TRUST_GOOD" == keyword {
                        Pka::Verified(addr)
                    } else {
                        Pka::Mismatch(addr)
                    });
                }
            }

            "NOTATION_NAME" => {
                if let Some(ref mut sig) = current {
                    sig.notations.push((arg(0).to_owned(), String::new()));
                }
            }

            "NOTATION_DATA" => {
                if let Some(&mut (_, ref mut value)) = current
                    .as_mut()
                    .and_then(|sig| sig.notations.last_mut())
                {
                    value.push_str(&unescape_notation(arg(0)));
                }
            }

            "SIG_CREATED" => {
                report.micalg = micalg_name(arg(2)).map(str::to_owned);
            }

            "ENC_TO" => report.recipients.push(arg(0).to_owned()),
            "INV_RECP" => report.invalid_recipients.push(arg(1).to_owned()),
            "BEGIN_DECRYPTION" => report.begin_decryption = true,
            "DECRYPTION_OKAY" => report.decryption_okay = true,
            "DECRYPTION_FAILED" => report.decryption_failed = true,
            "NODATA" => report.no_data = true,
            "IMPORT_RES" => report.imported = arg(0).parse().ok(),
            "IMPORT_OK" => report.import_ok.push(arg(1).to_owned()),
            "KEY_CREATED" => report.key_created = Some(arg(1).to_owned()),
            _ => (),
        }
    }

    report.signatures.extend(current);
    report
}

/// `args`, then `--local-user` unless `signer` is empty and GnuPG should
/// pick its default key.
fn with_signer<'a>(args: &[&'a str], signer: &'a str) -> Vec<&'a str> {
    let mut args = args.to_vec();
    if !signer.is_empty() {
        args.push("--local-user");
        args.push(signer);
    }
    args
}

pub struct GnupgEngine {
    program: String,
    /// The GnuPG home directory; the user's default if `None`.
    home: Option<PathBuf>,
    scratch: PathBuf,
    ignore_subkeys: bool,
    handles: Rc<HandleTable>,
}

impl GnupgEngine {
    pub fn new(
        program: &str,
        home: Option<PathBuf>,
        scratch: PathBuf,
        ignore_subkeys: bool,
    ) -> Self {
        GnupgEngine {
            program: program.to_owned(),
            home,
            scratch,
            ignore_subkeys,
            handles: HandleTable::new(),
        }
    }

    pub fn handles(&self) -> &Rc<HandleTable> {
        &self.handles
    }

    fn command_line(&self, args: &[&str]) -> String {
        let mut cmd = quote_filename(&self.program);
        cmd.push_str(" --batch --no-tty --status-fd 2 --no-verbose --quiet");
        for arg in args {
            cmd.push(' ');
            cmd.push_str(&quote_filename(arg));
        }
        cmd
    }

    fn gpg(
        &self,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> Result<(FilterOutput, StatusReport), Error> {
        let cmd = self.command_line(args);
        let env = self.home.as_ref().map_or_else(Vec::new, |home| {
            vec![(
                "GNUPGHOME".to_owned(),
                home.to_string_lossy().into_owned(),
            )]
        });
        debug!("Running {}", cmd);
        let out = filter::run(&cmd, input, &env)?;
        let report = parse_status(&out.stderr);
        debug!("GnuPG exited with {}", out.status);
        Ok((out, report))
    }
}

impl Engine for GnupgEngine {
    fn protocol(&self) -> Protocol {
        Protocol::OpenPgp
    }

    fn list_keys(
        &self,
        patterns: &[String],
        secret: bool,
    ) -> Result<Vec<Rc<KeyInfo>>, Error> {
        let mut args = vec![
            "--with-colons",
            "--with-fingerprint",
            "--fixed-list-mode",
            if secret {
                "--list-secret-keys"
            } else {
                "--list-keys"
            },
            "--",
        ];
        args.extend(patterns.iter().map(String::as_str));

        // Exits unsuccessfully when nothing matches, which is just an empty
        // listing to us
        let (out, _) = self.gpg(&args, None)?;
        let handles = &self.handles;
        Ok(parse_key_listing_with(
            &out.stdout,
            self.ignore_subkeys,
            &mut |_| Some(HandleTable::attach(handles)),
        ))
    }

    fn sign(
        &self,
        data: &[u8],
        signer: &str,
        _passphrase: Option<&SecStr>,
    ) -> Result<Signed, Error> {
        let args = with_signer(&["--armor", "--detach-sign"], signer);
        let (out, report) = self.gpg(&args, Some(data))?;
        if out.stdout.is_empty() {
            warn!("GnuPG produced no signature (status {})", out.status);
            return Err(Error::NoOutput);
        }
        Ok(Signed {
            signature: out.stdout,
            micalg: report.micalg.unwrap_or_else(|| "pgp-sha256".to_owned()),
        })
    }

    fn clearsign(
        &self,
        data: &[u8],
        signer: &str,
        _passphrase: Option<&SecStr>,
    ) -> Result<Vec<u8>, Error> {
        let args = with_signer(&["--armor", "--clearsign"], signer);
        let (out, _) = self.gpg(&args, Some(data))?;
        if out.stdout.is_empty() {
            warn!("GnuPG produced no clear-signed text ({})", out.status);
            return Err(Error::NoOutput);
        }
        Ok(out.stdout)
    }

    fn verify(
        &self,
        sig: &[u8],
        signed: Option<&[u8]>,
    ) -> Result<Verification, Error> {
        let (plaintext, report) = match signed {
            Some(signed) => {
                let sig_file = scratch_file(&self.scratch, ".asc", sig)?;
                let signed_file = scratch_file(&self.scratch, "", signed)?;
                let sig_path = sig_file.path().to_string_lossy().into_owned();
                let signed_path =
                    signed_file.path().to_string_lossy().into_owned();
                let (_, report) =
                    self.gpg(&["--verify", &sig_path, &signed_path], None)?;
                (None, report)
            }
            None => {
                let (out, report) =
                    self.gpg(&["--output", "-", "--decrypt"], Some(sig))?;
                (Some(out.stdout), report)
            }
        };

        if report.signatures.is_empty() {
            return Err(if report.no_data {
                Error::BadInput("no signed data".to_owned())
            } else {
                Error::VerifyFailed
            });
        }
        Ok(Verification {
            plaintext,
            signatures: report.signatures,
        })
    }

    fn encrypt(
        &self,
        data: &[u8],
        recipients: &[String],
        signer: Option<&str>,
        _passphrase: Option<&SecStr>,
    ) -> Result<Vec<u8>, Error> {
        let mut args = vec!["--armor", "--trust-model", "always", "--encrypt"];
        for r in recipients {
            args.push("--recipient");
            args.push(r);
        }
        if let Some(signer) = signer {
            args.push("--sign");
            if !signer.is_empty() {
                args.push("--local-user");
                args.push(signer);
            }
        }

        let (out, report) = self.gpg(&args, Some(data))?;
        if let Some(bad) = report.invalid_recipients.into_iter().next() {
            return Err(Error::KeyNotFound(bad));
        }
        if out.stdout.is_empty() {
            return Err(Error::NoOutput);
        }
        Ok(out.stdout)
    }

    fn decrypt(
        &self,
        data: &[u8],
        _passphrase: Option<&SecStr>,
    ) -> Result<Decryption, Error> {
        let (out, report) =
            self.gpg(&["--output", "-", "--decrypt"], Some(data))?;

        if !report.begin_decryption && !report.decryption_okay {
            return Err(Error::NotActuallyEncrypted);
        }
        if report.decryption_failed || !report.decryption_okay {
            return Err(Error::DecryptFailed);
        }
        Ok(Decryption {
            plaintext: out.stdout,
            signatures: report.signatures,
            recipients: report.recipients,
        })
    }

    fn import(&self, data: &[u8]) -> Result<usize, Error> {
        let (out, report) = self.gpg(&["--import"], Some(data))?;
        match report.imported {
            Some(n) => {
                info!("GnuPG processed {} key(s)", n);
                Ok(n)
            }
            None => Err(Error::CommandFailed(out.status)),
        }
    }

    fn export(&self, key: &str) -> Result<Vec<u8>, Error> {
        let (out, _) = self.gpg(&["--armor", "--export", key], None)?;
        if out.stdout.is_empty() {
            Err(Error::KeyNotFound(key.to_owned()))
        } else {
            Ok(out.stdout)
        }
    }

    fn generate_key(&self, uid: &str) -> Result<String, Error> {
        let (out, report) = self.gpg(
            &[
                "--pinentry-mode",
                "loopback",
                "--passphrase",
                "",
                "--quick-generate-key",
                uid,
                "default",
                "default",
                "never",
            ],
            None,
        )?;
        report.key_created.ok_or(Error::CommandFailed(out.status))
    }

    fn import_key(&self, data: &[u8]) -> Result<String, Error> {
        let (out, report) = self.gpg(&["--import"], Some(data))?;
        report
            .import_ok
            .into_iter()
            .next()
            .ok_or(Error::CommandFailed(out.status))
    }

    fn export_minimal(&self, key: &str) -> Result<Vec<u8>, Error> {
        let (out, _) = self.gpg(
            &["--export-options", "export-minimal", "--export", key],
            None,
        )?;
        if out.stdout.is_empty() {
            Err(Error::KeyNotFound(key.to_owned()))
        } else {
            Ok(out.stdout)
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::support::file_ops::chmod;

    const VERIFY_STATUS: &str = "\
gpg: Signature made Tue 14 Jul 2020
[GNUPG:] NEWSIG
[GNUPG:] KEY_CONSIDERED AAAABBBBCCCCDDDDEEEEFFFF0123456789ABCDEF 0
[GNUPG:] GOODSIG 0123456789ABCDEF Alice <alice@example.com>
[GNUPG:] NOTATION_NAME note@example.com
[GNUPG:] NOTATION_DATA hello%20world
[GNUPG:] VALIDSIG 1111222233334444555566667777FEDCBA987654 2020-07-14 \
1594700000 0 4 0 1 8 00 AAAABBBBCCCCDDDDEEEEFFFF0123456789ABCDEF
[GNUPG:] TRUST_FULLY 0 pgp
[GNUPG:] PKA_TRUST_GOOD alice@example.com
[GNUPG:] NEWSIG
[GNUPG:] ERRSIG FEDCBA9876543210 1 8 00 1594700000 9 -
[GNUPG:] NO_PUBKEY FEDCBA9876543210
[GNUPG:] BADSIG 5555666677778888 Mallory <mallory@example.com>
";

    #[test]
    fn status_signatures() {
        let report = parse_status(VERIFY_STATUS.as_bytes());
        assert_eq!(3, report.signatures.len());

        let good = &report.signatures[0];
        assert_eq!(SigStatus::Good, good.status);
        assert_eq!("AAAABBBBCCCCDDDDEEEEFFFF0123456789ABCDEF", good.fpr);
        assert!(good.summary.contains(SigSummary::GREEN | SigSummary::VALID));
        assert_eq!(Some(Validity::Full), good.validity);
        assert_eq!(Some(Utc.timestamp(1594700000, 0)), good.timestamp);
        assert_eq!(None, good.exp_timestamp);
        assert_eq!(
            vec![("note@example.com".to_owned(), "hello world".to_owned())],
            good.notations
        );
        assert_eq!(
            Some(Pka::Verified("alice@example.com".to_owned())),
            good.pka
        );

        let missing = &report.signatures[1];
        assert_eq!(SigStatus::NoPublicKey, missing.status);
        assert_eq!("FEDCBA9876543210", missing.fpr);
        assert!(missing.summary.contains(SigSummary::KEY_MISSING));

        let bad = &report.signatures[2];
        assert_eq!(SigStatus::Bad, bad.status);
        assert!(bad.summary.contains(SigSummary::RED));
    }

    #[test]
    fn status_decryption() {
        let report = parse_status(
            b"[GNUPG:] ENC_TO 0123456789ABCDEF 1 0\n\
              [GNUPG:] BEGIN_DECRYPTION\n\
              [GNUPG:] DECRYPTION_OKAY\n\
              [GNUPG:] SIG_CREATED D 1 10 00 1594700000 AAAA\n\
              [GNUPG:] IMPORT_OK 1 AAAABBBBCCCCDDDDEEEEFFFF0123456789ABCDEF\n\
              [GNUPG:] IMPORT_RES 2 0 1 0 1 0 0 0 0 0 0 0 0 0\n\
              [GNUPG:] KEY_CREATED B 0123ABCD\n",
        );
        assert_eq!(vec!["0123456789ABCDEF".to_owned()], report.recipients);
        assert!(report.begin_decryption);
        assert!(report.decryption_okay);
        assert!(!report.decryption_failed);
        assert_eq!(Some("pgp-sha512".to_owned()), report.micalg);
        assert_eq!(Some(2), report.imported);
        assert_eq!(
            vec!["AAAABBBBCCCCDDDDEEEEFFFF0123456789ABCDEF".to_owned()],
            report.import_ok
        );
        assert_eq!(Some("0123ABCD".to_owned()), report.key_created);
    }

    /// A stand-in for the GnuPG executable which answers according to the
    /// operation it is asked for.
    const FAKE_GPG: &str = r#"#!/bin/sh
case "$*" in
*--list-keys*)
    echo "pub:f:2048:1:0123456789ABCDEF:1500000000:::f:::escESC:"
    echo "fpr:::::::::AAAABBBBCCCCDDDDEEEEFFFF0123456789ABCDEF:"
    echo "uid:f::::::::Alice <alice@example.com>:"
    ;;
*--detach-sign*)
    cat >/dev/null
    echo "[GNUPG:] SIG_CREATED D 1 8 00 1594700000 AAAA" >&2
    echo "-----BEGIN PGP SIGNATURE-----"
    echo "-----END PGP SIGNATURE-----"
    ;;
*--clearsign*)
    echo "-----BEGIN PGP SIGNED MESSAGE-----"
    cat
    echo "-----END PGP SIGNATURE-----"
    ;;
*--decrypt*)
    read first
    if [ "$first" = "-----BEGIN PGP MESSAGE-----" ]; then
        echo "[GNUPG:] BEGIN_DECRYPTION" >&2
        echo "[GNUPG:] DECRYPTION_OKAY" >&2
        echo "plain text"
    else
        echo "[GNUPG:] NODATA 1" >&2
    fi
    ;;
*"--recipient nobody"*)
    cat >/dev/null
    echo "[GNUPG:] INV_RECP 1 nobody" >&2
    ;;
*--encrypt*)
    cat >/dev/null
    echo "-----BEGIN PGP MESSAGE-----"
    ;;
*--export*)
    echo "home=$GNUPGHOME"
    ;;
esac
"#;

    fn engine(dir: &TempDir) -> GnupgEngine {
        let program = dir.path().join("gpg");
        fs::write(&program, FAKE_GPG).unwrap();
        chmod(&program, 0o755).unwrap();
        GnupgEngine::new(
            &program.to_string_lossy(),
            Some(dir.path().join("home")),
            dir.path().to_owned(),
            true,
        )
    }

    #[test]
    fn listing_keys_takes_handles() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let keys = engine.list_keys(&["alice".to_owned()], false).unwrap();
        assert_eq!(1, keys.len());
        assert_eq!("0123456789ABCDEF", keys[0].key_id);
        assert!(keys[0].backend_ref.is_some());
        assert_eq!(1, engine.handles().live());

        let again = engine
            .get_key("0xAAAABBBBCCCCDDDDEEEEFFFF0123456789ABCDEF", false)
            .unwrap();
        assert!(again.is_some());
        drop(keys);
        drop(again);
        assert_eq!(0, engine.handles().live());
    }

    #[test]
    fn signing_reports_digest() {
        let dir = TempDir::new().unwrap();
        let signed = engine(&dir).sign(b"data", "alice", None).unwrap();
        assert_eq!("pgp-sha256", signed.micalg);
        assert!(signed.signature.starts_with(b"-----BEGIN PGP SIGNATURE"));
    }

    #[test]
    fn clearsigning() {
        let dir = TempDir::new().unwrap();
        let out = engine(&dir).clearsign(b"hello\n", "alice", None).unwrap();
        assert_eq!(
            "-----BEGIN PGP SIGNED MESSAGE-----\n\
             hello\n\
             -----END PGP SIGNATURE-----\n",
            String::from_utf8(out).unwrap()
        );
    }

    #[test]
    fn decryption_outcomes() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let dec = engine
            .decrypt(b"-----BEGIN PGP MESSAGE-----\nxx\n", None)
            .unwrap();
        assert_eq!(b"plain text\n".to_vec(), dec.plaintext);
        assert_matches!(
            Err(Error::NotActuallyEncrypted),
            engine.decrypt(b"hello\n", None)
        );
    }

    #[test]
    fn invalid_recipient() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert_matches!(
            Err(Error::KeyNotFound(_)),
            engine.encrypt(b"x", &["nobody".to_owned()], None, None)
        );
        assert!(engine
            .encrypt(b"x", &["alice".to_owned()], None, None)
            .is_ok());
    }

    #[test]
    fn home_directory_is_passed() {
        let dir = TempDir::new().unwrap();
        let out = engine(&dir).export("alice").unwrap();
        assert_eq!(
            format!("home={}\n", dir.path().join("home").display()),
            String::from_utf8(out).unwrap()
        );
    }
}
