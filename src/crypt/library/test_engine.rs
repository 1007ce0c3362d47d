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

//! A toy OpenPGP engine for tests.
//!
//! Keys are random AES-256 secrets named by a random fingerprint. Anyone
//! holding the "public" key can encrypt and check signatures; only keys
//! marked secret decrypt and sign. The armor looks enough like OpenPGP for
//! the surrounding code not to notice.

use std::cell::RefCell;
use std::rc::Rc;

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rand::rand_bytes;
use openssl::sign::Signer;
use openssl::symm::{self, Cipher};
use secstr::SecStr;

use super::engine::*;
use crate::crypt::flags::KeyFlags;
use crate::crypt::key::{KeyInfo, UserId, Validity};
use crate::support::error::Error;

const MESSAGE_BEGIN: &str = "-----BEGIN PGP MESSAGE-----";
const MESSAGE_END: &str = "-----END PGP MESSAGE-----";
const SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";
const SIGNATURE_END: &str = "-----END PGP SIGNATURE-----";
const SIGNED_BEGIN: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const KEY_BEGIN: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----";
const KEY_END: &str = "-----END PGP PUBLIC KEY BLOCK-----";

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if 0 != s.len() % 2 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

fn random(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand_bytes(&mut buf).expect("no randomness");
    buf
}

#[derive(Clone, Debug)]
struct ToyKey {
    fpr: String,
    uid: String,
    secret: Vec<u8>,
    has_secret: bool,
    validity: Validity,
    flags: KeyFlags,
}

#[derive(Default)]
pub struct ToyEngine {
    keys: RefCell<Vec<ToyKey>>,
    handles: Rc<HandleTable>,
}

impl ToyEngine {
    pub fn new() -> Self {
        ToyEngine::default()
    }

    pub fn handles(&self) -> &Rc<HandleTable> {
        &self.handles
    }

    /// Create a key pair for `uid`, returning its fingerprint.
    pub fn add_key(&self, uid: &str, validity: Validity) -> String {
        self.add_key_with(uid, validity, KeyFlags::empty())
    }

    pub fn add_key_with(
        &self,
        uid: &str,
        validity: Validity,
        flags: KeyFlags,
    ) -> String {
        let fpr = hex(&random(20));
        self.keys.borrow_mut().push(ToyKey {
            fpr: fpr.clone(),
            uid: uid.to_owned(),
            secret: random(32),
            has_secret: true,
            validity,
            flags,
        });
        fpr
    }

    /// Forget the secret half of `fpr`.
    pub fn drop_secret(&self, fpr: &str) {
        for key in self.keys.borrow_mut().iter_mut() {
            if key.fpr == fpr {
                key.has_secret = false;
            }
        }
    }

    /// Sign `data` as `signer`, in the armor a detached signature has.
    pub fn signature(&self, data: &[u8], signer: &str) -> Vec<u8> {
        self.sign(data, signer, None).expect("sign").signature
    }

    fn info(&self, key: &ToyKey, secret: bool) -> KeyInfo {
        let mut flags = KeyFlags::CANENCRYPT | KeyFlags::CANSIGN | key.flags;
        if secret {
            flags |= KeyFlags::SECRET;
        }
        KeyInfo {
            key_id: key.fpr[24..].to_owned(),
            fingerprint: Some(key.fpr.clone()),
            algorithm: "AES".to_owned(),
            num_alg: 1,
            key_len: 256,
            flags,
            validity: key.validity,
            user_ids: vec![UserId::new(key.uid.clone(), key.validity)],
            backend_ref: Some(HandleTable::attach(&self.handles)),
            ..KeyInfo::default()
        }
    }

    fn find(&self, id: &str, secret: bool) -> Result<ToyKey, Error> {
        let id = id.strip_prefix("0x").unwrap_or(id);
        self.keys
            .borrow()
            .iter()
            .find(|k| {
                (k.has_secret || !secret)
                    && (k.fpr.eq_ignore_ascii_case(id)
                        || k.fpr[24..].eq_ignore_ascii_case(id)
                        || k.fpr[32..].eq_ignore_ascii_case(id)
                        || k.uid.to_lowercase().contains(&id.to_lowercase()))
            })
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(id.to_owned()))
    }

    fn mac(key: &ToyKey, data: &[u8]) -> Result<String, Error> {
        let pkey = PKey::hmac(&key.secret)?;
        let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
        signer.update(data)?;
        Ok(hex(&signer.sign_to_vec()?))
    }

    /// Check one `<fpr> <mac>` line over `data`.
    fn check(&self, line: &str, data: &[u8]) -> Result<Signature, Error> {
        let mut words = line.split(' ');
        let fpr = words.next().unwrap_or("");
        let mac = words.next().unwrap_or("");

        let key = match self.find(fpr, false) {
            Ok(key) => key,
            Err(_) => {
                let mut sig = Signature::new(fpr, SigStatus::NoPublicKey);
                sig.summary = SigSummary::KEY_MISSING;
                return Ok(sig);
            }
        };

        let mut sig = Signature::new(fpr, SigStatus::Good);
        if Self::mac(&key, data)? != mac {
            sig.status = SigStatus::Bad;
            sig.summary = SigSummary::RED;
            return Ok(sig);
        }

        sig.validity = Some(key.validity);
        sig.summary = SigSummary::GREEN;
        if key.validity >= Validity::Full {
            sig.summary |= SigSummary::VALID;
        }
        if key.flags.contains(KeyFlags::REVOKED) {
            sig.summary = SigSummary::KEY_REVOKED;
            sig.status = SigStatus::Error("key revoked".to_owned());
        }
        Ok(sig)
    }

    /// The lines of an armored block, between its header and trailer.
    fn armor_body<'a>(
        text: &'a str,
        begin: &str,
        end: &str,
    ) -> Option<&'a str> {
        let start = text.find(begin)? + begin.len();
        let stop = start + text[start..].find(end)?;
        Some(text[start..stop].trim())
    }
}

impl Engine for ToyEngine {
    fn protocol(&self) -> Protocol {
        Protocol::OpenPgp
    }

    fn list_keys(
        &self,
        patterns: &[String],
        secret: bool,
    ) -> Result<Vec<Rc<KeyInfo>>, Error> {
        let keys = self.keys.borrow().clone();
        Ok(keys
            .iter()
            .filter(|k| k.has_secret || !secret)
            .map(|k| Rc::new(self.info(k, secret)))
            .filter(|k| {
                patterns.is_empty()
                    || patterns.iter().any(|p| pattern_matches(k, p))
            })
            .collect())
    }

    fn sign(
        &self,
        data: &[u8],
        signer: &str,
        _passphrase: Option<&SecStr>,
    ) -> Result<Signed, Error> {
        let key = self.find(signer, true)?;
        let signature = format!(
            "{}\n\n{} {}\n{}\n",
            SIGNATURE_BEGIN,
            key.fpr,
            Self::mac(&key, data)?,
            SIGNATURE_END
        );
        Ok(Signed {
            signature: signature.into_bytes(),
            micalg: "pgp-sha256".to_owned(),
        })
    }

    fn clearsign(
        &self,
        data: &[u8],
        signer: &str,
        _passphrase: Option<&SecStr>,
    ) -> Result<Vec<u8>, Error> {
        let key = self.find(signer, true)?;
        let mut out =
            format!("{}\nHash: SHA256\n\n", SIGNED_BEGIN).into_bytes();
        out.extend_from_slice(data);
        if !data.ends_with(b"\n") {
            out.push(b'\n');
        }
        out.extend_from_slice(
            format!(
                "{}\n\n{} {}\n{}\n",
                SIGNATURE_BEGIN,
                key.fpr,
                Self::mac(&key, data)?,
                SIGNATURE_END
            )
            .as_bytes(),
        );
        Ok(out)
    }

    fn verify(
        &self,
        sig: &[u8],
        signed: Option<&[u8]>,
    ) -> Result<Verification, Error> {
        let text = String::from_utf8_lossy(sig);
        let line =
            Self::armor_body(&text, SIGNATURE_BEGIN, SIGNATURE_END)
                .ok_or_else(|| Error::BadInput("no signature".to_owned()))?;

        let (plaintext, data) = match signed {
            Some(signed) => (None, signed.to_vec()),
            None => {
                let body = text
                    .find(SIGNED_BEGIN)
                    .and_then(|s| text[s..].find("\n\n").map(|e| s + e + 2))
                    .and_then(|s| {
                        text[s..].find(SIGNATURE_BEGIN).map(|e| &text[s..s + e])
                    })
                    .ok_or_else(|| {
                        Error::BadInput("no signed text".to_owned())
                    })?;
                (Some(body.as_bytes().to_vec()), body.as_bytes().to_vec())
            }
        };

        Ok(Verification {
            plaintext,
            signatures: vec![self.check(line, &data)?],
        })
    }

    fn encrypt(
        &self,
        data: &[u8],
        recipients: &[String],
        signer: Option<&str>,
        passphrase: Option<&SecStr>,
    ) -> Result<Vec<u8>, Error> {
        let mut inner = Vec::new();
        match signer {
            Some(signer) => {
                let signed = self.sign(data, signer, passphrase)?;
                inner.extend_from_slice(b"S");
                inner.extend_from_slice(&signed.signature);
            }
            None => inner.extend_from_slice(b"P"),
        }
        inner.extend_from_slice(data);

        let mut out = format!("{}\n\n", MESSAGE_BEGIN);
        for r in recipients {
            let key = self.find(r, false)?;
            let iv = random(16);
            let ct = symm::encrypt(
                Cipher::aes_256_cbc(),
                &key.secret,
                Some(&iv),
                &inner,
            )?;
            out.push_str(&format!(
                "{} {} {}\n",
                key.fpr,
                hex(&iv),
                base64::encode(&ct)
            ));
        }
        out.push_str(MESSAGE_END);
        out.push('\n');
        Ok(out.into_bytes())
    }

    fn decrypt(
        &self,
        data: &[u8],
        _passphrase: Option<&SecStr>,
    ) -> Result<Decryption, Error> {
        let text = String::from_utf8_lossy(data);
        let body = match Self::armor_body(&text, MESSAGE_BEGIN, MESSAGE_END) {
            Some(body) => body,
            None => return Err(Error::NotActuallyEncrypted),
        };

        let mut recipients = Vec::new();
        let mut inner: Option<Vec<u8>> = None;
        for line in body.lines() {
            let words = line.split(' ').collect::<Vec<_>>();
            let (fpr, iv, ct) = match words[..] {
                [fpr, iv, ct] => (fpr, iv, ct),
                _ => continue,
            };
            recipients.push(fpr[24.min(fpr.len())..].to_owned());
            if inner.is_some() {
                continue;
            }
            let key = match self.find(fpr, true) {
                Ok(key) => key,
                Err(_) => continue,
            };
            let (iv, ct) = match (unhex(iv), base64::decode(ct)) {
                (Some(iv), Ok(ct)) => (iv, ct),
                _ => return Err(Error::DecryptFailed),
            };
            let plain = symm::decrypt(
                Cipher::aes_256_cbc(),
                &key.secret,
                Some(&iv),
                &ct,
            )
            .map_err(|_| Error::DecryptFailed)?;
            inner = Some(plain);
        }

        let inner = inner.ok_or(Error::DecryptFailed)?;
        match inner.split_first() {
            Some((b'P', plaintext)) => Ok(Decryption {
                plaintext: plaintext.to_vec(),
                signatures: vec![],
                recipients,
            }),
            Some((b'S', rest)) => {
                let text = String::from_utf8_lossy(rest);
                let end = text
                    .find(SIGNATURE_END)
                    .map(|e| e + SIGNATURE_END.len() + 1)
                    .ok_or(Error::DecryptFailed)?;
                let plaintext = rest[end..].to_vec();
                let line =
                    Self::armor_body(&text, SIGNATURE_BEGIN, SIGNATURE_END)
                        .unwrap_or("");
                Ok(Decryption {
                    signatures: vec![self.check(line, &plaintext)?],
                    plaintext,
                    recipients,
                })
            }
            _ => Err(Error::DecryptFailed),
        }
    }

    fn import(&self, data: &[u8]) -> Result<usize, Error> {
        let text = String::from_utf8_lossy(data);
        let body = Self::armor_body(&text, KEY_BEGIN, KEY_END)
            .ok_or_else(|| Error::BadInput("no key block".to_owned()))?;

        let mut imported = 0;
        for line in body.lines() {
            let mut words = line.splitn(3, ' ');
            let (fpr, secret, uid) =
                match (words.next(), words.next(), words.next()) {
                    (Some(fpr), Some(secret), Some(uid)) => (fpr, secret, uid),
                    _ => continue,
                };
            let secret = match unhex(secret) {
                Some(secret) => secret,
                None => continue,
            };
            if self.find(fpr, false).is_ok() {
                continue;
            }
            self.keys.borrow_mut().push(ToyKey {
                fpr: fpr.to_owned(),
                uid: uid.to_owned(),
                secret,
                has_secret: false,
                validity: Validity::Unknown,
                flags: KeyFlags::empty(),
            });
            imported += 1;
        }
        Ok(imported)
    }

    fn export(&self, key: &str) -> Result<Vec<u8>, Error> {
        let key = self.find(key, false)?;
        Ok(format!(
            "{}\n\n{} {} {}\n{}\n",
            KEY_BEGIN,
            key.fpr,
            hex(&key.secret),
            key.uid,
            KEY_END
        )
        .into_bytes())
    }

    fn generate_key(&self, uid: &str) -> Result<String, Error> {
        Ok(self.add_key(uid, Validity::Ultimate))
    }

    fn import_key(&self, data: &[u8]) -> Result<String, Error> {
        self.import(data)?;
        let text = String::from_utf8_lossy(data);
        Self::armor_body(&text, KEY_BEGIN, KEY_END)
            .and_then(|body| body.lines().find(|l| l.contains(' ')))
            .and_then(|line| line.split(' ').next())
            .map(str::to_owned)
            .ok_or_else(|| Error::BadInput("no key block".to_owned()))
    }
}
