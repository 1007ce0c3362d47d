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

//! The CMS engine, built on OpenSSL's PKCS#7 support.
//!
//! Certificates are PEM files in the certificate directory; a file of the
//! same name in the key directory holds the matching private key (and makes
//! the certificate a secret key). This is the layout `smime_keys` maintains,
//! so both S/MIME backends can share one store.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info, warn};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{Id, PKey, Private};
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::X509;
use secstr::SecStr;

use super::engine::*;
use crate::crypt::flags::KeyFlags;
use crate::crypt::key::{KeyInfo, UserId, Validity};
use crate::support::error::Error;
use crate::support::system_config::{expand_path, SmimeConfig};

/// The cipher OpenSSL calls `name`.
fn cipher_for(name: &str) -> Result<Cipher, Error> {
    match name.to_lowercase().as_str() {
        "" | "aes256" | "aes-256" => Ok(Cipher::aes_256_cbc()),
        "aes192" | "aes-192" => Ok(Cipher::aes_192_cbc()),
        "aes128" | "aes-128" => Ok(Cipher::aes_128_cbc()),
        "des3" | "des-ede3" => Ok(Cipher::des_ede3_cbc()),
        other => {
            warn!("Unknown S/MIME cipher {}", other);
            Err(Error::Unsupported)
        }
    }
}

fn hex_fingerprint(cert: &X509) -> Result<String, Error> {
    Ok(cert
        .digest(MessageDigest::sha1())?
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect())
}

/// Parse a PKCS#7 object from DER or, failing that, PEM.
fn parse_pkcs7(data: &[u8]) -> Result<Pkcs7, Error> {
    Pkcs7::from_der(data)
        .or_else(|_| Pkcs7::from_pem(data))
        .map_err(|_| Error::BadInput("not a PKCS#7 object".to_owned()))
}

/// The user ids of a certificate: its e-mail addresses, with the common
/// name as personal name.
fn user_ids(cert: &X509) -> Vec<UserId> {
    let name = cert
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string());

    let mut emails: Vec<String> = cert
        .subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.email().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();
    for entry in cert.subject_name().entries_by_nid(Nid::PKCS9_EMAILADDRESS) {
        if let Ok(email) = entry.data().as_utf8() {
            let email = email.to_string();
            if !emails.iter().any(|e| e.eq_ignore_ascii_case(&email)) {
                emails.push(email);
            }
        }
    }

    emails
        .into_iter()
        .map(|email| {
            let addr = match name {
                Some(ref name) => format!("{} <{}>", name, email),
                None => format!("<{}>", email),
            };
            UserId::new(addr, Validity::Full)
        })
        .collect()
}

pub struct OpensslSmime {
    keys: PathBuf,
    certificates: PathBuf,
    ca_location: PathBuf,
    cipher: String,
    handles: Rc<HandleTable>,
}

impl OpensslSmime {
    pub fn new(config: &SmimeConfig) -> Self {
        OpensslSmime {
            keys: expand_path(&config.keys),
            certificates: expand_path(&config.certificates),
            ca_location: expand_path(&config.ca_location),
            cipher: config.encrypt_with.clone(),
            handles: HandleTable::new(),
        }
    }

    pub fn handles(&self) -> &Rc<HandleTable> {
        &self.handles
    }

    /// Every certificate in the store, with the name of its file.
    fn certificates(&self) -> Vec<(String, X509)> {
        let entries = match fs::read_dir(&self.certificates) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(
                    "No certificates in {}: {}",
                    self.certificates.display(),
                    e
                );
                return vec![];
            }
        };

        let mut certs = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let cert = fs::read(entry.path())
                .ok()
                .and_then(|pem| X509::from_pem(&pem).ok());
            match cert {
                Some(cert) => certs.push((name, cert)),
                None => debug!("Skipping {}: not a certificate", name),
            }
        }
        certs.sort_by(|a, b| a.0.cmp(&b.0));
        certs
    }

    fn key_info(&self, name: &str, cert: &X509) -> Result<KeyInfo, Error> {
        let mut flags =
            KeyFlags::ISX509 | KeyFlags::CANSIGN | KeyFlags::CANENCRYPT;
        if self.keys.join(name).is_file() {
            flags |= KeyFlags::SECRET;
        }
        let now = Asn1Time::days_from_now(0)?;
        if cert.not_after() < now {
            flags |= KeyFlags::EXPIRED;
        }

        let pkey = cert.public_key()?;
        let algorithm = match pkey.id() {
            Id::RSA => "RSA",
            Id::EC => "ECC",
            Id::DSA => "DSA",
            _ => "?",
        };

        Ok(KeyInfo {
            key_id: name.to_owned(),
            fingerprint: Some(hex_fingerprint(cert)?),
            algorithm: algorithm.to_owned(),
            key_len: pkey.bits(),
            flags,
            validity: Validity::Full,
            user_ids: user_ids(cert),
            backend_ref: Some(HandleTable::attach(&self.handles)),
            ..KeyInfo::default()
        })
    }

    /// The certificate whose file name, fingerprint or e-mail is `id`.
    fn find_certificate(&self, id: &str) -> Result<(String, X509), Error> {
        let id = id.strip_prefix("0x").unwrap_or(id);
        for (name, cert) in self.certificates() {
            let info = self.key_info(&name, &cert)?;
            if key_has_id(&info, id) || pattern_matches(&info, id) {
                return Ok((name, cert));
            }
        }
        Err(Error::KeyNotFound(id.to_owned()))
    }

    fn private_key(
        &self,
        name: &str,
        passphrase: Option<&SecStr>,
    ) -> Result<PKey<Private>, Error> {
        let pem = fs::read(self.keys.join(name))
            .map_err(|_| Error::KeyNotFound(name.to_owned()))?;
        match passphrase {
            Some(pass) => Ok(PKey::private_key_from_pem_passphrase(
                &pem,
                pass.unsecure(),
            )
            .map_err(|_| Error::PassphraseRequired)?),
            None => PKey::private_key_from_pem(&pem)
                .map_err(|_| Error::PassphraseRequired),
        }
    }

    fn trust_store(&self) -> Result<X509Store, Error> {
        let mut builder = X509StoreBuilder::new()?;
        let files = if self.ca_location.is_dir() {
            fs::read_dir(&self.ca_location)?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .collect()
        } else if self.ca_location.is_file() {
            vec![self.ca_location.clone()]
        } else {
            vec![]
        };

        for file in files {
            let pem = match fs::read(&file) {
                Ok(pem) => pem,
                Err(_) => continue,
            };
            for cert in X509::stack_from_pem(&pem).unwrap_or_default() {
                if let Err(e) = builder.add_cert(cert) {
                    debug!("Ignoring CA in {}: {}", file.display(), e);
                }
            }
        }
        Ok(builder.build())
    }

    fn all_certificates(&self) -> Result<Stack<X509>, Error> {
        let mut stack = Stack::new()?;
        for (_, cert) in self.certificates() {
            stack.push(cert)?;
        }
        Ok(stack)
    }

    /// Check `p7`, producing the one signature result OpenSSL can give.
    fn check(
        &self,
        p7: &Pkcs7,
        signed: Option<&[u8]>,
    ) -> Result<Verification, Error> {
        let known = self.all_certificates()?;
        let store = self.trust_store()?;

        let signer = p7
            .signers(&known, Pkcs7Flags::empty())
            .ok()
            .and_then(|s| s.iter().next().map(|c| c.to_owned()));
        let signer = match signer {
            Some(signer) => signer,
            None => {
                let mut sig = Signature::new("", SigStatus::NoPublicKey);
                sig.summary = SigSummary::KEY_MISSING;
                return Ok(Verification {
                    plaintext: None,
                    signatures: vec![sig],
                });
            }
        };

        let fpr = hex_fingerprint(&signer)?;
        let mut content = Vec::new();
        let mut sig = Signature::new(fpr, SigStatus::Good);
        let chain = p7.verify(
            &known,
            &store,
            signed,
            Some(&mut content),
            Pkcs7Flags::BINARY,
        );
        if chain.is_ok() {
            sig.summary = SigSummary::VALID | SigSummary::GREEN;
            sig.validity = Some(Validity::Full);
        } else {
            content.clear();
            let bare = p7.verify(
                &known,
                &store,
                signed,
                Some(&mut content),
                Pkcs7Flags::BINARY | Pkcs7Flags::NOVERIFY,
            );
            if bare.is_ok() {
                // Intact, but we cannot tell who made it
                sig.validity = Some(Validity::Unknown);
            } else {
                sig.status = SigStatus::Bad;
                sig.summary = SigSummary::RED;
            }
        }

        let mut info = self.key_info("", &signer)?;
        info.key_id = sig.fpr.clone();
        info.flags.remove(KeyFlags::SECRET);
        sig.signer = Some(Rc::new(info));

        Ok(Verification {
            plaintext: if signed.is_none() && SigStatus::Good == sig.status {
                Some(content)
            } else {
                None
            },
            signatures: vec![sig],
        })
    }

    fn store_certificate(&self, cert: &X509) -> Result<bool, Error> {
        let fpr = hex_fingerprint(cert)?;
        for (_, existing) in self.certificates() {
            if hex_fingerprint(&existing)? == fpr {
                return Ok(false);
            }
        }

        let stem = fpr[..8].to_lowercase();
        let mut n = 0;
        let path = loop {
            let path = self.certificates.join(format!("{}.{}", stem, n));
            if !path.exists() {
                break path;
            }
            n += 1;
        };
        fs::create_dir_all(&self.certificates)?;
        fs::write(&path, cert.to_pem()?)?;
        info!("Stored certificate {} as {}", fpr, path.display());
        Ok(true)
    }
}

impl Engine for OpensslSmime {
    fn protocol(&self) -> Protocol {
        Protocol::Cms
    }

    fn list_keys(
        &self,
        patterns: &[String],
        secret: bool,
    ) -> Result<Vec<Rc<KeyInfo>>, Error> {
        let mut keys = Vec::new();
        for (name, cert) in self.certificates() {
            let info = self.key_info(&name, &cert)?;
            if secret && !info.is_secret() {
                continue;
            }
            if patterns.is_empty()
                || patterns.iter().any(|p| pattern_matches(&info, p))
            {
                keys.push(Rc::new(info));
            }
        }
        Ok(keys)
    }

    fn sign(
        &self,
        data: &[u8],
        signer: &str,
        passphrase: Option<&SecStr>,
    ) -> Result<Signed, Error> {
        let (name, cert) = self.find_certificate(signer)?;
        let pkey = self.private_key(&name, passphrase)?;
        let extra = Stack::new()?;
        let p7 = Pkcs7::sign(
            &cert,
            &pkey,
            &extra,
            data,
            Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
        )?;
        Ok(Signed {
            signature: p7.to_der()?,
            micalg: "sha-256".to_owned(),
        })
    }

    fn verify(
        &self,
        sig: &[u8],
        signed: Option<&[u8]>,
    ) -> Result<Verification, Error> {
        let p7 = parse_pkcs7(sig)?;
        self.check(&p7, signed)
    }

    fn encrypt(
        &self,
        data: &[u8],
        recipients: &[String],
        _signer: Option<&str>,
        _passphrase: Option<&SecStr>,
    ) -> Result<Vec<u8>, Error> {
        let mut certs = Stack::new()?;
        for r in recipients {
            let (_, cert) = self.find_certificate(r)?;
            certs.push(cert)?;
        }
        let p7 = Pkcs7::encrypt(
            &certs,
            data,
            cipher_for(&self.cipher)?,
            Pkcs7Flags::BINARY,
        )?;
        Ok(p7.to_der()?)
    }

    fn decrypt(
        &self,
        data: &[u8],
        passphrase: Option<&SecStr>,
    ) -> Result<Decryption, Error> {
        let p7 = parse_pkcs7(data)?;
        let mut tried_any = false;

        for (name, cert) in self.certificates() {
            if !self.keys.join(&name).is_file() {
                continue;
            }
            let pkey = match self.private_key(&name, passphrase) {
                Ok(pkey) => pkey,
                Err(e) => {
                    debug!("Cannot use key {}: {}", name, e);
                    continue;
                }
            };
            tried_any = true;
            if let Ok(plaintext) =
                p7.decrypt(&pkey, &cert, Pkcs7Flags::empty())
            {
                return Ok(Decryption {
                    plaintext,
                    signatures: vec![],
                    recipients: vec![name],
                });
            }
        }

        // Signed data mislabelled as enveloped data is common
        let known = self.all_certificates()?;
        let store = self.trust_store()?;
        if p7
            .verify(&known, &store, None, None, Pkcs7Flags::NOVERIFY)
            .is_ok()
        {
            return Err(Error::NotActuallyEncrypted);
        }

        Err(if tried_any || passphrase.is_some() {
            Error::DecryptFailed
        } else {
            Error::PassphraseRequired
        })
    }

    fn import(&self, data: &[u8]) -> Result<usize, Error> {
        let certs = match X509::stack_from_pem(data) {
            Ok(certs) if !certs.is_empty() => certs,
            _ => vec![X509::from_der(data).map_err(|_| {
                Error::BadInput("no certificate found".to_owned())
            })?],
        };

        let mut imported = 0;
        for cert in &certs {
            if self.store_certificate(cert)? {
                imported += 1;
            }
        }
        Ok(imported)
    }

    fn export(&self, key: &str) -> Result<Vec<u8>, Error> {
        let (_, cert) = self.find_certificate(key)?;
        Ok(cert.to_pem()?)
    }

    fn generate_key(&self, _uid: &str) -> Result<String, Error> {
        Err(Error::Unsupported)
    }

    fn needs_passphrase(&self) -> bool {
        true
    }
}


#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::test_certs::self_signed;
    use super::*;

    struct Store {
        dir: TempDir,
        engine: OpensslSmime,
    }

    impl Store {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = SmimeConfig::default();
            config.keys = dir.path().join("keys");
            config.certificates = dir.path().join("certificates");
            config.ca_location = dir.path().join("ca.crt");
            fs::create_dir(&config.keys).unwrap();
            fs::create_dir(&config.certificates).unwrap();
            Store {
                engine: OpensslSmime::new(&config),
                dir,
            }
        }

        /// Add a certificate, with its private key if `secret`, trusting it
        /// as a CA if `trusted`.
        fn add(
            &self,
            file: &str,
            name: &str,
            email: &str,
            secret: bool,
            trusted: bool,
        ) {
            let (cert, pkey) = self_signed(name, email);
            let pem = cert.to_pem().unwrap();
            fs::write(self.dir.path().join("certificates").join(file), &pem)
                .unwrap();
            if secret {
                fs::write(
                    self.dir.path().join("keys").join(file),
                    pkey.private_key_to_pem_pkcs8().unwrap(),
                )
                .unwrap();
            }
            if trusted {
                let ca = self.dir.path().join("ca.crt");
                let mut all = fs::read(&ca).unwrap_or_default();
                all.extend_from_slice(&pem);
                fs::write(ca, all).unwrap();
            }
        }
    }

    #[test]
    fn listing() {
        let store = Store::new();
        store.add("aaaa.0", "Alice", "alice@example.com", true, false);
        store.add("bbbb.0", "Bob", "bob@example.com", false, false);
        fs::write(
            store.dir.path().join("certificates").join(".index"),
            "junk",
        )
        .unwrap();

        let all = store.engine.list_keys(&[], false).unwrap();
        assert_eq!(2, all.len());
        assert_eq!("aaaa.0", all[0].key_id);
        assert_eq!("Alice <alice@example.com>", all[0].user_ids[0].addr);
        assert!(all[0].is_secret());
        assert!(all[0].flags.contains(KeyFlags::ISX509));
        assert!(!all[1].is_secret());
        assert_eq!(2, store.engine.handles().live());
        drop(all);
        assert_eq!(0, store.engine.handles().live());

        let secret = store.engine.list_keys(&[], true).unwrap();
        assert_eq!(1, secret.len());
        let bob = store
            .engine
            .list_keys(&["BOB@example".to_owned()], false)
            .unwrap();
        assert_eq!(1, bob.len());
        assert_eq!("bbbb.0", bob[0].key_id);
    }

    #[test]
    fn sign_and_verify() {
        let store = Store::new();
        store.add("aaaa.0", "Alice", "alice@example.com", true, true);
        store.add("mmmm.0", "Mallory", "mallory@example.com", true, false);

        let data = b"Content-Type: text/plain\r\n\r\nhello\r\n";
        let signed = store.engine.sign(data, "aaaa.0", None).unwrap();
        assert_eq!("sha-256", signed.micalg);

        let v = store.engine.verify(&signed.signature, Some(data)).unwrap();
        assert_eq!(1, v.signatures.len());
        assert_eq!(SigStatus::Good, v.signatures[0].status);
        assert!(v.signatures[0].summary.contains(SigSummary::GREEN));
        assert_eq!(
            "Alice <alice@example.com>",
            v.signatures[0].signer.as_ref().unwrap().user_ids[0].addr
        );

        let v = store
            .engine
            .verify(&signed.signature, Some(b"tampered"))
            .unwrap();
        assert_eq!(SigStatus::Bad, v.signatures[0].status);

        // Intact, but not from a trusted certificate
        let signed = store.engine.sign(data, "mallory@example", None).unwrap();
        let v = store.engine.verify(&signed.signature, Some(data)).unwrap();
        assert_eq!(SigStatus::Good, v.signatures[0].status);
        assert!(!v.signatures[0].summary.contains(SigSummary::GREEN));
    }

    #[test]
    fn encrypt_and_decrypt() {
        let store = Store::new();
        store.add("aaaa.0", "Alice", "alice@example.com", true, false);

        let ciphertext = store
            .engine
            .encrypt(b"secret stuff", &["aaaa.0".to_owned()], None, None)
            .unwrap();
        let dec = store.engine.decrypt(&ciphertext, None).unwrap();
        assert_eq!(b"secret stuff".to_vec(), dec.plaintext);
        assert_eq!(vec!["aaaa.0".to_owned()], dec.recipients);

        assert_matches!(
            Err(Error::KeyNotFound(_)),
            store.engine.encrypt(b"x", &["nobody".to_owned()], None, None)
        );
    }

    #[test]
    fn opaque_signature_is_not_encrypted() {
        let store = Store::new();
        store.add("aaaa.0", "Alice", "alice@example.com", true, true);

        let (cert, pkey) = (
            store.engine.find_certificate("aaaa.0").unwrap().1,
            store.engine.private_key("aaaa.0", None).unwrap(),
        );
        let p7 = Pkcs7::sign(
            &cert,
            &pkey,
            &Stack::new().unwrap(),
            b"inner",
            Pkcs7Flags::BINARY,
        )
        .unwrap();
        let der = p7.to_der().unwrap();

        assert_matches!(
            Err(Error::NotActuallyEncrypted),
            store.engine.decrypt(&der, None)
        );
        let v = store.engine.verify(&der, None).unwrap();
        assert_eq!(Some(b"inner".to_vec()), v.plaintext);
    }

    #[test]
    fn import_and_export() {
        let store = Store::new();
        let (cert, _) = self_signed("Carol", "carol@example.com");
        let pem = cert.to_pem().unwrap();

        assert_eq!(1, store.engine.import(&pem).unwrap());
        assert_eq!(0, store.engine.import(&pem).unwrap());
        assert_eq!(pem, store.engine.export("carol@example.com").unwrap());
        assert_matches!(
            Err(Error::BadInput(_)),
            store.engine.import(b"garbage")
        );
        assert_matches!(
            Err(Error::Unsupported),
            store.engine.generate_key("x")
        );
    }
}
