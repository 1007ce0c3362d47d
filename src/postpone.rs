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

//! Security settings saved with postponed drafts.
//!
//! A draft records its security flags in a `Mutt-PGP:` or `Mutt-SMIME:`
//! header as a string of letters:
//!
//! - `E` encrypt
//! - `S` sign, optionally `S<keyid>` to sign as a particular key
//! - `I` inline PGP
//! - `O` opportunistic encryption
//! - `A` Autocrypt, `Z` Autocrypt choice made explicitly
//! - `C<alg>` S/MIME cipher
//! - `M<micalg>` is accepted and ignored
//!
//! `Mutt-Fcc:`, `Mutt-References:` and `Mutt-Mix:` carry the rest of the
//! draft's state. Every header is also accepted with an `X-` prefix.

use log::{info, warn};

use crate::crypt::flags::SecurityFlags;
use crate::crypt::Crypt;
use crate::mime::model::*;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CryptHeader {
    /// Includes the scheme the header was for.
    pub flags: SecurityFlags,
    pub sign_as: Option<String>,
    pub cipher: Option<String>,
}

/// Take the `<...>` argument at the start of `rest`, if any.
///
/// Returns `Err(())` if the argument is not terminated.
fn take_arg<'a>(rest: &mut &'a str) -> Result<Option<&'a str>, ()> {
    let after = match rest.strip_prefix('<') {
        Some(after) => after,
        None => return Ok(None),
    };
    let end = after.find('>').ok_or(())?;
    *rest = &after[end + 1..];
    Ok(Some(&after[..end]))
}

/// Parse the value of a draft crypt header written for the scheme `app`.
///
/// A bare `S` yields an empty `sign_as` when `set_empty_signas` is set, and
/// no `sign_as` otherwise. Returns `None` if the value is malformed.
pub fn parse_crypt_hdr(
    value: &str,
    set_empty_signas: bool,
    app: SecurityFlags,
) -> Option<CryptHeader> {
    let mut hdr = CryptHeader {
        flags: app,
        ..CryptHeader::default()
    };

    let mut rest = value;
    while let Some(c) = rest.chars().next() {
        rest = &rest[c.len_utf8()..];
        match c.to_ascii_lowercase() {
            ' ' | '\t' | '\r' | '\n' => (),
            'c' => {
                if let Some(alg) = take_arg(&mut rest).ok()? {
                    hdr.cipher = Some(alg.to_owned());
                }
            }
            'e' => hdr.flags |= SecurityFlags::ENCRYPT,
            'i' => hdr.flags |= SecurityFlags::INLINE,
            'm' => {
                take_arg(&mut rest).ok()?;
            }
            'o' => hdr.flags |= SecurityFlags::OPPENCRYPT,
            'a' => hdr.flags |= SecurityFlags::AUTOCRYPT,
            'z' => hdr.flags |= SecurityFlags::AUTOCRYPT_OVERRIDE,
            's' => {
                hdr.flags |= SecurityFlags::SIGN;
                match take_arg(&mut rest).ok()? {
                    Some(key) if !key.is_empty() => {
                        hdr.sign_as = Some(key.to_owned())
                    }
                    _ if set_empty_signas => hdr.sign_as = Some(String::new()),
                    _ => (),
                }
            }
            _ => return None,
        }
    }

    Some(hdr)
}

/// The value of the crypt header saving `flags`.
///
/// `cipher` is only written for S/MIME encryption.
pub fn format_crypt_hdr(
    flags: SecurityFlags,
    sign_as: &str,
    cipher: &str,
) -> String {
    let mut out = String::new();
    if flags.contains(SecurityFlags::ENCRYPT) {
        out.push('E');
        let smime = flags.contains(SecurityFlags::APPLICATION_SMIME);
        if smime && !cipher.is_empty() {
            out.push_str(&format!("C<{}>", cipher));
        }
    }
    if flags.contains(SecurityFlags::OPPENCRYPT) {
        out.push('O');
    }
    if flags.contains(SecurityFlags::SIGN) {
        out.push('S');
        if !sign_as.is_empty() {
            out.push_str(&format!("<{}>", sign_as));
        }
    }
    if flags.contains(SecurityFlags::INLINE) {
        out.push('I');
    }
    if flags.contains(SecurityFlags::APPLICATION_PGP) {
        if flags.contains(SecurityFlags::AUTOCRYPT) {
            out.push('A');
        }
        if flags.contains(SecurityFlags::AUTOCRYPT_OVERRIDE) {
            out.push('Z');
        }
    }
    out
}

/// State recovered from the special headers of a draft.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Recalled {
    /// `Some("")` means the draft asked for no Fcc at all.
    pub fcc: Option<String>,
    /// Message-ID of the message the draft replies to.
    pub references: Option<String>,
    pub mix_chain: Vec<String>,
    pub crypt: Option<CryptHeader>,
}

fn header_is(name: &str, base: &str) -> bool {
    name.eq_ignore_ascii_case(base)
        || (name.len() == base.len() + 2
            && name[..2].eq_ignore_ascii_case("x-")
            && name[2..].eq_ignore_ascii_case(base))
}

/// Extract the draft headers from `userhdrs`, removing them.
pub fn recall_headers(userhdrs: &mut Vec<(String, String)>) -> Recalled {
    let mut recalled = Recalled::default();

    userhdrs.retain(|(name, value)| {
        let value = value.trim();
        if header_is(name, "Mutt-References") {
            recalled.references = Some(value.to_owned());
        } else if header_is(name, "Mutt-Fcc") {
            recalled.fcc = Some(value.to_owned());
        } else if header_is(name, "Mutt-Mix") {
            recalled.mix_chain =
                value.split_whitespace().map(str::to_owned).collect();
        } else if header_is(name, "Mutt-PGP")
            || name.eq_ignore_ascii_case("Pgp")
        {
            recalled.crypt =
                Some(parse_or_warn(value, SecurityFlags::APPLICATION_PGP));
        } else if header_is(name, "Mutt-SMIME") {
            recalled.crypt =
                Some(parse_or_warn(value, SecurityFlags::APPLICATION_SMIME));
        } else {
            return true;
        }
        false
    });

    recalled
}

fn parse_or_warn(value: &str, app: SecurityFlags) -> CryptHeader {
    parse_crypt_hdr(value, true, app).unwrap_or_else(|| {
        warn!("Illegal crypto header: {}", value);
        CryptHeader {
            flags: app,
            ..CryptHeader::default()
        }
    })
}

/// Recover the draft state of `email`, which has just been read back from
/// the postponed folder.
///
/// The security flags go onto `email`; the signing key and S/MIME cipher
/// go into the configuration of `crypt`.
pub fn recall_draft(crypt: &mut Crypt, email: &mut Email) -> Recalled {
    let recalled = recall_headers(&mut email.env.userhdrs);

    if let Some(ref hdr) = recalled.crypt {
        email.security = hdr.flags;
        let smime = hdr.flags.contains(SecurityFlags::APPLICATION_SMIME);
        if let Some(ref cipher) = hdr.cipher {
            if smime {
                crypt.config.smime.encrypt_with = cipher.clone();
            }
        }
        if let Some(ref sign_as) = hdr.sign_as {
            if smime {
                crypt.config.smime.sign_as = sign_as.clone();
            } else {
                crypt.config.pgp.sign_as = sign_as.clone();
            }
        }
        info!("Recalled draft security {:?}", email.security);
    }

    if crypt.config.crypt.opportunistic_encrypt {
        crypt.opportunistic_encrypt(email);
    }
    recalled
}

/// The headers saving the state of `email` as a draft.
pub fn draft_headers(
    crypt: &Crypt,
    email: &Email,
    fcc: Option<&str>,
    in_reply_to: Option<&str>,
) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    if let Some(msgid) = in_reply_to {
        headers.push(("Mutt-References".to_owned(), msgid.to_owned()));
    }
    if let Some(fcc) = fcc {
        headers.push(("Mutt-Fcc".to_owned(), fcc.to_owned()));
    }

    let security = email.security;
    if security.contains(SecurityFlags::APPLICATION_PGP) {
        headers.push((
            "Mutt-PGP".to_owned(),
            format_crypt_hdr(security, &crypt.config.pgp.sign_as, ""),
        ));
    } else if security.contains(SecurityFlags::APPLICATION_SMIME) {
        headers.push((
            "Mutt-SMIME".to_owned(),
            format_crypt_hdr(
                security,
                &crypt.config.smime.sign_as,
                &crypt.config.smime.encrypt_with,
            ),
        ));
    }
    headers
}
