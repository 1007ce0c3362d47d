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

//! Security decisions made while a message is being composed.
//!
//! The flags of the message under composition are recomputed whenever the
//! recipients or the security settings change. Opportunistic encryption is
//! considered first, then the Autocrypt recommendation; explicit ENCRYPT,
//! SIGN or S/MIME always win over Autocrypt.

use log::{debug, warn};

use crate::autocrypt::Recommendation;
use crate::crypt::flags::SecurityFlags;
use crate::crypt::Crypt;
use crate::mime::model::*;

mod menu;

pub use self::menu::*;

/// A message under composition.
#[derive(Clone, Debug)]
pub struct ComposeState {
    pub email: Email,
    /// The last Autocrypt recommendation, for display.
    pub recommendation: Recommendation,
    /// OPPENCRYPT was set when Autocrypt took over the message; restored
    /// once Autocrypt no longer applies so opportunistic encryption can
    /// reconsider.
    oppenc_parked: bool,
}

impl ComposeState {
    pub fn new(email: Email) -> Self {
        ComposeState {
            email,
            recommendation: Recommendation::Off,
            oppenc_parked: false,
        }
    }

    /// Apply `f` to the envelope, then recompute the security flags.
    pub fn edit_envelope(
        &mut self,
        crypt: &Crypt,
        f: impl FnOnce(&mut Envelope),
    ) {
        f(&mut self.email.env);
        update_crypt_info(crypt, self);
    }
}

/// Recompute the security flags of `state` after a change to its recipients
/// or flags.
pub fn update_crypt_info(crypt: &Crypt, state: &mut ComposeState) {
    if state.oppenc_parked {
        state.email.security.insert(SecurityFlags::OPPENCRYPT);
        state.oppenc_parked = false;
    }

    if crypt.config.crypt.opportunistic_encrypt {
        crypt.opportunistic_encrypt(&mut state.email);
    }

    let ac = match crypt.autocrypt.as_ref() {
        Some(ac) => ac,
        None => return,
    };

    state.recommendation = match ac.ui_recommendation(&state.email) {
        Ok((rec, _)) => rec,
        Err(e) => {
            warn!("Autocrypt recommendation failed: {}", e);
            Recommendation::Off
        }
    };

    let (security, parked) =
        resolve_autocrypt(state.email.security, state.recommendation);
    if security != state.email.security {
        debug!(
            "Security flags {:?} -> {:?} ({:?})",
            state.email.security, security, state.recommendation
        );
    }
    state.email.security = security;
    state.oppenc_parked = parked;
}

/// Combine the current flags with an Autocrypt recommendation.
///
/// Returns the new flags and whether OPPENCRYPT was taken off because
/// Autocrypt is now in charge.
pub fn resolve_autocrypt(
    mut security: SecurityFlags,
    rec: Recommendation,
) -> (SecurityFlags, bool) {
    if security.intersects(
        SecurityFlags::ENCRYPT
            | SecurityFlags::SIGN
            | SecurityFlags::APPLICATION_SMIME,
    ) {
        security.remove(
            SecurityFlags::AUTOCRYPT | SecurityFlags::AUTOCRYPT_OVERRIDE,
        );
        return (security, false);
    }

    if security.contains(SecurityFlags::AUTOCRYPT_OVERRIDE) {
        return (security, false);
    }

    if Recommendation::Yes != rec {
        security.remove(SecurityFlags::AUTOCRYPT);
        return (security, false);
    }

    security.insert(SecurityFlags::AUTOCRYPT | SecurityFlags::APPLICATION_PGP);
    security.remove(SecurityFlags::INLINE | SecurityFlags::APPLICATION_SMIME);
    let parked = security.contains(SecurityFlags::OPPENCRYPT);
    security.remove(SecurityFlags::OPPENCRYPT);
    (security, parked)
}

/// The initial security flags of a new message.
///
/// `replying_to` is the flags of the message being replied to, if any.
pub fn default_security(
    crypt: &Crypt,
    replying_to: Option<SecurityFlags>,
) -> SecurityFlags {
    let config = &crypt.config;
    let cur = replying_to.unwrap_or_else(SecurityFlags::empty);
    let mut security = SecurityFlags::empty();

    if crypt.autocrypt.is_some()
        && config.autocrypt.reply
        && cur.contains(SecurityFlags::AUTOCRYPT)
    {
        security |= SecurityFlags::AUTOCRYPT
            | SecurityFlags::AUTOCRYPT_OVERRIDE
            | SecurityFlags::APPLICATION_PGP;
    } else {
        let c = &config.crypt;
        if c.auto_sign
            || (c.reply_sign && cur.contains(SecurityFlags::SIGN))
            || (c.reply_sign_encrypted && cur.contains(SecurityFlags::ENCRYPT))
        {
            security |= SecurityFlags::SIGN;
        }
        if c.auto_encrypt
            || (c.reply_encrypt && cur.contains(SecurityFlags::ENCRYPT))
        {
            security |= SecurityFlags::ENCRYPT;
        }
        if config.pgp.auto_inline
            && (security
                .intersects(SecurityFlags::ENCRYPT | SecurityFlags::SIGN)
                || c.opportunistic_encrypt)
        {
            security |= SecurityFlags::INLINE;
        }
    }

    let c = &config.crypt;
    if !security.is_empty() || c.opportunistic_encrypt {
        if c.auto_pgp && cur.contains(SecurityFlags::APPLICATION_PGP) {
            security |= SecurityFlags::APPLICATION_PGP;
        } else if c.auto_smime && cur.contains(SecurityFlags::APPLICATION_SMIME)
        {
            security |= SecurityFlags::APPLICATION_SMIME;
        }

        if !security.intersects(
            SecurityFlags::APPLICATION_PGP | SecurityFlags::APPLICATION_SMIME,
        ) {
            if c.auto_smime && config.smime.is_default {
                security |= SecurityFlags::APPLICATION_SMIME;
            } else if c.auto_pgp {
                security |= SecurityFlags::APPLICATION_PGP;
            } else if c.auto_smime {
                security |= SecurityFlags::APPLICATION_SMIME;
            }
        }
    }

    if c.opportunistic_encrypt
        && !security
            .intersects(SecurityFlags::ENCRYPT | SecurityFlags::AUTOCRYPT)
    {
        security |= SecurityFlags::OPPENCRYPT;
    }

    if !security.intersects(
        SecurityFlags::APPLICATION_PGP | SecurityFlags::APPLICATION_SMIME,
    ) {
        return SecurityFlags::empty();
    }
    security
}
