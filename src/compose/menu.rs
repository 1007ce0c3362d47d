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

//! The security menus of the compose screen, and the summary it shows.

use super::{update_crypt_info, ComposeState};
use crate::autocrypt::Recommendation;
use crate::crypt::backend::Scheme;
use crate::crypt::flags::SecurityFlags;
use crate::crypt::Crypt;

/// Switch `state` to `scheme` and run that backend's send menu.
///
/// Returns whether the security flags changed.
pub fn scheme_menu(
    crypt: &Crypt,
    state: &mut ComposeState,
    scheme: Scheme,
) -> bool {
    let old = state.email.security;
    let (this, other, question) = match scheme {
        Scheme::Pgp => (
            SecurityFlags::APPLICATION_PGP,
            SecurityFlags::APPLICATION_SMIME,
            "S/MIME already selected. Clear and continue?",
        ),
        Scheme::Smime => (
            SecurityFlags::APPLICATION_SMIME,
            SecurityFlags::APPLICATION_PGP,
            "PGP already selected. Clear and continue?",
        ),
    };

    if !crypt.has_backend(scheme) {
        crypt.prompt.error(match scheme {
            Scheme::Pgp => "No PGP backend configured",
            Scheme::Smime => "No S/MIME backend configured",
        });
        return false;
    }

    if state.email.security.contains(other) {
        if state
            .email
            .security
            .intersects(SecurityFlags::ENCRYPT | SecurityFlags::SIGN)
        {
            if Some(true) != crypt.prompt.yes_or_no(question, true) {
                return false;
            }
            state
                .email
                .security
                .remove(SecurityFlags::ENCRYPT | SecurityFlags::SIGN);
        }
        state.email.security.remove(other);
        state.email.security.insert(this);
        update_crypt_info(crypt, state);
    }

    state.email.security = crypt.send_menu(scheme, &mut state.email);
    update_crypt_info(crypt, state);
    old != state.email.security
}

/// Let the user force Autocrypt encryption on or off, or leave it to the
/// recommendation.
///
/// Returns whether the security flags changed.
pub fn autocrypt_menu(crypt: &Crypt, state: &mut ComposeState) -> bool {
    if crypt.autocrypt.is_none() {
        crypt.prompt.error("Autocrypt is not available");
        return false;
    }

    let old = state.email.security;
    let security = &mut state.email.security;
    security.insert(SecurityFlags::APPLICATION_PGP);

    match crypt
        .prompt
        .multi_choice("Autocrypt: (e)ncrypt, (c)lear, (a)utomatic?", "eca")
    {
        Some('e') => {
            security.insert(
                SecurityFlags::AUTOCRYPT | SecurityFlags::AUTOCRYPT_OVERRIDE,
            );
            security.remove(
                SecurityFlags::ENCRYPT
                    | SecurityFlags::SIGN
                    | SecurityFlags::OPPENCRYPT
                    | SecurityFlags::INLINE,
            );
        }
        Some('c') => {
            security.remove(SecurityFlags::AUTOCRYPT);
            security.insert(SecurityFlags::AUTOCRYPT_OVERRIDE);
        }
        Some('a') => {
            security.remove(SecurityFlags::AUTOCRYPT_OVERRIDE);
            if crypt.config.crypt.opportunistic_encrypt {
                security.insert(SecurityFlags::OPPENCRYPT);
            }
        }
        _ => (),
    }

    update_crypt_info(crypt, state);
    old != state.email.security
}

fn recommendation_label(rec: Recommendation) -> &'static str {
    match rec {
        Recommendation::Off => "Off",
        Recommendation::No => "No",
        Recommendation::Discourage => "Discouraged",
        Recommendation::Available => "Available",
        Recommendation::Yes => "Yes",
    }
}

/// The security lines of the compose screen.
pub fn security_summary(crypt: &Crypt, state: &ComposeState) -> Vec<String> {
    let security = state.email.security;
    let config = &crypt.config;
    let mut lines = Vec::new();

    let crypto = SecurityFlags::ENCRYPT | SecurityFlags::SIGN;
    let mut line = "Security: ".to_owned();
    line.push_str(if security.contains(crypto) {
        "Sign, Encrypt"
    } else if security.contains(SecurityFlags::ENCRYPT) {
        "Encrypt"
    } else if security.contains(SecurityFlags::SIGN) {
        "Sign"
    } else {
        "None"
    });

    if security.intersects(crypto) {
        if security.contains(SecurityFlags::APPLICATION_PGP) {
            line.push_str(if security.contains(SecurityFlags::INLINE) {
                " (inline PGP)"
            } else {
                " (PGP/MIME)"
            });
        } else if security.contains(SecurityFlags::APPLICATION_SMIME) {
            line.push_str(" (S/MIME)");
        }
    }
    if config.crypt.opportunistic_encrypt
        && security.contains(SecurityFlags::OPPENCRYPT)
    {
        line.push_str(" (OppEnc mode)");
    }
    lines.push(line);

    if security.contains(SecurityFlags::SIGN) {
        let sign_as = if security.contains(SecurityFlags::APPLICATION_PGP) {
            Some(&config.pgp.sign_as)
        } else if security.contains(SecurityFlags::APPLICATION_SMIME) {
            Some(&config.smime.sign_as)
        } else {
            None
        };
        if let Some(sign_as) = sign_as {
            let sign_as = if sign_as.is_empty() {
                "<default>"
            } else {
                sign_as.as_str()
            };
            lines.push(format!(" Sign as: {}", sign_as));
        }
    }

    if security.contains(SecurityFlags::SMIME_ENCRYPT)
        && !config.smime.encrypt_with.is_empty()
    {
        lines.push(format!("Encrypt with: {}", config.smime.encrypt_with));
    }

    if crypt.autocrypt.is_some() {
        lines.push(format!(
            "Autocrypt: {}    Recommendation: {}",
            if security.contains(SecurityFlags::AUTOCRYPT) {
                "Encrypt"
            } else {
                "Off"
            },
            recommendation_label(state.recommendation)
        ));
    }

    lines
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::autocrypt::test_support::Fixture;
    use crate::crypt::test_support::{bare_crypt, Canned};
    use crate::mime::model::*;
    use crate::support::prompt::test_prompt::Scripted;

    fn state(security: SecurityFlags) -> ComposeState {
        let mut email = Email::new(Envelope::default(), Body::default());
        email.env.from = vec![Address::new("me@example.com")];
        email.env.to = vec![Address::new("alice@example.com")];
        email.security = security;
        ComposeState::new(email)
    }

    #[test]
    fn switching_schemes_asks_first() {
        let mut crypt = bare_crypt(Scripted::default().answer("n"));
        crypt.register(Box::new(Canned::default()));

        let mut st = state(SecurityFlags::SMIME_SIGN);
        assert!(!scheme_menu(&crypt, &mut st, Scheme::Pgp));
        assert_eq!(SecurityFlags::SMIME_SIGN, st.email.security);

        // Defaults to yes
        assert!(scheme_menu(&crypt, &mut st, Scheme::Pgp));
        assert_eq!(SecurityFlags::APPLICATION_PGP, st.email.security);

        // Nothing to lose, nothing asked
        let mut st = state(SecurityFlags::APPLICATION_SMIME);
        assert!(scheme_menu(&crypt, &mut st, Scheme::Pgp));
        assert_eq!(SecurityFlags::APPLICATION_PGP, st.email.security);
    }

    #[test]
    fn missing_backend() {
        let crypt = bare_crypt(Scripted::default());
        let mut st = state(SecurityFlags::empty());
        assert!(!scheme_menu(&crypt, &mut st, Scheme::Smime));
        assert!(!autocrypt_menu(&crypt, &mut st));
    }

    #[test]
    fn autocrypt_choices() {
        let fx = Fixture::new(
            Scripted::default().answer("e").answer("c").answer("a"),
        );
        fx.account("me@example.com", true);

        let mut st = state(SecurityFlags::PGP_SIGN | SecurityFlags::INLINE);
        assert!(autocrypt_menu(&fx.crypt, &mut st));
        assert_eq!(
            SecurityFlags::AUTOCRYPT
                | SecurityFlags::AUTOCRYPT_OVERRIDE
                | SecurityFlags::APPLICATION_PGP,
            st.email.security
        );
        // alice has no key, but the choice is forced
        assert_eq!(Recommendation::No, st.recommendation);

        assert!(autocrypt_menu(&fx.crypt, &mut st));
        assert_eq!(
            SecurityFlags::AUTOCRYPT_OVERRIDE | SecurityFlags::APPLICATION_PGP,
            st.email.security
        );

        assert!(autocrypt_menu(&fx.crypt, &mut st));
        assert_eq!(SecurityFlags::APPLICATION_PGP, st.email.security);
    }

    #[test]
    fn summary_lines() {
        let mut crypt = bare_crypt(Scripted::default());
        crypt.config.pgp.sign_as = "0x1234".to_owned();

        let st = state(SecurityFlags::PGP_SIGN | SecurityFlags::ENCRYPT);
        assert_eq!(
            vec![
                "Security: Sign, Encrypt (PGP/MIME)".to_owned(),
                " Sign as: 0x1234".to_owned(),
            ],
            security_summary(&crypt, &st)
        );

        let st = state(SecurityFlags::SMIME_ENCRYPT);
        assert_eq!(
            vec![
                "Security: Encrypt (S/MIME)".to_owned(),
                "Encrypt with: aes256".to_owned(),
            ],
            security_summary(&crypt, &st)
        );

        let fx = Fixture::new(Scripted::default());
        let st = state(SecurityFlags::AUTOCRYPT);
        assert_eq!(
            vec![
                "Security: None".to_owned(),
                "Autocrypt: Encrypt    Recommendation: Off".to_owned(),
            ],
            security_summary(&fx.crypt, &st)
        );
    }
}
