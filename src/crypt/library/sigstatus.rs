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

//! Human-readable reports of signature verification results.

use std::rc::Rc;

use chrono::prelude::*;

use super::engine::*;
use super::LibraryBackend;
use crate::crypt::flags::KeyFlags;
use crate::crypt::key::{KeyInfo, Validity};
use crate::mime::state::{State, StateFlags};
use crate::support::error::Error;

fn print_time(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%c").to_string()
}

fn pad(msg: &str, label: &str) -> String {
    let width = (msg.chars().count() + 1).saturating_sub(label.len());
    format!("{:width$}{}", "", label, width = width)
}

/// `fpr` the way users compare fingerprints: OpenPGP v4 fingerprints in
/// groups of four hex digits, anything else as pairs.
pub fn format_fingerprint(fpr: &str, pgp: bool) -> String {
    let mut out = String::from("Fingerprint: ");
    if !fpr.is_ascii() {
        out.push_str(fpr);
        out.push('\n');
        return out;
    }

    let mut pos = 0;
    if pgp && 40 == fpr.len() {
        let mut i = 0;
        while fpr.len() - pos > 4 {
            out.push_str(&fpr[pos..pos + 4]);
            out.push(' ');
            if 4 == i {
                out.push(' ');
            }
            pos += 4;
            i += 1;
        }
    } else {
        let mut i = 0;
        while fpr.len() - pos > 2 {
            out.push_str(&fpr[pos..pos + 2]);
            out.push(if pgp { ' ' } else { ':' });
            if pgp && 7 == i {
                out.push(' ');
            }
            pos += 2;
            i += 1;
        }
    }
    out.push_str(&fpr[pos..]);
    out.push('\n');
    out
}

impl LibraryBackend {
    /// Report one signature. Returns 1 if it is bad, 2 if it is good but
    /// came with warnings, and 0 if it is good.
    pub(super) fn show_one_sig_status(
        &self,
        sig: &Signature,
        state: &mut State,
    ) -> i32 {
        let mut anybad = SigStatus::Good != sig.status;
        let mut anywarn = false;

        let key: Result<Option<Rc<KeyInfo>>, Error> =
            if SigStatus::NoPublicKey == sig.status {
                Ok(None)
            } else if let Some(ref signer) = sig.signer {
                Ok(Some(Rc::clone(signer)))
            } else {
                self.engine.get_key(&sig.fpr, false).and_then(|k| {
                    k.map(Some)
                        .ok_or_else(|| Error::KeyNotFound(sig.fpr.clone()))
                })
            };
        if let Ok(Some(ref key)) = key {
            let mut remembered = self.signature_key.borrow_mut();
            if remembered.is_none() {
                *remembered = Some(Rc::clone(key));
            }
        }

        if !state.has(StateFlags::DISPLAY) {
            // Nowhere to say anything
        } else if let Err(ref e) = key {
            state.puts(&format!(
                "Error getting key information for KeyID {}: {}\n",
                sig.fpr, e
            ));
            anybad = true;
        } else {
            let key = key.as_ref().ok().and_then(Option::as_deref);
            if sig.summary.contains(SigSummary::GREEN) {
                self.print_keyinfo("Good signature from:", sig, key, state);
                anywarn |= self.show_sig_summary(sig, key, state);
                self.show_one_sig_validity(sig, state);
            } else if sig.summary.contains(SigSummary::RED) {
                self.print_keyinfo("*BAD* signature from:", sig, key, state);
                self.show_sig_summary(sig, key, state);
            } else if let (false, Some(k), Protocol::OpenPgp) =
                (anybad, key, self.engine.protocol())
            {
                // Undecided, but a PGP user expects name, validity and
                // fingerprint
                self.print_keyinfo("Good signature from:", sig, key, state);
                self.show_one_sig_validity(sig, state);
                if let Some(ref fpr) = k.fingerprint {
                    state.puts(&format_fingerprint(fpr, true));
                }
                anywarn |= self.show_sig_summary(sig, key, state);
            } else {
                self.print_keyinfo("Problem signature from:", sig, key, state);
                if let Some(exp) = sig.exp_timestamp {
                    state.puts(&format!(
                        "               expires: {}\n",
                        print_time(exp)
                    ));
                }
                self.show_sig_summary(sig, key, state);
                anywarn = true;
            }
        }

        if anybad {
            1
        } else if anywarn {
            2
        } else {
            0
        }
    }

    /// Write the warnings the summary of `sig` calls for. Returns whether
    /// any of them is severe.
    fn show_sig_summary(
        &self,
        sig: &Signature,
        key: Option<&KeyInfo>,
        state: &mut State,
    ) -> bool {
        if key.is_none() {
            return true;
        }
        let sum = sig.summary;
        let mut severe = false;

        if sum.contains(SigSummary::KEY_REVOKED) {
            state.puts("Warning: One of the keys has been revoked\n");
            severe = true;
        }
        if sum.contains(SigSummary::KEY_EXPIRED) {
            state.puts(
                "Warning: At least one certification key has expired\n",
            );
        }
        if sum.contains(SigSummary::SIG_EXPIRED) {
            let at = sig.exp_timestamp.map(print_time).unwrap_or_default();
            state.puts(&format!(
                "Warning: The signature expired at: {}\n",
                at
            ));
        }
        if sum.contains(SigSummary::KEY_MISSING) {
            state.puts("Can't verify due to a missing key or certificate\n");
        }
        if sum.contains(SigSummary::CRL_MISSING) {
            state.puts("The CRL is not available\n");
            severe = true;
        }
        if sum.contains(SigSummary::CRL_TOO_OLD) {
            state.puts("Available CRL is too old\n");
            severe = true;
        }
        if sum.contains(SigSummary::BAD_POLICY) {
            state.puts("A policy requirement was not met\n");
        }
        if sum.contains(SigSummary::SYS_ERROR) {
            state.puts("A system error occurred");
            if sig.wrong_key_usage {
                state.puts(": Wrong_Key_Usage");
            }
            state.puts("\n");
        }

        match sig.pka {
            Some(Pka::Mismatch(ref addr)) => state.puts(&format!(
                "WARNING: PKA entry does not match signer's address: {}\n",
                addr
            )),
            Some(Pka::Verified(ref addr)) => state
                .puts(&format!("PKA verified signer's address is: {}\n", addr)),
            None => (),
        }

        severe
    }

    fn show_one_sig_validity(&self, sig: &Signature, state: &mut State) {
        let warning = match sig.validity {
            Some(Validity::Unknown) => {
                "WARNING: We have NO indication whether the key belongs to \
                 the person named as shown above\n"
            }
            Some(Validity::Never) => {
                "WARNING: The key does NOT BELONG to the person named as \
                 shown above\n"
            }
            Some(Validity::Marginal) => {
                "WARNING: It is NOT certain that the key belongs to the \
                 person named as shown above\n"
            }
            _ => return,
        };
        state.puts(warning);
    }

    /// `msg`, then who made `sig` and when.
    fn print_keyinfo(
        &self,
        msg: &str,
        sig: &Signature,
        key: Option<&KeyInfo>,
        state: &mut State,
    ) {
        state.puts(msg);
        state.puts(" ");

        match key {
            Some(key) => {
                let mut aka = false;
                for uid in &key.user_ids {
                    if uid.flags.contains(KeyFlags::REVOKED) {
                        continue;
                    }
                    if aka {
                        state.puts(&pad(msg, "aka: "));
                    }
                    state.puts(&uid.addr);
                    state.puts("\n");
                    aka = true;
                }
            }
            None => {
                if sig.fpr.is_empty() {
                    state.puts("no signature fingerprint available");
                } else {
                    state.puts("KeyID ");
                    state.puts(&sig.fpr);
                }
                state.puts("\n");
            }
        }

        if let Some(ts) = sig.timestamp {
            state.puts(&pad(msg, "created: "));
            state.puts(&print_time(ts));
            state.puts("\n");
        }
    }

    /// The notations of good signatures.
    pub(super) fn show_notations(
        &self,
        signatures: &[Signature],
        state: &mut State,
    ) {
        for sig in signatures {
            if sig.notations.is_empty() {
                continue;
            }
            state.puts(&format!(
                "*** Begin Notation (signature by: {}) ***\n",
                sig.fpr
            ));
            for (name, value) in &sig.notations {
                if !name.is_empty() {
                    state.puts(name);
                    state.puts("=");
                }
                state.puts(value);
                if !value.ends_with('\n') {
                    state.puts("\n");
                }
            }
            state.puts("*** End Notation ***\n");
        }
    }

    /// Show every signature in a block, returning whether all were good and
    /// whether any came with warnings.
    pub(super) fn show_signatures(
        &self,
        signatures: &[Signature],
        state: &mut State,
    ) -> (bool, bool) {
        let mut anybad = false;
        let mut anywarn = false;
        for sig in signatures {
            match self.show_one_sig_status(sig, state) {
                1 => anybad = true,
                2 => anywarn = true,
                _ => (),
            }
        }
        (!anybad && !signatures.is_empty(), anywarn)
    }
}

#[cfg(test)]
mod test {
    use super::super::test::*;
    use super::*;
    use crate::crypt::key::UserId;
    use crate::support::prompt::test_prompt::Scripted;

    fn display() -> State {
        State::new(Rc::from(&b""[..]), StateFlags::DISPLAY)
    }

    #[test]
    fn fingerprint_layout() {
        assert_eq!(
            "Fingerprint: AAAA BBBB CCCC DDDD EEEE  FFFF 0123 4567 89AB CDEF\n",
            format_fingerprint("AAAABBBBCCCCDDDDEEEEFFFF0123456789ABCDEF", true)
        );
        assert_eq!(
            "Fingerprint: 01:23:45:67:89\n",
            format_fingerprint("0123456789", false)
        );
        assert_eq!(
            "Fingerprint: 00 11 22 33 44 55 66 77  88 99 AA BB CC DD EE FF\n",
            format_fingerprint("00112233445566778899AABBCCDDEEFF", true)
        );
    }

    #[test]
    fn good_signature() {
        let fx = Fixture::pgp(Scripted::default());
        let fpr =
            fx.engine.add_key("Alice <alice@example.com>", Validity::Full);
        let mut sig = Signature::new(fpr, SigStatus::Good);
        sig.summary = SigSummary::GREEN | SigSummary::VALID;
        sig.validity = Some(Validity::Full);

        let mut state = display();
        assert_eq!(0, fx.backend.show_one_sig_status(&sig, &mut state));
        assert_eq!(
            "Good signature from: Alice <alice@example.com>\n",
            state.output_text()
        );
        assert!(fx.backend.signature_key.borrow().is_some());
    }

    #[test]
    fn undecided_pgp_signature() {
        let fx = Fixture::pgp(Scripted::default());
        let fpr = fx.engine.add_key("Bob <bob@example.com>", Validity::Unknown);
        let mut sig = Signature::new(fpr.clone(), SigStatus::Good);
        sig.validity = Some(Validity::Marginal);

        let mut state = display();
        assert_eq!(0, fx.backend.show_one_sig_status(&sig, &mut state));
        assert_eq!(
            format!(
                "Good signature from: Bob <bob@example.com>\n\
                 WARNING: It is NOT certain that the key belongs to the \
                 person named as shown above\n\
                 {}",
                format_fingerprint(&fpr, true)
            ),
            state.output_text()
        );
    }

    #[test]
    fn bad_and_missing() {
        let fx = Fixture::pgp(Scripted::default());
        let fpr = fx.engine.add_key("Bob <bob@example.com>", Validity::Full);
        let mut bad = Signature::new(fpr, SigStatus::Bad);
        bad.summary = SigSummary::RED;
        let mut state = display();
        assert_eq!(1, fx.backend.show_one_sig_status(&bad, &mut state));
        assert_eq!(
            "*BAD* signature from: Bob <bob@example.com>\n",
            state.output_text()
        );

        let mut missing = Signature::new("0123ABCD", SigStatus::NoPublicKey);
        missing.summary = SigSummary::KEY_MISSING;
        let mut state = display();
        assert_eq!(1, fx.backend.show_one_sig_status(&missing, &mut state));
        assert_eq!(
            "Problem signature from: KeyID 0123ABCD\n",
            state.output_text()
        );

        let unknown = Signature::new("FFFF0000", SigStatus::Good);
        let mut state = display();
        assert_eq!(1, fx.backend.show_one_sig_status(&unknown, &mut state));
        assert!(state
            .output_text()
            .starts_with("Error getting key information for KeyID FFFF0000"));
    }

    #[test]
    fn summary_warnings() {
        let fx = Fixture::pgp(Scripted::default());
        let key = KeyInfo {
            key_id: "0123456789ABCDEF".to_owned(),
            user_ids: vec![
                UserId::new("Carol <carol@example.com>", Validity::Full),
                UserId::new("Carol <carol@work.example>", Validity::Full),
            ],
            ..KeyInfo::default()
        };
        let mut sig = Signature::new("0123456789ABCDEF", SigStatus::Good);
        sig.summary = SigSummary::GREEN
            | SigSummary::KEY_REVOKED
            | SigSummary::SYS_ERROR;
        sig.wrong_key_usage = true;
        sig.pka = Some(Pka::Mismatch("eve@example.com".to_owned()));
        sig.signer = Some(Rc::new(key));

        let mut state = display();
        assert_eq!(2, fx.backend.show_one_sig_status(&sig, &mut state));
        assert_eq!(
            "Good signature from: Carol <carol@example.com>\n\
             \x20               aka: Carol <carol@work.example>\n\
             Warning: One of the keys has been revoked\n\
             A system error occurred: Wrong_Key_Usage\n\
             WARNING: PKA entry does not match signer's address: \
             eve@example.com\n",
            state.output_text()
        );
    }

    #[test]
    fn notations() {
        let fx = Fixture::pgp(Scripted::default());
        let mut sig = Signature::new("AAAA", SigStatus::Good);
        sig.notations = vec![
            ("note@example.com".to_owned(), "hi".to_owned()),
            (String::new(), "https://example.com/policy\n".to_owned()),
        ];
        let mut state = display();
        fx.backend.show_notations(&[sig], &mut state);
        assert_eq!(
            "*** Begin Notation (signature by: AAAA) ***\n\
             note@example.com=hi\n\
             https://example.com/policy\n\
             *** End Notation ***\n",
            state.output_text()
        );
    }
}
