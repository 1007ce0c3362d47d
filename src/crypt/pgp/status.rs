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

//! Interpreting what GnuPG reports on its status and error streams.

use log::debug;
use regex::Regex;

use crate::mime::state::State;

const STATUS_PREFIX: &[u8] = b"[GNUPG:] ";

fn lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|&b| b'\n' == b)
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
}

/// Classify the status stream of a decryption.
///
/// - `0`: `DECRYPTION_OKAY` was seen and no plaintext outside the
///   decryption bracket.
/// - `-1`: no decryption status at all.
/// - `-2`: `PLAINTEXT` outside `BEGIN_DECRYPTION`/`END_DECRYPTION`, meaning
///   (part of) the message was not actually encrypted.
/// - `-3`: `DECRYPTION_FAILED`.
pub fn check_status_fd(status: &[u8]) -> i32 {
    let mut rc = -1;
    let mut inside_decrypt = false;

    for line in lines(status) {
        let s = match line.strip_prefix(STATUS_PREFIX) {
            Some(s) => s,
            None => continue,
        };

        if s.starts_with(b"BEGIN_DECRYPTION") {
            inside_decrypt = true;
        } else if s.starts_with(b"END_DECRYPTION") {
            inside_decrypt = false;
        } else if s.starts_with(b"PLAINTEXT") {
            if !inside_decrypt {
                debug!("PLAINTEXT encountered outside of DECRYPTION");
                return -2;
            }
        } else if s.starts_with(b"DECRYPTION_FAILED") {
            debug!("DECRYPTION_FAILED encountered");
            return -3;
        } else if s.starts_with(b"DECRYPTION_OKAY") {
            // Keep going, a stray PLAINTEXT may still follow
            rc = 0;
        }
    }

    rc
}

/// Classify the outcome of a decryption from its error output, using the
/// status stream if `status_fd` and the `okay` pattern otherwise.
pub fn check_decryption_okay(
    status_fd: bool,
    okay: Option<&Regex>,
    stderr: &[u8],
) -> i32 {
    if status_fd {
        check_status_fd(stderr)
    } else {
        check_okay_regex(okay, stderr)
    }
}

/// Look for a line matching `okay` in the error output of a decryption.
///
/// Returns 0 on a match, -1 if there was none, and 1 if there is no pattern
/// to look for.
pub fn check_okay_regex(okay: Option<&Regex>, output: &[u8]) -> i32 {
    let okay = match okay {
        Some(re) => re,
        None => return 1,
    };

    if lines(output).any(|l| okay.is_match(&String::from_utf8_lossy(l))) {
        0
    } else {
        -1
    }
}

/// Copy the diagnostic output of a PGP run to `state`, dropping raw status
/// lines, and look for signs of a good signature on the way.
///
/// Returns 0 if some line matched `good_sign`, -1 if none did, and 1 if
/// there is no pattern (in which case everything is copied verbatim).
pub fn copy_checksig(
    good_sign: Option<&Regex>,
    output: &[u8],
    state: &mut State,
) -> i32 {
    let good_sign = match good_sign {
        Some(re) => re,
        None => {
            state.put_bytes(output);
            return 1;
        }
    };

    let mut rc = -1;
    let trimmed = output.strip_suffix(b"\n").unwrap_or(output);
    if trimmed.is_empty() {
        return rc;
    }

    for line in lines(trimmed) {
        let text = String::from_utf8_lossy(line);
        if good_sign.is_match(&text) {
            debug!("\"{}\" matches good signature pattern", text);
            rc = 0;
        }

        if line.starts_with(STATUS_PREFIX) {
            continue;
        }
        state.put_bytes(line);
        state.puts("\n");
    }

    rc
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;
    use crate::mime::state::StateFlags;

    #[test]
    fn status_fd_classification() {
        assert_eq!(
            0,
            check_status_fd(
                b"[GNUPG:] BEGIN_DECRYPTION\n[GNUPG:] DECRYPTION_OKAY\n\
                  [GNUPG:] END_DECRYPTION\n"
            )
        );
        assert_eq!(
            -2,
            check_status_fd(
                b"[GNUPG:] PLAINTEXT 62 0 x\n[GNUPG:] BEGIN_DECRYPTION\n"
            )
        );
        assert_eq!(-3, check_status_fd(b"[GNUPG:] DECRYPTION_FAILED\n"));
        assert_eq!(-1, check_status_fd(b""));
    }

    #[test]
    fn plaintext_inside_decryption_is_fine() {
        assert_eq!(
            0,
            check_status_fd(
                b"gpg: encrypted with 2048-bit RSA key\n\
                  [GNUPG:] BEGIN_DECRYPTION\n\
                  [GNUPG:] PLAINTEXT 62 0 x\n\
                  [GNUPG:] DECRYPTION_OKAY\n\
                  [GNUPG:] END_DECRYPTION\n"
            )
        );
        assert_eq!(
            -2,
            check_status_fd(
                b"[GNUPG:] BEGIN_DECRYPTION\n[GNUPG:] DECRYPTION_OKAY\n\
                  [GNUPG:] END_DECRYPTION\n[GNUPG:] PLAINTEXT 62 0 y\n"
            )
        );
    }

    #[test]
    fn okay_regex() {
        let re = Regex::new(r"^\[GNUPG:\] DECRYPTION_OKAY").unwrap();
        assert_eq!(
            0,
            check_okay_regex(Some(&re), b"x\n[GNUPG:] DECRYPTION_OKAY\n")
        );
        assert_eq!(-1, check_okay_regex(Some(&re), b"x\n"));
        assert_eq!(1, check_okay_regex(None, b"x\n"));
        assert_eq!(
            -3,
            check_decryption_okay(
                true,
                Some(&re),
                b"[GNUPG:] DECRYPTION_FAILED\n[GNUPG:] DECRYPTION_OKAY\n"
            )
        );
        assert_eq!(
            0,
            check_decryption_okay(
                false,
                Some(&re),
                b"[GNUPG:] DECRYPTION_FAILED\n[GNUPG:] DECRYPTION_OKAY\n"
            )
        );
    }

    #[test]
    fn checksig_strips_status_lines() {
        let re = Regex::new(r"^\[GNUPG:\] GOODSIG").unwrap();
        let mut state = State::new(Rc::from(&b""[..]), StateFlags::DISPLAY);
        let rc = copy_checksig(
            Some(&re),
            b"gpg: Good signature from \"Alice\"\n\
              [GNUPG:] GOODSIG 0123 Alice\n",
            &mut state,
        );
        assert_eq!(0, rc);
        assert_eq!("gpg: Good signature from \"Alice\"\n", state.output_text());

        let mut state = State::new(Rc::from(&b""[..]), StateFlags::DISPLAY);
        assert_eq!(
            -1,
            copy_checksig(Some(&re), b"[GNUPG:] BADSIG 0123\n", &mut state)
        );
        assert!(state.out.is_empty());

        let mut state = State::new(Rc::from(&b""[..]), StateFlags::DISPLAY);
        assert_eq!(1, copy_checksig(None, b"anything\n", &mut state));
        assert_eq!("anything\n", state.output_text());
    }
}
