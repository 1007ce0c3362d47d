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

//! The boundary to whatever is interacting with the user.
//!
//! The security core never talks to a terminal directly. Whenever it needs a
//! decision or a secret, it asks a `Prompt`.

use std::io::{self, BufRead, Write};

use log::{info, warn};
use secstr::SecStr;

use super::system_config::QuadOption;

pub trait Prompt {
    /// Read a secret. `None` means the user declined to give one.
    fn ask_passphrase(&self, prompt: &str) -> Option<SecStr>;

    /// Ask a yes/no question. `None` means the question was cancelled.
    fn yes_or_no(&self, question: &str, default: bool) -> Option<bool>;

    /// Offer a choice of single-letter answers; `letters` lists the valid
    /// ones. `None` means cancellation.
    fn multi_choice(&self, question: &str, letters: &str) -> Option<char>;

    /// Let the user pick one of `entries`, returning its index.
    fn select_key(&self, title: &str, entries: &[String]) -> Option<usize>;

    /// Ask for a line of text, pre-filled with `default`.
    fn ask_string(&self, question: &str, default: &str) -> Option<String>;

    fn any_key_to_continue(&self) {}

    fn message(&self, msg: &str);

    fn error(&self, msg: &str);

    /// Resolve a quad-option, asking only if the option says to.
    fn query_quadoption(
        &self,
        option: QuadOption,
        question: &str,
    ) -> Option<bool> {
        match option {
            QuadOption::Yes => Some(true),
            QuadOption::No => Some(false),
            QuadOption::AskYes => self.yes_or_no(question, true),
            QuadOption::AskNo => self.yes_or_no(question, false),
        }
    }
}

/// A prompt for non-interactive use: every question gets its default answer
/// and no secrets are ever provided.
#[derive(Clone, Copy, Debug, Default)]
pub struct Batch;

impl Prompt for Batch {
    fn ask_passphrase(&self, prompt: &str) -> Option<SecStr> {
        info!("Not asking for passphrase in batch mode: {}", prompt);
        None
    }

    fn yes_or_no(&self, _: &str, default: bool) -> Option<bool> {
        Some(default)
    }

    fn multi_choice(&self, _: &str, _: &str) -> Option<char> {
        None
    }

    fn select_key(&self, _: &str, _: &[String]) -> Option<usize> {
        None
    }

    fn ask_string(&self, _: &str, default: &str) -> Option<String> {
        if default.is_empty() {
            None
        } else {
            Some(default.to_owned())
        }
    }

    fn message(&self, msg: &str) {
        info!("{}", msg);
    }

    fn error(&self, msg: &str) {
        warn!("{}", msg);
    }
}

/// A prompt using the controlling terminal.
#[derive(Clone, Copy, Debug, Default)]
pub struct Terminal;

impl Terminal {
    fn read_line(&self, question: &str) -> Option<String> {
        eprint!("{} ", question);
        let _ = io::stderr().flush();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(&['\r', '\n'][..]).to_owned()),
        }
    }
}

impl Prompt for Terminal {
    fn ask_passphrase(&self, prompt: &str) -> Option<SecStr> {
        match rpassword::read_password_from_tty(Some(prompt)) {
            Ok(p) => Some(SecStr::from(p)),
            Err(e) => {
                warn!("Failed to read passphrase: {}", e);
                None
            }
        }
    }

    fn yes_or_no(&self, question: &str, default: bool) -> Option<bool> {
        let hint = if default { "([yes]/no)" } else { "(yes/[no])" };
        let answer = self.read_line(&format!("{} {}", question, hint))?;
        match answer.trim().chars().next() {
            None => Some(default),
            Some('y') | Some('Y') => Some(true),
            Some('n') | Some('N') => Some(false),
            Some(_) => None,
        }
    }

    fn multi_choice(&self, question: &str, letters: &str) -> Option<char> {
        let answer = self.read_line(question)?;
        answer.trim().chars().next().filter(|c| letters.contains(*c))
    }

    fn select_key(&self, title: &str, entries: &[String]) -> Option<usize> {
        eprintln!("{}", title);
        for (ix, entry) in entries.iter().enumerate() {
            eprintln!("{:4} {}", ix + 1, entry);
        }
        let answer = self.read_line("Select:")?;
        let ix = answer.trim().parse::<usize>().ok()?;
        if ix >= 1 && ix <= entries.len() {
            Some(ix - 1)
        } else {
            None
        }
    }

    fn ask_string(&self, question: &str, default: &str) -> Option<String> {
        let answer = self.read_line(&format!("{} [{}]", question, default))?;
        if answer.is_empty() {
            Some(default.to_owned())
        } else {
            Some(answer)
        }
    }

    fn any_key_to_continue(&self) {
        let _ = self.read_line("Press return to continue...");
    }

    fn message(&self, msg: &str) {
        eprintln!("{}", msg);
    }

    fn error(&self, msg: &str) {
        eprintln!("error: {}", msg);
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn batch_takes_defaults() {
        assert_eq!(Some(true), Batch.query_quadoption(QuadOption::AskYes, "?"));
        assert_eq!(Some(false), Batch.query_quadoption(QuadOption::AskNo, "?"));
        assert_eq!(Some(true), Batch.query_quadoption(QuadOption::Yes, "?"));
        assert!(Batch.ask_passphrase("pass").is_none());
        assert_eq!(None, Batch.ask_string("label", ""));
        assert_eq!(Some("x".to_owned()), Batch.ask_string("label", "x"));
    }

    #[test]
    fn fixed_quadoptions_never_ask() {
        let prompt = test_prompt::Scripted::default().answer("yes");
        assert_eq!(Some(false), prompt.query_quadoption(QuadOption::No, "?"));
        assert!(prompt.transcript.borrow().is_empty());
        assert_eq!(
            Some(true),
            prompt.query_quadoption(QuadOption::AskNo, "sure?")
        );
        assert_eq!(vec!["sure?".to_owned()], *prompt.transcript.borrow());
    }
}
