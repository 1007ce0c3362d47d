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

//! The rendering context threaded through the body handlers.

use std::rc::Rc;

use bitflags::bitflags;

bitflags! {
    pub struct StateFlags: u32 {
        /// Output is destined for display rather than a file.
        const DISPLAY = 1 << 0;
        /// Verify signatures.
        const VERIFY = 1 << 1;
        /// The prefix must be written before the next character.
        const PENDINGPREFIX = 1 << 2;
        /// Honour the header ignore list.
        const WEED = 1 << 3;
        /// Convert text to the display charset.
        const CHARCONV = 1 << 4;
        const PRINTING = 1 << 5;
        /// Quoting for a reply.
        const REPLYING = 1 << 6;
        /// The first output line has been written.
        const FIRSTDONE = 1 << 7;
        /// Display attachments inline as well.
        const DISPLAY_ATTACH = 1 << 8;
    }
}

/// Where a handler reads its input from and writes its output to.
///
/// Handlers find the payload of a body by its offsets into `fp_in`. A handler
/// rendering a derived entity (such as a decrypted part) swaps in the derived
/// buffer with `with_input` while recursing.
pub struct State {
    pub fp_in: Rc<[u8]>,
    pub out: Vec<u8>,
    /// Quote string written at the start of every output line, if any.
    pub prefix: Option<String>,
    pub flags: StateFlags,
    /// Handler nesting depth.
    pub depth: u32,
}

impl State {
    pub fn new(fp_in: Rc<[u8]>, flags: StateFlags) -> Self {
        State {
            fp_in,
            out: Vec::new(),
            prefix: None,
            flags,
            depth: 0,
        }
    }

    pub fn has(&self, flag: StateFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn puts(&mut self, s: &str) {
        self.out.extend_from_slice(s.as_bytes());
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
    }

    /// Write one byte, emitting the prefix first if a new line started.
    pub fn prefix_putc(&mut self, c: u8) {
        if self.flags.contains(StateFlags::PENDINGPREFIX) {
            self.flags.remove(StateFlags::PENDINGPREFIX);
            if let Some(ref prefix) = self.prefix {
                self.out.extend_from_slice(prefix.as_bytes());
            }
        }
        self.out.push(c);
        if b'\n' == c {
            self.flags.insert(StateFlags::PENDINGPREFIX);
        }
    }

    /// Write `data`, quoting each line with the prefix when there is one.
    pub fn prefix_put(&mut self, data: &[u8]) {
        if self.prefix.is_none() {
            self.put_bytes(data);
            return;
        }
        for &c in data {
            self.prefix_putc(c);
        }
    }

    /// Write a status line for the user, such as an attachment notice.
    pub fn attach_puts(&mut self, s: &str) {
        self.prefix_put(s.as_bytes());
    }

    /// Run `f` with `input` as the current input buffer.
    pub fn with_input<R>(
        &mut self,
        input: Rc<[u8]>,
        f: impl FnOnce(&mut State) -> R,
    ) -> R {
        let saved = std::mem::replace(&mut self.fp_in, input);
        let ret = f(self);
        self.fp_in = saved;
        ret
    }

    /// The output so far, lossily as text.
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.out).into_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_applies_per_line() {
        let mut s = State::new(Rc::from(&b""[..]), StateFlags::PENDINGPREFIX);
        s.prefix = Some("> ".to_owned());
        s.prefix_put(b"one\ntwo\n");
        s.attach_puts("[-- x --]\n");
        assert_eq!("> one\n> two\n> [-- x --]\n", s.output_text());
    }

    #[test]
    fn no_prefix_is_verbatim() {
        let mut s = State::new(Rc::from(&b""[..]), StateFlags::DISPLAY);
        s.prefix_put(b"a\nb");
        s.puts("c");
        assert_eq!("a\nbc", s.output_text());
    }

    #[test]
    fn input_is_restored() {
        let mut s = State::new(Rc::from(&b"outer"[..]), StateFlags::empty());
        let inner_len = s.with_input(Rc::from(&b"in"[..]), |s| s.fp_in.len());
        assert_eq!(2, inner_len);
        assert_eq!(b"outer", &s.fp_in[..]);
    }
}
