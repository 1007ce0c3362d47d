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

//! Handlers for text: plain, `format=flowed`, `text/enriched`, and anything
//! rendered through a mailcap filter.

use std::path::Path;

use log::warn;

use super::payload;
use crate::crypt::expando::quote_filename;
use crate::crypt::Crypt;
use crate::mime::model::*;
use crate::mime::state::{State, StateFlags};
use crate::support::file_ops::scratch_file;
use crate::support::filter;

/// Split `data` into lines without their terminators. A final newline does
/// not start another line.
pub(super) fn lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let data = data.strip_suffix(b"\n").unwrap_or(data);
    let empty = data.is_empty();
    data.split(|&c| b'\n' == c)
        .filter(move |_| !empty)
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
}

/// Widest a reflowed line may be when the configured width leaves no room.
const FLOWED_MAX: usize = 77;

#[derive(Default)]
struct FlowedState {
    width: usize,
    spaces: usize,
    delsp: bool,
}

impl Crypt {
    pub(super) fn text_plain_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let fp_in = std::rc::Rc::clone(&state.fp_in);
        for line in lines(payload(b, &fp_in)) {
            if let Some(ref prefix) = state.prefix {
                state.out.extend_from_slice(prefix.as_bytes());
            }
            state.put_bytes(line);
            state.put_bytes(b"\n");
        }
        0
    }

    /// RFC 3676 `format=flowed`: joins soft-broken lines into paragraphs
    /// and rewraps them.
    pub(super) fn flowed_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let mut fst = FlowedState::default();
        let mut delsp = false;
        if let Some(d) = b.param("delsp") {
            delsp = d.eq_ignore_ascii_case("yes");
            fst.delsp = true;
        }

        let fp_in = std::rc::Rc::clone(&state.fp_in);
        let mut quote_level = 0;
        for line in lines(payload(b, &fp_in)) {
            let line = String::from_utf8_lossy(line);
            let newql = line.bytes().take_while(|&c| b'>' == c).count();
            if newql != quote_level {
                flush_par(state, &mut fst);
            }
            quote_level = newql;

            let mut off = newql;
            // Undo space-stuffing
            if Some(&b' ') == line.as_bytes().get(off) {
                off += 1;
            }
            let text = &line[off..];
            let sigsep = "-- " == text;
            let fixed = text.is_empty() || !line.ends_with(' ') || sigsep;

            if (fixed && (0 == fst.width || line.is_empty())) || sigsep {
                flush_par(state, &mut fst);
                self.print_fixed_line(text, state, quote_level, &mut fst);
                continue;
            }

            let text = if delsp && !fixed {
                &text[..text.len() - 1]
            } else {
                text
            };
            self.print_flowed_line(text, state, quote_level, &mut fst, fixed);
        }
        flush_par(state, &mut fst);
        0
    }

    fn space_quotes(&self) -> bool {
        self.config.display.reflow_space_quotes
    }

    fn add_quote_suffix(&self, state: &State, ql: usize) -> bool {
        !state.has(StateFlags::REPLYING) && !self.space_quotes() && ql > 0
    }

    fn print_indent(
        &self,
        ql: usize,
        state: &mut State,
        suffix: bool,
    ) -> usize {
        let mut wid = 0;
        if let Some(prefix) = state.prefix.clone() {
            state.puts(&prefix);
            wid = prefix.chars().count();
        }
        for _ in 0..ql {
            state.puts(if self.space_quotes() { "> " } else { ">" });
        }
        if suffix {
            state.puts(" ");
        }

        let ql = if self.space_quotes() { ql * 2 } else { ql };
        ql + suffix as usize + wid
    }

    fn quote_width(&self, state: &State, ql: usize) -> usize {
        let mut width = self.config.display.reflow_wrap as isize;
        width -= if self.space_quotes() { ql * 2 } else { ql } as isize;
        if self.add_quote_suffix(state, ql) {
            width -= 1;
        }
        if width <= 0 {
            FLOWED_MAX
        } else {
            width as usize
        }
    }

    fn print_flowed_line(
        &self,
        line: &str,
        state: &mut State,
        ql: usize,
        fst: &mut FlowedState,
        term: bool,
    ) {
        if line.is_empty() {
            flush_par(state, fst);
            self.print_indent(ql, state, false);
            state.puts("\n");
            return;
        }

        let width = self.quote_width(state, ql);
        let last = line.chars().last();
        let mut words = 0;
        for word in line.split(' ') {
            if word.is_empty() {
                fst.spaces += 1;
                continue;
            }
            if words > 0 {
                fst.spaces += 1;
            }

            let w = word.chars().count();
            // A long word with DelSp is broken by the reader, not here
            let unbreakable = 0 == fst.spaces && fst.delsp && Some(' ') != last;
            if !unbreakable && w < width && w + fst.width + fst.spaces > width {
                state.puts("\n");
                fst.width = 0;
                fst.spaces = 0;
                words = 0;
            }

            if 0 == words && 0 == fst.width {
                let suffix = self.add_quote_suffix(state, ql);
                fst.width = self.print_indent(ql, state, suffix);
            }
            fst.width += w + fst.spaces;
            for _ in 0..fst.spaces {
                state.puts(" ");
            }
            fst.spaces = 0;
            state.puts(word);
            words += 1;
        }

        if term {
            flush_par(state, fst);
        }
    }

    fn print_fixed_line(
        &self,
        line: &str,
        state: &mut State,
        ql: usize,
        fst: &mut FlowedState,
    ) {
        let suffix = self.add_quote_suffix(state, ql);
        self.print_indent(ql, state, suffix);
        state.puts(line);
        state.puts("\n");
        fst.width = 0;
        fst.spaces = 0;
    }

    /// RFC 1896 `text/enriched`.
    pub(super) fn enriched_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let fp_in = std::rc::Rc::clone(&state.fp_in);
        let text: Vec<char> =
            String::from_utf8_lossy(payload(b, &fp_in)).chars().collect();

        #[derive(Clone, Copy, PartialEq)]
        enum Lex {
            Text,
            Tag,
            BogusTag,
            Newline,
            Eof,
        }

        let mut en = Enriched::new(state);
        let mut lex = Lex::Text;
        let mut tag = String::new();
        let mut ix = 0;
        loop {
            let c = if Lex::Eof == lex {
                '\0'
            } else if ix < text.len() {
                ix += 1;
                text[ix - 1]
            } else {
                lex = Lex::Eof;
                '\0'
            };

            match lex {
                Lex::Text => match c {
                    '<' => {
                        if Some(&'<') == text.get(ix) {
                            ix += 1;
                            en.putc('<');
                        } else {
                            tag.clear();
                            lex = Lex::Tag;
                        }
                    }
                    '\n' => {
                        if en.level(Rich::NoFill) > 0 {
                            en.flush(true);
                        } else {
                            en.putc(' ');
                            lex = Lex::Newline;
                        }
                    }
                    c => en.putc(c),
                },

                Lex::Tag => {
                    if '>' == c {
                        en.set_flags(&tag);
                        lex = Lex::Text;
                    } else if tag.len() < 1024 {
                        tag.push(c);
                    } else {
                        lex = Lex::BogusTag;
                    }
                }

                Lex::BogusTag => {
                    if '>' == c {
                        lex = Lex::Text;
                    }
                }

                Lex::Newline => {
                    if '\n' == c {
                        en.flush(true);
                    } else {
                        ix -= 1;
                        lex = Lex::Text;
                    }
                }

                Lex::Eof => {
                    en.putc('\0');
                    en.flush(true);
                    break;
                }
            }
        }

        state.puts("\n");
        0
    }

    /// Render through the mailcap command configured for the type.
    pub(super) fn autoview_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let command = match self.mailcap_command(b) {
            Some(c) => c.to_owned(),
            None => return 0,
        };

        let data = payload(b, &state.fp_in).to_vec();
        let suffix = b
            .filename
            .as_deref()
            .and_then(|f| Path::new(f).extension())
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let tf = match scratch_file(&self.scratch(), &suffix, &data) {
            Ok(tf) => tf,
            Err(e) => {
                warn!("Can't create autoview file: {}", e);
                return -1;
            }
        };

        let (cmd, piped) =
            expand_mailcap_command(&command, b, &tf.path().to_string_lossy());
        let display = state.has(StateFlags::DISPLAY);
        if display {
            state.puts(&format!("[-- Autoview using {} --]\n", cmd));
            self.prompt
                .message(&format!("Invoking autoview command: {}", cmd));
        }

        let output = match filter::run(
            &cmd,
            if piped { Some(&data[..]) } else { None },
            &[],
        ) {
            Ok(output) => output,
            Err(e) => {
                warn!("Autoview command failed: {}", e);
                if display {
                    state.puts(&format!("[-- Can't run {} --]\n", cmd));
                }
                return -1;
            }
        };

        match state.prefix.clone() {
            Some(prefix) => {
                // Terminal formatting has no place in quoted text
                for line in lines(&output.stdout) {
                    state.puts(&prefix);
                    state.put_bytes(&strip_formatting(line));
                    state.puts("\n");
                }
                if !output.stderr.is_empty() {
                    if display {
                        state.puts(&format!(
                            "[-- Autoview stderr of {} --]\n",
                            cmd
                        ));
                    }
                    for line in lines(&output.stderr) {
                        state.puts(&prefix);
                        state.put_bytes(line);
                        state.puts("\n");
                    }
                }
            }
            None => {
                state.put_bytes(&output.stdout);
                if !output.stderr.is_empty() {
                    if display {
                        state.puts(&format!(
                            "[-- Autoview stderr of {} --]\n",
                            cmd
                        ));
                    }
                    state.put_bytes(&output.stderr);
                }
            }
        }
        0
    }
}

fn flush_par(state: &mut State, fst: &mut FlowedState) {
    if fst.width > 0 {
        state.puts("\n");
        fst.width = 0;
    }
    fst.spaces = 0;
}

/// Substitute `%s` (the file), `%t` (the type) and `%{param}` in a mailcap
/// command. Returns whether the command instead reads the part from
/// standard input, which is the case when it has no `%s`.
pub(super) fn expand_mailcap_command(
    command: &str,
    b: &Body,
    file: &str,
) -> (String, bool) {
    let mut out = String::new();
    let mut piped = true;
    let mut it = command.chars().peekable();
    while let Some(c) = it.next() {
        match c {
            '\\' => {
                if let Some(next) = it.next() {
                    out.push(next);
                }
            }
            '%' => match it.next() {
                Some('s') => {
                    out.push_str(&quote_filename(file));
                    piped = false;
                }
                Some('t') => out.push_str(&quote_filename(&b.mime_type())),
                Some('{') => {
                    let name: String =
                        it.by_ref().take_while(|&c| '}' != c).collect();
                    out.push_str(&quote_filename(
                        b.param(&name).unwrap_or_default(),
                    ));
                }
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            },
            c => out.push(c),
        }
    }
    (out, piped)
}

/// Remove ANSI escape sequences and backspace overstrikes.
fn strip_formatting(line: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(line.len());
    let mut ix = 0;
    while ix < line.len() {
        match line[ix] {
            0x1b if Some(&b'[') == line.get(ix + 1) => {
                ix += 2;
                while ix < line.len() && !line[ix].is_ascii_alphabetic() {
                    ix += 1;
                }
                ix += 1;
            }
            0x08 => {
                out.pop();
                ix += 1;
            }
            c => {
                out.push(c);
                ix += 1;
            }
        }
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rich {
    Param = 0,
    Bold,
    Underline,
    Italic,
    NoFill,
    Indent,
    IndentRight,
    Excerpt,
    Center,
    FlushLeft,
    FlushRight,
    Color,
}

const RICH_MAX: usize = 12;
const INDENT_SIZE: usize = 4;

impl Rich {
    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag.to_ascii_lowercase().as_str() {
            "param" => Rich::Param,
            "bold" => Rich::Bold,
            "italic" => Rich::Italic,
            "underline" => Rich::Underline,
            "nofill" => Rich::NoFill,
            "excerpt" => Rich::Excerpt,
            "indent" => Rich::Indent,
            "indentright" => Rich::IndentRight,
            "center" => Rich::Center,
            "flushleft" | "flushboth" => Rich::FlushLeft,
            "flushright" => Rich::FlushRight,
            "color" | "x-color" => Rich::Color,
            _ => return None,
        })
    }
}

/// Line assembly for `text/enriched`. Characters collect into the current
/// word, words into the current line, and lines are wrapped at the margin.
struct Enriched<'s> {
    state: &'s mut State,
    tag_level: [usize; RICH_MAX],
    wrap_margin: usize,
    line: Vec<char>,
    line_len: usize,
    word: Vec<char>,
    word_len: usize,
    indent_len: usize,
    param: String,
}

impl<'s> Enriched<'s> {
    fn new(state: &'s mut State) -> Self {
        let mut indent_len = 0;
        if let Some(prefix) = state.prefix.clone() {
            state.puts(&prefix);
            indent_len += prefix.len();
        }
        Enriched {
            state,
            tag_level: [0; RICH_MAX],
            wrap_margin: 72,
            line: Vec::new(),
            line_len: 0,
            word: Vec::new(),
            word_len: 0,
            indent_len,
            param: String::new(),
        }
    }

    fn level(&self, r: Rich) -> usize {
        self.tag_level[r as usize]
    }

    fn emit(&mut self, s: &str) {
        self.state.puts(s);
    }

    fn wrap(&mut self) {
        if self.line_len > 0 {
            if self.level(Rich::Center) > 0 || self.level(Rich::FlushRight) > 0
            {
                while self.line.len() > 1
                    && self.line.last().map_or(false, |c| c.is_whitespace())
                {
                    self.line.pop();
                    self.line_len = self.line_len.saturating_sub(1);
                }
                if self.level(Rich::Center) > 0 {
                    let lead = self
                        .line
                        .iter()
                        .take_while(|c| c.is_whitespace())
                        .count();
                    self.line.drain(..lead);
                    self.line_len = self.line_len.saturating_sub(lead);
                }
            }

            let extra = self.wrap_margin as isize
                - self.line_len as isize
                - self.indent_len as isize
                - (self.level(Rich::IndentRight) * INDENT_SIZE) as isize;
            if extra > 0 {
                let pad = if self.level(Rich::Center) > 0 {
                    extra / 2
                } else if self.level(Rich::FlushRight) > 0 {
                    extra - 1
                } else {
                    0
                };
                self.emit(&" ".repeat(pad as usize));
            }
            let line: String = self.line.iter().collect();
            self.emit(&line);
        }

        self.emit("\n");
        self.line.clear();
        self.line_len = 0;
        self.indent_len = 0;
        let prefix = self.state.prefix.clone();
        if let Some(ref prefix) = prefix {
            self.emit(prefix);
            self.indent_len += prefix.len();
        }

        let excerpt = self.level(Rich::Excerpt);
        if excerpt > 0 {
            for _ in 0..excerpt {
                let quote = prefix.as_deref().unwrap_or("> ");
                self.emit(quote);
                self.indent_len += quote.len();
            }
        } else {
            self.indent_len = 0;
        }

        let indent = self.level(Rich::Indent) * INDENT_SIZE;
        if indent > 0 {
            self.indent_len += indent;
            self.emit(&" ".repeat(indent));
        }
    }

    fn flush(&mut self, wrap: bool) {
        let room = self.wrap_margin as isize
            - (self.level(Rich::IndentRight) * INDENT_SIZE) as isize
            - self.indent_len as isize;
        if 0 == self.level(Rich::NoFill)
            && (self.line_len + self.word_len) as isize > room
        {
            self.wrap();
        }

        self.line.append(&mut self.word);
        self.line_len += self.word_len;
        self.word_len = 0;
        if wrap {
            self.wrap();
        }
    }

    fn putc(&mut self, c: char) {
        if self.level(Rich::Param) > 0 {
            if self.level(Rich::Color) > 0 {
                self.param.push(c);
            }
            return;
        }

        if (0 == self.level(Rich::NoFill) && c.is_whitespace()) || '\0' == c {
            if '\t' == c {
                self.word_len += 8 - (self.line_len + self.word_len) % 8;
            } else {
                self.word_len += 1;
            }
            if '\0' != c {
                self.word.push(c);
            }
            self.flush(false);
        } else {
            if self.state.has(StateFlags::DISPLAY) {
                if self.level(Rich::Bold) > 0 {
                    self.word.extend_from_slice(&[c, '\x08', c]);
                } else if self.level(Rich::Underline) > 0 {
                    self.word.extend_from_slice(&['_', '\x08', c]);
                } else if self.level(Rich::Italic) > 0 {
                    self.word.extend_from_slice(&[c, '\x08', '_']);
                } else {
                    self.word.push(c);
                }
            } else {
                self.word.push(c);
            }
            self.word_len += 1;
        }
    }

    fn set_flags(&mut self, tag: &str) {
        let (closing, name) = match tag.strip_prefix('/') {
            Some(name) => (true, name),
            None => (false, tag),
        };
        let r = match Rich::from_tag(name) {
            Some(r) => r,
            None => return,
        };

        if Rich::Center == r || Rich::FlushLeft == r || Rich::FlushRight == r {
            self.flush(true);
        }

        let display = self.state.has(StateFlags::DISPLAY);
        if closing {
            let level = &mut self.tag_level[r as usize];
            *level = level.saturating_sub(1);

            if display && Rich::Param == r && self.level(Rich::Color) > 0 {
                let code = match self.param.to_ascii_lowercase().as_str() {
                    "black" => Some(30),
                    "red" => Some(31),
                    "green" => Some(32),
                    "yellow" => Some(33),
                    "blue" => Some(34),
                    "magenta" => Some(35),
                    "cyan" => Some(36),
                    "white" => Some(37),
                    _ => None,
                };
                if let Some(code) = code {
                    self.word.extend(format!("\x1b[{}m", code).chars());
                }
            }
            if display && Rich::Color == r {
                self.word.extend("\x1b[0m".chars());
            }
            if Rich::Param == r {
                self.param.clear();
            }
        } else {
            self.tag_level[r as usize] += 1;
            if Rich::Excerpt == r {
                self.flush(true);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::test_support::*;
    use super::*;
    use crate::crypt::test_support::*;
    use crate::support::prompt::test_prompt::Scripted;

    fn crypt() -> Crypt {
        bare_crypt(Scripted::default())
    }

    #[test]
    fn line_splitting() {
        let all: Vec<&[u8]> = lines(b"a\r\n\nb\n").collect();
        assert_eq!(vec![&b"a"[..], &b""[..], &b"b"[..]], all);
        assert_eq!(0, lines(b"").count());
        assert_eq!(1, lines(b"x").count());
    }

    #[test]
    fn flowed_paragraphs_are_joined() {
        let raw = "Content-Type: text/plain; format=flowed\n\
                   \n\
                   This is a \n\
                   flowed para.\n\
                   > quoted \n\
                   > more\n\
                   -- \n\
                   sig\n";
        let (rc, out) = render_with(&crypt(), raw, StateFlags::DISPLAY);
        assert_eq!(0, rc);
        assert_eq!("This is a flowed para.\n> quoted more\n-- \nsig\n", out);
    }

    #[test]
    fn flowed_paragraphs_are_rewrapped() {
        let mut crypt = crypt();
        crypt.config.display.reflow_wrap = 10;
        let raw = "Content-Type: text/plain; format=flowed\n\
                   \n\
                   aaaa bbbb \n\
                   cccc dddd\n";
        let (_, out) = render_with(&crypt, raw, StateFlags::empty());
        assert_eq!("aaaa bbbb\ncccc dddd\n", out);
    }

    #[test]
    fn flowed_is_plain_without_reflow() {
        let mut crypt = crypt();
        crypt.config.display.reflow_text = false;
        let raw = "Content-Type: text/plain; format=flowed\n\
                   \n\
                   soft \n\
                   break\n";
        let (_, out) = render_with(&crypt, raw, StateFlags::empty());
        assert_eq!("soft \nbreak\n", out);
    }

    #[test]
    fn enriched_text() {
        let raw = "Content-Type: text/enriched\n\
                   \n\
                   Hello <bold>world</bold>\n\
                   \n\
                   Next<<para\n";
        let (_, out) = render_with(&crypt(), raw, StateFlags::empty());
        assert_eq!("Hello world \nNext<para \n\n", out);

        let raw = "Content-Type: text/enriched\n\
                   \n\
                   <color><param>red</param>Hi</color>\n";
        let (_, out) = render_with(&crypt(), raw, StateFlags::empty());
        assert_eq!("Hi \n\n", out);
    }

    #[test]
    fn enriched_bold_overstrikes_on_display() {
        let raw = "Content-Type: text/enriched\n\
                   \n\
                   <bold>ab</bold>\n";
        let (_, out) = render_with(&crypt(), raw, StateFlags::DISPLAY);
        assert_eq!("a\x08ab\x08b \n\n", out);
    }

    #[test]
    fn autoview_through_stdin() {
        let mut crypt = crypt();
        crypt.config.display.auto_view = vec!["text/html".to_owned()];
        crypt
            .config
            .display
            .mailcap
            .insert("text/html".to_owned(), "tr a-z A-Z".to_owned());
        let raw = "Content-Type: text/html\n\
                   \n\
                   <p>hi</p>\n";
        let (rc, out) = render_with(&crypt, raw, StateFlags::DISPLAY);
        assert_eq!(0, rc);
        assert_eq!("[-- Autoview using tr a-z A-Z --]\n<P>HI</P>\n", out);
    }

    #[test]
    fn autoview_through_file() {
        let mut crypt = crypt();
        crypt.config.display.auto_view = vec!["text/*".to_owned()];
        crypt
            .config
            .display
            .mailcap
            .insert("text/*".to_owned(), "cat %s; echo oops >&2".to_owned());
        let raw = "Content-Type: text/x-thing\n\
                   \n\
                   body\n";
        let mut email = parsed(raw);
        let (_, out) =
            crypt.render(&mut email, StateFlags::empty(), Some("> "));
        assert_eq!("> body\n> oops\n", String::from_utf8_lossy(&out));
    }

    #[test]
    fn mailcap_expansion() {
        let mut b = Body::new_leaf(BodyType::Text, "html", "");
        b.params.set("charset", "utf-8");
        let (cmd, piped) =
            expand_mailcap_command("view %t %{charset} 100\\%", &b, "/x");
        assert_eq!("view 'text/html' 'utf-8' 100%", cmd);
        assert!(piped);
        let (cmd, piped) = expand_mailcap_command("lynx %s", &b, "/tmp/a b");
        assert_eq!("lynx '/tmp/a b'", cmd);
        assert!(!piped);
    }

    #[test]
    fn formatting_is_stripped() {
        assert_eq!(
            b"bold red".to_vec(),
            strip_formatting(b"b\x08bold \x1b[31mred\x1b[0m")
        );
    }
}
