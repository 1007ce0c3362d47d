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

//! Handlers for containers: embedded messages, external bodies and the
//! multipart family.

use std::rc::Rc;

use chrono::Utc;
use log::debug;

use super::pretty_size;
use crate::crypt::Crypt;
use crate::mime::encoded_word::decode_header_text;
use crate::mime::header::parse_datetime;
use crate::mime::model::*;
use crate::mime::parse::{
    parse_entity, parse_message, parse_message_at, read_headers,
};
use crate::mime::state::{State, StateFlags};
use crate::mime::write::write_message;

/// Text subtypes in increasing order of preference within
/// `multipart/alternative`.
const TEXT_RANK: &[&str] = &["plain", "enriched", "html"];

impl Crypt {
    /// Copy the header block in `source[start..end]` to the output, decoding
    /// encoded words and hiding ignored headers if `weed`.
    pub(super) fn copy_headers(
        &self,
        state: &mut State,
        source: &[u8],
        start: usize,
        end: usize,
        weed: bool,
    ) {
        let (headers, _) = read_headers(source, start, end);
        for header in headers {
            if weed && self.config.display.matches_ignore(&header.name) {
                continue;
            }
            if let Some(prefix) = state.prefix.clone() {
                state.puts(&prefix);
            }
            state.puts(&format!(
                "{}: {}\n",
                header.name,
                decode_header_text(&header.value)
            ));
        }
    }

    fn weed_headers(&self, state: &State) -> bool {
        state.has(StateFlags::WEED)
            || ((state.has(StateFlags::DISPLAY)
                || state.has(StateFlags::PRINTING))
                && self.config.display.weed)
    }

    pub(super) fn message_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let mut scratch;
        let email: &mut Email = match b.email {
            Some(ref mut email) if email.source.is_some() => &mut **email,
            Some(ref email) => {
                let mut out = Vec::new();
                write_message(&mut out, email);
                scratch = parse_message(Rc::from(out));
                &mut scratch
            }
            None => {
                // Not parsed up front because it was transfer-encoded
                let end = b.offset + b.length;
                scratch = parse_message_at(&state.fp_in, b.offset, end);
                &mut scratch
            }
        };
        let source = match email.source.clone() {
            Some(source) => source,
            None => return -1,
        };

        let weed = self.weed_headers(state);
        self.copy_headers(
            state,
            &source,
            email.body.hdr_offset,
            email.body.offset,
            weed,
        );
        if let Some(prefix) = state.prefix.clone() {
            state.puts(&prefix);
        }
        state.puts("\n");

        state.with_input(source, |state| {
            self.handle_body(&mut email.body, state)
        })
    }

    pub(super) fn external_body_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let display = state.has(StateFlags::DISPLAY);
        let access_type = match b.param("access-type").map(str::to_owned) {
            Some(access_type) => access_type,
            None => {
                if display {
                    state.puts(
                        "[-- Error: message/external-body has no \
                         access-type parameter --]\n",
                    );
                    return 0;
                }
                return -1;
            }
        };

        let expiration = b.param("expiration").map(str::to_owned);
        let expires_at = expiration
            .as_ref()
            .and_then(|e| parse_datetime(e.as_bytes()));
        let expired = expires_at.map_or(false, |e| e < Utc::now());

        // The payload of an external body is the header block of the
        // phantom part it stands for
        let end = b.offset + b.length;
        let phantom = parse_entity(&state.fp_in, b.offset, end, false);
        let mime_type = phantom.mime_type();

        let banner = if access_type.eq_ignore_ascii_case("x-mutt-deleted") {
            if !display && !state.has(StateFlags::PRINTING) {
                return 0;
            }

            let size = b
                .param("length")
                .and_then(|l| l.trim().parse::<usize>().ok())
                .map(|size| {
                    format!(
                        " (size {} byte{})",
                        pretty_size(size),
                        if 1 == size { "" } else { "s" }
                    )
                })
                .unwrap_or_default();
            let mut banner = format!(
                "[-- This {} attachment{} has been deleted --]\n",
                mime_type, size
            );
            if let (Some(ref expiration), Some(_)) = (&expiration, expires_at) {
                banner.push_str(&format!("[-- on {} --]\n", expiration));
            }
            if let Some(ref filename) = phantom.filename {
                banner.push_str(&format!("[-- name: {} --]\n", filename));
            }
            banner
        } else if expired {
            if !display {
                return 0;
            }
            format!(
                "[-- This {} attachment is not included, --]\n\
                 [-- and the indicated external source has --]\n\
                 [-- expired. --]\n",
                mime_type
            )
        } else {
            if !display {
                return 0;
            }
            format!(
                "[-- This {} attachment is not included, --]\n\
                 [-- and the indicated access-type {} is unsupported --]\n",
                mime_type, access_type
            )
        };

        state.attach_puts(&banner);
        let weed = self.config.display.weed;
        let fp_in = Rc::clone(&state.fp_in);
        self.copy_headers(state, &fp_in, b.offset, phantom.offset, weed);
        0
    }

    pub(super) fn alternative_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let choice = match self.choose_alternative(&b.parts) {
            Some(choice) => choice,
            None => {
                if state.has(StateFlags::DISPLAY) {
                    state.puts(
                        "[-- Error: Could not display any parts of \
                         Multipart/Alternative --]\n",
                    );
                    return -1;
                }
                return 0;
            }
        };

        let chosen = &mut b.parts[choice];
        if state.has(StateFlags::DISPLAY) && !self.config.display.weed {
            let fp_in = Rc::clone(&state.fp_in);
            state.put_bytes(
                fp_in
                    .get(chosen.hdr_offset..chosen.offset)
                    .unwrap_or_default(),
            );
        }

        let info = "info" == self.config.display.show_multipart_alternative;
        if info {
            self.print_part_line(state, chosen, 0);
        }
        self.handle_body(chosen, state);

        if info {
            for (n, other) in b
                .parts
                .iter()
                .enumerate()
                .filter(|&(ix, _)| ix != choice)
                .map(|(_, p)| p)
                .enumerate()
            {
                if 0 == n {
                    state.puts("\n");
                }
                self.print_part_line(state, other, n + 1);
            }
        }
        0
    }

    /// Pick the alternative to render: the last part matching the first
    /// `alternative_order` entry that matches anything, else the last
    /// autoviewable part, else the best text part, else the last part that
    /// can be rendered at all.
    fn choose_alternative(&self, parts: &[Body]) -> Option<usize> {
        for want in &self.config.display.alternative_order {
            let (base, subtype) = match want.find('/') {
                Some(slash) => (&want[..slash], Some(&want[slash + 1..])),
                None => (&want[..], None),
            };
            let wild = subtype.map_or(true, |s| "*" == s);
            let hit = parts.iter().rposition(|p| {
                p.type_name().eq_ignore_ascii_case(base)
                    && (wild
                        || subtype.map_or(false, |s| {
                            s.eq_ignore_ascii_case(&p.subtype)
                        }))
            });
            if hit.is_some() {
                return hit;
            }
        }

        if let Some(ix) = parts.iter().rposition(|p| self.is_autoview(p)) {
            return Some(ix);
        }

        let mut best: Option<(usize, usize)> = None;
        for (ix, p) in parts.iter().enumerate() {
            if !p.is_text() {
                continue;
            }
            if let Some(rank) = TEXT_RANK.iter().position(|&t| t == p.subtype) {
                if best.map_or(true, |(_, r)| rank >= r) {
                    best = Some((ix, rank));
                }
            }
        }
        if let Some((ix, _)) = best {
            return Some(ix);
        }

        parts.iter().rposition(|p| self.can_decode(p))
    }

    /// RFC 8255: render the part in the first preferred language, else the
    /// language-neutral part, else the first part that can be rendered.
    pub(super) fn multilingual_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let decodable: Vec<usize> = (0..b.parts.len())
            .filter(|&ix| self.can_decode(&b.parts[ix]))
            .collect();
        let lang_part = |lang: &str| {
            decodable
                .iter()
                .copied()
                .find(|&ix| Some(lang) == b.parts[ix].language.as_deref())
        };

        let mut choice = None;
        for lang in &self.config.display.preferred_languages {
            choice = lang_part(lang);
            if choice.is_some() {
                debug!("Preferred language {} selected", lang);
                break;
            }
        }
        let choice = choice
            .or_else(|| lang_part("zxx"))
            .or_else(|| decodable.first().copied());

        match choice {
            Some(ix) => {
                self.handle_body(&mut b.parts[ix], state);
                0
            }
            None => 0,
        }
    }

    pub(super) fn multipart_handler(
        &self,
        b: &mut Body,
        state: &mut State,
    ) -> i32 {
        let mut rc = 0;
        for (ix, p) in b.parts.iter_mut().enumerate() {
            let count = ix + 1;
            if state.has(StateFlags::DISPLAY) {
                match p.description.as_ref().or(p.filename.as_ref()) {
                    Some(name) => state.puts(&format!(
                        "[-- Attachment #{}: {} --]\n",
                        count, name
                    )),
                    None => {
                        state.puts(&format!("[-- Attachment #{} --]\n", count))
                    }
                }
                self.print_part_line(state, p, 0);
                if self.config.display.weed {
                    state.puts("\n");
                } else {
                    let fp_in = Rc::clone(&state.fp_in);
                    state.put_bytes(
                        fp_in.get(p.hdr_offset..p.offset).unwrap_or_default(),
                    );
                }
            }

            rc = self.handle_body(p, state);
            state.puts("\n");

            if 0 != rc {
                self.prompt.error(
                    "One or more parts of this message could not be displayed",
                );
                debug!(
                    "Failed on attachment #{}, type {}",
                    count,
                    p.mime_type()
                );
            }
        }

        // One broken part does not sink the message
        if rc < 0 {
            1
        } else {
            rc
        }
    }
}
