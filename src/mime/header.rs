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

//! Parsers for the structured RFC 5322 and RFC 2045 headers the security
//! core consumes.
//!
//! The grammar follows RFC 2822 including the "obsolete" productions, with
//! the RFC 6532 amendments allowing raw UTF-8 wherever text may appear.
//! Everything here operates on complete header values (already unfolded),
//! so only the `complete` flavours of the nom combinators are used.

use std::str;

use chrono::prelude::*;
use nom::{
    branch::alt,
    bytes::complete::{
        is_a, is_not, tag, tag_no_case, take, take_while1, take_while_m_n,
    },
    character::complete::char,
    combinator::{map, opt},
    multi::{
        fold_many0, many0, many0_count, many1_count, separated_nonempty_list,
    },
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use super::content_encoding::convert_charset;
use super::encoded_word::{decode_header_text, ew_decode};
use super::model::{Address, ParamList};

type PResult<'a, T> = IResult<&'a [u8], T>;

fn ascii_digit(b: u8) -> bool {
    b.is_ascii_digit()
}

fn digits_value(s: &[u8]) -> u32 {
    s.iter().fold(0, |acc, &b| acc * 10 + u32::from(b - b'0'))
}

// RFC 2822 3.2.2 "quoted-pair", 8-bit clean
fn quoted_pair(i: &[u8]) -> PResult<&[u8]> {
    preceded(char('\\'), take(1usize))(i)
}

// RFC 2822 3.2.3 "Folding white space". Values are already unfolded, so line
// endings are just more whitespace.
fn fws(i: &[u8]) -> PResult<&[u8]> {
    map(is_a(" \t\r\n"), |_| &b" "[..])(i)
}

fn ctext(i: &[u8]) -> PResult<&[u8]> {
    is_not("()\\ \t\r\n")(i)
}

fn ccontent(i: &[u8]) -> PResult<()> {
    alt((
        map(ctext, |_| ()),
        map(quoted_pair, |_| ()),
        map(fws, |_| ()),
        comment,
    ))(i)
}

// RFC 2822 3.2.3 "Comment". Comments nest.
fn comment(i: &[u8]) -> PResult<()> {
    map(delimited(char('('), many0_count(ccontent), char(')')), |_| ())(i)
}

fn cfws(i: &[u8]) -> PResult<()> {
    map(many1_count(alt((map(fws, |_| ()), comment))), |_| ())(i)
}

fn is_atext(ch: u8) -> bool {
    ch.is_ascii_alphanumeric()
        || b"!#$%&'*+-/=?^_`{|}~".contains(&ch)
        // RFC 6532
        || ch >= 0x80
}

fn atext(i: &[u8]) -> PResult<&[u8]> {
    take_while1(is_atext)(i)
}

// RFC 2822 3.2.4 "Atom"
fn atom(i: &[u8]) -> PResult<&[u8]> {
    delimited(opt(cfws), atext, opt(cfws))(i)
}

fn qtext(i: &[u8]) -> PResult<&[u8]> {
    is_not(" \t\r\n\\\"")(i)
}

fn qcontent(i: &[u8]) -> PResult<&[u8]> {
    alt((qtext, quoted_pair, is_a(" \t\r\n")))(i)
}

// RFC 2822 3.2.5 "Quoted string"
fn quoted_string(i: &[u8]) -> PResult<Vec<u8>> {
    delimited(
        pair(opt(cfws), char('"')),
        fold_many0(qcontent, Vec::new(), |mut acc: Vec<u8>, item| {
            acc.extend_from_slice(item);
            acc
        }),
        pair(char('"'), opt(cfws)),
    )(i)
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Word<'a> {
    Atom(&'a [u8]),
    Quoted(Vec<u8>),
    Dot,
}

// RFC 2822 3.2.6 "word"
fn word(i: &[u8]) -> PResult<Word<'_>> {
    alt((map(atom, Word::Atom), map(quoted_string, Word::Quoted)))(i)
}

// Part of the "obs-phrase" grammar, which accounts for the unquoted '.' many
// agents put into display names.
fn obs_dot(i: &[u8]) -> PResult<Word<'_>> {
    terminated(map(char('.'), |_| Word::Dot), opt(cfws))(i)
}

// RFC 2822 3.2.6 "phrase", with RFC 2047 encoded words decoded.
fn phrase(i: &[u8]) -> PResult<String> {
    map(pair(word, many0(alt((word, obs_dot)))), |(head, mut tail)| {
        tail.insert(0, head);
        assemble_phrase(&tail)
    })(i)
}

// Words are separated by single spaces, except that whitespace between
// adjacent encoded words disappears and none goes before an obsolete dot.
fn assemble_phrase(words: &[Word<'_>]) -> String {
    let mut out = String::new();
    let mut prev_encoded = false;
    for w in words {
        match *w {
            Word::Atom(a) => {
                let text = String::from_utf8_lossy(a);
                match ew_decode(&text) {
                    Some(decoded) => {
                        if !out.is_empty() && !prev_encoded {
                            out.push(' ');
                        }
                        out.push_str(&decoded);
                        prev_encoded = true;
                    }
                    None => {
                        if !out.is_empty() {
                            out.push(' ');
                        }
                        out.push_str(&text);
                        prev_encoded = false;
                    }
                }
            }
            Word::Quoted(ref q) => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&decode_header_text(q));
                prev_encoded = false;
            }
            Word::Dot => {
                out.push('.');
                prev_encoded = false;
            }
        }
    }
    out
}

// RFC 2822 3.3 date/time syntax, including obsolete forms. The obsolete
// forms allow CFWS between all terms, so it is accepted everywhere.
fn year(i: &[u8]) -> PResult<i32> {
    map(take_while_m_n(2, 4, ascii_digit), |s: &[u8]| {
        let y = digits_value(s) as i32;
        // RFC 2822 4.3
        if s.len() == 2 && y < 50 {
            y + 2000
        } else if s.len() < 4 {
            y + 1900
        } else {
            y
        }
    })(i)
}

fn month(i: &[u8]) -> PResult<u32> {
    alt((
        map(tag_no_case("jan"), |_| 1),
        map(tag_no_case("feb"), |_| 2),
        map(tag_no_case("mar"), |_| 3),
        map(tag_no_case("apr"), |_| 4),
        map(tag_no_case("may"), |_| 5),
        map(tag_no_case("jun"), |_| 6),
        map(tag_no_case("jul"), |_| 7),
        map(tag_no_case("aug"), |_| 8),
        map(tag_no_case("sep"), |_| 9),
        map(tag_no_case("oct"), |_| 10),
        map(tag_no_case("nov"), |_| 11),
        map(tag_no_case("dec"), |_| 12),
    ))(i)
}

fn day(i: &[u8]) -> PResult<u32> {
    map(take_while_m_n(1, 2, ascii_digit), digits_value)(i)
}

fn date(i: &[u8]) -> PResult<(i32, u32, u32)> {
    map(
        tuple((
            terminated(day, opt(cfws)),
            terminated(month, opt(cfws)),
            terminated(year, opt(cfws)),
        )),
        |(d, m, y)| (y, m, d),
    )(i)
}

fn two_digit(i: &[u8]) -> PResult<u32> {
    map(take_while_m_n(2, 2, ascii_digit), digits_value)(i)
}

fn colon(i: &[u8]) -> PResult<()> {
    map(tuple((opt(cfws), char(':'), opt(cfws))), |_| ())(i)
}

fn time_of_day(i: &[u8]) -> PResult<(u32, u32, u32)> {
    map(
        tuple((
            terminated(two_digit, colon),
            two_digit,
            opt(preceded(colon, two_digit)),
            opt(cfws),
        )),
        |(h, m, s, _)| (h, m, s.unwrap_or(0)),
    )(i)
}

// Offset east of UTC, in seconds.
fn numeric_zone(i: &[u8]) -> PResult<i32> {
    map(
        pair(
            alt((char('+'), char('-'))),
            pair(two_digit, two_digit),
        ),
        |(sign, (hh, mm))| {
            let n = (hh * 3600 + mm * 60) as i32;
            if '-' == sign {
                -n
            } else {
                n
            }
        },
    )(i)
}

fn zone(i: &[u8]) -> PResult<i32> {
    const H: i32 = 3600;
    alt((
        numeric_zone,
        map(alt((tag_no_case("gmt"), tag_no_case("ut"))), |_| 0),
        map(tag_no_case("edt"), |_| -4 * H),
        map(alt((tag_no_case("est"), tag_no_case("cdt"))), |_| -5 * H),
        map(alt((tag_no_case("cst"), tag_no_case("mdt"))), |_| -6 * H),
        map(alt((tag_no_case("mst"), tag_no_case("pdt"))), |_| -7 * H),
        map(tag_no_case("pst"), |_| -8 * H),
        // Military and unknown zones must be treated as UTC
        map(atext, |_| 0),
    ))(i)
}

fn date_time(i: &[u8]) -> PResult<Option<DateTime<FixedOffset>>> {
    map(
        preceded(
            // The day of week is redundant
            pair(opt(cfws), opt(tuple((atom, char(','), opt(cfws))))),
            tuple((date, terminated(pair(time_of_day, zone), opt(cfws)))),
        ),
        |((year, month, day), ((hour, minute, second), zone))| {
            FixedOffset::east_opt(zone).and_then(|off| {
                off.with_ymd_and_hms(year, month, day, hour, minute, second)
                    .single()
            })
        },
    )(i)
}

// RFC 2822 3.4.1 local part, via the obsolete syntax which subsumes the
// others.
fn local_part(i: &[u8]) -> PResult<String> {
    map(separated_nonempty_list(char('.'), word), |words| {
        words
            .iter()
            .map(|w| match *w {
                Word::Atom(a) => String::from_utf8_lossy(a).into_owned(),
                Word::Quoted(ref q) => String::from_utf8_lossy(q).into_owned(),
                Word::Dot => ".".to_owned(),
            })
            .collect::<Vec<_>>()
            .join(".")
    })(i)
}

fn obs_domain(i: &[u8]) -> PResult<String> {
    map(separated_nonempty_list(char('.'), atom), |parts| {
        parts
            .iter()
            .map(|p| String::from_utf8_lossy(p))
            .collect::<Vec<_>>()
            .join(".")
    })(i)
}

fn dcontent(i: &[u8]) -> PResult<&[u8]> {
    alt((is_not("[]\\ \t\r\n"), quoted_pair, fws))(i)
}

fn domain_literal(i: &[u8]) -> PResult<String> {
    map(
        delimited(
            pair(opt(cfws), char('[')),
            fold_many0(dcontent, Vec::new(), |mut acc: Vec<u8>, item| {
                acc.extend_from_slice(item);
                acc
            }),
            pair(char(']'), opt(cfws)),
        ),
        |content| format!("[{}]", String::from_utf8_lossy(&content)),
    )(i)
}

fn domain(i: &[u8]) -> PResult<String> {
    alt((obs_domain, domain_literal))(i)
}

// RFC 2822 3.4.1 address specification
fn addr_spec(i: &[u8]) -> PResult<String> {
    map(
        pair(local_part, preceded(char('@'), domain)),
        |(local, domain)| format!("{}@{}", local, domain),
    )(i)
}

// RFC 2822 4.4 obsolete routing information, discarded
fn obs_domain_list(i: &[u8]) -> PResult<()> {
    map(
        tuple((
            char('@'),
            domain,
            many0_count(tuple((
                many0_count(alt((cfws, map(char(','), |_| ())))),
                opt(cfws),
                char('@'),
                domain,
            ))),
            char(':'),
        )),
        |_| (),
    )(i)
}

fn angle_addr(i: &[u8]) -> PResult<String> {
    alt((
        delimited(
            tuple((opt(cfws), char('<'), opt(obs_domain_list))),
            addr_spec,
            pair(char('>'), opt(cfws)),
        ),
        // The null reverse path, as found in Return-Path
        map(tuple((opt(cfws), tag("<>"), opt(cfws))), |_| String::new()),
    ))(i)
}

fn mailbox(i: &[u8]) -> PResult<Address> {
    map(
        alt((
            pair(opt(phrase), angle_addr),
            map(addr_spec, |a| (None, a)),
        )),
        |(personal, mailbox)| Address { personal, mailbox },
    )(i)
}

fn obs_list_delim(i: &[u8]) -> PResult<()> {
    map(many1_count(tuple((opt(cfws), char(','), opt(cfws)))), |_| ())(i)
}

fn mailbox_list(i: &[u8]) -> PResult<Vec<Address>> {
    delimited(
        opt(obs_list_delim),
        separated_nonempty_list(obs_list_delim, mailbox),
        opt(obs_list_delim),
    )(i)
}

// RFC 2822 3.4 group. Groups are flattened into their members.
fn group(i: &[u8]) -> PResult<Vec<Address>> {
    map(
        pair(
            terminated(phrase, char(':')),
            terminated(
                opt(mailbox_list),
                tuple((opt(cfws), char(';'), opt(cfws))),
            ),
        ),
        |(_, boxes)| boxes.unwrap_or_default(),
    )(i)
}

fn address(i: &[u8]) -> PResult<Vec<Address>> {
    alt((map(mailbox, |m| vec![m]), group))(i)
}

fn address_list(i: &[u8]) -> PResult<Vec<Address>> {
    map(
        delimited(
            opt(obs_list_delim),
            separated_nonempty_list(obs_list_delim, address),
            opt(obs_list_delim),
        ),
        |groups| groups.into_iter().flatten().collect(),
    )(i)
}

/// Parse an address list header value.
///
/// Malformed entries are skipped rather than failing the whole list.
pub fn parse_address_list(value: &[u8]) -> Vec<Address> {
    if let Ok((rest, addrs)) = address_list(value) {
        if rest.iter().all(u8::is_ascii_whitespace) {
            return addrs;
        }
    }

    value
        .split(|&b| b',' == b)
        .filter_map(|chunk| match address(chunk) {
            Ok((_, addrs)) => Some(addrs),
            Err(_) => None,
        })
        .flatten()
        .filter(|a| !a.mailbox.is_empty())
        .collect()
}

/// Parse a single address, such as an `addr` attribute or a command line
/// argument.
pub fn parse_address(value: &str) -> Option<Address> {
    parse_address_list(value.as_bytes()).into_iter().next()
}

/// Parse an RFC 5322 date-time.
pub fn parse_datetime(value: &[u8]) -> Option<DateTime<FixedOffset>> {
    date_time(value).ok().and_then(|(_, dt)| dt)
}

/// Parse a list of message ids as found in `References` or `In-Reply-To`.
///
/// Anything between angle brackets counts; text outside is ignored unless
/// there are no brackets at all, in which case whitespace-separated tokens
/// are taken.
pub fn parse_msgid_list(value: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find('<') {
        match rest[start..].find('>') {
            Some(end) => {
                ids.push(rest[start..start + end + 1].to_owned());
                rest = &rest[start + end + 1..];
            }
            None => break,
        }
    }

    if ids.is_empty() {
        ids.extend(value.split_whitespace().map(str::to_owned));
    }
    ids
}

fn is_token_char(ch: u8) -> bool {
    ch > b' ' && ch < 0x7F && !b"()<>@,;:\\\"/[]?=".contains(&ch)
}

fn token(i: &[u8]) -> PResult<&[u8]> {
    take_while1(is_token_char)(i)
}

// Many agents emit unquoted parameter values containing tspecials, so the
// value syntax is looser than RFC 2045's.
fn loose_value(i: &[u8]) -> PResult<&[u8]> {
    is_not("; \t\r\n\"")(i)
}

fn parameter(i: &[u8]) -> PResult<(String, Vec<u8>)> {
    map(
        tuple((
            opt(cfws),
            token,
            opt(cfws),
            char('='),
            opt(cfws),
            alt((quoted_string, map(loose_value, <[u8]>::to_vec))),
            opt(cfws),
        )),
        |(_, name, _, _, _, value, _)| {
            (String::from_utf8_lossy(name).to_ascii_lowercase(), value)
        },
    )(i)
}

fn parameters(i: &[u8]) -> PResult<Vec<(String, Vec<u8>)>> {
    map(
        many0(preceded(
            pair(opt(cfws), char(';')),
            opt(alt((
                map(parameter, Some),
                // Unparseable junk up to the next ';'
                map(is_not(";"), |_| None),
            ))),
        )),
        |params| params.into_iter().flatten().flatten().collect(),
    )(i)
}

/// Parse a sequence of `; name=value` parameters.
pub fn parse_params(value: &[u8]) -> ParamList {
    match parameters(value) {
        Ok((_, raw)) => rfc2231_merge(raw),
        Err(_) => ParamList::default(),
    }
}

/// Parse a `Content-Type` value into the type, subtype, and parameters.
///
/// A missing subtype is returned as an empty string.
pub fn parse_content_type(value: &[u8]) -> Option<(String, String, ParamList)> {
    let (rest, (_, ty, _, subtype)) = tuple((
        opt(cfws),
        token,
        opt(cfws),
        opt(delimited(
            pair(char('/'), opt(cfws)),
            token,
            opt(cfws),
        )),
    ))(value)
    .ok()?;

    Some((
        String::from_utf8_lossy(ty).to_ascii_lowercase(),
        subtype
            .map(|s| String::from_utf8_lossy(s).to_ascii_lowercase())
            .unwrap_or_default(),
        parse_params(rest),
    ))
}

/// Parse a `Content-Disposition` value into the disposition type and
/// parameters.
pub fn parse_content_disposition(value: &[u8]) -> (String, ParamList) {
    match tuple((opt(cfws), token, opt(cfws)))(value) {
        Ok((rest, (_, disp, _))) => (
            String::from_utf8_lossy(disp).to_ascii_lowercase(),
            parse_params(rest),
        ),
        Err(_) => (String::new(), ParamList::default()),
    }
}

/// Combine RFC 2231 continuations and decode extended values.
///
/// Everything else is decoded as header text, which also covers the RFC
/// 2047 encoded words non-conforming agents put into parameters.
fn rfc2231_merge(raw: Vec<(String, Vec<u8>)>) -> ParamList {
    struct Continuation {
        name: String,
        index: u32,
        extended: bool,
        value: Vec<u8>,
    }

    let mut plain: Vec<(String, String)> = Vec::new();
    let mut continuations: Vec<Continuation> = Vec::new();

    for (name, value) in raw {
        let (base, extended) = match name.strip_suffix('*') {
            Some(base) => (base.to_owned(), true),
            None => (name.clone(), false),
        };

        let (base, index) = match base.rfind('*') {
            Some(star)
                if star + 1 < base.len()
                    && base[star + 1..].bytes().all(ascii_digit) =>
            {
                (
                    base[..star].to_owned(),
                    Some(digits_value(base[star + 1..].as_bytes())),
                )
            }
            _ => (base, None),
        };

        if !extended && index.is_none() {
            plain.push((base, decode_header_text(&value)));
        } else {
            continuations.push(Continuation {
                name: base,
                index: index.unwrap_or(0),
                extended,
                value,
            });
        }
    }

    continuations.sort_by(|a, b| {
        a.name.cmp(&b.name).then_with(|| a.index.cmp(&b.index))
    });

    let mut merged: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, String, Vec<u8>)> = None;
    for cont in continuations {
        let starts_new = current
            .as_ref()
            .map_or(true, |&(ref name, _, _)| *name != cont.name);
        if starts_new {
            if let Some((name, charset, data)) = current.take() {
                merged.push((name, convert_charset(&data, &charset)));
            }

            let mut charset = "us-ascii".to_owned();
            let mut value = &cont.value[..];
            if cont.extended {
                // charset'language'value
                let mut split = value.splitn(3, |&b| b'\'' == b);
                if let (Some(cs), Some(_), Some(rest)) =
                    (split.next(), split.next(), split.next())
                {
                    if !cs.is_empty() {
                        charset = String::from_utf8_lossy(cs).into_owned();
                    }
                    value = rest;
                }
            }
            current = Some((cont.name.clone(), charset, Vec::new()));
            if let Some((_, _, ref mut data)) = current {
                append_continuation(data, value, cont.extended);
            }
        } else if let Some((_, _, ref mut data)) = current {
            append_continuation(data, &cont.value, cont.extended);
        }
    }
    if let Some((name, charset, data)) = current.take() {
        merged.push((name, convert_charset(&data, &charset)));
    }

    // Extended forms take precedence over plain ones of the same name.
    plain.retain(|p| !merged.iter().any(|m| m.0 == p.0));
    plain.extend(merged);
    ParamList(plain)
}

fn append_continuation(dst: &mut Vec<u8>, value: &[u8], extended: bool) {
    if !extended {
        dst.extend_from_slice(value);
        return;
    }

    let mut i = 0;
    while i < value.len() {
        if b'%' == value[i] && i + 2 < value.len() {
            if let Some(b) = str::from_utf8(&value[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                dst.push(b);
                i += 3;
                continue;
            }
        }
        dst.push(value[i]);
        i += 1;
    }
}
