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

//! Building the MIME tree of a message.
//!
//! Parsing never fails outright. Malformed structure degrades to something
//! renderable, such as a multipart without a usable boundary being left with
//! no children.

use std::rc::Rc;

use log::debug;
use memchr::memchr;

use super::encoded_word::decode_header_text;
use super::header::*;
use super::model::*;

/// One header field, unfolded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawHeader {
    pub name: String,
    pub value: Vec<u8>,
}

/// Split the header block of the entity starting at `start`.
///
/// Returns the headers and the offset of the first byte after the blank line
/// terminating them. A line which is neither a header nor a continuation also
/// ends the header block, and is then the first line of the body.
pub fn read_headers(
    data: &[u8],
    start: usize,
    end: usize,
) -> (Vec<RawHeader>, usize) {
    let end = end.min(data.len());
    let mut headers: Vec<RawHeader> = Vec::new();
    let mut pos = start.min(end);

    while pos < end {
        let (line_end, next) = match memchr(b'\n', &data[pos..end]) {
            Some(nl) => (pos + nl, pos + nl + 1),
            None => (end, end),
        };
        let mut line = &data[pos..line_end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        if line.is_empty() {
            return (headers, next);
        }

        if b' ' == line[0] || b'\t' == line[0] {
            if let Some(last) = headers.last_mut() {
                last.value.extend_from_slice(line);
                pos = next;
                continue;
            }
        }

        // The mbox separator
        if pos == start && line.starts_with(b"From ") {
            pos = next;
            continue;
        }

        match memchr(b':', line) {
            Some(colon)
                if colon > 0
                    && line[..colon].iter().all(|&b| b > b' ' && b < 0x7F) =>
            {
                let value = &line[colon + 1..];
                let skip = value
                    .iter()
                    .take_while(|&&b| b' ' == b || b'\t' == b)
                    .count();
                headers.push(RawHeader {
                    name: String::from_utf8_lossy(&line[..colon]).into_owned(),
                    value: value[skip..].to_vec(),
                });
            }
            _ => return (headers, pos),
        }

        pos = next;
    }

    (headers, end)
}

fn trimmed(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim().to_owned()
}

/// Apply one header to `env`. Returns whether it was an envelope header.
pub fn apply_envelope_header(
    env: &mut Envelope,
    name: &str,
    value: &[u8],
) -> bool {
    let addresses = match name.to_ascii_lowercase().as_str() {
        "from" => &mut env.from,
        "to" => &mut env.to,
        "cc" => &mut env.cc,
        "bcc" => &mut env.bcc,
        "sender" => &mut env.sender,
        "reply-to" => &mut env.reply_to,
        "mail-followup-to" => &mut env.mail_followup_to,
        "x-original-to" => &mut env.x_original_to,
        "return-path" => &mut env.return_path,
        "subject" => {
            env.subject = Some(decode_header_text(value).trim().to_owned());
            return true;
        }
        "date" => {
            env.date = Some(trimmed(value));
            return true;
        }
        "message-id" => {
            env.message_id = Some(trimmed(value));
            return true;
        }
        "references" => {
            env.references = parse_msgid_list(&trimmed(value));
            return true;
        }
        "in-reply-to" => {
            env.in_reply_to = parse_msgid_list(&trimmed(value));
            return true;
        }
        "autocrypt" => {
            env.autocrypt.push(trimmed(value));
            return true;
        }
        "autocrypt-gossip" => {
            env.autocrypt_gossip.push(trimmed(value));
            return true;
        }
        _ => return false,
    };

    addresses.extend(parse_address_list(value));
    true
}

fn default_subtype(body_type: BodyType) -> &'static str {
    match body_type {
        BodyType::Text => "plain",
        BodyType::Audio => "basic",
        BodyType::Message => "rfc822",
        BodyType::Application => "octet-stream",
        _ => "x-unknown",
    }
}

/// Apply one header to `body`. Returns whether it was a content header.
pub fn apply_content_header(body: &mut Body, name: &str, value: &[u8]) -> bool {
    match name.to_ascii_lowercase().as_str() {
        "content-type" => {
            if let Some((ty, subtype, params)) = parse_content_type(value) {
                body.body_type = BodyType::parse(&ty);
                body.xtype = if BodyType::Other == body.body_type {
                    Some(ty)
                } else {
                    None
                };
                body.subtype = if subtype.is_empty() {
                    default_subtype(body.body_type).to_owned()
                } else {
                    subtype
                };
                if body.filename.is_none() {
                    body.filename = params.get("name").map(str::to_owned);
                }
                body.params = params;
            }
        }
        "content-transfer-encoding" => {
            body.encoding = Encoding::parse(&trimmed(value));
        }
        "content-disposition" => {
            let (disp, params) = parse_content_disposition(value);
            body.disposition = match disp.as_str() {
                "inline" => Disposition::Inline,
                "form-data" => Disposition::FormData,
                _ => Disposition::Attach,
            };
            if let Some(filename) = params.get("filename") {
                body.filename = Some(filename.to_owned());
            }
        }
        "content-description" => {
            body.description =
                Some(decode_header_text(value).trim().to_owned());
        }
        "content-language" => {
            body.language = Some(trimmed(value));
        }
        "mime-version" | "content-id" | "content-length" | "content-md5" => {
        }
        _ => return false,
    }
    true
}

/// Parse a complete message.
pub fn parse_message(data: Rc<[u8]>) -> Email {
    let end = data.len();
    parse_message_at(&data, 0, end)
}

/// Parse the message occupying `data[start..end]`.
pub fn parse_message_at(data: &Rc<[u8]>, start: usize, end: usize) -> Email {
    let (headers, body_start) = read_headers(data, start, end);

    let mut env = Envelope::default();
    let mut body = Body {
        hdr_offset: start,
        offset: body_start,
        length: end.saturating_sub(body_start),
        ..Body::default()
    };
    for header in &headers {
        if !apply_content_header(&mut body, &header.name, &header.value)
            && !apply_envelope_header(&mut env, &header.name, &header.value)
        {
            env.userhdrs
                .push((header.name.clone(), trimmed(&header.value)));
        }
    }

    parse_part(data, &mut body);

    let date_sent =
        env.date.as_ref().and_then(|d| parse_datetime(d.as_bytes()));
    Email {
        env,
        body,
        security: Default::default(),
        date_sent,
        source: Some(Rc::clone(data)),
    }
}

/// Parse a MIME entity (headers and payload) occupying `data[start..end]`.
///
/// Headers which belong to the message rather than to the part are collected
/// into `mime_headers`. `digest` selects the `multipart/digest` default type.
pub fn parse_entity(
    data: &Rc<[u8]>,
    start: usize,
    end: usize,
    digest: bool,
) -> Body {
    let (headers, body_start) = read_headers(data, start, end);

    let mut body = Body {
        hdr_offset: start,
        offset: body_start,
        length: end.saturating_sub(body_start),
        ..Body::default()
    };
    if digest {
        body.body_type = BodyType::Message;
        body.subtype = "rfc822".to_owned();
    }

    let mut env = Envelope::default();
    let mut any_envelope = false;
    for header in &headers {
        if !apply_content_header(&mut body, &header.name, &header.value) {
            any_envelope |=
                apply_envelope_header(&mut env, &header.name, &header.value);
        }
    }
    if any_envelope {
        body.mime_headers = Some(Box::new(env));
    }

    parse_part(data, &mut body);
    body
}

/// Parse a free-standing entity, such as the output of a decryption.
pub fn parse_entity_bytes(data: Rc<[u8]>) -> Body {
    let end = data.len();
    parse_entity(&data, 0, end, false)
}

/// Fill in the children of a multipart or message part.
pub fn parse_part(data: &Rc<[u8]>, body: &mut Body) {
    let end = (body.offset + body.length).min(data.len());
    match body.body_type {
        BodyType::Multipart => {
            let boundary = match body.param("boundary") {
                Some(b) if !b.is_empty() => b.to_owned(),
                _ => {
                    debug!("multipart/{} without boundary", body.subtype);
                    return;
                }
            };
            let digest = "digest" == body.subtype;
            body.parts =
                parse_multipart(data, body.offset, end, &boundary, digest);
        }
        BodyType::Message
            if body.encoding.is_identity()
                && ("rfc822" == body.subtype
                    || "news" == body.subtype
                    || "global" == body.subtype) =>
        {
            body.email =
                Some(Box::new(parse_message_at(data, body.offset, end)));
        }
        _ => (),
    }
}

/// Split `data[start..end]` on `boundary` and parse each part.
pub fn parse_multipart(
    data: &Rc<[u8]>,
    start: usize,
    end: usize,
    boundary: &str,
    digest: bool,
) -> Vec<Body> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();
    let mut part_start: Option<usize> = None;
    let mut pos = start;

    while pos < end {
        let (line_end, next) = match memchr(b'\n', &data[pos..end]) {
            Some(nl) => (pos + nl, pos + nl + 1),
            None => (end, end),
        };
        let line = &data[pos..line_end];

        if line.starts_with(delimiter) {
            let tail = &line[delimiter.len()..];
            let tail_trimmed: Vec<u8> = tail
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            let is_final = b"--" == &tail_trimmed[..];
            if is_final || tail_trimmed.is_empty() {
                if let Some(ps) = part_start.take() {
                    // The line ending before the delimiter belongs to it
                    let mut pe = pos;
                    if pe > ps && b'\n' == data[pe - 1] {
                        pe -= 1;
                        if pe > ps && b'\r' == data[pe - 1] {
                            pe -= 1;
                        }
                    }
                    parts.push(parse_entity(data, ps, pe, digest));
                }

                if is_final {
                    return parts;
                }
                part_start = Some(next);
            }
        }

        pos = next;
    }

    if let Some(ps) = part_start {
        debug!("Missing final boundary for {}", boundary);
        parts.push(parse_entity(data, ps, end, digest));
    }
    parts
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(text: &str) -> Email {
        parse_message(Rc::from(text.replace('\n', "\r\n").as_bytes()))
    }

    #[test]
    fn headers_and_envelope() {
        let email = parse(
            "From: Alice <alice@example.com>\n\
             To: bob@example.org,\n  carol@example.net\n\
             Subject: =?UTF-8?Q?caf=C3=A9?= talk\n\
             Date: Tue, 1 Jun 2021 10:00:00 +0000\n\
             Message-ID: <m1@example.com>\n\
             Autocrypt: addr=alice@example.com; keydata=AAAA\n\
             X-Custom: yes\n\
             \n\
             Body\n",
        );
        assert_eq!("alice@example.com", email.env.from[0].mailbox);
        assert_eq!(2, email.env.to.len());
        assert_eq!(Some("café talk".to_owned()), email.env.subject);
        assert_eq!(Some("<m1@example.com>".to_owned()), email.env.message_id);
        assert_eq!(1, email.env.autocrypt.len());
        assert_eq!(
            vec![("X-Custom".to_owned(), "yes".to_owned())],
            email.env.userhdrs
        );
        assert!(email.date_sent.is_some());
        assert!(email.body.is(BodyType::Text, "plain"));
        let source = email.source.as_ref().unwrap();
        assert_eq!(b"Body\r\n", email.body.raw(source));
    }

    #[test]
    fn multipart_structure() {
        let email = parse(
            "Content-Type: multipart/mixed; boundary=\"XX\"\n\
             \n\
             preamble\n\
             --XX\n\
             Content-Type: text/plain\n\
             \n\
             first\n\
             --XX\n\
             Content-Type: application/octet-stream\n\
             Content-Transfer-Encoding: base64\n\
             Content-Disposition: attachment; filename=\"a.bin\"\n\
             \n\
             AAEC\n\
             --XX--\n\
             epilogue\n",
        );
        let source = email.source.clone().unwrap();
        assert!(email.body.is(BodyType::Multipart, "mixed"));
        assert_eq!(2, email.body.parts.len());
        assert_eq!(b"first", email.body.parts[0].raw(&source));
        let att = &email.body.parts[1];
        assert_eq!(Encoding::Base64, att.encoding);
        assert_eq!(Disposition::Attach, att.disposition);
        assert_eq!(Some("a.bin".to_owned()), att.filename);
        assert_eq!(b"AAEC", att.raw(&source));
        assert_eq!(
            b"Content-Type: text/plain\r\n\r\nfirst".to_vec(),
            email.body.parts[0].raw_entity(&source).to_vec()
        );
    }

    #[test]
    fn empty_part_has_zero_length() {
        let email = parse(
            "Content-Type: multipart/mixed; boundary=b\n\
             \n\
             --b\n\
             Content-Type: text/plain; charset=us-ascii\n\
             \n\
             --b\n\
             Content-Type: application/pgp-encrypted\n\
             \n\
             Version: 1\n\
             --b--\n",
        );
        assert_eq!(2, email.body.parts.len());
        assert_eq!(0, email.body.parts[0].length);
    }

    #[test]
    fn protected_headers_collected() {
        let data: Rc<[u8]> = Rc::from(
            &b"Content-Type: text/plain; protected-headers=\"v1\"\n\
               Subject: Secret subject\n\
               From: alice@example.com\n\
               \n\
               hidden\n"[..],
        );
        let body = parse_entity_bytes(data);
        let env = body.mime_headers.unwrap();
        assert_eq!(Some("Secret subject".to_owned()), env.subject);
        assert_eq!("alice@example.com", env.from[0].mailbox);
        assert_eq!(Some("v1"), body.params.get("protected-headers"));
    }

    #[test]
    fn nested_message() {
        let email = parse(
            "Content-Type: message/rfc822\n\
             \n\
             Subject: inner\n\
             \n\
             inner body\n",
        );
        let inner = email.body.email.as_ref().unwrap();
        assert_eq!(Some("inner".to_owned()), inner.env.subject);
        let source = email.source.clone().unwrap();
        assert_eq!(b"inner body\r\n", inner.body.raw(&source));
    }

    #[test]
    fn missing_final_boundary_and_digest() {
        let email = parse(
            "Content-Type: multipart/digest; boundary=d\n\
             \n\
             --d\n\
             \n\
             Subject: digested\n\
             \n\
             text\n",
        );
        assert_eq!(1, email.body.parts.len());
        let part = &email.body.parts[0];
        assert!(part.is(BodyType::Message, "rfc822"));
        assert_eq!(
            Some("digested".to_owned()),
            part.email.as_ref().unwrap().env.subject
        );
    }

    #[test]
    fn headerless_part() {
        let (headers, body_start) = read_headers(b"not a header\nmore", 0, 17);
        assert!(headers.is_empty());
        assert_eq!(0, body_start);
    }
}
