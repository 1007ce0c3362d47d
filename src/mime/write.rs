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

//! Serialising the MIME tree.
//!
//! Output uses bare LF line endings. Parts which were parsed from a source
//! buffer are copied from it verbatim (their transfer encoding is kept);
//! parts built in memory have their `content` encoded on the way out.

use rand::distributions::Alphanumeric;
use rand::Rng;

use super::content_encoding::{decode_transfer, encode_transfer};
use super::encoded_word::ew_encode;
use super::model::*;

const TSPECIALS: &[u8] = b"()<>@,;:\\\"/[]?=";

/// A fresh random multipart boundary.
pub fn generate_boundary() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .collect()
}

/// Give every multipart in the tree a boundary if it lacks one.
///
/// Anything that will be signed must have this applied first, since the
/// bytes written must not change between signing and sending.
pub fn assign_boundaries(body: &mut Body) {
    if body.is_multipart() && body.param("boundary").is_none() {
        body.params.set("boundary", generate_boundary());
    }
    for part in &mut body.parts {
        assign_boundaries(part);
    }
    if let Some(ref mut email) = body.email {
        assign_boundaries(&mut email.body);
    }
}

fn write_param(out: &mut Vec<u8>, name: &str, value: &str) {
    if !value.is_ascii() {
        out.extend_from_slice(format!(";\n\t{}*=utf-8''", name).as_bytes());
        for &b in value.as_bytes() {
            if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
                out.push(b);
            } else {
                out.extend_from_slice(format!("%{:02X}", b).as_bytes());
            }
        }
        return;
    }

    let needs_quotes = value.is_empty()
        || value
            .bytes()
            .any(|b| b <= b' ' || b >= 0x7F || TSPECIALS.contains(&b));
    out.extend_from_slice(b"; ");
    out.extend_from_slice(name.as_bytes());
    out.push(b'=');
    if needs_quotes {
        out.push(b'"');
        for b in value.bytes() {
            if b'"' == b || b'\\' == b {
                out.push(b'\\');
            }
            out.push(b);
        }
        out.push(b'"');
    } else {
        out.extend_from_slice(value.as_bytes());
    }
}

fn write_address_header(out: &mut Vec<u8>, name: &str, addrs: &[Address]) {
    if addrs.is_empty() {
        return;
    }
    let formatted = addrs
        .iter()
        .map(|a| match a.personal {
            Some(ref p) if !p.is_ascii() => {
                format!("{} <{}>", ew_encode(p), a.mailbox)
            }
            _ => a.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",\n\t");
    out.extend_from_slice(format!("{}: {}\n", name, formatted).as_bytes());
}

fn write_opt_header(out: &mut Vec<u8>, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        out.extend_from_slice(format!("{}: {}\n", name, value).as_bytes());
    }
}

fn write_list_header(out: &mut Vec<u8>, name: &str, values: &[String]) {
    if !values.is_empty() {
        out.extend_from_slice(
            format!("{}: {}\n", name, values.join(" ")).as_bytes(),
        );
    }
}

/// Write the headers of an envelope that describe the message itself.
///
/// This is used both for the top-level header block and for protected
/// headers embedded in a part.
pub fn write_envelope_headers(out: &mut Vec<u8>, env: &Envelope) {
    write_opt_header(out, "Date", env.date.as_deref());
    write_address_header(out, "From", &env.from);
    write_address_header(out, "Sender", &env.sender);
    write_address_header(out, "To", &env.to);
    write_address_header(out, "Cc", &env.cc);
    write_address_header(out, "Bcc", &env.bcc);
    write_address_header(out, "Reply-To", &env.reply_to);
    write_address_header(out, "Mail-Followup-To", &env.mail_followup_to);
    if let Some(ref subject) = env.subject {
        out.extend_from_slice(
            format!("Subject: {}\n", ew_encode(subject)).as_bytes(),
        );
    }
    write_opt_header(out, "Message-ID", env.message_id.as_deref());
    write_list_header(out, "References", &env.references);
    write_list_header(out, "In-Reply-To", &env.in_reply_to);
    for value in &env.autocrypt {
        write_opt_header(out, "Autocrypt", Some(value));
    }
    for value in &env.autocrypt_gossip {
        write_opt_header(out, "Autocrypt-Gossip", Some(value));
    }
}

fn write_mime_header_with(
    out: &mut Vec<u8>,
    body: &Body,
    boundary: Option<&str>,
) {
    out.extend_from_slice(b"Content-Type: ");
    out.extend_from_slice(body.mime_type().as_bytes());
    for (name, value) in body.params.iter() {
        if name.eq_ignore_ascii_case("boundary") {
            continue;
        }
        write_param(out, name, value);
    }
    if let Some(boundary) = boundary {
        write_param(out, "boundary", boundary);
    }
    out.push(b'\n');

    if let Some(ref description) = body.description {
        out.extend_from_slice(
            format!("Content-Description: {}\n", ew_encode(description))
                .as_bytes(),
        );
    }

    if body.use_disp && Disposition::None != body.disposition {
        out.extend_from_slice(b"Content-Disposition: ");
        out.extend_from_slice(match body.disposition {
            Disposition::Attach => b"attachment",
            Disposition::FormData => b"form-data",
            _ => b"inline",
        });
        let filename = body.d_filename.as_ref().or(body.filename.as_ref());
        if let Some(filename) = filename {
            let base = filename.rsplit('/').next().unwrap_or(filename);
            write_param(out, "filename", base);
        }
        out.push(b'\n');
    }

    if Encoding::SevenBit != body.encoding {
        out.extend_from_slice(
            format!("Content-Transfer-Encoding: {}\n", body.encoding.as_str())
                .as_bytes(),
        );
    }

    if let Some(ref language) = body.language {
        write_opt_header(out, "Content-Language", Some(language));
    }

    if let Some(ref env) = body.mime_headers {
        write_envelope_headers(out, env);
    }
}

/// Write the MIME headers of `body`, without the terminating blank line.
pub fn write_mime_header(out: &mut Vec<u8>, body: &Body) {
    write_mime_header_with(out, body, body.param("boundary"));
}

fn write_mime_body_with(
    out: &mut Vec<u8>,
    body: &Body,
    source: Option<&[u8]>,
    boundary: Option<&str>,
) {
    if body.is_multipart() {
        let boundary = boundary.unwrap_or("");
        for part in &body.parts {
            out.extend_from_slice(format!("\n--{}\n", boundary).as_bytes());
            write_entity(out, part, source);
        }
        out.extend_from_slice(format!("\n--{}--\n", boundary).as_bytes());
        return;
    }

    if let (Some(ref email), None) =
        (body.email.as_ref(), body.content.as_ref())
    {
        if email.source.is_none() {
            write_message(out, email);
            return;
        }
    }

    match (body.content.as_ref(), source) {
        (Some(content), _) => {
            out.extend_from_slice(&encode_transfer(
                body.encoding,
                content,
                body.is_text(),
            ));
        }
        (None, Some(source)) => out.extend_from_slice(body.raw(source)),
        (None, None) => (),
    }
}

/// Write the payload of `body`, with the parts of a multipart.
pub fn write_mime_body(out: &mut Vec<u8>, body: &Body, source: Option<&[u8]>) {
    write_mime_body_with(out, body, source, body.param("boundary"));
}

/// Write a complete entity: MIME headers, blank line and payload.
pub fn write_entity(out: &mut Vec<u8>, body: &Body, source: Option<&[u8]>) {
    let generated;
    let boundary = match body.param("boundary") {
        Some(b) => Some(b),
        None if body.is_multipart() => {
            generated = generate_boundary();
            Some(generated.as_str())
        }
        None => None,
    };
    write_mime_header_with(out, body, boundary);
    out.push(b'\n');
    write_mime_body_with(out, body, source, boundary);
}

/// Write a complete message.
pub fn write_message(out: &mut Vec<u8>, email: &Email) {
    write_envelope_headers(out, &email.env);
    for (name, value) in &email.env.userhdrs {
        out.extend_from_slice(format!("{}: {}\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"MIME-Version: 1.0\n");
    write_entity(out, &email.body, email.source.as_deref());
}

/// Turn a parsed body into one which carries its own payload, so that it
/// can outlive `source` and be rewrapped while composing.
///
/// Leaf payloads are decoded; they are re-encoded with the same transfer
/// encoding when written.
pub fn detach(body: &Body, source: &[u8]) -> Body {
    let mut out = Body {
        parts: body.parts.iter().map(|p| detach(p, source)).collect(),
        email: None,
        hdr_offset: 0,
        offset: 0,
        length: 0,
        ..body.clone()
    };

    if let Some(ref email) = body.email {
        let inner_source = email.source.as_deref().unwrap_or(source);
        out.email = Some(Box::new(Email {
            body: detach(&email.body, inner_source),
            source: None,
            ..(**email).clone()
        }));
    } else if !body.is_multipart() && body.content.is_none() {
        out.content =
            Some(decode_transfer(body.encoding, body.raw(source)).into_owned());
    }
    out
}

/// Convenience: an entity rendered to a fresh buffer.
pub fn entity_to_vec(body: &Body, source: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    write_entity(&mut out, body, source);
    out
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::super::parse::{parse_entity_bytes, parse_message};
    use super::*;

    #[test]
    fn leaf_headers() {
        let mut body = Body::new_leaf(BodyType::Text, "plain", "héllo\n");
        body.params.set("charset", "utf-8");
        body.encoding = Encoding::QuotedPrintable;
        body.disposition = Disposition::Attach;
        body.filename = Some("/tmp/some file.txt".to_owned());
        body.description = Some("A note".to_owned());

        let text = String::from_utf8(entity_to_vec(&body, None)).unwrap();
        assert_eq!(
            "Content-Type: text/plain; charset=utf-8\n\
             Content-Description: A note\n\
             Content-Disposition: attachment; filename=\"some file.txt\"\n\
             Content-Transfer-Encoding: quoted-printable\n\
             \n\
             h=C3=A9llo\n",
            text
        );
    }

    #[test]
    fn multipart_round_trip() {
        let mut body = Body::new_multipart(
            "mixed",
            vec![
                Body::new_leaf(BodyType::Text, "plain", "one\n"),
                Body {
                    encoding: Encoding::Base64,
                    ..Body::new_leaf(
                        BodyType::Application,
                        "octet-stream",
                        vec![0u8, 1, 2],
                    )
                },
            ],
        );
        assign_boundaries(&mut body);
        let written = entity_to_vec(&body, None);

        let parsed = parse_entity_bytes(Rc::from(written.as_slice()));
        assert!(parsed.is(BodyType::Multipart, "mixed"));
        assert_eq!(body.param("boundary"), parsed.param("boundary"));
        assert_eq!(2, parsed.parts.len());
        assert_eq!(b"one\n", parsed.parts[0].raw(&written));
        assert_eq!(Encoding::Base64, parsed.parts[1].encoding);
    }

    #[test]
    fn protected_headers_are_written() {
        let mut body = Body::new_leaf(BodyType::Text, "plain", "x");
        body.params.set("protected-headers", "v1");
        body.mime_headers = Some(Box::new(Envelope {
            subject: Some("Hidden".to_owned()),
            autocrypt_gossip: vec![
                "addr=b@example.com; keydata=AAAA".to_owned()
            ],
            ..Envelope::default()
        }));
        let text = String::from_utf8(entity_to_vec(&body, None)).unwrap();
        assert!(text.contains("protected-headers=v1\n"));
        assert!(text.contains("Subject: Hidden\n"));
        assert!(text
            .contains("Autocrypt-Gossip: addr=b@example.com; keydata=AAAA\n"));
    }

    #[test]
    fn parsed_message_rewrites_verbatim_payload() {
        let email = parse_message(Rc::from(
            &b"From: a@example.com\nSubject: hi\n\
               Content-Type: text/plain\nContent-Transfer-Encoding: base64\n\
               \naGk=\n"[..],
        ));
        let mut out = Vec::new();
        write_message(&mut out, &email);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("From: a@example.com\nSubject: hi\n"));
        assert!(text.contains("MIME-Version: 1.0\n"));
        assert!(text.ends_with("Content-Transfer-Encoding: base64\n\naGk=\n"));
    }

    #[test]
    fn detached_body_survives_without_source() {
        let source: Rc<[u8]> = Rc::from(
            &b"Content-Type: multipart/mixed; boundary=xx\n\n\
               --xx\nContent-Type: text/plain\n\
               Content-Transfer-Encoding: quoted-printable\n\nh=C3=A9\n\
               --xx\nContent-Type: message/rfc822\n\n\
               Subject: inner\n\ninner body\n\
               --xx--\n"[..],
        );
        let parsed = parse_entity_bytes(Rc::clone(&source));
        let detached = detach(&parsed, &source);

        assert_eq!(
            Some("h\u{e9}".as_bytes()),
            detached.parts[0].content.as_deref()
        );
        let inner = detached.parts[1].email.as_ref().unwrap();
        assert!(inner.source.is_none());
        assert_eq!(Some(&b"inner body"[..]), inner.body.content.as_deref());

        let rewritten = entity_to_vec(&detached, None);
        let reparsed = parse_entity_bytes(Rc::from(rewritten.as_slice()));
        assert_eq!(2, reparsed.parts.len());
        assert_eq!(b"h=C3=A9", reparsed.parts[0].raw(&rewritten));
    }
}
