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

//! The owned representation of a message and its MIME tree.
//!
//! A parsed body does not carry its payload. Instead, `hdr_offset`,
//! `offset` and `length` locate it within the buffer the message was parsed
//! from. Bodies built in memory (while composing) carry their decoded
//! payload in `content` instead.

use std::fmt;
use std::rc::Rc;

use chrono::prelude::*;

use crate::crypt::flags::SecurityFlags;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Address {
    pub personal: Option<String>,
    pub mailbox: String,
}

impl Address {
    pub fn new(mailbox: impl Into<String>) -> Self {
        Address {
            personal: None,
            mailbox: mailbox.into(),
        }
    }

    pub fn with_personal(
        personal: impl Into<String>,
        mailbox: impl Into<String>,
    ) -> Self {
        Address {
            personal: Some(personal.into()),
            mailbox: mailbox.into(),
        }
    }

    pub fn mailbox_eq(&self, other: &Address) -> bool {
        self.mailbox.eq_ignore_ascii_case(&other.mailbox)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.personal {
            Some(ref personal) if !personal.is_empty() => {
                let plain = personal.bytes().all(|b| {
                    b.is_ascii_alphanumeric()
                        || b" !#$%&'*+-/=?^_`{|}~".contains(&b)
                        || b >= 0x80
                });
                if plain {
                    write!(f, "{} <{}>", personal, self.mailbox)
                } else {
                    write!(
                        f,
                        "\"{}\" <{}>",
                        personal.replace('\\', "\\\\").replace('"', "\\\""),
                        self.mailbox
                    )
                }
            }
            _ => write!(f, "{}", self.mailbox),
        }
    }
}

/// Joins addresses the way they appear in a header.
pub fn format_address_list(addrs: &[Address]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The RFC 5322 header fields the security core looks at.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub return_path: Vec<Address>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub mail_followup_to: Vec<Address>,
    pub x_original_to: Vec<Address>,
    pub subject: Option<String>,
    /// The `Date` header, as it appeared.
    pub date: Option<String>,
    pub message_id: Option<String>,
    pub references: Vec<String>,
    pub in_reply_to: Vec<String>,
    /// Raw values of every `Autocrypt` header.
    pub autocrypt: Vec<String>,
    /// Raw values of every `Autocrypt-Gossip` header.
    pub autocrypt_gossip: Vec<String>,
    /// Every header not otherwise represented, in order.
    pub userhdrs: Vec<(String, String)>,
}

impl Envelope {
    /// Whether any field is set at all.
    pub fn is_empty(&self) -> bool {
        *self == Envelope::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyType {
    Other,
    Audio,
    Application,
    Image,
    Message,
    Model,
    Multipart,
    Text,
    Video,
}

impl BodyType {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "audio" => BodyType::Audio,
            "application" => BodyType::Application,
            "image" => BodyType::Image,
            "message" => BodyType::Message,
            "model" => BodyType::Model,
            "multipart" => BodyType::Multipart,
            "text" => BodyType::Text,
            "video" => BodyType::Video,
            _ => BodyType::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BodyType::Other => "x-unknown",
            BodyType::Audio => "audio",
            BodyType::Application => "application",
            BodyType::Image => "image",
            BodyType::Message => "message",
            BodyType::Model => "model",
            BodyType::Multipart => "multipart",
            BodyType::Text => "text",
            BodyType::Video => "video",
        }
    }
}

/// Content-Transfer-Encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    SevenBit,
    EightBit,
    QuotedPrintable,
    Base64,
    Binary,
    UuEncoded,
    Other,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::SevenBit
    }
}

impl Encoding {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "7bit" => Encoding::SevenBit,
            "8bit" => Encoding::EightBit,
            "quoted-printable" => Encoding::QuotedPrintable,
            "base64" => Encoding::Base64,
            "binary" => Encoding::Binary,
            "x-uuencode" | "x-uue" | "uuencode" => Encoding::UuEncoded,
            _ => Encoding::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::SevenBit => "7bit",
            Encoding::EightBit => "8bit",
            Encoding::QuotedPrintable => "quoted-printable",
            Encoding::Base64 => "base64",
            Encoding::Binary => "binary",
            Encoding::UuEncoded => "x-uuencoded",
            Encoding::Other => "x-unknown",
        }
    }

    /// Whether the encoding leaves the content as-is.
    pub fn is_identity(self) -> bool {
        match self {
            Encoding::SevenBit | Encoding::EightBit | Encoding::Binary => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attach,
    FormData,
    None,
}

impl Default for Disposition {
    fn default() -> Self {
        Disposition::Inline
    }
}

/// An ordered list of MIME parameters with case-insensitive names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamList(pub Vec<(String, String)>);

impl ParamList {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|p| p.0.eq_ignore_ascii_case(name))
            .map(|p| p.1.as_str())
    }

    /// Replace the value of `name`, appending it if absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(slot) = self
            .0
            .iter_mut()
            .find(|p| p.0.eq_ignore_ascii_case(name))
        {
            slot.1 = value;
        } else {
            self.0.push((name.to_owned(), value));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|p| !p.0.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Body {
    pub body_type: BodyType,
    /// The literal type name when `body_type` is `Other`.
    pub xtype: Option<String>,
    /// Always lower case.
    pub subtype: String,
    pub params: ParamList,
    pub encoding: Encoding,
    /// Where the MIME headers of this part start in the source.
    pub hdr_offset: usize,
    /// Where the (still transfer-encoded) payload starts in the source.
    pub offset: usize,
    pub length: usize,
    pub parts: Vec<Body>,
    /// The embedded message of a `message/rfc822` part.
    pub email: Option<Box<Email>>,
    /// Headers found among this part's MIME headers which belong to the
    /// message itself, i.e. protected headers.
    pub mime_headers: Option<Box<Envelope>>,
    pub description: Option<String>,
    /// `filename` or `name` as found in the part headers.
    pub filename: Option<String>,
    /// Filename to advertise when writing the part.
    pub d_filename: Option<String>,
    pub disposition: Disposition,
    /// Whether to write a `Content-Disposition` header at all.
    pub use_disp: bool,
    pub language: Option<String>,
    /// The decoded payload of a part built in memory.
    pub content: Option<Vec<u8>>,
    pub goodsig: bool,
    pub badsig: bool,
    pub warnsig: bool,
    pub is_autocrypt: bool,
}

impl Default for Body {
    fn default() -> Self {
        Body {
            body_type: BodyType::Text,
            xtype: None,
            subtype: "plain".to_owned(),
            params: ParamList::default(),
            encoding: Encoding::SevenBit,
            hdr_offset: 0,
            offset: 0,
            length: 0,
            parts: vec![],
            email: None,
            mime_headers: None,
            description: None,
            filename: None,
            d_filename: None,
            disposition: Disposition::Inline,
            use_disp: true,
            language: None,
            content: None,
            goodsig: false,
            badsig: false,
            warnsig: false,
            is_autocrypt: false,
        }
    }
}

impl Body {
    /// A leaf part built in memory.
    pub fn new_leaf(
        body_type: BodyType,
        subtype: &str,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Body {
            body_type,
            subtype: subtype.to_ascii_lowercase(),
            content: Some(content.into()),
            ..Body::default()
        }
    }

    /// A multipart built in memory; the boundary is left to the caller.
    pub fn new_multipart(subtype: &str, parts: Vec<Body>) -> Self {
        Body {
            body_type: BodyType::Multipart,
            subtype: subtype.to_ascii_lowercase(),
            parts,
            ..Body::default()
        }
    }

    pub fn type_name(&self) -> &str {
        match (self.body_type, self.xtype.as_ref()) {
            (BodyType::Other, Some(x)) => x,
            (t, _) => t.as_str(),
        }
    }

    /// `type/subtype`.
    pub fn mime_type(&self) -> String {
        format!("{}/{}", self.type_name(), self.subtype)
    }

    pub fn is(&self, body_type: BodyType, subtype: &str) -> bool {
        self.body_type == body_type
            && self.subtype.eq_ignore_ascii_case(subtype)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn charset(&self) -> Option<&str> {
        self.params.get("charset")
    }

    pub fn is_multipart(&self) -> bool {
        BodyType::Multipart == self.body_type
    }

    pub fn is_text(&self) -> bool {
        BodyType::Text == self.body_type
    }

    /// Whether the part is `format=flowed` text.
    pub fn is_flowed(&self) -> bool {
        self.is(BodyType::Text, "plain")
            && self
                .param("format")
                .map_or(false, |f| f.eq_ignore_ascii_case("flowed"))
    }

    /// The raw (still transfer-encoded) payload within `source`.
    pub fn raw<'a>(&self, source: &'a [u8]) -> &'a [u8] {
        let end = (self.offset + self.length).min(source.len());
        &source[self.offset.min(end)..end]
    }

    /// The complete entity, MIME headers included, within `source`.
    pub fn raw_entity<'a>(&self, source: &'a [u8]) -> &'a [u8] {
        let end = (self.offset + self.length).min(source.len());
        &source[self.hdr_offset.min(end)..end]
    }

    /// Total size of the decoded payload, approximately.
    pub fn size(&self) -> usize {
        self.content.as_ref().map_or(self.length, Vec::len)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Email {
    pub env: Envelope,
    pub body: Body,
    pub security: SecurityFlags,
    pub date_sent: Option<DateTime<FixedOffset>>,
    /// The bytes `body` was parsed from, if any.
    pub source: Option<Rc<[u8]>>,
}

impl Email {
    pub fn new(env: Envelope, body: Body) -> Self {
        Email {
            env,
            body,
            security: SecurityFlags::empty(),
            date_sent: None,
            source: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_display() {
        assert_eq!("a@b.c", Address::new("a@b.c").to_string());
        assert_eq!(
            "Alice Example <a@b.c>",
            Address::with_personal("Alice Example", "a@b.c").to_string()
        );
        assert_eq!(
            "\"Example, Alice\" <a@b.c>",
            Address::with_personal("Example, Alice", "a@b.c").to_string()
        );
    }

    #[test]
    fn params_case_insensitive() {
        let mut params = ParamList::default();
        params.set("Charset", "utf-8");
        assert_eq!(Some("utf-8"), params.get("charset"));
        params.set("CHARSET", "us-ascii");
        assert_eq!(1, params.0.len());
        assert_eq!(Some("us-ascii"), params.get("charset"));
        params.remove("charset");
        assert!(params.get("charset").is_none());
    }

    #[test]
    fn raw_slices_are_clamped() {
        let body = Body {
            hdr_offset: 2,
            offset: 4,
            length: 100,
            ..Body::default()
        };
        assert_eq!(b"ef", body.raw(b"abcdef"));
        assert_eq!(b"cdef", body.raw_entity(b"abcdef"));
    }
}
