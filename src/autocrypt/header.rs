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

//! The `Autocrypt:` and `Autocrypt-Gossip:` header values.
//!
//! A value is a `;`-separated list of `name=value` attributes. `addr` and
//! `keydata` are mandatory, `prefer-encrypt` is optional, and attributes
//! starting with `_` are ignored. Any other attribute makes the whole header
//! invalid, as does a repeated `addr` or `keydata`.

/// Continuation lines of `keydata` carry this many characters after the tab.
const FOLD_WIDTH: usize = 75;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutocryptHeader {
    pub addr: String,
    pub prefer_encrypt: bool,
    /// Base64 of the key, with all whitespace removed.
    pub keydata: String,
}

impl AutocryptHeader {
    pub fn new(
        addr: impl Into<String>,
        prefer_encrypt: bool,
        keydata: impl Into<String>,
    ) -> Self {
        AutocryptHeader {
            addr: addr.into(),
            prefer_encrypt,
            keydata: keydata.into(),
        }
    }

    /// Parse a header value, returning `None` if it is not valid.
    pub fn parse(value: &str) -> Option<Self> {
        let mut addr = None;
        let mut keydata = None;
        let mut prefer_encrypt = false;
        let mut any = false;

        for attr in value.split(';') {
            let attr = attr.trim();
            if attr.is_empty() {
                continue;
            }
            any = true;

            let (name, value) = attr.split_once('=')?;
            let name = name.trim();
            let value = value.trim().trim_matches('"');

            if name.eq_ignore_ascii_case("addr") {
                if addr.is_some() {
                    return None;
                }
                addr = Some(value.to_owned());
            } else if name.eq_ignore_ascii_case("prefer-encrypt") {
                prefer_encrypt = value.eq_ignore_ascii_case("mutual");
            } else if name.eq_ignore_ascii_case("keydata") {
                if keydata.is_some() {
                    return None;
                }
                keydata = Some(
                    value
                        .chars()
                        .filter(|c| !c.is_ascii_whitespace())
                        .collect::<String>(),
                );
            } else if !name.starts_with('_') {
                return None;
            }
        }

        if !any {
            return None;
        }

        match (addr, keydata) {
            (Some(addr), Some(keydata))
                if !addr.is_empty() && !keydata.is_empty() =>
            {
                Some(AutocryptHeader {
                    addr,
                    prefer_encrypt,
                    keydata,
                })
            }
            _ => None,
        }
    }

    /// The folded header value, without the header name or the final line
    /// ending. `keydata` starts on its own continuation line.
    pub fn to_header_value(&self) -> String {
        let mut out = format!("addr={}; ", self.addr);
        if self.prefer_encrypt {
            out.push_str("prefer-encrypt=mutual; ");
        }
        out.push_str("keydata=");

        let bytes = self.keydata.as_bytes();
        for chunk in bytes.chunks(FOLD_WIDTH) {
            out.push_str("\n\t");
            // keydata is base64, so every chunk boundary is a char boundary
            out.push_str(&String::from_utf8_lossy(chunk));
        }
        out
    }
}
