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

use std::io::{self, Write};

use log::warn;

use super::main::{crypt, read_message, DecodeSubcommand};
use crate::crypt::flags::SecurityFlags;
use crate::mime::state::StateFlags;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

pub(super) fn decode(config: SystemConfig, cmd: DecodeSubcommand) {
    let crypt = crypt(config);
    let mut email = read_message(&cmd.input);

    let mut flags =
        StateFlags::DISPLAY | StateFlags::VERIFY | StateFlags::CHARCONV;
    if cmd.weed {
        flags |= StateFlags::WEED;
    }
    let (rc, out) = crypt.render(&mut email, flags, None);

    if let Err(e) = io::stdout().write_all(&out) {
        die!(EX_IOERR, "Error writing output: {}", e);
    }

    if cmd.ingest {
        match crypt.autocrypt {
            Some(ref ac) => {
                if let Err(e) = ac.ingest(&email) {
                    warn!("Autocrypt headers not processed: {}", e);
                }
            }
            None => warn!("Autocrypt is not available; nothing ingested"),
        }
    }

    if email.security.contains(SecurityFlags::BADSIGN) || rc < 0 {
        EX_DATAERR.exit();
    }
}
