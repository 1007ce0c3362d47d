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

use super::main::{crypt, read_message, DraftSubcommand};
use crate::compose::{security_summary, ComposeState};
use crate::postpone::recall_draft;
use crate::support::system_config::SystemConfig;

pub(super) fn draft(config: SystemConfig, cmd: DraftSubcommand) {
    let mut crypt = crypt(config);
    let mut email = read_message(&cmd.input);
    let recalled = recall_draft(&mut crypt, &mut email);

    match recalled.fcc.as_deref() {
        None => (),
        Some("") => println!("Fcc: (none)"),
        Some(fcc) => println!("Fcc: {}", fcc),
    }
    if let Some(ref msgid) = recalled.references {
        println!("Reply to: {}", msgid);
    }
    if !recalled.mix_chain.is_empty() {
        println!("Mix chain: {}", recalled.mix_chain.join(" "));
    }

    let state = ComposeState::new(email);
    for line in security_summary(&crypt, &state) {
        println!("{}", line);
    }
}
