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

use super::main::CheckMailSubcommand;
use crate::mailbox::{CheckFlags, MailboxSet};
use crate::support::system_config::SystemConfig;

pub(super) fn check_mail(config: SystemConfig, cmd: CheckMailSubcommand) {
    if config.mailbox.mailboxes.is_empty() {
        println!("No mailboxes configured.");
        return;
    }

    let mut set = MailboxSet::new(&config.mailbox);
    let mut flags = CheckFlags::FORCE;
    if cmd.stats {
        flags |= CheckFlags::STATS;
    }
    set.check(None, flags);

    match set.list() {
        Some(message) => println!("{}", message),
        None => println!("No new mail."),
    }

    if cmd.stats {
        for mailbox in &set.mailboxes {
            println!(
                "{}: {} messages, {} unread, {} new",
                mailbox.path.display(),
                mailbox.counts.total,
                mailbox.counts.unread,
                mailbox.counts.new
            );
        }
    }
}
