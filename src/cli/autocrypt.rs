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

use super::main::{crypt, read_message, AutocryptSubcommand};
use crate::autocrypt::{self, Autocrypt};
use crate::compose::{security_summary, update_crypt_info, ComposeState};
use crate::crypt::Crypt;
use crate::mime::header::parse_address;
use crate::mime::model::*;
use crate::mime::state::StateFlags;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

pub(super) fn main(config: SystemConfig, cmd: AutocryptSubcommand) {
    if !config.autocrypt.enabled {
        die!(
            EX_CONFIG,
            "Autocrypt is not enabled; set `enabled = true` in the\n\
             [autocrypt] section of the configuration first."
        );
    }

    if let AutocryptSubcommand::Init { .. } = cmd {
        if !autocrypt::is_initialised(&config) {
            if let Err(e) = Autocrypt::init(&config, true) {
                die!(EX_CANTCREAT, "Unable to create Autocrypt store: {}", e);
            }
        }
    }

    let crypt = crypt(config);
    let ac = match crypt.autocrypt {
        Some(ref ac) => ac,
        None => die!(
            EX_UNAVAILABLE,
            "The Autocrypt store could not be opened.\n\
             Run `mailcrypt autocrypt init <address>` to create it."
        ),
    };

    match cmd {
        AutocryptSubcommand::Init { addr } => init(&crypt, ac, &addr),
        AutocryptSubcommand::Accounts => accounts(ac),
        AutocryptSubcommand::Ingest { input } => {
            let mut email = read_message(&input);
            // Decrypting first lets gossip headers be seen
            let _ = crypt.render(&mut email, StateFlags::empty(), None);
            if let Err(e) = ac.ingest(&email) {
                die!(EX_DATAERR, "Unable to process message: {}", e);
            }
        }
        AutocryptSubcommand::Recommend { from, recipients } => {
            recommend(&crypt, &from, &recipients)
        }
    }
}

fn address(s: &str) -> Address {
    match parse_address(s) {
        Some(addr) => addr,
        None => die!(EX_USAGE, "Not a valid address: {}", s),
    }
}

fn init(crypt: &Crypt, ac: &Autocrypt, addr: &str) {
    let addr = address(addr);
    match ac.account_init(crypt, &addr) {
        Ok(account) => {
            println!("Created account for {}", account.email_addr);
            println!("Key: {}", account.keyid);
        }
        Err(e) => die!(EX_SOFTWARE, "Account creation failed: {}", e),
    }
}

fn accounts(ac: &Autocrypt) {
    let accounts = match ac.list_accounts() {
        Ok(accounts) => accounts,
        Err(e) => die!(EX_SOFTWARE, "Unable to list accounts: {}", e),
    };

    if accounts.is_empty() {
        println!("No Autocrypt accounts.");
    }
    for (n, account) in accounts.iter().enumerate() {
        println!("{}", ac.format_account(n + 1, account));
    }
}

fn recommend(crypt: &Crypt, from: &str, recipients: &[String]) {
    let mut email = Email::new(Envelope::default(), Body::default());
    email.env.from = vec![address(from)];
    email.env.to = recipients.iter().map(|r| address(r)).collect();

    let mut state = ComposeState::new(email);
    update_crypt_info(crypt, &mut state);

    println!("Recommendation: {}", state.recommendation.as_str());
    for line in security_summary(crypt, &state) {
        println!("{}", line);
    }
}
