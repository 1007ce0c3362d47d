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

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::LevelFilter;
use structopt::StructOpt;

use crate::crypt::Crypt;
use crate::mime::model::Email;
use crate::mime::parse::parse_message;
use crate::support::prompt::{Batch, Prompt, Terminal};
use crate::support::sysexits::*;
use crate::support::system_config::{expand_path, SystemConfig};

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    #[structopt(flatten)]
    common: CommonOptions,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
pub(super) struct CommonOptions {
    /// The configuration file to use
    /// [default: ~/.config/mailcrypt/mailcrypt.toml]
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Log what is going on to standard error.
    #[structopt(short, long)]
    verbose: bool,
}

#[derive(StructOpt)]
enum Command {
    /// Display a message, decrypting and verifying it as needed.
    ///
    /// The output is what a reader would see in the pager: decoded text
    /// with the results of signature checks and decryption marked inline.
    Decode(DecodeSubcommand),
    /// Manage Autocrypt accounts and peers.
    Autocrypt(AutocryptSubcommand),
    /// Show the security settings saved in a postponed draft.
    Draft(DraftSubcommand),
    /// Check the configured mailboxes for new mail, once.
    CheckMail(CheckMailSubcommand),
}

#[derive(StructOpt)]
pub(super) struct DecodeSubcommand {
    /// Only show the headers a reader is normally interested in.
    #[structopt(long)]
    pub(super) weed: bool,

    /// Feed any Autocrypt headers found into the Autocrypt database.
    #[structopt(long)]
    pub(super) ingest: bool,

    /// The message to display. "-" reads from stdin.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) input: PathBuf,
}

#[derive(StructOpt)]
pub(super) enum AutocryptSubcommand {
    /// Create an account, with a new key, for one of your addresses.
    Init {
        /// The address to create the account for.
        addr: String,
    },
    /// List the accounts in the Autocrypt database.
    Accounts,
    /// Update the peer database from a received message.
    Ingest {
        /// The message to read. "-" reads from stdin.
        #[structopt(parse(from_os_str), default_value = "-")]
        input: PathBuf,
    },
    /// Show whether a message to the given recipients would be encrypted.
    Recommend {
        /// The address the message would be sent from.
        #[structopt(long)]
        from: String,
        /// The recipients.
        #[structopt(required = true)]
        recipients: Vec<String>,
    },
}

#[derive(StructOpt)]
pub(super) struct DraftSubcommand {
    /// The draft to read. "-" reads from stdin.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) input: PathBuf,
}

#[derive(StructOpt)]
pub(super) struct CheckMailSubcommand {
    /// Also count the messages in each mailbox.
    #[structopt(long)]
    pub(super) stats: bool,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let options = Options::from_clap(&match Options::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    let config_path = options.common.config.clone();
    let config = load_config(config_path.as_deref());
    init_log(&options.common, config_path.as_deref());

    match options.command {
        Command::Decode(cmd) => super::decode::decode(config, cmd),
        Command::Autocrypt(cmd) => super::autocrypt::main(config, cmd),
        Command::Draft(cmd) => super::draft::draft(config, cmd),
        Command::CheckMail(cmd) => super::mailbox::check_mail(config, cmd),
    }
}

fn default_config_dir() -> PathBuf {
    expand_path(Path::new("~/.config/mailcrypt"))
}

fn load_config(explicit: Option<&Path>) -> SystemConfig {
    let path = match explicit {
        Some(path) => path.to_owned(),
        None => {
            let path = default_config_dir().join("mailcrypt.toml");
            if !path.is_file() {
                return SystemConfig::default();
            }
            path
        }
    };

    match SystemConfig::load(&path) {
        Ok(config) => config,
        Err(e) => die!(
            EX_CONFIG,
            "Error in config file at '{}': {}",
            path.display(),
            e
        ),
    }
}

/// Set up logging to standard error, unless a `logging.toml` sits next to
/// the configuration file, in which case it decides.
fn init_log(common: &CommonOptions, config_path: Option<&Path>) {
    let config_dir = config_path
        .and_then(Path::parent)
        .map(Path::to_owned)
        .unwrap_or_else(default_config_dir);
    let log_config_file = config_dir.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
        }
        return;
    }

    use log4rs::append::console::{ConsoleAppender, Target};
    use log4rs::config::{Appender, Config, Root};

    let level = if common.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let stderr = ConsoleAppender::builder().target(Target::Stderr).build();
    let result = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .map_err(|e| e.to_string())
        .and_then(|c| log4rs::init_config(c).map_err(|e| e.to_string()));
    if let Err(e) = result {
        die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
    }
}

/// Ask on the terminal when there is one, otherwise take the defaults.
pub(super) fn prompt() -> Box<dyn Prompt> {
    if Ok(true) == nix::unistd::isatty(0) {
        Box::new(Terminal)
    } else {
        Box::new(Batch)
    }
}

pub(super) fn crypt(config: SystemConfig) -> Crypt {
    match Crypt::with_configured_backends(config, prompt()) {
        Ok(crypt) => crypt,
        Err(e) => die!(EX_CONFIG, "Unable to set up crypto backends: {}", e),
    }
}

pub(super) fn read_message(input: &Path) -> Email {
    let mut data = Vec::new();
    let result = if input == Path::new("-") {
        io::stdin().lock().read_to_end(&mut data).map(|_| ())
    } else {
        fs::File::open(input)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map(|_| ())
    };

    if let Err(e) = result {
        die!(EX_NOINPUT, "Error reading '{}': {}", input.display(), e);
    }

    parse_message(Rc::from(data))
}
