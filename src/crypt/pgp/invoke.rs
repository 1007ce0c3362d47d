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

//! Running the configured PGP commands.

use std::path::Path;

use log::debug;

use crate::crypt::expando::{quote_filename, Template};
use crate::support::error::Error;
use crate::support::filter::{self, FilterOutput};
use crate::support::system_config::PgpConfig;

/// The command templates, compiled once.
#[derive(Clone, Debug)]
pub struct Commands {
    pub decode: Template,
    pub verify: Template,
    pub decrypt: Template,
    pub sign: Template,
    pub clear_sign: Template,
    pub encrypt_sign: Template,
    pub encrypt_only: Template,
    pub import: Template,
    pub export: Template,
    pub verify_key: Template,
    pub list_pubring: Template,
    pub list_secring: Template,
    pub get_keys: Option<Template>,
}

impl Commands {
    pub fn compile(config: &PgpConfig) -> Self {
        Commands {
            decode: Template::compile(&config.decode_command),
            verify: Template::compile(&config.verify_command),
            decrypt: Template::compile(&config.decrypt_command),
            sign: Template::compile(&config.sign_command),
            clear_sign: Template::compile(&config.clear_sign_command),
            encrypt_sign: Template::compile(&config.encrypt_sign_command),
            encrypt_only: Template::compile(&config.encrypt_only_command),
            import: Template::compile(&config.import_command),
            export: Template::compile(&config.export_command),
            verify_key: Template::compile(&config.verify_key_command),
            list_pubring: Template::compile(&config.list_pubring_command),
            list_secring: Template::compile(&config.list_secring_command),
            get_keys: if config.get_keys_command.is_empty() {
                None
            } else {
                Some(Template::compile(&config.get_keys_command))
            },
        }
    }
}

/// The values placeholders expand to.
#[derive(Clone, Debug, Default)]
pub struct Vars<'a> {
    /// `%f`
    pub file: Option<&'a Path>,
    /// `%s`
    pub sig_file: Option<&'a Path>,
    /// `%a`
    pub signer: Option<&'a str>,
    /// `%r`
    pub recipients: Option<&'a str>,
    /// Whether `%p` is set, telling the command to read a passphrase from
    /// its standard input.
    pub need_pass: bool,
}

impl<'a> Vars<'a> {
    pub fn file(path: &'a Path) -> Self {
        Vars {
            file: Some(path),
            ..Vars::default()
        }
    }
}

fn quote_path(p: &Path) -> String {
    quote_filename(&p.to_string_lossy())
}

/// Expand `template` for one run.
pub fn render(template: &Template, vars: &Vars<'_>, use_agent: bool) -> String {
    template.render(&|c| match c {
        'f' => vars.file.map(quote_path),
        's' => vars.sig_file.map(quote_path),
        'a' => vars.signer.map(str::to_owned),
        'r' => vars.recipients.map(str::to_owned),
        'p' if vars.need_pass && !use_agent => Some("PGPPASSFD=0".to_owned()),
        _ => None,
    })
}

/// Run `template` to completion, feeding it `input`.
pub fn run(
    template: &Template,
    vars: &Vars<'_>,
    use_agent: bool,
    input: Option<&[u8]>,
) -> Result<FilterOutput, Error> {
    let cmd = render(template, vars, use_agent);
    if cmd.trim().is_empty() {
        return Err(Error::Unsupported);
    }
    debug!("Running PGP command: {}", cmd);
    let out = filter::run(&cmd, input, &[])?;
    debug!(
        "PGP command exited with {}, {} bytes out, {} bytes on stderr",
        out.status,
        out.stdout.len(),
        out.stderr.len()
    );
    Ok(out)
}

/// `%r` for the key listing commands: each hint as its own argument.
pub fn quote_hints(hints: &[String]) -> String {
    hints
        .iter()
        .map(|h| quote_filename(h))
        .collect::<Vec<_>>()
        .join(" ")
}
