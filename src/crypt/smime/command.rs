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

//! Running the configured OpenSSL commands.

use std::path::{Path, PathBuf};

use log::debug;

use crate::crypt::expando::{quote_filename, Template};
use crate::support::error::Error;
use crate::support::filter::{self, FilterOutput};
use crate::support::system_config::{expand_path, SmimeConfig};

#[derive(Clone, Debug)]
pub struct Commands {
    pub decrypt: Template,
    pub verify: Template,
    pub verify_opaque: Template,
    pub sign: Template,
    pub encrypt: Template,
    pub pk7out: Template,
    pub get_cert: Template,
    pub get_signer_cert: Template,
    pub get_cert_email: Template,
    pub import_cert: Template,
}

impl Commands {
    pub fn compile(config: &SmimeConfig) -> Self {
        Commands {
            decrypt: Template::compile(&config.decrypt_command),
            verify: Template::compile(&config.verify_command),
            verify_opaque: Template::compile(&config.verify_opaque_command),
            sign: Template::compile(&config.sign_command),
            encrypt: Template::compile(&config.encrypt_command),
            pk7out: Template::compile(&config.pk7out_command),
            get_cert: Template::compile(&config.get_cert_command),
            get_signer_cert: Template::compile(&config.get_signer_cert_command),
            get_cert_email: Template::compile(&config.get_cert_email_command),
            import_cert: Template::compile(&config.import_cert_command),
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
    pub cryptalg: Option<&'a str>,
    /// `%d`
    pub digestalg: Option<&'a str>,
    /// `%k`
    pub key: Option<&'a Path>,
    /// `%c`, each quoted separately.
    pub certificates: &'a [PathBuf],
    /// `%i`
    pub intermediates: Option<&'a Path>,
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

/// `%C`: how OpenSSL is told where the trusted CAs are.
pub fn ca_location(configured: &Path) -> String {
    let path = expand_path(configured);
    if path.is_dir() {
        format!("-CApath {}", quote_path(&path))
    } else {
        format!("-CAfile {}", quote_path(&path))
    }
}

pub fn render(template: &Template, vars: &Vars<'_>, ca: &Path) -> String {
    template.render(&|c| match c {
        'f' => vars.file.map(quote_path),
        's' => vars.sig_file.map(quote_path),
        'a' => vars.cryptalg.map(str::to_owned),
        'd' => vars.digestalg.map(str::to_owned),
        'k' => vars.key.map(quote_path),
        'c' if !vars.certificates.is_empty() => Some(
            vars.certificates
                .iter()
                .map(|p| quote_path(p))
                .collect::<Vec<_>>()
                .join(" "),
        ),
        'i' => vars.intermediates.map(quote_path),
        'C' => Some(ca_location(ca)),
        _ => None,
    })
}

/// Run `template` to completion, feeding it `input`.
pub fn run(
    template: &Template,
    vars: &Vars<'_>,
    ca: &Path,
    input: Option<&[u8]>,
) -> Result<FilterOutput, Error> {
    let cmd = render(template, vars, ca);
    if cmd.trim().is_empty() {
        return Err(Error::Unsupported);
    }
    debug!("Running S/MIME command: {}", cmd);
    let out = filter::run(&cmd, input, &[])?;
    debug!(
        "S/MIME command exited with {}, {} bytes out",
        out.status,
        out.stdout.len()
    );
    Ok(out)
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn placeholder_expansion() {
        let dir = TempDir::new().unwrap();
        let t = Template::compile("openssl -%a -md %d -inkey %k -in %f %c %C");
        let certs = vec![PathBuf::from("/c/one"), PathBuf::from("/c/two")];
        let vars = Vars {
            file: Some(Path::new("/tmp/msg")),
            cryptalg: Some("aes256"),
            digestalg: Some("sha256"),
            key: Some(Path::new("/k/abc.0")),
            certificates: &certs,
            ..Vars::default()
        };
        assert_eq!(
            format!(
                "openssl -aes256 -md sha256 -inkey '/k/abc.0' -in '/tmp/msg' \
                 '/c/one' '/c/two' -CApath '{}'",
                dir.path().display()
            ),
            render(&t, &vars, dir.path())
        );
    }

    #[test]
    fn ca_file_or_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("bundle.crt");
        assert_eq!(
            format!("-CAfile '{}'", file.display()),
            ca_location(&file)
        );
        assert!(ca_location(dir.path()).starts_with("-CApath "));
    }
}
