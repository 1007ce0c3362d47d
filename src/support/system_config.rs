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

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::Error;

/// The full configuration of the security subsystem.
///
/// This is stored in a file named `mailcrypt.toml`, typically under
/// `~/.config/mailcrypt`. Every section may be omitted, in which case its
/// defaults apply.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SystemConfig {
    /// Options shared by both schemes and both backends.
    pub crypt: CryptConfig,
    /// The classic OpenPGP backend.
    pub pgp: PgpConfig,
    /// The classic S/MIME backend.
    pub smime: SmimeConfig,
    /// Autocrypt Level 1.1 support.
    pub autocrypt: AutocryptConfig,
    /// How non-security MIME parts are rendered.
    pub display: DisplayConfig,
    /// Mailbox polling.
    pub mailbox: MailboxConfig,
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = fs::read(path)?;
        Ok(toml::from_slice(&data)?)
    }
}

/// A setting which may either be fixed or prompt the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuadOption {
    No,
    Yes,
    AskNo,
    AskYes,
}

/// Associates recipients matching `pattern` with a fixed key.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CryptHook {
    /// Regular expression matched case-insensitively against the recipient's
    /// mailbox.
    pub pattern: String,
    /// A key id, fingerprint, or e-mail address to use instead of looking the
    /// recipient up.
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CryptConfig {
    /// Use the in-process library backend instead of running external
    /// commands.
    pub use_gpgme: bool,
    /// Automatically turn encryption on when keys for every recipient can be
    /// found without asking.
    pub opportunistic_encrypt: bool,
    /// Only use strongly valid keys for opportunistic encryption.
    pub opportunistic_encrypt_strong_keys: bool,
    /// Display protected headers found in signed or encrypted parts.
    pub protected_headers_read: bool,
    /// Generate protected headers when signing or encrypting.
    pub protected_headers_write: bool,
    /// The subject to put in the clear when the real one is protected. Empty
    /// disables subject hiding.
    pub protected_headers_subject: String,
    /// Keep protected headers when saving decrypted copies.
    pub protected_headers_save: bool,
    /// Protect more than just the subject.
    pub protected_headers_devel: bool,
    /// Weed protected headers the same way as regular ones.
    pub protected_headers_weed: bool,
    /// Add a timestamp banner before crypto output.
    pub timestamp: bool,
    /// Whether to verify signatures when displaying.
    pub verify_sig: QuadOption,
    /// Whether to fall back to PGP/MIME when inline PGP cannot be used.
    pub pgp_mime_auto: QuadOption,
    /// Keep detached signatures when signing and encrypting with PGP.
    pub retainable_sigs: bool,
    pub auto_sign: bool,
    pub auto_encrypt: bool,
    pub auto_pgp: bool,
    pub auto_smime: bool,
    pub reply_encrypt: bool,
    pub reply_sign: bool,
    pub reply_sign_encrypted: bool,
    /// Also encrypt to our own key.
    pub self_encrypt: bool,
    /// Ask before using a key from a crypt hook.
    pub confirm_hook: bool,
    pub crypt_hooks: Vec<CryptHook>,
    /// Consult `crypt_hooks` at all.
    pub use_hook: bool,
    /// The character set used for display.
    pub charset: String,
    /// Character sets tried, in order, when converting outgoing text.
    pub send_charset: Vec<String>,
    /// Directory for temporary files; the system default if empty.
    pub tmp_dir: PathBuf,
    pub envelope_from_address: Option<String>,
    pub use_envelope_from: bool,
    /// Include encrypted parts when quoting a message in a reply.
    pub include_encrypted: bool,
}

impl Default for CryptConfig {
    fn default() -> Self {
        CryptConfig {
            use_gpgme: false,
            opportunistic_encrypt: false,
            opportunistic_encrypt_strong_keys: false,
            protected_headers_read: true,
            protected_headers_write: true,
            protected_headers_subject: "...".to_owned(),
            protected_headers_save: false,
            protected_headers_devel: false,
            protected_headers_weed: false,
            timestamp: true,
            verify_sig: QuadOption::Yes,
            pgp_mime_auto: QuadOption::AskYes,
            retainable_sigs: false,
            auto_sign: false,
            auto_encrypt: false,
            auto_pgp: true,
            auto_smime: true,
            reply_encrypt: true,
            reply_sign: false,
            reply_sign_encrypted: true,
            self_encrypt: true,
            confirm_hook: true,
            crypt_hooks: vec![],
            use_hook: true,
            charset: "utf-8".to_owned(),
            send_charset: vec!["us-ascii".to_owned(), "utf-8".to_owned()],
            tmp_dir: PathBuf::new(),
            envelope_from_address: None,
            use_envelope_from: false,
            include_encrypted: false,
        }
    }
}

/// Configuration for the classic OpenPGP backend.
///
/// Command templates use `%f` (input file), `%s` (signature file), `%a`
/// (signing key), `%r` (recipient key ids) and `%p` (set when a passphrase
/// is expected on standard input). `%?x?yes&no?` renders `yes` if `x` is set
/// and `no` otherwise.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PgpConfig {
    pub decode_command: String,
    pub verify_command: String,
    pub decrypt_command: String,
    pub sign_command: String,
    pub clear_sign_command: String,
    pub encrypt_sign_command: String,
    pub encrypt_only_command: String,
    pub import_command: String,
    pub export_command: String,
    pub verify_key_command: String,
    pub list_pubring_command: String,
    pub list_secring_command: String,
    /// Run to fetch keys for an address that is not in the keyring. Empty
    /// disables.
    pub get_keys_command: String,
    /// Parse the `--status-fd` stream instead of relying on `decryption_okay`.
    pub check_gpg_decrypt_status_fd: bool,
    /// Matched against decryption output when status checking is off.
    pub decryption_okay: String,
    /// Matched against verification output to detect a good signature.
    pub good_sign: String,
    /// Treat a non-zero exit status as failure.
    pub check_exit: bool,
    /// Rely on gpg-agent for passphrases.
    pub use_gpg_agent: bool,
    /// Seconds a cached passphrase stays valid.
    pub timeout: u64,
    pub sign_as: String,
    pub default_key: String,
    pub self_encrypt_as: String,
    /// Use inline PGP for new messages where possible.
    pub auto_inline: bool,
    /// Detect inline PGP in text parts automatically.
    pub auto_decode: bool,
    pub long_ids: bool,
    pub ignore_subkeys: bool,
    pub show_unusable: bool,
    pub strict_enc: bool,
    /// Warn before encrypting to keys which are not fully trusted.
    pub check_trust: bool,
    /// The GnuPG executable the library backend drives.
    pub gpg_program: String,
}

impl Default for PgpConfig {
    fn default() -> Self {
        const PASS: &str = "%?p?--pinentry-mode loopback --passphrase-fd 0?";
        PgpConfig {
            decode_command: format!(
                "gpg {} --no-verbose --quiet --batch --output - %f",
                PASS
            ),
            verify_command: "gpg --status-fd=2 --no-verbose --quiet --batch \
                             --output - --verify %s %f"
                .to_owned(),
            decrypt_command: format!(
                "gpg {} --status-fd=2 --no-verbose --quiet --batch \
                 --output - --decrypt %f",
                PASS
            ),
            sign_command: format!(
                "gpg {} --no-verbose --batch --quiet --output - --armor \
                 --textmode %?a?--local-user %a? --detach-sign %f",
                PASS
            ),
            clear_sign_command: format!(
                "gpg {} --no-verbose --batch --quiet --output - --armor \
                 --textmode %?a?--local-user %a? --clearsign %f",
                PASS
            ),
            encrypt_sign_command: format!(
                "for r in %r; do set -- \"$@\" --recipient \"$r\"; done; \
                 gpg {} --batch --quiet --no-verbose --textmode --output - \
                 %?a?--local-user %a? --armor --trust-model always --sign \
                 --encrypt \"$@\" -- %f",
                PASS
            ),
            encrypt_only_command:
                "for r in %r; do set -- \"$@\" --recipient \"$r\"; done; \
                 gpg --batch --quiet --no-verbose --output - --textmode \
                 --armor --trust-model always --encrypt \"$@\" -- %f"
                    .to_owned(),
            import_command: "gpg --no-verbose --import %f".to_owned(),
            export_command: "gpg --no-verbose --armor --export %r".to_owned(),
            verify_key_command: "gpg --verbose --batch --fingerprint \
                                 --check-sigs %r"
                .to_owned(),
            list_pubring_command: "gpg --no-verbose --batch --quiet \
                                   --with-colons --with-fingerprint \
                                   --list-keys %r"
                .to_owned(),
            list_secring_command: "gpg --no-verbose --batch --quiet \
                                   --with-colons --with-fingerprint \
                                   --list-secret-keys %r"
                .to_owned(),
            get_keys_command: String::new(),
            check_gpg_decrypt_status_fd: true,
            decryption_okay: r"^\[GNUPG:\] DECRYPTION_OKAY".to_owned(),
            good_sign: r"^\[GNUPG:\] GOODSIG".to_owned(),
            check_exit: true,
            use_gpg_agent: true,
            timeout: 300,
            sign_as: String::new(),
            default_key: String::new(),
            self_encrypt_as: String::new(),
            auto_inline: false,
            auto_decode: false,
            long_ids: true,
            ignore_subkeys: true,
            show_unusable: true,
            strict_enc: true,
            check_trust: false,
            gpg_program: "gpg".to_owned(),
        }
    }
}

/// Configuration for the classic S/MIME backend.
///
/// In addition to `%f` and `%s`, templates may use `%c` (certificate files),
/// `%i` (intermediate certificates), `%k` (private key file), `%C` (CA
/// location option), `%a` (cipher) and `%d` (digest).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SmimeConfig {
    pub decrypt_command: String,
    pub verify_command: String,
    pub verify_opaque_command: String,
    pub sign_command: String,
    pub encrypt_command: String,
    pub pk7out_command: String,
    pub get_cert_command: String,
    pub get_signer_cert_command: String,
    pub get_cert_email_command: String,
    pub import_cert_command: String,
    /// Directory holding private keys and their `.index`.
    pub keys: PathBuf,
    /// Directory holding certificates and their `.index`.
    pub certificates: PathBuf,
    /// CA bundle file or hashed CA directory.
    pub ca_location: PathBuf,
    pub encrypt_with: String,
    pub sign_digest_alg: String,
    pub sign_as: String,
    pub default_key: String,
    pub self_encrypt_as: String,
    pub timeout: u64,
    pub ask_cert_label: bool,
    pub decrypt_use_default_key: bool,
    /// Use S/MIME rather than PGP when both are possible.
    pub is_default: bool,
}

impl Default for SmimeConfig {
    fn default() -> Self {
        SmimeConfig {
            decrypt_command: "openssl smime -decrypt -passin stdin \
                              -inform DER -in %f -inkey %k -recip %c"
                .to_owned(),
            verify_command: "openssl smime -verify -inform DER -in %s %C \
                             -content %f"
                .to_owned(),
            verify_opaque_command: "openssl smime -verify -inform DER -in %s \
                                    %C || openssl smime -verify -inform DER \
                                    -in %s -noverify 2>/dev/null"
                .to_owned(),
            sign_command: "openssl smime -sign -md %d -signer %c -inkey %k \
                           -passin stdin -in %f -certfile %i -outform DER"
                .to_owned(),
            encrypt_command: "openssl smime -encrypt -%a -outform DER -in %f \
                              %c"
            .to_owned(),
            pk7out_command: "openssl smime -verify -in %f -noverify -pk7out"
                .to_owned(),
            get_cert_command: "openssl pkcs7 -print_certs -in %f".to_owned(),
            get_signer_cert_command: "openssl smime -verify -in %f \
                                      -noverify -signer %c -out /dev/null"
                .to_owned(),
            get_cert_email_command: "openssl x509 -in %f -noout -email"
                .to_owned(),
            import_cert_command: "smime_keys add_cert %f".to_owned(),
            keys: PathBuf::from("~/.smime/keys"),
            certificates: PathBuf::from("~/.smime/certificates"),
            ca_location: PathBuf::from("~/.smime/ca-bundle.crt"),
            encrypt_with: "aes256".to_owned(),
            sign_digest_alg: "sha256".to_owned(),
            sign_as: String::new(),
            default_key: String::new(),
            self_encrypt_as: String::new(),
            timeout: 300,
            ask_cert_label: true,
            decrypt_use_default_key: true,
            is_default: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AutocryptConfig {
    pub enabled: bool,
    /// Holds the Autocrypt database and keyring.
    pub dir: PathBuf,
    /// Format of the account list printed by the front end; `%a` is the
    /// address, `%k` the key id, `%p` the prefer-encrypt setting and `%s`
    /// whether the account is enabled.
    pub acct_format: String,
    /// Enable Autocrypt when replying to an Autocrypt message.
    pub reply: bool,
}

impl Default for AutocryptConfig {
    fn default() -> Self {
        AutocryptConfig {
            enabled: false,
            dir: PathBuf::from("~/.mutt/autocrypt"),
            acct_format: "%4n %-30a %20p %10s".to_owned(),
            reply: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Types rendered through `mailcap` even inside multiparts.
    pub auto_view: Vec<String>,
    /// Maps `type/subtype` (or `type/*`) to a filter command; `%s` is
    /// replaced with the file holding the part.
    pub mailcap: BTreeMap<String, String>,
    /// Preference order for `multipart/alternative`.
    pub alternative_order: Vec<String>,
    /// Preference order for `multipart/multilingual`.
    pub preferred_languages: Vec<String>,
    pub weed: bool,
    pub ignored_headers: Vec<String>,
    pub unignored_headers: Vec<String>,
    /// Reflow `format=flowed` text.
    pub reflow_text: bool,
    /// Column reflowed text wraps at.
    pub reflow_wrap: usize,
    /// Write reflowed quote markers as `> > `.
    pub reflow_space_quotes: bool,
    /// Honour `Content-Disposition: attachment`.
    pub honor_disposition: bool,
    /// Controls the multipart/alternative summary: "info", "inline" or "".
    pub show_multipart_alternative: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            auto_view: vec![],
            mailcap: BTreeMap::new(),
            alternative_order: vec![],
            preferred_languages: vec![],
            weed: true,
            ignored_headers: vec!["*".to_owned()],
            unignored_headers: vec![
                "from".to_owned(),
                "subject".to_owned(),
                "to".to_owned(),
                "cc".to_owned(),
                "date".to_owned(),
            ],
            reflow_text: true,
            reflow_wrap: 78,
            reflow_space_quotes: true,
            honor_disposition: false,
            show_multipart_alternative: String::new(),
        }
    }
}

impl DisplayConfig {
    /// Whether `header` is hidden when weeding.
    pub fn matches_ignore(&self, header: &str) -> bool {
        let hit = |list: &[String]| {
            list.iter().any(|h| {
                "*" == h
                    || (header.len() >= h.len()
                        && header[..h.len()].eq_ignore_ascii_case(h))
            })
        };
        hit(&self.ignored_headers) && !hit(&self.unignored_headers)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Seconds between checks for new mail.
    pub mail_check: u64,
    /// Also collect message counts during checks.
    pub mail_check_stats: bool,
    /// Seconds between message count collections.
    pub mail_check_stats_interval: u64,
    /// Only report mail that arrived since the last visit.
    pub mail_check_recent: bool,
    /// Track the size of the current mbox to notice new mail.
    pub check_mbox_size: bool,
    pub mailboxes: Vec<PathBuf>,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        MailboxConfig {
            mail_check: 5,
            mail_check_stats: false,
            mail_check_stats_interval: 60,
            mail_check_recent: true,
            check_mbox_size: false,
            mailboxes: vec![],
        }
    }
}

/// Expands a leading `~/` against `$HOME`.
pub fn expand_path(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_owned()
}
