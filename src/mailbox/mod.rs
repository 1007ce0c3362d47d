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

//! Polling the configured mailboxes for new mail.
//!
//! Each pass looks at every mailbox for new mail. Message counts are more
//! expensive to collect, so they are only gathered every
//! `mail_check_stats_interval` seconds, on the first pass, or on request.
//! Passes themselves are throttled to one per `mail_check` seconds unless
//! forced.

mod stats;

pub use self::stats::{Counts, MailboxKind};

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use log::{debug, info, warn};
use nix::sys::stat::utimes;
use nix::sys::time::{TimeVal, TimeValLike};

use crate::support::error::Error;
use crate::support::system_config::{expand_path, MailboxConfig};

bitflags! {
    #[derive(Default)]
    pub struct CheckFlags: u8 {
        /// Ignore the `mail_check` throttle.
        const FORCE = 1 << 0;
        /// Collect message counts on this pass.
        const STATS = 1 << 1;
    }
}

/// A timestamp with nanosecond resolution, as found in `stat()` output.
type Stamp = (i64, i64);

fn mtime(md: &fs::Metadata) -> Stamp {
    (md.mtime(), md.mtime_nsec())
}

fn atime(md: &fs::Metadata) -> Stamp {
    (md.atime(), md.atime_nsec())
}

fn ctime(md: &fs::Metadata) -> Stamp {
    (md.ctime(), md.ctime_nsec())
}

fn now_stamp() -> Stamp {
    let now = chrono::Utc::now();
    (now.timestamp(), i64::from(now.timestamp_subsec_nanos()))
}

#[derive(Clone, Debug)]
pub struct Mailbox {
    pub path: PathBuf,
    pub kind: MailboxKind,
    /// Size of an mbox as of the last time it was looked at.
    pub size: u64,
    pub has_new: bool,
    /// The user has been told about the new mail in this mailbox.
    pub notified: bool,
    /// Whether new mail here should be announced at all.
    pub notify_user: bool,
    pub poll_new_mail: bool,
    /// The mailbox did not exist at the last check.
    pub newly_created: bool,
    pub first_check_stats_done: bool,
    pub last_visited: Stamp,
    pub counts: Counts,
    stats_last_checked: Stamp,
}

impl Mailbox {
    pub fn new(path: PathBuf) -> Self {
        Mailbox {
            kind: stats::detect_kind(&path),
            path,
            size: 0,
            has_new: false,
            notified: false,
            notify_user: true,
            poll_new_mail: true,
            newly_created: false,
            first_check_stats_done: false,
            last_visited: (0, 0),
            counts: Counts::default(),
            stats_last_checked: (0, 0),
        }
    }

    /// Refresh the remembered size from the file system.
    pub fn update_size(&mut self) {
        self.size = fs::metadata(&self.path).map_or(0, |md| md.len());
    }

    fn check_mbox(
        &mut self,
        config: &MailboxConfig,
        flags: CheckFlags,
    ) -> Result<(), Error> {
        let md = fs::metadata(&self.path)?;

        let new_or_changed = if config.check_mbox_size {
            md.len() > self.size
        } else {
            mtime(&md) > atime(&md)
                || (self.newly_created
                    && ctime(&md) == mtime(&md)
                    && ctime(&md) == atime(&md))
        };

        if new_or_changed {
            if !config.mail_check_recent || mtime(&md) > self.last_visited {
                self.has_new = true;
            }
        } else if config.check_mbox_size {
            // Mail was removed by someone else
            self.size = md.len();
        }

        if self.newly_created
            && (ctime(&md) != mtime(&md) || ctime(&md) != atime(&md))
        {
            self.newly_created = false;
        }

        if flags.contains(CheckFlags::STATS)
            && mtime(&md) > self.stats_last_checked
        {
            self.counts = stats::count_mbox(&self.path)?;
            self.stats_last_checked = now_stamp();
        }

        Ok(())
    }

    fn check_maildir(
        &mut self,
        config: &MailboxConfig,
        flags: CheckFlags,
    ) -> Result<(), Error> {
        for (_, md) in stats::maildir_messages(&self.path.join("new"))? {
            if !config.mail_check_recent || mtime(&md) > self.last_visited {
                self.has_new = true;
                break;
            }
        }

        if flags.contains(CheckFlags::STATS) {
            self.counts = stats::count_maildir(&self.path)?;
            self.stats_last_checked = now_stamp();
        }

        Ok(())
    }
}

/// The set of polled mailboxes and the state shared between passes.
pub struct MailboxSet {
    pub mailboxes: Vec<Mailbox>,
    config: MailboxConfig,
    last_check: i64,
    last_stats: i64,
    /// Mailboxes with new mail as of the last pass.
    count: usize,
    /// Mailboxes with new mail the user has not been told about.
    unnotified: usize,
}

impl MailboxSet {
    pub fn new(config: &MailboxConfig) -> Self {
        MailboxSet {
            mailboxes: config
                .mailboxes
                .iter()
                .map(|p| Mailbox::new(expand_path(p)))
                .collect(),
            config: config.clone(),
            last_check: 0,
            last_stats: 0,
            count: 0,
            unnotified: 0,
        }
    }

    pub fn find(&self, path: &Path) -> Option<&Mailbox> {
        self.mailboxes.iter().find(|m| m.path == path)
    }

    fn find_mut(&mut self, path: &Path) -> Option<&mut Mailbox> {
        self.mailboxes.iter_mut().find(|m| m.path == path)
    }

    /// Check every mailbox for new mail.
    ///
    /// `current` is the mailbox the user has open, if any. Returns the
    /// number of mailboxes with new mail.
    pub fn check(
        &mut self,
        current: Option<&Path>,
        flags: CheckFlags,
    ) -> usize {
        self.check_at(current, flags, chrono::Utc::now().timestamp())
    }

    pub fn check_at(
        &mut self,
        current: Option<&Path>,
        mut flags: CheckFlags,
        now: i64,
    ) -> usize {
        if self.mailboxes.is_empty() {
            return 0;
        }

        if flags.is_empty()
            && now - self.last_check < self.config.mail_check as i64
        {
            return self.count;
        }

        if flags.contains(CheckFlags::STATS)
            || (self.config.mail_check_stats
                && now - self.last_stats
                    >= self.config.mail_check_stats_interval as i64)
        {
            flags |= CheckFlags::STATS;
            self.last_stats = now;
        }

        self.last_check = now;
        self.count = 0;
        self.unnotified = 0;

        let current_id = current
            .and_then(|p| fs::metadata(p).ok())
            .map(|md| (md.dev(), md.ino()));

        for i in 0..self.mailboxes.len() {
            if !self.mailboxes[i].poll_new_mail {
                continue;
            }

            let mut box_flags = flags;
            if !self.mailboxes[i].first_check_stats_done
                && self.config.mail_check_stats
            {
                box_flags |= CheckFlags::STATS;
            }

            self.check_one(current, current_id, i, box_flags);
            let mailbox = &mut self.mailboxes[i];
            if mailbox.has_new {
                self.count += 1;
            }
            mailbox.first_check_stats_done = true;
        }

        debug!("{} mailboxes with new mail", self.count);
        self.count
    }

    fn check_one(
        &mut self,
        current: Option<&Path>,
        current_id: Option<(u64, u64)>,
        ix: usize,
        flags: CheckFlags,
    ) {
        let config = &self.config;
        let mailbox = &mut self.mailboxes[ix];

        if config.mail_check_recent && Some(mailbox.path.as_path()) == current
        {
            mailbox.has_new = false;
        }

        let md = match fs::metadata(&mailbox.path) {
            Ok(md) => md,
            Err(_) => {
                mailbox.newly_created = true;
                mailbox.kind = MailboxKind::Unknown;
                mailbox.size = 0;
                return;
            }
        };

        if MailboxKind::Unknown == mailbox.kind {
            mailbox.kind = stats::detect_kind(&mailbox.path);
        }
        if MailboxKind::Unknown == mailbox.kind {
            // Not there yet in any meaningful sense
            mailbox.newly_created = true;
            mailbox.size = 0;
            return;
        }

        if current_id != Some((md.dev(), md.ino())) {
            let result = match mailbox.kind {
                MailboxKind::Mbox => mailbox.check_mbox(config, flags),
                MailboxKind::Maildir => mailbox.check_maildir(config, flags),
                MailboxKind::Unknown => Ok(()),
            };
            if let Err(e) = result {
                warn!("Failed to check {}: {}", mailbox.path.display(), e);
            }
        } else if config.check_mbox_size {
            mailbox.size = md.len();
        }

        if !mailbox.has_new {
            mailbox.notified = false;
        } else if !mailbox.notify_user {
            mailbox.notified = true;
        } else if !mailbox.notified {
            self.unnotified += 1;
        }
    }

    /// Run a normal check and describe any mail the user has not yet been
    /// told about.
    pub fn notify(&mut self, current: Option<&Path>) -> Option<String> {
        if self.check(current, CheckFlags::empty()) > 0 && 0 != self.unnotified
        {
            self.list()
        } else {
            None
        }
    }

    /// Describe the mailboxes with new mail, marking them notified.
    ///
    /// When some mailboxes have not been announced yet, only those are
    /// listed.
    pub fn list(&mut self) -> Option<String> {
        let have_unnotified = 0 != self.unnotified;
        let mut names = Vec::new();

        for mailbox in &mut self.mailboxes {
            if !mailbox.has_new || (have_unnotified && mailbox.notified) {
                continue;
            }

            if !mailbox.notified {
                mailbox.notified = true;
                self.unnotified = self.unnotified.saturating_sub(1);
            }
            names.push(pretty_path(&mailbox.path));
        }

        if names.is_empty() {
            self.unnotified = 0;
            None
        } else {
            let message = format!("New mail in {}", names.join(", "));
            info!("{}", message);
            Some(message)
        }
    }

    /// Record that the user has just looked at the mailbox at `path`.
    pub fn set_notified(&mut self, path: &Path) {
        if let Some(mailbox) = self.find_mut(path) {
            mailbox.notified = true;
            mailbox.last_visited = now_stamp();
        }
    }

    /// The next mailbox after `after` with new mail, wrapping around.
    pub fn next(
        &mut self,
        current: Option<&Path>,
        after: &Path,
    ) -> Option<PathBuf> {
        if 0 == self.check(current, CheckFlags::empty()) {
            return None;
        }
        self.find_next(after, |m| m.has_new)
    }

    /// The next mailbox after `after` with unread mail, wrapping around.
    pub fn next_unread(&self, after: &Path) -> Option<PathBuf> {
        self.find_next(after, |m| m.counts.unread > 0)
    }

    fn find_next(
        &self,
        after: &Path,
        wanted: impl Fn(&Mailbox) -> bool,
    ) -> Option<PathBuf> {
        let after = expand_path(after);
        let mut found = false;
        for pass in 0..2 {
            for mailbox in &self.mailboxes {
                if (found || pass > 0) && wanted(mailbox) {
                    return Some(mailbox.path.clone());
                }
                if mailbox.path == after {
                    found = true;
                }
            }
        }
        None
    }

    /// Fix up the times of the mbox at `path` after modifying it, given its
    /// metadata from before the modification, so that the next check draws
    /// the right conclusion about new mail.
    pub fn restore_timestamp(
        &mut self,
        path: &Path,
        before: &fs::Metadata,
    ) -> Result<(), Error> {
        if self.config.check_mbox_size {
            if let Some(mailbox) = self.find_mut(path) {
                if !mailbox.has_new {
                    mailbox.update_size();
                }
            }
            return Ok(());
        }

        let now = TimeVal::seconds(chrono::Utc::now().timestamp());
        let new_atime = if mtime(before) > atime(before) {
            TimeVal::seconds(before.atime())
        } else {
            now
        };
        utimes(path, &new_atime, &now)?;
        Ok(())
    }
}

/// Abbreviate `path` for display by replacing the home directory with `~`.
fn pretty_path(path: &Path) -> String {
    if let Some(home) = std::env::var_os("HOME") {
        if let Ok(rest) = path.strip_prefix(&home) {
            return format!("~/{}", rest.display());
        }
    }
    path.display().to_string()
}
