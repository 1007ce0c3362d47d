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

//! Format detection and message counting for local mailboxes.

use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::debug;
use nix::sys::stat::utimes;
use nix::sys::time::{TimeVal, TimeValLike};

/// The formats of local mailbox this module understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxKind {
    /// Missing, empty, or not a mailbox.
    Unknown,
    Mbox,
    Maildir,
}

/// Work out what kind of mailbox lives at `path`.
pub fn detect_kind(path: &Path) -> MailboxKind {
    let md = match fs::metadata(path) {
        Ok(md) => md,
        Err(_) => return MailboxKind::Unknown,
    };

    if md.is_dir() {
        if path.join("cur").is_dir() && path.join("new").is_dir() {
            MailboxKind::Maildir
        } else {
            MailboxKind::Unknown
        }
    } else if md.is_file() {
        let mut first = [0u8; 5];
        let read = fs::File::open(path)
            .and_then(|mut f| f.read_exact(&mut first))
            .is_ok();
        restore_times(path, &md);
        if read && &first == b"From " {
            MailboxKind::Mbox
        } else {
            MailboxKind::Unknown
        }
    } else {
        MailboxKind::Unknown
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub total: usize,
    pub unread: usize,
    /// Unread and not yet seen by any client.
    pub new: usize,
}

fn to_timeval(secs: i64, nsecs: i64) -> TimeVal {
    TimeVal::microseconds(secs * 1_000_000 + nsecs / 1000)
}

/// Put back the access and modification times `md` recorded, since merely
/// looking inside a mailbox must not make its new mail look read.
pub fn restore_times(path: &Path, md: &fs::Metadata) {
    if let Err(e) = utimes(
        path,
        &to_timeval(md.atime(), md.atime_nsec()),
        &to_timeval(md.mtime(), md.mtime_nsec()),
    ) {
        debug!("Failed to restore times of {}: {}", path.display(), e);
    }
}

/// Count the messages in an mbox, classifying each by its `Status:` header.
pub fn count_mbox(path: &Path) -> io::Result<Counts> {
    let md = fs::metadata(path)?;
    let mut counts = Counts::default();
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut line = Vec::new();
    let mut prev_blank = true;
    let mut in_headers = false;
    let mut status: Option<Vec<u8>> = None;

    let finish = |counts: &mut Counts, status: Option<Vec<u8>>| {
        let status = status.unwrap_or_default();
        if !status.contains(&b'R') {
            counts.unread += 1;
            if !status.contains(&b'O') {
                counts.new += 1;
            }
        }
    };

    loop {
        line.clear();
        if 0 == reader.read_until(b'\n', &mut line)? {
            break;
        }
        let content = trim_eol(&line);

        if prev_blank && content.starts_with(b"From ") {
            if counts.total > 0 {
                finish(&mut counts, status.take());
            }
            counts.total += 1;
            in_headers = true;
        } else if in_headers {
            if content.is_empty() {
                in_headers = false;
            } else if content.len() > 7
                && content[..7].eq_ignore_ascii_case(b"status:")
            {
                status = Some(content[7..].to_vec());
            }
        }

        prev_blank = content.is_empty();
    }

    if counts.total > 0 {
        finish(&mut counts, status);
    }
    restore_times(path, &md);
    Ok(counts)
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// The maildir flags of a file name, i.e., whatever follows `:2,`.
fn maildir_flags(name: &str) -> &str {
    name.rsplit_once(":2,").map_or("", |(_, flags)| flags)
}

/// Visit the messages in one maildir subdirectory, skipping dot files and
/// anything marked trashed.
pub fn maildir_messages(
    dir: &Path,
) -> io::Result<impl Iterator<Item = (String, fs::Metadata)>> {
    Ok(fs::read_dir(dir)?.filter_map(|entry| {
        let entry = entry.ok()?;
        let name = entry.file_name().into_string().ok()?;
        if name.starts_with('.') || maildir_flags(&name).contains('T') {
            return None;
        }
        Some((name, entry.metadata().ok()?))
    }))
}

pub fn count_maildir(path: &Path) -> io::Result<Counts> {
    let mut counts = Counts::default();
    for _ in maildir_messages(&path.join("new"))? {
        counts.total += 1;
        counts.unread += 1;
        counts.new += 1;
    }
    for (name, _) in maildir_messages(&path.join("cur"))? {
        counts.total += 1;
        if !maildir_flags(&name).contains('S') {
            counts.unread += 1;
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detect_and_count_mbox() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("inbox");
        assert_eq!(MailboxKind::Unknown, detect_kind(&path));

        fs::write(&path, b"").unwrap();
        assert_eq!(MailboxKind::Unknown, detect_kind(&path));

        fs::write(
            &path,
            b"From a@example.com Mon May  4 10:00:00 2020\n\
              Subject: one\n\
              Status: RO\n\
              \n\
              >From here on it is body text\n\
              \n\
              From b@example.com Mon May  4 11:00:00 2020\n\
              Subject: two\n\
              status: O\n\
              \n\
              body\n\
              \n\
              From c@example.com Mon May  4 12:00:00 2020\r\n\
              Subject: three\r\n\
              \r\n\
              Status: R is not a header here\r\n",
        )
        .unwrap();
        assert_eq!(MailboxKind::Mbox, detect_kind(&path));
        assert_eq!(
            Counts {
                total: 3,
                unread: 2,
                new: 1,
            },
            count_mbox(&path).unwrap()
        );
    }

    #[test]
    fn detect_and_count_maildir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(MailboxKind::Unknown, detect_kind(dir.path()));

        for sub in &["cur", "new", "tmp"] {
            fs::create_dir(dir.path().join(sub)).unwrap();
        }
        assert_eq!(MailboxKind::Maildir, detect_kind(dir.path()));

        fs::write(dir.path().join("new/1.host"), b"x").unwrap();
        fs::write(dir.path().join("new/.hidden"), b"x").unwrap();
        fs::write(dir.path().join("cur/2.host:2,S"), b"x").unwrap();
        fs::write(dir.path().join("cur/3.host:2,F"), b"x").unwrap();
        fs::write(dir.path().join("cur/4.host:2,ST"), b"x").unwrap();
        assert_eq!(
            Counts {
                total: 3,
                unread: 2,
                new: 1,
            },
            count_maildir(dir.path()).unwrap()
        );
    }
}
