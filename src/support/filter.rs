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

//! Running external filter commands.
//!
//! A filter is a shell command line with up to three redirected standard
//! streams. Every crypto program the classic backends drive, as well as
//! mailcap viewers, goes through here.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};

use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::error::Error;

/// Where one standard stream of a filter goes.
#[derive(Debug)]
pub enum Redirect {
    /// Create a pipe the caller can read or write.
    Pipe,
    /// Share the caller's stream, and with it the controlling terminal.
    Inherit,
    /// `/dev/null`.
    Null,
    /// An already-open file.
    File(File),
}

impl Redirect {
    fn into_stdio(self) -> Stdio {
        match self {
            Redirect::Pipe => Stdio::piped(),
            Redirect::Inherit => Stdio::inherit(),
            Redirect::Null => Stdio::null(),
            Redirect::File(f) => Stdio::from(f),
        }
    }
}

/// A running filter process.
#[derive(Debug)]
pub struct Filter {
    child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl Filter {
    /// Start `cmd` under `sh -c` with the given redirections and additional
    /// environment.
    pub fn spawn(
        cmd: &str,
        stdin: Redirect,
        stdout: Redirect,
        stderr: Redirect,
        env: &[(String, String)],
    ) -> Result<Self, Error> {
        debug!("Spawning filter: {}", cmd);
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .envs(env.iter().map(|&(ref k, ref v)| (k, v)))
            .stdin(stdin.into_stdio())
            .stdout(stdout.into_stdio())
            .stderr(stderr.into_stdio())
            .spawn()
            .map_err(|e| {
                warn!("Failed to spawn '{}': {}", cmd, e);
                Error::SpawnFailed(cmd.to_owned())
            })?;

        Ok(Filter {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Block until the process exits and return its exit status.
    ///
    /// Any pipe still held is closed first. A process killed by a signal
    /// counts as interrupted.
    pub fn wait(mut self) -> Result<i32, Error> {
        self.stdin.take();
        let status = self.child.wait()?;
        if let Some(code) = status.code() {
            Ok(code)
        } else {
            debug!(
                "Filter {} terminated by signal {:?}",
                self.child.id(),
                status.signal()
            );
            Err(Error::Interrupted)
        }
    }

    /// Deliver SIGINT to the process.
    pub fn interrupt(&self) -> Result<(), Error> {
        kill(Pid::from_raw(self.child.id() as i32), Signal::SIGINT)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(())
    }
}

/// The collected result of `run`.
#[derive(Clone, Debug, Default)]
pub struct FilterOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run `cmd` to completion, feeding it `input` on standard input.
///
/// Standard output and error are spooled through anonymous temporary files,
/// so a process which writes a lot before reading its input cannot deadlock
/// against us.
pub fn run(
    cmd: &str,
    input: Option<&[u8]>,
    env: &[(String, String)],
) -> Result<FilterOutput, Error> {
    let mut out = tempfile::tempfile()?;
    let mut err = tempfile::tempfile()?;
    let mut filter = Filter::spawn(
        cmd,
        if input.is_some() {
            Redirect::Pipe
        } else {
            Redirect::Null
        },
        Redirect::File(out.try_clone()?),
        Redirect::File(err.try_clone()?),
        env,
    )?;

    if let (Some(input), Some(mut stdin)) = (input, filter.stdin.take()) {
        match stdin.write_all(input) {
            Ok(()) => (),
            // The process does not care about (the rest of) its input
            Err(e) if io::ErrorKind::BrokenPipe == e.kind() => (),
            Err(e) => return Err(e.into()),
        }
    }

    let status = filter.wait()?;
    Ok(FilterOutput {
        status,
        stdout: slurp(&mut out)?,
        stderr: slurp(&mut err)?,
    })
}

fn slurp(f: &mut File) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    f.seek(SeekFrom::Start(0))?;
    f.read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_pipes_input_through() {
        let out = run("tr a-z A-Z", Some(b"hello\n"), &[]).unwrap();
        assert_eq!(0, out.status);
        assert_eq!(b"HELLO\n".to_vec(), out.stdout);
        assert!(out.stderr.is_empty());
    }

    #[test]
    fn run_reports_status_and_stderr() {
        let out = run("echo oops >&2; exit 3", None, &[]).unwrap();
        assert_eq!(3, out.status);
        assert_eq!(b"oops\n".to_vec(), out.stderr);
    }

    #[test]
    fn run_passes_environment() {
        let out = run(
            "printf %s \"$MAILCRYPT_TEST\"",
            None,
            &[("MAILCRYPT_TEST".to_owned(), "plugh".to_owned())],
        )
        .unwrap();
        assert_eq!(b"plugh".to_vec(), out.stdout);
    }

    #[test]
    fn input_ignored_by_child_is_not_an_error() {
        let input = vec![b'x'; 1 << 20];
        let out = run("exit 0", Some(&input), &[]).unwrap();
        assert_eq!(0, out.status);
    }

    #[test]
    fn signal_death_is_interruption() {
        assert_matches!(
            Err(Error::Interrupted),
            run("kill -INT $$", None, &[])
        );
    }

    #[test]
    fn interrupt_stops_child() {
        let filter = Filter::spawn(
            "exec sleep 30",
            Redirect::Null,
            Redirect::Null,
            Redirect::Null,
            &[],
        )
        .unwrap();
        filter.interrupt().unwrap();
        assert_matches!(Err(Error::Interrupted), filter.wait());
    }

    #[test]
    fn pipe_stdout_readable() {
        let mut filter = Filter::spawn(
            "echo foo",
            Redirect::Null,
            Redirect::Pipe,
            Redirect::Null,
            &[],
        )
        .unwrap();
        let mut s = String::new();
        filter.stdout.take().unwrap().read_to_string(&mut s).unwrap();
        assert_eq!("foo\n", s);
        assert_eq!(0, filter.wait().unwrap());
    }
}
