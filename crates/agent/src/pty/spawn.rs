// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;

use anyhow::{bail, Context};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;

/// The PTY master, wrapped so it can drive an `AsyncFd`.
#[derive(Debug)]
struct MasterFd(OwnedFd);

impl MasterFd {
    /// Readiness-based I/O needs the fd in non-blocking mode.
    fn set_nonblocking(&self) -> io::Result<()> {
        let flags = OFlag::from_bits_truncate(fcntl(&self.0, FcntlArg::F_GETFL).map_err(errno_io)?);
        fcntl(&self.0, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(errno_io)?;
        Ok(())
    }
}

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for MasterFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

fn errno_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// How a session's child process is launched.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub shell: String,
    /// When set, the process runs inside this container via `docker exec`.
    pub container: Option<ContainerExec>,
    pub work_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Target container for `docker exec` sessions.
#[derive(Debug, Clone)]
pub struct ContainerExec {
    pub container_id: String,
    pub user: Option<String>,
}

impl SpawnSpec {
    /// Build the argv executed on the PTY.
    ///
    /// Container mode wraps the shell in `docker exec -it` with the work
    /// dir, user, and environment forwarded as flags; direct mode runs the
    /// shell itself (env and cwd are applied in the forked child instead).
    pub fn argv(&self) -> Vec<String> {
        match &self.container {
            Some(exec) => {
                let mut argv = vec!["docker".to_owned(), "exec".to_owned(), "-it".to_owned()];
                if let Some(user) = &exec.user {
                    argv.push("-u".to_owned());
                    argv.push(user.clone());
                }
                if let Some(dir) = &self.work_dir {
                    argv.push("-w".to_owned());
                    argv.push(dir.display().to_string());
                }
                for (k, v) in &self.env {
                    argv.push("-e".to_owned());
                    argv.push(format!("{k}={v}"));
                }
                argv.push("-e".to_owned());
                argv.push("TERM=xterm-256color".to_owned());
                argv.push(exec.container_id.clone());
                argv.push(self.shell.clone());
                argv.push("-l".to_owned());
                argv
            }
            None => vec![self.shell.clone()],
        }
    }
}

/// A spawned PTY: nonblocking master fd plus the child pid.
pub struct PtyHandle {
    master: AsyncFd<MasterFd>,
    pub child: Pid,
}

/// Spawn the child on a fresh PTY with the given initial window size.
// forkpty requires unsafe: the child is partially initialized post-fork.
#[allow(unsafe_code)]
pub fn spawn_pty(spec: &SpawnSpec, rows: u16, cols: u16) -> anyhow::Result<PtyHandle> {
    let argv = spec.argv();
    if argv.is_empty() {
        bail!("empty command");
    }

    let winsize = Winsize {
        ws_col: cols,
        ws_row: rows,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: forkpty is unsafe because the child is in a
    // partially-initialized state after fork. We immediately exec.
    let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

    match result {
        ForkptyResult::Child => {
            std::env::set_var("TERM", "xterm-256color");
            if spec.container.is_none() {
                for (k, v) in &spec.env {
                    std::env::set_var(k, v);
                }
                if let Some(dir) = &spec.work_dir {
                    let _ = std::env::set_current_dir(dir);
                }
            }

            let c_args: Vec<CString> = argv
                .iter()
                .map(|s| CString::new(s.as_bytes()))
                .collect::<Result<_, _>>()
                .context("invalid command argument")?;

            execvp(&c_args[0], &c_args).context("execvp failed")?;
            unreachable!();
        }
        ForkptyResult::Parent { child, master } => {
            let master = MasterFd(master);
            master.set_nonblocking()?;
            let master = AsyncFd::new(master).context("AsyncFd::new failed")?;
            Ok(PtyHandle { master, child })
        }
    }
}

impl PtyHandle {
    /// Wait for output and read the next chunk into `buf`.
    ///
    /// Returns `None` when the stream has ended. The kernel reports the
    /// child side closing as a raw `EIO` on Linux PTYs, so that case is
    /// folded into the end-of-stream result here rather than surfaced as
    /// an error.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            let mut ready = self.master.readable().await?;
            let attempt = ready.try_io(|fd| {
                nix::unistd::read(fd, buf).map_err(errno_io)
            });
            match attempt {
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(n)) => return Ok(Some(n)),
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(None),
                Ok(Err(e)) => return Err(e),
                // Spurious readiness; park again.
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer, waiting for writability between partial
    /// writes.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut ready = self.master.writable().await?;
            match ready.try_io(|fd| nix::unistd::write(fd.get_ref(), remaining).map_err(errno_io)) {
                Ok(Ok(n)) => remaining = &remaining[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Apply a new window size with the `TIOCSWINSZ` ioctl.
    // The ioctl call itself requires unsafe.
    #[allow(unsafe_code)]
    pub fn set_winsize(&self, rows: u16, cols: u16) -> anyhow::Result<()> {
        let ws = Winsize {
            ws_col: cols,
            ws_row: rows,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the window
        // size on the PTY master fd. The Winsize struct is fully initialized.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!(
                "TIOCSWINSZ ioctl failed: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }

    /// Best-effort shutdown: SIGHUP, short wait, SIGKILL, reap.
    pub fn terminate(&self) {
        let pid = self.child;
        let _ = kill(pid, Signal::SIGHUP);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
        });
    }

    /// Reap the child's exit code without blocking.
    ///
    /// Returns `None` when the child has not exited yet.
    pub fn try_exit_code(&self) -> Option<i32> {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(128 + sig as i32),
            _ => None,
        }
    }
}

/// Block until the child exits and return its exit code.
///
/// Returns `None` if the child was already reaped elsewhere.
pub fn wait_for_exit(pid: Pid) -> Option<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Some(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Some(128 + sig as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
#[path = "spawn_tests.rs"]
mod tests;
