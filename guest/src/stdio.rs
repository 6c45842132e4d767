//! Stdio plumbing: connection sets, console allocation and the TTY relay.
//!
//! A [`ConnectionSet`] carries the file descriptors a process's stdio is
//! wired to. For console-emulated processes the set is bridged to a pty
//! master by a [`TtyRelay`], which also owns the resize channel.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Mutex;

use cocoon_shared::{CocoonError, CocoonResult};
use nix::fcntl::OFlag;
use nix::pty::Winsize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

/// The stdio endpoints handed to a process.
///
/// Absent descriptors mean the corresponding stream is not connected; the
/// process sees a closed or null stream there.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl ConnectionSet {
    /// A set with no connections at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(stdin: Option<OwnedFd>, stdout: Option<OwnedFd>, stderr: Option<OwnedFd>) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }

    /// Consume the set, yielding files suitable for wiring directly to a
    /// child process.
    pub fn into_files(self) -> (Option<File>, Option<File>, Option<File>) {
        (
            self.stdin.map(File::from),
            self.stdout.map(File::from),
            self.stderr.map(File::from),
        )
    }

    /// Consume the set and bridge it to the given pty master.
    pub fn new_tty_relay(self, master: OwnedFd) -> TtyRelay {
        TtyRelay::new(self, master)
    }
}

/// Allocate a console pair: the pty master and the path of its slave.
pub fn new_console() -> CocoonResult<(OwnedFd, PathBuf)> {
    let master = nix::pty::posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
        .map_err(|e| CocoonError::os("openpt", e))?;
    nix::pty::grantpt(&master).map_err(|e| CocoonError::os("grantpt", e))?;
    nix::pty::unlockpt(&master).map_err(|e| CocoonError::os("unlockpt", e))?;
    let slave_path = nix::pty::ptsname_r(&master).map_err(|e| CocoonError::os("ptsname", e))?;

    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    Ok((master, PathBuf::from(slave_path)))
}

/// Bridges a pty master and a caller's connection set.
///
/// `start` spawns the forwarding tasks, `wait` drains them, and
/// `resize_console` drives the window-size ioctl. The relay keeps the
/// master open for as long as it is alive so resize stays possible after
/// the forwarding ends.
pub struct TtyRelay {
    master: File,
    endpoints: Mutex<Option<(Option<OwnedFd>, Option<OwnedFd>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TtyRelay {
    fn new(set: ConnectionSet, master: OwnedFd) -> Self {
        // stderr has no meaning on a tty; the master carries both output
        // streams merged.
        let ConnectionSet { stdin, stdout, .. } = set;
        Self {
            master: File::from(master),
            endpoints: Mutex::new(Some((stdin, stdout))),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Begin forwarding between the connection set and the master.
    ///
    /// Calling `start` more than once is a no-op.
    pub fn start(&self) {
        let Some((stdin, stdout)) = self.endpoints.lock().unwrap_or_else(|e| e.into_inner()).take()
        else {
            return;
        };

        let mut tasks = Vec::new();
        if let Some(stdin) = stdin {
            if let Ok(to_master) = dup_file(&self.master) {
                tasks.push(tokio::spawn(copy_stream(File::from(stdin), to_master)));
            }
        }
        if let Some(stdout) = stdout {
            if let Ok(from_master) = dup_file(&self.master) {
                tasks.push(tokio::spawn(copy_stream(from_master, File::from(stdout))));
            }
        }
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
    }

    /// Wait for the forwarding tasks to drain.
    pub async fn wait(&self) {
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Resize the console window.
    pub fn resize_console(&self, height: u16, width: u16) -> CocoonResult<()> {
        let winsize = Winsize {
            ws_row: height,
            ws_col: width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe {
            nix::libc::ioctl(
                self.master.as_raw_fd(),
                nix::libc::TIOCSWINSZ,
                &winsize as *const _,
            )
        };
        if rc == -1 {
            return Err(CocoonError::os(
                "resize console",
                std::io::Error::last_os_error(),
            ));
        }
        debug!(height, width, "console resized");
        Ok(())
    }
}

fn dup_file(file: &File) -> CocoonResult<File> {
    let fd = nix::unistd::dup(file.as_raw_fd()).map_err(|e| CocoonError::os("dup", e))?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Pump bytes from one descriptor to the other until EOF or error.
async fn copy_stream(reader: File, writer: File) {
    let mut reader = tokio::fs::File::from_std(reader);
    let mut writer = tokio::fs::File::from_std(writer);
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            // A pty master reports EIO once the slave side is gone; that is
            // the normal end of stream.
            Err(_) => break,
        }
    }
    let _ = writer.flush().await;
}
