//! Real OS implementation backed by nix and tokio.

use std::fs::File;
use std::os::fd::FromRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use cocoon_shared::protocol::NetworkAdapter;
use cocoon_shared::{CocoonError, CocoonResult};
use nix::fcntl::OFlag;
use nix::mount::MsFlags;
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use tracing::debug;

use super::{HostProcess, HostProcessSpec, Os};
use crate::net;
use crate::runtime::ExitState;

/// The guest kernel, for real.
#[derive(Debug, Default)]
pub struct SystemOs;

impl SystemOs {
    pub fn new() -> Self {
        SystemOs
    }
}

#[async_trait]
impl Os for SystemOs {
    fn mkdir_all(&self, path: &Path, mode: u32) -> CocoonResult<()> {
        std::fs::create_dir_all(path)
            .map_err(|e| CocoonError::os(format!("mkdir {}", path.display()), e))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| CocoonError::os(format!("chmod {}", path.display()), e))
    }

    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> CocoonResult<()> {
        std::fs::write(path, contents)
            .map_err(|e| CocoonError::os(format!("write {}", path.display()), e))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| CocoonError::os(format!("chmod {}", path.display()), e))
    }

    fn open_file(&self, path: &Path, flags: OFlag, mode: u32) -> CocoonResult<File> {
        let fd = nix::fcntl::open(path, flags, Mode::from_bits_truncate(mode))
            .map_err(|e| CocoonError::os(format!("open {}", path.display()), e))?;
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn remove_all(&self, path: &Path) -> CocoonResult<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CocoonError::os(format!("remove {}", path.display()), e)),
        }
    }

    fn kill(&self, pid: i32, signal: i32) -> CocoonResult<()> {
        let signal = Signal::try_from(signal)
            .map_err(|_| CocoonError::InvalidArguments(format!("invalid signal {signal}")))?;
        nix::sys::signal::kill(Pid::from_raw(pid), signal)
            .map_err(|e| CocoonError::os(format!("kill {pid}"), e))
    }

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: Option<&str>,
    ) -> CocoonResult<()> {
        debug!(source, target = %target.display(), fstype, "mounting");
        std::fs::create_dir_all(target)
            .map_err(|e| CocoonError::os(format!("mkdir {}", target.display()), e))?;
        nix::mount::mount(Some(source), target, Some(fstype), flags, data).map_err(|e| {
            CocoonError::storage(
                format!("mount {} on {}", source, target.display()),
                e,
            )
        })
    }

    fn unmount(&self, target: &Path) -> CocoonResult<()> {
        debug!(target = %target.display(), "unmounting");
        nix::mount::umount(target)
            .map_err(|e| CocoonError::storage(format!("unmount {}", target.display()), e))
    }

    fn device_for_scsi_lun(&self, lun: u8) -> CocoonResult<PathBuf> {
        Ok(PathBuf::from(format!("/dev/sd{}", scsi_disk_suffix(lun))))
    }

    async fn configure_adapter(&self, adapter: &NetworkAdapter) -> CocoonResult<()> {
        net::configure_interface(adapter).await
    }

    async fn spawn(&self, spec: HostProcessSpec) -> CocoonResult<Box<dyn HostProcess>> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.env_clear();
        for entry in &spec.env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        if !spec.cwd.is_empty() {
            cmd.current_dir(&spec.cwd);
        }
        cmd.stdin(spec.stdin.map_or_else(Stdio::null, Stdio::from));
        cmd.stdout(spec.stdout.map_or_else(Stdio::null, Stdio::from));
        cmd.stderr(spec.stderr.map_or_else(Stdio::null, Stdio::from));

        if spec.controlling_tty {
            // Stdin is the console slave at this point; make it the
            // child's controlling terminal in a fresh session.
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::other)?;
                    if nix::libc::ioctl(0, nix::libc::TIOCSCTTY, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd
            .spawn()
            .map_err(|e| CocoonError::os(format!("spawn {}", spec.program), e))?;
        let pid = child
            .id()
            .ok_or_else(|| CocoonError::os(format!("spawn {}", spec.program), "no pid"))?
            as i32;

        debug!(pid, program = %spec.program, "host process spawned");
        Ok(Box::new(SystemHostProcess { pid, child }))
    }
}

struct SystemHostProcess {
    pid: i32,
    child: tokio::process::Child,
}

#[async_trait]
impl HostProcess for SystemHostProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    async fn wait(&mut self) -> CocoonResult<ExitState> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| CocoonError::os(format!("wait for {}", self.pid), e))?;
        let code = status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
        Ok(ExitState::new(code))
    }
}

/// SCSI disk naming: lun 0 is sda, 25 is sdz, 26 is sdaa and so on.
fn scsi_disk_suffix(lun: u8) -> String {
    let mut n = lun as u32;
    let mut suffix = String::new();
    loop {
        suffix.insert(0, char::from(b'a' + (n % 26) as u8));
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    suffix
}
