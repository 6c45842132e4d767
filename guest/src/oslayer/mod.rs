//! OS collaborator consumed by the core.
//!
//! Everything the supervisor asks of the guest kernel goes through the
//! [`Os`] trait: filesystem setup, mounts, signals, adapter configuration
//! and host-process spawning. The real implementation is [`SystemOs`];
//! tests substitute a recording mock.

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cocoon_shared::protocol::NetworkAdapter;
use cocoon_shared::CocoonResult;
use nix::fcntl::OFlag;
use nix::mount::MsFlags;

use crate::runtime::ExitState;

mod system;
pub use system::SystemOs;

#[cfg(test)]
pub(crate) mod mock;

/// Guest OS operations used by the core.
#[async_trait]
pub trait Os: Send + Sync {
    fn mkdir_all(&self, path: &Path, mode: u32) -> CocoonResult<()>;

    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> CocoonResult<()>;

    fn open_file(&self, path: &Path, flags: OFlag, mode: u32) -> CocoonResult<File>;

    fn remove_all(&self, path: &Path) -> CocoonResult<()>;

    fn kill(&self, pid: i32, signal: i32) -> CocoonResult<()>;

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: Option<&str>,
    ) -> CocoonResult<()>;

    fn unmount(&self, target: &Path) -> CocoonResult<()>;

    /// Resolve a mapped disk's LUN to its block device node.
    fn device_for_scsi_lun(&self, lun: u8) -> CocoonResult<PathBuf>;

    /// Configure a network adapter in the namespace containers run in.
    async fn configure_adapter(&self, adapter: &NetworkAdapter) -> CocoonResult<()>;

    /// Spawn a process in the utility VM, outside any container.
    async fn spawn(&self, spec: HostProcessSpec) -> CocoonResult<Box<dyn HostProcess>>;
}

/// Everything needed to spawn a host process.
pub struct HostProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Environment in `KEY=VALUE` form, replacing the inherited one.
    pub env: Vec<String>,
    /// Working directory; empty means inherit.
    pub cwd: String,
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
    /// Make stdin the child's controlling terminal (console emulation).
    pub controlling_tty: bool,
}

/// A spawned host process, owned by its supervisor.
#[async_trait]
pub trait HostProcess: Send {
    fn pid(&self) -> i32;

    /// Wait for the process to exit.
    ///
    /// A nonzero exit is not an error; `Err` means the wait itself failed
    /// and no exit state could be collected.
    async fn wait(&mut self) -> CocoonResult<ExitState>;
}
