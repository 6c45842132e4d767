//! Per-container and per-process records.
//!
//! Entries are shared between the registries and any waiters via `Arc`, so
//! a waiter that looked an entry up before its removal keeps a valid
//! reference and still observes the exit code. All mutable container state
//! is only touched while the container registry's write guard is held; the
//! inner mutex exists to satisfy the borrow checker, not as a second
//! synchronization point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use cocoon_shared::protocol::{MappedDirectory, MappedVirtualDisk, NetworkAdapter};
use cocoon_shared::{CocoonError, CocoonResult};
use tokio::sync::watch;
use tracing::warn;

use crate::runtime::RuntimeContainer;
use crate::stdio::TtyRelay;

/// One-shot completion cell carrying an exit code.
///
/// Armed at construction. `release` stores the code and wakes every
/// waiter; later releases are ignored. Late waiters return immediately
/// with the stored value.
pub struct ExitLatch {
    cell: watch::Sender<Option<i32>>,
}

impl ExitLatch {
    pub fn new() -> Self {
        Self {
            cell: watch::channel(None).0,
        }
    }

    /// Store the exit code and release all waiters. Returns false if the
    /// latch had already been released.
    pub fn release(&self, code: i32) -> bool {
        self.cell.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(code);
                true
            } else {
                false
            }
        })
    }

    /// Block until released, then return the stored exit code.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.cell.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(-1),
            // The sender lives in the same entry we hold; this arm is
            // unreachable but must not panic.
            Err(_) => self.code().unwrap_or(-1),
        };
        result
    }

    /// The stored code, if released.
    pub fn code(&self) -> Option<i32> {
        *self.cell.borrow()
    }
}

impl Default for ExitLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable part of a container entry. Guarded by the container registry's
/// write side.
#[derive(Default)]
pub struct ContainerState {
    pub mapped_virtual_disks: HashMap<u8, MappedVirtualDisk>,
    pub mapped_directories: HashMap<u32, MappedDirectory>,
    pub network_adapters: Vec<NetworkAdapter>,
    pub runtime_handle: Option<Arc<dyn RuntimeContainer>>,
    pub has_run_init_process: bool,
    /// Layer mount points in mount order, for cleanup and rollback.
    pub layer_mounts: Vec<PathBuf>,
}

/// Everything the supervisor knows about one container.
pub struct ContainerEntry {
    id: String,
    state: Mutex<ContainerState>,
    exit: ExitLatch,
}

impl ContainerEntry {
    /// A fresh entry with a pre-armed exit latch, ready for insertion.
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            state: Mutex::new(ContainerState::default()),
            exit: ExitLatch::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exit(&self) -> &ExitLatch {
        &self.exit
    }

    /// Exit code recorded so far; -1 until the init process has exited.
    pub fn exit_code(&self) -> i32 {
        self.exit.code().unwrap_or(-1)
    }

    pub fn state(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_network_adapter(&self, adapter: NetworkAdapter) {
        self.state().network_adapters.push(adapter);
    }

    pub fn add_mapped_virtual_disk(&self, disk: MappedVirtualDisk) -> CocoonResult<()> {
        let mut state = self.state();
        if state.mapped_virtual_disks.contains_key(&disk.lun) {
            return Err(CocoonError::DuplicateMappedDiskLun {
                id: self.id.clone(),
                lun: disk.lun,
            });
        }
        state.mapped_virtual_disks.insert(disk.lun, disk);
        Ok(())
    }

    /// Removal is idempotent; unknown LUNs only warn.
    pub fn remove_mapped_virtual_disk(&self, disk: &MappedVirtualDisk) {
        let mut state = self.state();
        if state.mapped_virtual_disks.remove(&disk.lun).is_none() {
            warn!(
                container = %self.id,
                lun = disk.lun,
                "removing a virtual disk that is not attached"
            );
        }
    }

    pub fn add_mapped_directory(&self, dir: MappedDirectory) -> CocoonResult<()> {
        let mut state = self.state();
        if state.mapped_directories.contains_key(&dir.port) {
            return Err(CocoonError::DuplicateMappedDirectoryPort {
                id: self.id.clone(),
                port: dir.port,
            });
        }
        state.mapped_directories.insert(dir.port, dir);
        Ok(())
    }

    /// Removal is idempotent; unknown ports only warn.
    pub fn remove_mapped_directory(&self, dir: &MappedDirectory) {
        let mut state = self.state();
        if state.mapped_directories.remove(&dir.port).is_none() {
            warn!(
                container = %self.id,
                port = dir.port,
                "removing a mapped directory that is not attached"
            );
        }
    }
}

/// Everything the supervisor knows about one process.
///
/// Entries are never removed; a reused pid overwrites the stale entry so
/// late waiters on the old pid still resolve.
pub struct ProcessEntry {
    container_id: String,
    tty: Option<Arc<TtyRelay>>,
    exit: ExitLatch,
}

impl ProcessEntry {
    /// An entry for a container process. An empty container id denotes a
    /// host process.
    pub fn new(container_id: impl Into<String>, tty: Option<Arc<TtyRelay>>) -> Arc<Self> {
        Arc::new(Self {
            container_id: container_id.into(),
            tty,
            exit: ExitLatch::new(),
        })
    }

    /// An entry for a process outside any container.
    pub fn host(tty: Option<Arc<TtyRelay>>) -> Arc<Self> {
        Self::new("", tty)
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn is_host_process(&self) -> bool {
        self.container_id.is_empty()
    }

    pub fn tty(&self) -> Option<Arc<TtyRelay>> {
        self.tty.clone()
    }

    pub fn exit(&self) -> &ExitLatch {
        &self.exit
    }
}
