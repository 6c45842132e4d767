//! OCI runtime collaborator consumed by the core.
//!
//! The core never talks to the runtime binary directly; it drives these
//! traits. [`runc::RuncRuntime`] binds them to an external runc-compatible
//! binary, tests substitute a mock.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use cocoon_shared::protocol::ContainerProcessState;
use cocoon_shared::CocoonResult;
use oci_spec::runtime::Process as OciProcess;

use crate::stdio::{ConnectionSet, TtyRelay};

mod runc;
pub use runc::RuncRuntime;

#[cfg(test)]
pub(crate) mod mock;

/// Terminal state of an exited container or process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    code: i32,
}

impl ExitState {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    pub fn exit_code(&self) -> i32 {
        self.code
    }
}

/// Entry point into the underlying OCI runtime.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create a container from the bundle at `storage_path`, wiring the
    /// init process's stdio to `stdio`. The container is left created but
    /// not started.
    async fn create_container(
        &self,
        id: &str,
        storage_path: &Path,
        stdio: ConnectionSet,
    ) -> CocoonResult<Arc<dyn RuntimeContainer>>;
}

/// A created container. The handle stays valid until `wait` returns.
#[async_trait]
pub trait RuntimeContainer: Send + Sync {
    /// Pid of the init process.
    fn pid(&self) -> i32;

    /// The init process's console relay, when created with a terminal.
    fn tty(&self) -> Option<Arc<TtyRelay>>;

    async fn start(&self) -> CocoonResult<()>;

    async fn kill(&self, signal: i32) -> CocoonResult<()>;

    /// Block until the init process exits.
    async fn wait(&self) -> CocoonResult<ExitState>;

    /// Execute an additional process inside the container.
    async fn exec_process(
        &self,
        process: OciProcess,
        stdio: ConnectionSet,
    ) -> CocoonResult<Arc<dyn RuntimeProcess>>;

    /// Every process in the container, zombies included.
    async fn get_all_processes(&self) -> CocoonResult<Vec<ContainerProcessState>>;
}

/// A process executed inside a container.
#[async_trait]
pub trait RuntimeProcess: Send + Sync {
    fn pid(&self) -> i32;

    fn tty(&self) -> Option<Arc<TtyRelay>>;

    /// Block until the process exits.
    async fn wait(&self) -> CocoonResult<ExitState>;

    /// Reclaim runtime resources once the process has exited.
    async fn delete(&self) -> CocoonResult<()>;
}
