//! Container and process lifecycle orchestration.
//!
//! [`GuestCore`] owns the two identifier registries and drives the runtime
//! and OS collaborators. All mutations of a container entry happen under
//! the container registry's write guard, which is the single serialization
//! point for per-container state; exit supervision runs on detached tasks
//! that release each entry's exit latch exactly once.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use cocoon_shared::layout;
use cocoon_shared::protocol::{
    ContainerProcessState, ContainerSettings, ModifyRequest, NetworkAdapter, ProcessParameters,
    RequestType, ResourceType, SignalProcessOptions,
};
use cocoon_shared::{CocoonError, CocoonResult};
use oci_spec::runtime::Spec;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::net;
use crate::oslayer::Os;
use crate::runtime::{Runtime, RuntimeContainer, RuntimeProcess};
use crate::stdio::ConnectionSet;

mod entry;
mod external;
mod process;
mod storage;

pub use entry::{ContainerEntry, ContainerState, ExitLatch, ProcessEntry};
pub use process::process_parameters_to_oci;

/// The lifecycle manager at the heart of the guest supervisor.
pub struct GuestCore {
    runtime: Arc<dyn Runtime>,
    os: Arc<dyn Os>,
    containers: RwLock<HashMap<String, Arc<ContainerEntry>>>,
    processes: RwLock<HashMap<i32, Arc<ProcessEntry>>>,
}

impl GuestCore {
    pub fn new(runtime: Arc<dyn Runtime>, os: Arc<dyn Os>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            os,
            containers: RwLock::new(HashMap::new()),
            processes: RwLock::new(HashMap::new()),
        })
    }

    /// Create the infrastructure for a container: mapped disks, mapped
    /// directories and rootfs layers. The init process is not created
    /// until the first `exec_process` call.
    pub async fn create_container(&self, id: &str, settings: ContainerSettings) -> CocoonResult<()> {
        let mut containers = self.containers.write().await;
        if containers.contains_key(id) {
            return Err(CocoonError::ContainerExists(id.to_string()));
        }

        // The latch is armed by construction, before insertion, so the
        // init supervisor's release can never race a late waiter.
        let entry = ContainerEntry::new(id);

        if let Err(err) = self.assemble_container(id, &settings, &entry) {
            // Unwind whatever was mounted before the failure.
            self.cleanup_container(&entry);
            return Err(err);
        }

        containers.insert(id.to_string(), entry);
        info!(container = id, "container created");
        Ok(())
    }

    fn assemble_container(
        &self,
        id: &str,
        settings: &ContainerSettings,
        entry: &ContainerEntry,
    ) -> CocoonResult<()> {
        self.setup_mapped_virtual_disks(id, &settings.mapped_virtual_disks, entry)?;
        self.setup_mapped_directories(id, &settings.mapped_directories, entry)?;
        self.mount_layers(id, settings, entry)?;

        for adapter in &settings.network_adapters {
            entry.add_network_adapter(adapter.clone());
        }

        // The runtime overlays the rootfs later; /etc must exist on the
        // base layer by then or resolv.conf never becomes visible.
        self.os
            .mkdir_all(&Path::new(layout::BASE_FILES_PATH).join("etc"), 0o755)?;
        Ok(())
    }

    /// Execute a process in the container. The first call creates and
    /// starts the init process; later calls exec additional processes.
    /// Returns the pid the process is registered under.
    pub async fn exec_process(
        self: Arc<Self>,
        id: &str,
        params: ProcessParameters,
        stdio: ConnectionSet,
    ) -> CocoonResult<i32> {
        let containers = self.containers.write().await;
        let entry = containers
            .get(id)
            .cloned()
            .ok_or_else(|| CocoonError::ContainerDoesNotExist(id.to_string()))?;

        let first = !entry.state().has_run_init_process;
        let (pid, process_entry) = if first {
            self.clone().exec_init_process(&entry, params, stdio).await?
        } else {
            self.exec_container_process(&entry, params, stdio).await?
        };

        // A reused pid overwrites the stale entry for the old process.
        self.processes.write().await.insert(pid, process_entry);
        drop(containers);
        Ok(pid)
    }

    async fn exec_init_process(
        self: Arc<Self>,
        entry: &Arc<ContainerEntry>,
        params: ProcessParameters,
        stdio: ConnectionSet,
    ) -> CocoonResult<(i32, Arc<ProcessEntry>)> {
        entry.state().has_run_init_process = true;

        // From here until the supervisor takes over, failures must unblock
        // anyone already sleeping in wait_container.
        if let Err(err) = self.write_config_file(entry.id(), params.oci_specification.as_ref()) {
            entry.exit().release(-1);
            return Err(err);
        }

        let storage_path = layout::container_storage_path(entry.id());
        let container = match self
            .runtime
            .create_container(entry.id(), &storage_path, stdio)
            .await
        {
            Ok(container) => container,
            Err(err) => {
                entry.exit().release(-1);
                return Err(err);
            }
        };

        entry.state().runtime_handle = Some(container.clone());
        let process_entry = ProcessEntry::new(entry.id(), container.tty());

        let adapters = entry.state().network_adapters.clone();
        for adapter in &adapters {
            if let Err(err) = self.configure_adapter(adapter).await {
                entry.exit().release(-1);
                return Err(err);
            }
        }

        let core = self.clone();
        let init_entry = entry.clone();
        let init_process = process_entry.clone();
        let init_container = container.clone();
        tokio::spawn(async move {
            core.supervise_init(init_entry, init_process, init_container)
                .await;
        });

        // On failure the supervisor still owns the latch; the container
        // exit will release it.
        container.start().await?;

        Ok((container.pid(), process_entry))
    }

    async fn exec_container_process(
        &self,
        entry: &Arc<ContainerEntry>,
        params: ProcessParameters,
        stdio: ConnectionSet,
    ) -> CocoonResult<(i32, Arc<ProcessEntry>)> {
        let oci_process = process_parameters_to_oci(&params)?;
        let container = entry.state().runtime_handle.clone().ok_or_else(|| {
            CocoonError::runtime(
                "exec",
                format!("container {} has no runtime handle", entry.id()),
            )
        })?;

        let proc = container.exec_process(oci_process, stdio).await?;
        let process_entry = ProcessEntry::new(entry.id(), proc.tty());

        let child_entry = process_entry.clone();
        let child_proc = proc.clone();
        tokio::spawn(async move {
            supervise_process(child_entry, child_proc).await;
        });

        Ok((proc.pid(), process_entry))
    }

    /// Init supervisor: collect the init exit, tear the container's
    /// storage down, publish the exit code and drop the registry entry.
    async fn supervise_init(
        self: Arc<Self>,
        entry: Arc<ContainerEntry>,
        process_entry: Arc<ProcessEntry>,
        container: Arc<dyn RuntimeContainer>,
    ) {
        let state = container.wait().await;

        {
            let _guard = self.containers.write().await;
            if let Err(err) = &state {
                error!(container = %entry.id(), error = %err, "container wait failed");
            }
            // Cleanup is best effort; errors are logged inside and the
            // latch is released regardless.
            self.cleanup_container(&entry);
        }

        let exit_code = state.map(|s| s.exit_code()).unwrap_or(-1);
        info!(
            container = %entry.id(),
            pid = container.pid(),
            exit_code,
            "container init process exited"
        );

        // Process latch first, container latch second: a waiter woken on
        // the container knows no init-process waiter can miss the code.
        process_entry.exit().release(exit_code);
        entry.exit().release(exit_code);

        // Removal strictly after release; waiters that already hold the
        // entry keep a valid reference.
        self.containers.write().await.remove(entry.id());
    }

    fn write_config_file(&self, id: &str, spec: Option<&Spec>) -> CocoonResult<()> {
        let spec = spec.ok_or_else(|| {
            CocoonError::InvalidArguments(
                "an OCI specification is required for the init process".to_string(),
            )
        })?;
        let doc =
            serde_json::to_vec(spec).map_err(|e| CocoonError::os("serialize config", e))?;
        let storage_path = layout::container_storage_path(id);
        self.os.mkdir_all(&storage_path, 0o755)?;
        self.os
            .write_file(&layout::container_config_path(id), &doc, 0o600)
    }

    async fn configure_adapter(&self, adapter: &NetworkAdapter) -> CocoonResult<()> {
        if !adapter.dns_servers.is_empty() || adapter.dns_suffix.is_some() {
            let contents = net::resolv_conf(&adapter.dns_servers, adapter.dns_suffix.as_deref());
            let etc = Path::new(layout::BASE_FILES_PATH).join("etc");
            self.os.mkdir_all(&etc, 0o755)?;
            self.os
                .write_file(&etc.join("resolv.conf"), contents.as_bytes(), 0o644)?;
        }
        self.os.configure_adapter(adapter).await
    }

    /// Send a signal to the container's init process. A container that has
    /// been created but not started has no init process yet; that is not
    /// an error.
    pub async fn signal_container(&self, id: &str, signal: i32) -> CocoonResult<()> {
        let containers = self.containers.write().await;
        let entry = containers
            .get(id)
            .ok_or_else(|| CocoonError::ContainerDoesNotExist(id.to_string()))?;

        let handle = entry.state().runtime_handle.clone();
        if let Some(container) = handle {
            container.kill(signal).await?;
        }
        Ok(())
    }

    /// Deliver a signal to a single process. Signal zero is interpreted as
    /// SIGKILL for host controllers that predate signal forwarding.
    pub async fn signal_process(&self, pid: i32, options: SignalProcessOptions) -> CocoonResult<()> {
        {
            let processes = self.processes.read().await;
            if !processes.contains_key(&pid) {
                return Err(CocoonError::ProcessDoesNotExist(pid));
            }
        }

        let signal = if options.signal == 0 {
            nix::libc::SIGKILL
        } else {
            options.signal
        };
        self.os.kill(pid, signal)
    }

    /// All processes in the container, zombies included. Empty before the
    /// init process has been created.
    pub async fn list_processes(&self, id: &str) -> CocoonResult<Vec<ContainerProcessState>> {
        let containers = self.containers.write().await;
        let entry = containers
            .get(id)
            .ok_or_else(|| CocoonError::ContainerDoesNotExist(id.to_string()))?;

        let handle = entry.state().runtime_handle.clone();
        match handle {
            Some(container) => container.get_all_processes().await,
            None => Ok(Vec::new()),
        }
    }

    /// Hot add or remove a mapped resource on a running container. The
    /// whole modification happens under the registry write guard, so it
    /// cannot race container creation or exit.
    pub async fn modify_settings(&self, id: &str, request: ModifyRequest) -> CocoonResult<()> {
        let containers = self.containers.write().await;
        let entry = containers
            .get(id)
            .cloned()
            .ok_or_else(|| CocoonError::ContainerDoesNotExist(id.to_string()))?;

        match (request.request_type, request.resource_type) {
            (RequestType::Add, ResourceType::MappedVirtualDisk) => {
                let disk = required(request.settings.mapped_virtual_disk, "mapped virtual disk")?;
                self.setup_mapped_virtual_disks(id, &[disk], &entry)
            }
            (RequestType::Add, ResourceType::MappedDirectory) => {
                let dir = required(request.settings.mapped_directory, "mapped directory")?;
                self.setup_mapped_directories(id, &[dir], &entry)
            }
            (RequestType::Remove, ResourceType::MappedVirtualDisk) => {
                let disk = required(request.settings.mapped_virtual_disk, "mapped virtual disk")?;
                self.remove_mapped_virtual_disks(id, &[disk], &entry)
            }
            (RequestType::Remove, ResourceType::MappedDirectory) => {
                let dir = required(request.settings.mapped_directory, "mapped directory")?;
                self.remove_mapped_directories(id, &[dir], &entry)
            }
            (request_type, resource_type) => Err(CocoonError::UnsupportedRequest {
                request_type: request_type.to_string(),
                resource_type: resource_type.to_string(),
            }),
        }
    }

    /// Resize the console of a console-emulated process.
    pub async fn resize_console(&self, pid: i32, height: u16, width: u16) -> CocoonResult<()> {
        let entry = {
            self.processes
                .read()
                .await
                .get(&pid)
                .cloned()
                .ok_or(CocoonError::ProcessDoesNotExist(pid))?
        };
        let relay = entry.tty().ok_or(CocoonError::NotATerminal(pid))?;
        relay.resize_console(height, width)
    }

    /// Block until the container's init process has exited and return its
    /// exit code. The wait happens without holding the registry, so other
    /// operations proceed while waiters sleep.
    pub async fn wait_container(&self, id: &str) -> CocoonResult<i32> {
        let entry = {
            self.containers
                .read()
                .await
                .get(id)
                .cloned()
                .ok_or_else(|| CocoonError::ContainerDoesNotExist(id.to_string()))?
        };
        Ok(entry.exit().wait().await)
    }

    /// Block until the process has exited and return its exit code.
    pub async fn wait_process(&self, pid: i32) -> CocoonResult<i32> {
        let entry = {
            self.processes
                .read()
                .await
                .get(&pid)
                .cloned()
                .ok_or(CocoonError::ProcessDoesNotExist(pid))?
        };
        Ok(entry.exit().wait().await)
    }
}

fn required<T>(value: Option<T>, what: &str) -> CocoonResult<T> {
    value.ok_or_else(|| CocoonError::InvalidArguments(format!("missing {what} settings")))
}

/// Child-process supervisor: collect the exit, publish it, reclaim the
/// runtime resources.
async fn supervise_process(entry: Arc<ProcessEntry>, proc: Arc<dyn RuntimeProcess>) {
    let state = proc.wait().await;
    if let Err(err) = &state {
        error!(pid = proc.pid(), error = %err, "process wait failed");
    }
    let exit_code = state.map(|s| s.exit_code()).unwrap_or(-1);
    info!(pid = proc.pid(), exit_code, "container process exited");

    entry.exit().release(exit_code);

    if let Err(err) = proc.delete().await {
        error!(pid = proc.pid(), error = %err, "process delete failed");
    }
}
