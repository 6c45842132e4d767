//! Host-process runner: processes in the utility VM, outside any
//! container namespace. Used for diagnostics and utility work.

use std::sync::Arc;

use cocoon_shared::protocol::ProcessParameters;
use cocoon_shared::{CocoonError, CocoonResult};
use nix::fcntl::OFlag;
use tracing::{error, info};

use super::{process_parameters_to_oci, GuestCore, ProcessEntry};
use crate::oslayer::{HostProcess, HostProcessSpec};
use crate::stdio::{self, ConnectionSet};

impl GuestCore {
    /// Spawn a process in the VM, outside any container. Returns the pid
    /// the process is registered under.
    pub async fn run_external_process(
        &self,
        params: ProcessParameters,
        stdio_set: ConnectionSet,
    ) -> CocoonResult<i32> {
        let oci_process = process_parameters_to_oci(&params)?;
        let mut args = oci_process.args().clone().unwrap_or_default();
        if args.is_empty() {
            return Err(CocoonError::InvalidArguments(
                "no command specified for external process".to_string(),
            ));
        }
        let program = args.remove(0);
        let env = oci_process.env().clone().unwrap_or_default();

        let (stdin, stdout, stderr, relay) = if params.emulate_console {
            // The console slave is the child's stdio; the master is
            // bridged to the caller. The master closes on any failure
            // here because the relay is never constructed.
            let (master, slave_path) = stdio::new_console()?;
            let console = self.os.open_file(&slave_path, OFlag::O_RDWR, 0o777)?;
            let console_out = console
                .try_clone()
                .map_err(|e| CocoonError::os("dup console", e))?;
            let console_err = console
                .try_clone()
                .map_err(|e| CocoonError::os("dup console", e))?;
            let relay = Arc::new(stdio_set.new_tty_relay(master));
            (
                Some(console),
                Some(console_out),
                Some(console_err),
                Some(relay),
            )
        } else {
            let (stdin, stdout, stderr) = stdio_set.into_files();
            (stdin, stdout, stderr, None)
        };

        let child = self
            .os
            .spawn(HostProcessSpec {
                program,
                args,
                env,
                cwd: params.working_directory.clone(),
                stdin,
                stdout,
                stderr,
                controlling_tty: params.emulate_console,
            })
            .await?;

        if let Some(relay) = &relay {
            relay.start();
        }

        let pid = child.pid();
        let entry = ProcessEntry::host(relay);

        let supervised = entry.clone();
        tokio::spawn(async move {
            supervise_external(supervised, child).await;
        });

        self.processes.write().await.insert(pid, entry);
        Ok(pid)
    }
}

/// External-process supervisor: collect the exit, drain the relay, publish
/// the exit code.
async fn supervise_external(entry: Arc<ProcessEntry>, mut child: Box<dyn HostProcess>) {
    let pid = child.pid();
    let state = child.wait().await;

    // A nonzero exit arrives as Ok with that code; Err means the wait
    // itself failed and -1 is recorded instead.
    if let Err(err) = &state {
        error!(pid, error = %err, "external process wait failed");
    }
    let exit_code = state.map(|s| s.exit_code()).unwrap_or(-1);
    info!(pid, exit_code, "external process exited");

    if let Some(relay) = entry.tty() {
        relay.wait().await;
    }

    entry.exit().release(exit_code);
}
