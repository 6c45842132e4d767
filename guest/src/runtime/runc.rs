//! Binding to an external runc-compatible OCI runtime binary.
//!
//! Containers are created detached; their init processes reparent to the
//! supervisor, which registered itself as a child subreaper at startup, so
//! exits are collected with plain `waitpid`. Terminal processes hand their
//! pty master back over the OCI console socket.

use std::collections::HashSet;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cocoon_shared::protocol::ContainerProcessState;
use cocoon_shared::{CocoonError, CocoonResult};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use oci_spec::runtime::{Process as OciProcess, Spec};
use tracing::{debug, warn};

use super::{ExitState, Runtime, RuntimeContainer, RuntimeProcess};
use crate::stdio::{ConnectionSet, TtyRelay};

/// Drives an external OCI runtime binary.
pub struct RuncRuntime {
    cli: Arc<RuncCli>,
}

struct RuncCli {
    binary: PathBuf,
    root: PathBuf,
}

impl RuncRuntime {
    /// `binary` is the runtime executable, `root` its state directory.
    pub fn new(binary: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            cli: Arc::new(RuncCli {
                binary: binary.into(),
                root: root.into(),
            }),
        }
    }
}

impl RuncCli {
    fn command(&self, args: &[&str]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("--root").arg(&self.root);
        cmd.args(args);
        cmd
    }

    /// Run a runtime subcommand to completion, with stdio discarded.
    async fn run(&self, operation: &str, args: &[&str]) -> CocoonResult<Vec<u8>> {
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CocoonError::runtime(operation, e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CocoonError::runtime(operation, stderr.trim()));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Runtime for RuncRuntime {
    async fn create_container(
        &self,
        id: &str,
        storage_path: &Path,
        stdio: ConnectionSet,
    ) -> CocoonResult<Arc<dyn RuntimeContainer>> {
        let config_path = storage_path.join("config.json");
        let config = tokio::fs::read(&config_path)
            .await
            .map_err(|e| CocoonError::runtime("create", e))?;
        let spec: Spec =
            serde_json::from_slice(&config).map_err(|e| CocoonError::runtime("create", e))?;
        let terminal = spec
            .process()
            .as_ref()
            .and_then(|p| p.terminal().as_ref().copied())
            .unwrap_or(false);

        let pid_file = storage_path.join("init.pid");
        let bundle = storage_path.to_string_lossy().into_owned();
        let pid_file_arg = pid_file.to_string_lossy().into_owned();

        let relay = if terminal {
            let socket = ConsoleSocket::bind(storage_path.join("console.sock"))?;
            let socket_arg = socket.path().to_string_lossy().into_owned();
            let accept = socket.receive_in_background();

            let created = self
                .cli
                .run(
                    "create",
                    &[
                        "create",
                        "--bundle",
                        &bundle,
                        "--console-socket",
                        &socket_arg,
                        "--pid-file",
                        &pid_file_arg,
                        id,
                    ],
                )
                .await;
            if let Err(err) = created {
                ConsoleSocket::unblock(storage_path.join("console.sock"));
                return Err(err);
            }

            let master = accept
                .await
                .map_err(|e| CocoonError::runtime("create", e))??;
            let relay = Arc::new(stdio.new_tty_relay(master));
            relay.start();
            Some(relay)
        } else {
            let (stdin, stdout, stderr) = stdio.into_files();
            let mut cmd = self.cli.command(&[
                "create",
                "--bundle",
                &bundle,
                "--pid-file",
                &pid_file_arg,
                id,
            ]);
            cmd.stdin(stdin.map_or_else(Stdio::null, Stdio::from));
            cmd.stdout(stdout.map_or_else(Stdio::null, Stdio::from));
            cmd.stderr(stderr.map_or_else(Stdio::null, Stdio::from));
            let status = cmd
                .status()
                .await
                .map_err(|e| CocoonError::runtime("create", e))?;
            if !status.success() {
                return Err(CocoonError::runtime("create", format!("runc exited {status}")));
            }
            None
        };

        let pid = read_pid_file(&pid_file).await?;
        debug!(container = id, pid, "container created");

        Ok(Arc::new(RuncContainer {
            cli: self.cli.clone(),
            id: id.to_string(),
            storage_path: storage_path.to_path_buf(),
            pid,
            relay,
            exec_pids: Mutex::new(HashSet::new()),
        }))
    }
}

struct RuncContainer {
    cli: Arc<RuncCli>,
    id: String,
    storage_path: PathBuf,
    pid: i32,
    relay: Option<Arc<TtyRelay>>,
    exec_pids: Mutex<HashSet<i32>>,
}

#[async_trait]
impl RuntimeContainer for RuncContainer {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn tty(&self) -> Option<Arc<TtyRelay>> {
        self.relay.clone()
    }

    async fn start(&self) -> CocoonResult<()> {
        self.cli.run("start", &["start", &self.id]).await?;
        Ok(())
    }

    async fn kill(&self, signal: i32) -> CocoonResult<()> {
        let signal = signal.to_string();
        self.cli
            .run("kill", &["kill", &self.id, &signal])
            .await?;
        Ok(())
    }

    async fn wait(&self) -> CocoonResult<ExitState> {
        let state = reap(self.pid).await?;
        if let Some(relay) = &self.relay {
            relay.wait().await;
        }
        // The container is gone; let the runtime drop its state.
        if let Err(err) = self.cli.run("delete", &["delete", "--force", &self.id]).await {
            warn!(container = %self.id, error = %err, "runtime delete failed");
        }
        Ok(state)
    }

    async fn exec_process(
        &self,
        process: OciProcess,
        stdio: ConnectionSet,
    ) -> CocoonResult<Arc<dyn RuntimeProcess>> {
        let exec_id = uuid::Uuid::new_v4().to_string();
        let process_path = self.storage_path.join(format!("proc-{exec_id}.json"));
        let pid_file = self.storage_path.join(format!("proc-{exec_id}.pid"));

        let doc = serde_json::to_vec(&process).map_err(|e| CocoonError::runtime("exec", e))?;
        tokio::fs::write(&process_path, doc)
            .await
            .map_err(|e| CocoonError::runtime("exec", e))?;

        let terminal = process.terminal().as_ref().copied().unwrap_or(false);
        let process_arg = process_path.to_string_lossy().into_owned();
        let pid_file_arg = pid_file.to_string_lossy().into_owned();

        let relay = if terminal {
            let socket_path = self.storage_path.join(format!("proc-{exec_id}.sock"));
            let socket = ConsoleSocket::bind(socket_path.clone())?;
            let socket_arg = socket.path().to_string_lossy().into_owned();
            let accept = socket.receive_in_background();

            let execed = self
                .cli
                .run(
                    "exec",
                    &[
                        "exec",
                        "--detach",
                        "--process",
                        &process_arg,
                        "--console-socket",
                        &socket_arg,
                        "--pid-file",
                        &pid_file_arg,
                        &self.id,
                    ],
                )
                .await;
            if let Err(err) = execed {
                ConsoleSocket::unblock(socket_path);
                return Err(err);
            }

            let master = accept.await.map_err(|e| CocoonError::runtime("exec", e))??;
            let relay = Arc::new(stdio.new_tty_relay(master));
            relay.start();
            Some(relay)
        } else {
            let (stdin, stdout, stderr) = stdio.into_files();
            let mut cmd = self.cli.command(&[
                "exec",
                "--detach",
                "--process",
                &process_arg,
                "--pid-file",
                &pid_file_arg,
                &self.id,
            ]);
            cmd.stdin(stdin.map_or_else(Stdio::null, Stdio::from));
            cmd.stdout(stdout.map_or_else(Stdio::null, Stdio::from));
            cmd.stderr(stderr.map_or_else(Stdio::null, Stdio::from));
            let output = cmd
                .output()
                .await
                .map_err(|e| CocoonError::runtime("exec", e))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(CocoonError::runtime("exec", stderr.trim()));
            }
            None
        };

        let pid = read_pid_file(&pid_file).await?;
        self.exec_pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid);
        debug!(container = %self.id, pid, "process executed");

        Ok(Arc::new(RuncProcess {
            pid,
            relay,
            process_path,
            pid_file,
        }))
    }

    async fn get_all_processes(&self) -> CocoonResult<Vec<ContainerProcessState>> {
        let out = self
            .cli
            .run("ps", &["ps", "--format", "json", &self.id])
            .await?;
        let pids: Vec<i32> =
            serde_json::from_slice(&out).map_err(|e| CocoonError::runtime("ps", e))?;

        let created: HashSet<i32> = {
            let exec_pids = self.exec_pids.lock().unwrap_or_else(|e| e.into_inner());
            exec_pids.iter().copied().chain([self.pid]).collect()
        };

        Ok(pids
            .into_iter()
            .map(|pid| {
                let mut state = ContainerProcessState {
                    pid,
                    command: Vec::new(),
                    created_by_runtime: created.contains(&pid),
                    is_zombie: false,
                };
                if let Ok(proc) = procfs::process::Process::new(pid) {
                    if let Ok(cmdline) = proc.cmdline() {
                        state.command = cmdline;
                    }
                    if let Ok(stat) = proc.stat() {
                        state.is_zombie = stat.state == 'Z';
                    }
                }
                state
            })
            .collect())
    }
}

struct RuncProcess {
    pid: i32,
    relay: Option<Arc<TtyRelay>>,
    process_path: PathBuf,
    pid_file: PathBuf,
}

#[async_trait]
impl RuntimeProcess for RuncProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn tty(&self) -> Option<Arc<TtyRelay>> {
        self.relay.clone()
    }

    async fn wait(&self) -> CocoonResult<ExitState> {
        let state = reap(self.pid).await?;
        if let Some(relay) = &self.relay {
            relay.wait().await;
        }
        Ok(state)
    }

    async fn delete(&self) -> CocoonResult<()> {
        let _ = tokio::fs::remove_file(&self.process_path).await;
        let _ = tokio::fs::remove_file(&self.pid_file).await;
        Ok(())
    }
}

/// Collect the exit status of a reparented child.
async fn reap(pid: i32) -> CocoonResult<ExitState> {
    let status = tokio::task::spawn_blocking(move || loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(status) => break Ok(status),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => break Err(e),
        }
    })
    .await
    .map_err(|e| CocoonError::runtime("wait", e))?
    .map_err(|e| CocoonError::runtime("wait", e))?;

    match status {
        WaitStatus::Exited(_, code) => Ok(ExitState::new(code)),
        WaitStatus::Signaled(_, signal, _) => Ok(ExitState::new(128 + signal as i32)),
        other => Err(CocoonError::runtime(
            "wait",
            format!("unexpected wait status {other:?}"),
        )),
    }
}

async fn read_pid_file(path: &Path) -> CocoonResult<i32> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CocoonError::runtime("read pid file", e))?;
    raw.trim()
        .parse::<i32>()
        .map_err(|e| CocoonError::runtime("read pid file", e))
}

/// Unix socket the runtime sends the pty master over (SCM_RIGHTS).
struct ConsoleSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ConsoleSocket {
    fn bind(path: PathBuf) -> CocoonResult<Self> {
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .map_err(|e| CocoonError::os(format!("bind {}", path.display()), e))?;
        Ok(Self { listener, path })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Accept the runtime's connection on a blocking thread and hand back
    /// the received master descriptor.
    fn receive_in_background(self) -> tokio::task::JoinHandle<CocoonResult<OwnedFd>> {
        tokio::task::spawn_blocking(move || {
            let result = self.receive();
            let _ = std::fs::remove_file(&self.path);
            result
        })
    }

    fn receive(&self) -> CocoonResult<OwnedFd> {
        let (stream, _) = self
            .listener
            .accept()
            .map_err(|e| CocoonError::os("console socket accept", e))?;

        let mut buf = [0u8; 256];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<UnixAddr>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        )
        .map_err(|e| CocoonError::os("console socket recvmsg", e))?;

        for cmsg in msg.cmsgs().into_iter().flatten() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&fd) = fds.first() {
                    return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }
        Err(CocoonError::os(
            "console socket",
            "no pty master descriptor received",
        ))
    }

    /// Wake a pending accept after the runtime invocation failed, so the
    /// receiving thread does not linger.
    fn unblock(path: PathBuf) {
        let _ = std::os::unix::net::UnixStream::connect(path);
    }
}
