//! Recording OS double for tests.
//!
//! Mutating operations are recorded instead of performed; host processes
//! are virtual and exit when the test (or a recorded kill) says so.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use cocoon_shared::protocol::NetworkAdapter;
use cocoon_shared::{CocoonError, CocoonResult};
use nix::fcntl::OFlag;
use nix::mount::MsFlags;
use tokio::sync::watch;

use super::{HostProcess, HostProcessSpec, Os};
use crate::runtime::ExitState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountRecord {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub data: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct SpawnRecord {
    pub program: String,
    pub args: Vec<String>,
    pub controlling_tty: bool,
}

#[derive(Default)]
pub(crate) struct MockOs {
    pub mounts: Mutex<Vec<MountRecord>>,
    pub unmounts: Mutex<Vec<PathBuf>>,
    pub mkdirs: Mutex<Vec<PathBuf>>,
    pub removed: Mutex<Vec<PathBuf>>,
    pub files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    pub kills: Mutex<Vec<(i32, i32)>>,
    pub adapters: Mutex<Vec<NetworkAdapter>>,
    pub spawns: Mutex<Vec<SpawnRecord>>,
    pub fail_mounts: AtomicBool,
    next_pid: AtomicI32,
    procs: Mutex<HashMap<i32, watch::Sender<Option<i32>>>>,
}

impl MockOs {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicI32::new(1000),
            ..Default::default()
        }
    }

    /// Force the pid the next spawn will report.
    pub fn set_next_pid(&self, pid: i32) {
        self.next_pid.store(pid, Ordering::SeqCst);
    }

    /// Complete a virtual host process with the given exit code.
    pub fn finish(&self, pid: i32, code: i32) {
        if let Some(tx) = self.procs.lock().unwrap().get(&pid) {
            let _ = tx.send(Some(code));
        }
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.lock().unwrap().len()
    }

    pub fn unmount_count(&self) -> usize {
        self.unmounts.lock().unwrap().len()
    }
}

#[async_trait]
impl Os for MockOs {
    fn mkdir_all(&self, path: &Path, _mode: u32) -> CocoonResult<()> {
        self.mkdirs.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &[u8], _mode: u32) -> CocoonResult<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn open_file(&self, path: &Path, _flags: OFlag, _mode: u32) -> CocoonResult<File> {
        // The console path opens a real pty slave; pass that through so
        // console-emulation tests exercise real descriptors.
        File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CocoonError::os(format!("open {}", path.display()), e))
    }

    fn remove_all(&self, path: &Path) -> CocoonResult<()> {
        self.removed.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn kill(&self, pid: i32, signal: i32) -> CocoonResult<()> {
        self.kills.lock().unwrap().push((pid, signal));
        if let Some(tx) = self.procs.lock().unwrap().get(&pid) {
            let _ = tx.send(Some(128 + signal));
        }
        Ok(())
    }

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        _flags: MsFlags,
        data: Option<&str>,
    ) -> CocoonResult<()> {
        if self.fail_mounts.load(Ordering::SeqCst) {
            return Err(CocoonError::storage(
                format!("mount {} on {}", source, target.display()),
                "injected mount failure",
            ));
        }
        self.mounts.lock().unwrap().push(MountRecord {
            source: source.to_string(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
            data: data.map(str::to_string),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> CocoonResult<()> {
        self.unmounts.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }

    fn device_for_scsi_lun(&self, lun: u8) -> CocoonResult<PathBuf> {
        Ok(PathBuf::from(format!("/dev/mock{lun}")))
    }

    async fn configure_adapter(&self, adapter: &NetworkAdapter) -> CocoonResult<()> {
        self.adapters.lock().unwrap().push(adapter.clone());
        Ok(())
    }

    async fn spawn(&self, spec: HostProcessSpec) -> CocoonResult<Box<dyn HostProcess>> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.spawns.lock().unwrap().push(SpawnRecord {
            program: spec.program,
            args: spec.args,
            controlling_tty: spec.controlling_tty,
        });
        let (tx, rx) = watch::channel(None);
        self.procs.lock().unwrap().insert(pid, tx);
        Ok(Box::new(MockHostProcess { pid, rx }))
    }
}

struct MockHostProcess {
    pid: i32,
    rx: watch::Receiver<Option<i32>>,
}

#[async_trait]
impl HostProcess for MockHostProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    async fn wait(&mut self) -> CocoonResult<ExitState> {
        let code = match self.rx.wait_for(Option::is_some).await {
            Ok(guard) => guard.unwrap_or(-1),
            Err(_) => return Err(CocoonError::os("wait", "mock process abandoned")),
        };
        Ok(ExitState::new(code))
    }
}
