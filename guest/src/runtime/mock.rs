//! Scriptable runtime double for tests.
//!
//! Containers and processes exist only as records; tests complete them by
//! calling `finish`, and kills complete them with the conventional
//! 128+signal code.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cocoon_shared::protocol::ContainerProcessState;
use cocoon_shared::{CocoonError, CocoonResult};
use oci_spec::runtime::Process as OciProcess;
use tokio::sync::watch;

use super::{ExitState, Runtime, RuntimeContainer, RuntimeProcess};
use crate::stdio::{ConnectionSet, TtyRelay};

pub(crate) struct MockRuntime {
    next_pid: Arc<AtomicI32>,
    pub fail_create: AtomicBool,
    /// Containers created while set refuse their start call.
    pub fail_start: AtomicBool,
    pub containers: Mutex<Vec<Arc<MockContainer>>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: Arc::new(AtomicI32::new(100)),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            containers: Mutex::new(Vec::new()),
        })
    }

    pub fn container(&self, id: &str) -> Option<Arc<MockContainer>> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn create_container(
        &self,
        id: &str,
        _storage_path: &Path,
        _stdio: ConnectionSet,
    ) -> CocoonResult<Arc<dyn RuntimeContainer>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CocoonError::runtime("create", "injected create failure"));
        }
        let container = Arc::new(MockContainer {
            id: id.to_string(),
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            next_pid: self.next_pid.clone(),
            started: AtomicBool::new(false),
            fail_start: AtomicBool::new(self.fail_start.load(Ordering::SeqCst)),
            kills: Mutex::new(Vec::new()),
            exit: watch::channel(None).0,
            procs: Mutex::new(Vec::new()),
            process_list: Mutex::new(Vec::new()),
        });
        self.containers.lock().unwrap().push(container.clone());
        Ok(container)
    }
}

pub(crate) struct MockContainer {
    pub id: String,
    pid: i32,
    next_pid: Arc<AtomicI32>,
    pub started: AtomicBool,
    pub fail_start: AtomicBool,
    pub kills: Mutex<Vec<i32>>,
    exit: watch::Sender<Option<i32>>,
    pub procs: Mutex<Vec<Arc<MockProcess>>>,
    pub process_list: Mutex<Vec<ContainerProcessState>>,
}

impl MockContainer {
    /// Let the init process exit with the given code.
    pub fn finish(&self, code: i32) {
        self.exit.send_replace(Some(code));
    }

    pub fn last_proc(&self) -> Arc<MockProcess> {
        self.procs
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no process executed")
    }
}

#[async_trait]
impl RuntimeContainer for MockContainer {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn tty(&self) -> Option<Arc<TtyRelay>> {
        None
    }

    async fn start(&self) -> CocoonResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CocoonError::runtime("start", "injected start failure"));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self, signal: i32) -> CocoonResult<()> {
        self.kills.lock().unwrap().push(signal);
        self.finish(128 + signal);
        Ok(())
    }

    async fn wait(&self) -> CocoonResult<ExitState> {
        let mut rx = self.exit.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(code) => Ok(ExitState::new(code.unwrap_or(-1))),
            Err(_) => Err(CocoonError::runtime("wait", "mock container abandoned")),
        };
        result
    }

    async fn exec_process(
        &self,
        process: OciProcess,
        _stdio: ConnectionSet,
    ) -> CocoonResult<Arc<dyn RuntimeProcess>> {
        let proc = Arc::new(MockProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            args: process
                .args()
                .clone()
                .unwrap_or_default(),
            exit: watch::channel(None).0,
            deleted: AtomicBool::new(false),
        });
        self.procs.lock().unwrap().push(proc.clone());
        Ok(proc)
    }

    async fn get_all_processes(&self) -> CocoonResult<Vec<ContainerProcessState>> {
        Ok(self.process_list.lock().unwrap().clone())
    }
}

pub(crate) struct MockProcess {
    pid: i32,
    pub args: Vec<String>,
    exit: watch::Sender<Option<i32>>,
    pub deleted: AtomicBool,
}

impl MockProcess {
    pub fn finish(&self, code: i32) {
        self.exit.send_replace(Some(code));
    }
}

#[async_trait]
impl RuntimeProcess for MockProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn tty(&self) -> Option<Arc<TtyRelay>> {
        None
    }

    async fn wait(&self) -> CocoonResult<ExitState> {
        let mut rx = self.exit.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(code) => Ok(ExitState::new(code.unwrap_or(-1))),
            Err(_) => Err(CocoonError::runtime("wait", "mock process abandoned")),
        };
        result
    }

    async fn delete(&self) -> CocoonResult<()> {
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }
}
