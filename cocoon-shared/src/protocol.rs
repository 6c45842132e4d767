//! Request surface and resource descriptors.
//!
//! These types travel between the host runtime and the guest supervisor as
//! line-delimited JSON. Fields the core does not interpret (paths, mount
//! options) are carried through untouched.

use std::collections::HashMap;

use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};

use crate::errors::WireError;

/// A block device projected into the guest, identified by its SCSI LUN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappedVirtualDisk {
    /// Absolute path the disk is mounted at inside the container.
    pub container_path: String,
    /// SCSI logical unit number, unique within a container.
    pub lun: u8,
    #[serde(default)]
    pub read_only: bool,
}

/// A host directory projected into the guest over a vsock-backed 9p share.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappedDirectory {
    /// Absolute path the share is mounted at inside the container.
    pub container_path: String,
    /// Vsock port the share is served on, unique within a container.
    pub port: u32,
    #[serde(default)]
    pub read_only: bool,
}

/// A network adapter handed to a container, configured when the init
/// process is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAdapter {
    /// Guest-side interface name.
    pub id: String,
    /// Address with prefix, e.g. "10.0.0.5/24". None leaves addressing alone.
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub dns_suffix: Option<String>,
}

/// A read-only rootfs layer. Layers are ordered lowest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Layer {
    /// Block device backing the layer.
    pub path: String,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default)]
    pub layers: Vec<Layer>,
    /// Writable scratch device for the container's upper layer.
    #[serde(default)]
    pub scratch_path: String,
    #[serde(default)]
    pub mapped_virtual_disks: Vec<MappedVirtualDisk>,
    #[serde(default)]
    pub mapped_directories: Vec<MappedDirectory>,
    #[serde(default)]
    pub network_adapters: Vec<NetworkAdapter>,
}

/// Parameters for creating a process, either a container init process,
/// a subsequent container process or a host process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessParameters {
    /// Shell-style command line, tokenized when `command_args` is empty.
    #[serde(default)]
    pub command_line: String,
    /// Argument vector used verbatim when non-empty.
    #[serde(default)]
    pub command_args: Vec<String>,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub emulate_console: bool,
    /// Full OCI specification, required for a container's init process.
    #[serde(default)]
    pub oci_specification: Option<Spec>,
}

/// Options accompanying a signal delivery to a single process.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SignalProcessOptions {
    /// Signal number. Zero is delivered as SIGKILL for compatibility with
    /// host controllers that predate signal forwarding.
    #[serde(default)]
    pub signal: i32,
}

/// What a settings modification does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Add,
    Remove,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestType::Add => write!(f, "add"),
            RequestType::Remove => write!(f, "remove"),
        }
    }
}

/// What kind of resource a settings modification targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MappedVirtualDisk,
    MappedDirectory,
    Memory,
    Network,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::MappedVirtualDisk => write!(f, "mapped_virtual_disk"),
            ResourceType::MappedDirectory => write!(f, "mapped_directory"),
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::Network => write!(f, "network"),
        }
    }
}

/// Resource payload of a settings modification. Exactly one field matching
/// the resource type must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifySettings {
    #[serde(default)]
    pub mapped_virtual_disk: Option<MappedVirtualDisk>,
    #[serde(default)]
    pub mapped_directory: Option<MappedDirectory>,
}

/// A hot add/remove request against a running container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyRequest {
    pub request_type: RequestType,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub settings: ModifySettings,
}

/// State of one process inside a container, zombies included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerProcessState {
    pub pid: i32,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub created_by_runtime: bool,
    #[serde(default)]
    pub is_zombie: bool,
}

/// Host vsock ports the guest dials back to attach a process's stdio.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StdioPorts {
    #[serde(default)]
    pub stdin: Option<u32>,
    #[serde(default)]
    pub stdout: Option<u32>,
    #[serde(default)]
    pub stderr: Option<u32>,
}

/// A single request from the host controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateContainer {
        id: String,
        settings: ContainerSettings,
    },
    ExecProcess {
        id: String,
        params: ProcessParameters,
        #[serde(default)]
        stdio: Option<StdioPorts>,
    },
    SignalContainer {
        id: String,
        signal: i32,
    },
    SignalProcess {
        pid: i32,
        options: SignalProcessOptions,
    },
    ListProcesses {
        id: String,
    },
    ModifySettings {
        id: String,
        request: ModifyRequest,
    },
    ResizeConsole {
        pid: i32,
        height: u16,
        width: u16,
    },
    WaitContainer {
        id: String,
    },
    WaitProcess {
        pid: i32,
    },
    RunExternalProcess {
        params: ProcessParameters,
        #[serde(default)]
        stdio: Option<StdioPorts>,
    },
}

/// A request envelope carrying the caller's sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub seq: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Response payload for requests that return data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Pid { pid: i32 },
    ExitCode { exit_code: i32 },
    Processes { processes: Vec<ContainerProcessState> },
}

/// A single response to the host controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResponseBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}
