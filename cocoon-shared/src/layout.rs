//! Guest filesystem layout.
//!
//! All container state lives under a per-container directory. The base
//! files directory holds the files every container sees as its bottom-most
//! rootfs layer; network configuration writes `etc/resolv.conf` there.

use std::path::PathBuf;

/// Root of all per-container storage.
pub const STORAGE_ROOT: &str = "/run/cocoon/containers";

/// Bottom-most rootfs layer shared by every container.
pub const BASE_FILES_PATH: &str = "/run/cocoon/base";

/// Per-container storage directory.
pub fn container_storage_path(id: &str) -> PathBuf {
    PathBuf::from(STORAGE_ROOT).join(id)
}

/// The OCI configuration document for a container.
pub fn container_config_path(id: &str) -> PathBuf {
    container_storage_path(id).join("config.json")
}

/// Mount point of the writable scratch device.
pub fn scratch_path(id: &str) -> PathBuf {
    container_storage_path(id).join("scratch")
}

/// Mount point of the nth read-only layer device.
pub fn layer_path(id: &str, index: usize) -> PathBuf {
    container_storage_path(id).join(format!("layer{index}"))
}

/// The merged overlay the runtime uses as the container root.
pub fn rootfs_path(id: &str) -> PathBuf {
    container_storage_path(id).join("rootfs")
}
