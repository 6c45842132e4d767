//! Storage orchestration: mapped disks, mapped directories and rootfs
//! layers.
//!
//! Every operation here expects the container registry's write guard to be
//! held by the caller. Mounts that succeeded before a later step failed
//! are unwound, so an entry never records a resource that is not mounted
//! and a failed add leaves nothing behind.

use std::path::{Path, PathBuf};

use cocoon_shared::layout;
use cocoon_shared::protocol::{ContainerSettings, MappedDirectory, MappedVirtualDisk};
use cocoon_shared::{CocoonError, CocoonResult};
use nix::mount::MsFlags;
use tracing::warn;

use super::{ContainerEntry, GuestCore};

impl GuestCore {
    /// Mount a set of mapped virtual disks and record them on the entry.
    pub(super) fn setup_mapped_virtual_disks(
        &self,
        id: &str,
        disks: &[MappedVirtualDisk],
        entry: &ContainerEntry,
    ) -> CocoonResult<()> {
        let mut mounted: Vec<&MappedVirtualDisk> = Vec::new();
        let mut added: Vec<&MappedVirtualDisk> = Vec::new();
        let mut failure = None;

        for disk in disks {
            match self.mount_mapped_virtual_disk(disk) {
                Ok(()) => mounted.push(disk),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if failure.is_none() {
            for disk in disks {
                match entry.add_mapped_virtual_disk(disk.clone()) {
                    Ok(()) => added.push(disk),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        let Some(err) = failure else {
            return Ok(());
        };

        for disk in added {
            entry.remove_mapped_virtual_disk(disk);
        }
        for disk in mounted {
            if let Err(unmount_err) = self.os.unmount(Path::new(&disk.container_path)) {
                warn!(
                    container = id,
                    lun = disk.lun,
                    error = %unmount_err,
                    "failed to unwind disk mount after setup failure"
                );
            }
        }
        Err(err)
    }

    fn mount_mapped_virtual_disk(&self, disk: &MappedVirtualDisk) -> CocoonResult<()> {
        let device = self.os.device_for_scsi_lun(disk.lun)?;
        let device = device.to_str().ok_or_else(|| {
            CocoonError::storage("resolve disk device", "device path is not utf-8")
        })?;
        let mut flags = MsFlags::empty();
        if disk.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        self.os
            .mount(device, Path::new(&disk.container_path), "ext4", flags, None)
    }

    /// Mount a set of mapped directories and record them on the entry.
    pub(super) fn setup_mapped_directories(
        &self,
        id: &str,
        dirs: &[MappedDirectory],
        entry: &ContainerEntry,
    ) -> CocoonResult<()> {
        let mut mounted: Vec<&MappedDirectory> = Vec::new();
        let mut added: Vec<&MappedDirectory> = Vec::new();
        let mut failure = None;

        for dir in dirs {
            match self.mount_mapped_directory(dir) {
                Ok(()) => mounted.push(dir),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if failure.is_none() {
            for dir in dirs {
                match entry.add_mapped_directory(dir.clone()) {
                    Ok(()) => added.push(dir),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        let Some(err) = failure else {
            return Ok(());
        };

        for dir in added {
            entry.remove_mapped_directory(dir);
        }
        for dir in mounted {
            if let Err(unmount_err) = self.os.unmount(Path::new(&dir.container_path)) {
                warn!(
                    container = id,
                    port = dir.port,
                    error = %unmount_err,
                    "failed to unwind directory mount after setup failure"
                );
            }
        }
        Err(err)
    }

    fn mount_mapped_directory(&self, dir: &MappedDirectory) -> CocoonResult<()> {
        let mut flags = MsFlags::empty();
        if dir.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        let data = format!("trans=vsock,port={},msize=65536", dir.port);
        self.os.mount(
            "cocoon",
            Path::new(&dir.container_path),
            "9p",
            flags,
            Some(&data),
        )
    }

    /// Unmount a set of mapped virtual disks and drop them from the entry.
    /// A disk that is not attached is skipped with a warning; removal is
    /// idempotent.
    pub(super) fn remove_mapped_virtual_disks(
        &self,
        id: &str,
        disks: &[MappedVirtualDisk],
        entry: &ContainerEntry,
    ) -> CocoonResult<()> {
        for disk in disks {
            let attached = entry
                .state()
                .mapped_virtual_disks
                .contains_key(&disk.lun);
            if attached {
                self.os
                    .unmount(Path::new(&disk.container_path))
                    .map_err(|e| {
                        CocoonError::storage(
                            format!("unmount mapped virtual disks for container {id}"),
                            e,
                        )
                    })?;
            }
            entry.remove_mapped_virtual_disk(disk);
        }
        Ok(())
    }

    /// Unmount a set of mapped directories and drop them from the entry.
    /// A directory that is not attached is skipped with a warning; removal
    /// is idempotent.
    pub(super) fn remove_mapped_directories(
        &self,
        id: &str,
        dirs: &[MappedDirectory],
        entry: &ContainerEntry,
    ) -> CocoonResult<()> {
        for dir in dirs {
            let attached = entry.state().mapped_directories.contains_key(&dir.port);
            if attached {
                self.os.unmount(Path::new(&dir.container_path)).map_err(|e| {
                    CocoonError::storage(
                        format!("unmount mapped directories for container {id}"),
                        e,
                    )
                })?;
            }
            entry.remove_mapped_directory(dir);
        }
        Ok(())
    }

    /// Mount the rootfs: the writable scratch device, each read-only layer
    /// device, and the overlay the runtime uses as the container root.
    /// Every successful mount is recorded on the entry before the next is
    /// attempted so a failure can be unwound.
    pub(super) fn mount_layers(
        &self,
        id: &str,
        settings: &ContainerSettings,
        entry: &ContainerEntry,
    ) -> CocoonResult<()> {
        if settings.scratch_path.is_empty() {
            if settings.layers.is_empty() {
                // Nothing to mount; the host supplies no rootfs of ours.
                return Ok(());
            }
            return Err(CocoonError::InvalidArguments(format!(
                "container {id} has layers but no scratch device"
            )));
        }

        let storage_path = layout::container_storage_path(id);
        self.os.mkdir_all(&storage_path, 0o755)?;

        let scratch = layout::scratch_path(id);
        self.os
            .mount(&settings.scratch_path, &scratch, "ext4", MsFlags::empty(), None)?;
        entry.state().layer_mounts.push(scratch.clone());

        let mut lowers: Vec<PathBuf> = Vec::with_capacity(settings.layers.len());
        for (index, layer) in settings.layers.iter().enumerate() {
            let target = layout::layer_path(id, index);
            self.os
                .mount(&layer.path, &target, "ext4", MsFlags::MS_RDONLY, None)?;
            entry.state().layer_mounts.push(target.clone());
            lowers.push(target);
        }

        let upper = scratch.join("upper");
        let work = scratch.join("work");
        self.os.mkdir_all(&upper, 0o755)?;
        self.os.mkdir_all(&work, 0o755)?;

        // lowerdir wants the topmost layer first; the base files sit at
        // the bottom of every container.
        let mut lowerdirs: Vec<String> = lowers
            .iter()
            .rev()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        lowerdirs.push(layout::BASE_FILES_PATH.to_string());
        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowerdirs.join(":"),
            upper.display(),
            work.display()
        );

        let rootfs = layout::rootfs_path(id);
        self.os
            .mount("overlay", &rootfs, "overlay", MsFlags::empty(), Some(&data))?;
        entry.state().layer_mounts.push(rootfs);
        Ok(())
    }

    /// Tear down everything a container entry has mounted: mapped
    /// directories, mapped disks and layer mounts, then the storage
    /// directory itself. Errors are logged, never returned; the state is
    /// cleared so a second invocation is a no-op.
    pub(super) fn cleanup_container(&self, entry: &ContainerEntry) {
        let (disks, dirs, layer_mounts) = {
            let mut state = entry.state();
            (
                state.mapped_virtual_disks.drain().map(|(_, d)| d).collect::<Vec<_>>(),
                state.mapped_directories.drain().map(|(_, d)| d).collect::<Vec<_>>(),
                std::mem::take(&mut state.layer_mounts),
            )
        };

        for dir in &dirs {
            if let Err(err) = self.os.unmount(Path::new(&dir.container_path)) {
                warn!(container = %entry.id(), port = dir.port, error = %err, "failed to unmount mapped directory");
            }
        }
        for disk in &disks {
            if let Err(err) = self.os.unmount(Path::new(&disk.container_path)) {
                warn!(container = %entry.id(), lun = disk.lun, error = %err, "failed to unmount mapped virtual disk");
            }
        }
        for target in layer_mounts.iter().rev() {
            if let Err(err) = self.os.unmount(target) {
                warn!(container = %entry.id(), target = %target.display(), error = %err, "failed to unmount layer");
            }
        }

        if let Err(err) = self
            .os
            .remove_all(&layout::container_storage_path(entry.id()))
        {
            warn!(container = %entry.id(), error = %err, "failed to remove container storage");
        }
    }
}
