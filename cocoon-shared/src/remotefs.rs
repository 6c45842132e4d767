//! Wire dialect of the remote-filesystem helper tool.
//!
//! The helper itself is a separate binary driven over its stdio by the
//! host; only the dialect is fixed here so both sides agree on framing.
//! For `openfile`, every operation on the open file is delimited by a
//! fixed-size header, with payload bytes following for reads and writes.

use serde::{Deserialize, Serialize};

use crate::errors::{CocoonError, CocoonResult};

/// Name of the helper's meta command.
pub const REMOTEFS_CMD: &str = "remotefs";

/// Subcommand names accepted by the helper.
pub const STAT_CMD: &str = "stat";
pub const LSTAT_CMD: &str = "lstat";
pub const READLINK_CMD: &str = "readlink";
pub const MKDIR_CMD: &str = "mkdir";
pub const MKDIRALL_CMD: &str = "mkdirall";
pub const REMOVE_CMD: &str = "remove";
pub const REMOVEALL_CMD: &str = "removeall";
pub const LINK_CMD: &str = "link";
pub const SYMLINK_CMD: &str = "symlink";
pub const LCHMOD_CMD: &str = "lchmod";
pub const LCHOWN_CMD: &str = "lchown";
pub const MKNOD_CMD: &str = "mknod";
pub const MKFIFO_CMD: &str = "mkfifo";
pub const OPENFILE_CMD: &str = "openfile";
pub const READFILE_CMD: &str = "readfile";
pub const WRITEFILE_CMD: &str = "writefile";
pub const READDIR_CMD: &str = "readdir";
pub const RESOLVEPATH_CMD: &str = "resolvepath";
pub const EXTRACTARCHIVE_CMD: &str = "extractarchive";
pub const ARCHIVEPATH_CMD: &str = "archivepath";

/// Per-frame command codes for `openfile` sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileCmd {
    Read = 0,
    Write = 1,
    Seek = 2,
    Close = 3,
    /// Response: the request succeeded.
    CmdOk = 4,
    /// Response: the request failed.
    CmdFailed = 5,
}

impl TryFrom<u32> for FileCmd {
    type Error = CocoonError;

    fn try_from(value: u32) -> CocoonResult<Self> {
        match value {
            0 => Ok(FileCmd::Read),
            1 => Ok(FileCmd::Write),
            2 => Ok(FileCmd::Seek),
            3 => Ok(FileCmd::Close),
            4 => Ok(FileCmd::CmdOk),
            5 => Ok(FileCmd::CmdFailed),
            other => Err(CocoonError::InvalidArguments(format!(
                "unknown remotefs file command {other}"
            ))),
        }
    }
}

/// Header delimiting each `openfile` operation: `{Cmd: u32, Size: u64}`,
/// both big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub cmd: u32,
    pub size: u64,
}

impl FileHeader {
    pub const ENCODED_LEN: usize = 12;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..4].copy_from_slice(&self.cmd.to_be_bytes());
        buf[4..].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> CocoonResult<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(CocoonError::InvalidArguments(format!(
                "remotefs file header truncated at {} bytes",
                buf.len()
            )));
        }
        let mut cmd = [0u8; 4];
        cmd.copy_from_slice(&buf[..4]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[4..12]);
        Ok(FileHeader {
            cmd: u32::from_be_bytes(cmd),
            size: u64::from_be_bytes(size),
        })
    }
}

/// Payload of a `Seek` frame: `{Offset: i64, Whence: i32}`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekHeader {
    pub offset: i64,
    pub whence: i32,
}

impl SeekHeader {
    pub const ENCODED_LEN: usize = 12;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..8].copy_from_slice(&self.offset.to_be_bytes());
        buf[8..].copy_from_slice(&self.whence.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> CocoonResult<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(CocoonError::InvalidArguments(format!(
                "remotefs seek header truncated at {} bytes",
                buf.len()
            )));
        }
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[..8]);
        let mut whence = [0u8; 4];
        whence.copy_from_slice(&buf[8..12]);
        Ok(SeekHeader {
            offset: i64::from_be_bytes(offset),
            whence: i32::from_be_bytes(whence),
        })
    }
}

/// An error serialized by the helper. The field names are part of the
/// dialect and must not change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportedError {
    #[serde(rename = "ErrString")]
    pub err_string: String,
    #[serde(rename = "ErrNum", default, skip_serializing_if = "Option::is_none")]
    pub err_num: Option<i32>,
}
