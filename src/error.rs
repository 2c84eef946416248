use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmuError {
    /// BIOS, table or disk image could not be read.
    #[error("failed to load {what} image {}: {source}", path.display())]
    ImageLoad {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Image was read but is too short for the layout it must carry.
    #[error("{what} image is truncated: need {needed} bytes, found {found}")]
    ImageTruncated {
        what: &'static str,
        needed: usize,
        found: usize,
    },

    /// Raw opcode (or group sub-function) has no implemented semantics.
    #[error("illegal opcode {opcode:#04x} at {cs:04x}:{ip:04x}")]
    IllegalOpcode { cs: u16, ip: u16, opcode: u8 },

    #[error("memory size {size:#x} cannot hold the register overlay")]
    InvalidMemorySize { size: usize },

    #[error("failed to open disk image {}: {source}", path.display())]
    DiskSetup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, EmuError>;
