use std::io;

use thiserror::Error;

use crate::version::Version;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{context} ({source})")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("empty file")]
    EmptyFile,

    #[error("parsing error @{offset:#x} - expected {expected} bytes but got {actual}")]
    MagicMismatch {
        offset: usize,
        expected: String,
        actual: String,
    },

    #[error("parsing error @{offset:#x} - need to read {needed} bytes but only \
        {available} bytes are available")]
    TruncatedInput {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("parsing error @{offset:#x} - entry too big ({size} > {available})")]
    EntryTooBig {
        offset: usize,
        size: u32,
        available: usize,
    },

    #[error("parsing error @{offset:#x} - an EFI var is too huge ({size} > {available})")]
    VariableTooBig {
        offset: usize,
        size: u32,
        available: usize,
    },

    #[error("parsing error @{offset:#x} - an EFI var name is too huge \
        ({name_size} > {data_size})")]
    NameTooBig {
        offset: usize,
        name_size: u32,
        data_size: u32,
    },

    #[error("parsing error @{offset:#x} - invalid EFI_NV data size {size} \
        (expected between {min} and {max})")]
    NestedSizeInvalid {
        offset: usize,
        size: u32,
        min: usize,
        max: u32,
    },

    #[error("unable to convert {0}")]
    Encoding(&'static str),

    #[error("{what} '{name}' is too long (max {max} bytes)")]
    NameTooLong {
        what: &'static str,
        name: String,
        max: usize,
    },

    #[error("invalid GUID '{guid}': {reason}")]
    InvalidGuid { guid: String, reason: &'static str },

    #[error("EFI variables section not found")]
    NoVariablesEntry,

    #[error("entry '{0}' does not hold EFI variables")]
    NotVariablesEntry(String),

    #[error("variable '{0}' not found")]
    VariableNotFound(String),

    #[error("{what} is not the right size ({size})")]
    InvalidValueSize { what: &'static str, size: usize },

    #[error("invalid {0} field in version string")]
    InvalidVersion(&'static str),

    #[error("can't find csr enable / disable logic for macOS version {0}")]
    UnsupportedVersion(Version),

    #[error("{reason} at line {line}")]
    Vmx { line: usize, reason: String },

    #[error(transparent)]
    Binrw(#[from] binrw::Error),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// The OS error code of an I/O failure, if any.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Byte offset of a parse failure, relative to the start of the parse.
    pub fn offset(&self) -> Option<usize> {
        match *self {
            Error::MagicMismatch { offset, .. }
            | Error::TruncatedInput { offset, .. }
            | Error::EntryTooBig { offset, .. }
            | Error::VariableTooBig { offset, .. }
            | Error::NameTooBig { offset, .. }
            | Error::NestedSizeInvalid { offset, .. } => Some(offset),
            _ => None,
        }
    }
}
