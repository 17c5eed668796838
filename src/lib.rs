#[macro_use]
extern crate lazy_static;

pub mod efi;
pub mod error;
pub mod helper;
pub mod nvram;
pub mod reader;
pub mod version;
pub mod vmx;

pub use crate::efi::EfiGuid;
pub use crate::error::{Error, Result};
pub use crate::nvram::{Entry, EntryType, Nvram, Variable, VariableMut};
pub use crate::version::Version;
pub use crate::vmx::Vmx;
