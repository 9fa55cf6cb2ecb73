//! Prelude module for convenient imports.

pub use crate::error::{Result, SandboxError};
pub use crate::sandbox::{
    config::{SandboxConfig, StdLib},
    executor::{LuaSandbox, MULTRET},
    table::TableRef,
    value::{MapKey, Value},
};
