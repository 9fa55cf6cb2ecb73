//! Sandbox module containing the interpreter and its host boundary.

pub mod config;
pub(crate) mod convert;
pub mod executor;
pub mod limits;
pub(crate) mod protect;
pub mod table;
pub mod value;
