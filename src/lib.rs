//! # Lua Sandbox
//!
//! A memory-bounded Lua 5.4 interpreter for running untrusted scripts inside
//! a host process.
//!
//! Each sandbox owns one interpreter whose every allocation passes through a
//! byte budget. Values cross the boundary as [`Value`]s, and tables can stay
//! inside the interpreter behind [`TableRef`] handles that are released
//! automatically. The sandbox enforces:
//!
//! - **Memory limits**: allocations beyond the configured ceiling are refused
//! - **Library selection**: no standard library is opened unless requested
//! - **Text-only loading**: precompiled bytecode is rejected by default
//! - **Typed failures**: every guest error surfaces with its kind and message
//!
//! ## Example
//!
//! ```rust
//! use lua_sandbox_rs::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let sandbox = LuaSandbox::new(256 * 1024)?;
//!
//!     sandbox.load_text("return 1 + 1")?;
//!     sandbox.call(0, 1, 0)?;
//!     assert_eq!(sandbox.pop()?, Value::Number(2.0));
//!
//!     let results = sandbox.eval("return {a = 1, b = 'x'}")?;
//!     let table = results[0].as_table().expect("a table");
//!     assert_eq!(table.get("a")?, Value::Number(1.0));
//!     assert_eq!(table.get("missing")?, Value::Nil);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Safety Model
//!
//! Guest code only runs through protected calls. An error raised outside
//! one reaches the interpreter's panic handler, which records the message
//! and then terminates the process, so the host should never invoke guest
//! functions by other means.
//!
//! A sandbox and its tables are `!Send`: all use of one interpreter happens
//! on one thread. Separate sandboxes are fully independent.

pub mod error;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{ErrorKind, Result, SandboxError};
pub use sandbox::config::{ChunkMode, SandboxConfig, SandboxConfigBuilder, StdLib};
pub use sandbox::executor::{LuaSandbox, MULTRET};
pub use sandbox::limits::MemoryBudget;
pub use sandbox::table::TableRef;
pub use sandbox::value::{MapKey, Value};
