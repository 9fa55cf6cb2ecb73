//! Sandbox configuration with builder pattern.

use std::ffi::CStr;
use std::ops::{BitOr, BitOrAssign};

/// A set of Lua standard libraries to open when a sandbox is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StdLib(u32);

impl StdLib {
    /// No libraries at all: only the core language is available.
    pub const NONE: StdLib = StdLib(0);
    /// Basic functions (`print`, `error`, `pairs`, `pcall`, ...).
    pub const BASE: StdLib = StdLib(1 << 0);
    pub const COROUTINE: StdLib = StdLib(1 << 1);
    pub const TABLE: StdLib = StdLib(1 << 2);
    pub const STRING: StdLib = StdLib(1 << 3);
    pub const MATH: StdLib = StdLib(1 << 4);
    pub const UTF8: StdLib = StdLib(1 << 5);
    /// File and process I/O. Never part of [`StdLib::SAFE`].
    pub const IO: StdLib = StdLib(1 << 6);
    /// Operating system access. Never part of [`StdLib::SAFE`].
    pub const OS: StdLib = StdLib(1 << 7);
    /// Module loading. Never part of [`StdLib::SAFE`].
    pub const PACKAGE: StdLib = StdLib(1 << 8);
    /// Introspection hooks. Never part of [`StdLib::SAFE`].
    pub const DEBUG: StdLib = StdLib(1 << 9);

    /// Libraries that give guest code no access to the host.
    ///
    /// Without [`StdLib::IO`], the base library's `dofile`, `loadfile` and
    /// `load` are removed as well.
    pub const SAFE: StdLib = StdLib(
        Self::BASE.0 | Self::COROUTINE.0 | Self::TABLE.0 | Self::STRING.0 | Self::MATH.0 | Self::UTF8.0,
    );

    /// Every standard library.
    pub const ALL: StdLib =
        StdLib(Self::SAFE.0 | Self::IO.0 | Self::OS.0 | Self::PACKAGE.0 | Self::DEBUG.0);

    /// Check if every library in `other` is part of this set.
    pub fn contains(self, other: StdLib) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn bits(self) -> u32 {
        self.0
    }

    pub(crate) fn from_bits(bits: u32) -> Self {
        StdLib(bits & Self::ALL.0)
    }
}

impl BitOr for StdLib {
    type Output = StdLib;

    fn bitor(self, rhs: StdLib) -> StdLib {
        StdLib(self.0 | rhs.0)
    }
}

impl BitOrAssign for StdLib {
    fn bitor_assign(&mut self, rhs: StdLib) {
        self.0 |= rhs.0;
    }
}

/// Which chunk encodings the loader accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkMode {
    /// Source text only. Precompiled bytecode is rejected as a syntax error.
    #[default]
    Text,
    /// Precompiled bytecode only.
    Binary,
    /// Either encoding.
    Any,
}

impl ChunkMode {
    /// The `mode` argument understood by `lua_load`.
    pub(crate) fn as_c_str(self) -> &'static CStr {
        match self {
            ChunkMode::Text => c"t",
            ChunkMode::Binary => c"b",
            ChunkMode::Any => c"bt",
        }
    }
}

/// Configuration for the Lua sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes the interpreter may hold; 0 means unlimited.
    pub memory_limit: usize,
    /// Standard libraries opened at construction.
    pub libraries: StdLib,
    /// Chunk encodings accepted by `load_text` and `load_file`.
    pub chunk_mode: ChunkMode,
    /// Name reported in diagnostics for chunks loaded from text.
    pub chunk_name: String,
    /// Deepest table nesting the eager-copy conversion will follow.
    pub max_copy_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 0,
            libraries: StdLib::NONE,
            chunk_mode: ChunkMode::Text,
            chunk_name: "=(load)".to_string(),
            max_copy_depth: 64,
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    memory_limit: Option<usize>,
    libraries: Option<StdLib>,
    chunk_mode: Option<ChunkMode>,
    chunk_name: Option<String>,
    max_copy_depth: Option<usize>,
}

impl SandboxConfigBuilder {
    /// Set the memory limit in bytes (0 for unlimited).
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Set the standard libraries to open.
    pub fn libraries(mut self, libraries: StdLib) -> Self {
        self.libraries = Some(libraries);
        self
    }

    /// Set which chunk encodings the loader accepts.
    pub fn chunk_mode(mut self, mode: ChunkMode) -> Self {
        self.chunk_mode = Some(mode);
        self
    }

    /// Set the chunk name used in diagnostics for text chunks.
    ///
    /// Interior NUL bytes cannot cross into the interpreter and are removed.
    pub fn chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = Some(name.into().replace('\0', ""));
        self
    }

    /// Set the deepest table nesting followed by eager copies.
    pub fn max_copy_depth(mut self, depth: usize) -> Self {
        self.max_copy_depth = Some(depth);
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        let default = SandboxConfig::default();
        SandboxConfig {
            memory_limit: self.memory_limit.unwrap_or(default.memory_limit),
            libraries: self.libraries.unwrap_or(default.libraries),
            chunk_mode: self.chunk_mode.unwrap_or(default.chunk_mode),
            chunk_name: self.chunk_name.unwrap_or(default.chunk_name),
            max_copy_depth: self.max_copy_depth.unwrap_or(default.max_copy_depth),
        }
    }
}
