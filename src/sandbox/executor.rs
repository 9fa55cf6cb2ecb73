//! Core execution engine for the Lua sandbox.

use std::cell::RefCell;
use std::ffi::CString;
use std::fmt;
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;
use std::ptr::NonNull;
use std::rc::Rc;

use mlua_sys as ffi;
use tracing::{debug, error, warn};

use crate::error::{Result, SandboxError};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::convert::{to_guest, to_host, TableMode};
use crate::sandbox::limits::{bounded_alloc, MemoryBudget};
use crate::sandbox::protect::{self, GuestFailure, StackGuard};
use crate::sandbox::value::Value;

/// Pass as `n_results` to keep every value the called function returns.
pub const MULTRET: i32 = ffi::LUA_MULTRET;

/// Host state the interpreter can reach from its callbacks.
pub(crate) struct GuestContext {
    pub budget: MemoryBudget,
    pub last_error: RefCell<Option<String>>,
}

/// Owner of one interpreter instance.
///
/// Shared between a [`LuaSandbox`] and every table reference minted from it,
/// so the state is closed only after the last of them is dropped.
pub(crate) struct SandboxCore {
    state: NonNull<ffi::lua_State>,
    context: Box<GuestContext>,
    config: SandboxConfig,
    chunk_name: CString,
}

impl SandboxCore {
    pub fn state(&self) -> *mut ffi::lua_State {
        self.state.as_ptr()
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.context.budget
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Convert a failure, recording interpreter messages as the most recent
    /// error. Host-side refusals leave the error slot untouched.
    pub fn capture(&self, failure: GuestFailure) -> SandboxError {
        warn!(
            status = failure.status,
            message = %failure.message,
            from_guest = failure.from_guest,
            "guest error captured"
        );
        if failure.from_guest {
            if let Ok(mut slot) = self.context.last_error.try_borrow_mut() {
                *slot = Some(failure.message.clone());
            }
        }
        SandboxError::from_status(failure.status, failure.message)
    }

    /// Turn the status of an operation that leaves its error on the stack
    /// into a result.
    fn check(&self, status: c_int) -> Result<()> {
        if status == ffi::LUA_OK {
            return Ok(());
        }
        // SAFETY: a failing status always comes with an error object on top.
        let failure = unsafe { protect::take_error(self.state(), status) };
        Err(self.capture(failure))
    }
}

impl Drop for SandboxCore {
    fn drop(&mut self) {
        debug!(
            used = self.context.budget.used(),
            peak = self.context.budget.peak(),
            "closing sandbox"
        );
        // SAFETY: the state is owned here and no handle outlives this core.
        unsafe { ffi::lua_close(self.state()) };
    }
}

/// Last-resort handler for errors raised outside any protected call.
///
/// The interpreter aborts the process as soon as this returns. The message is
/// logged and kept in the error slot for anything that inspects the sandbox
/// from a process-level hook.
unsafe extern "C-unwind" fn panic_sink(state: *mut ffi::lua_State) -> c_int {
    let message = protect::error_text(state, -1);
    error!(message = %message, "unprotected error in sandbox, aborting");

    let context = *(ffi::lua_getextraspace(state) as *const *const GuestContext);
    if let Some(context) = context.as_ref() {
        if let Ok(mut slot) = context.last_error.try_borrow_mut() {
            *slot = Some(message);
        }
    }
    0
}

/// A memory-bounded Lua interpreter.
///
/// Cloning is cheap and yields another handle to the same interpreter. The
/// sandbox is neither `Send` nor `Sync`: every operation on it and on the
/// tables it hands out happens on one thread. Independent sandboxes share
/// nothing and may live on different threads.
///
/// Guest code only ever runs through [`call`](Self::call) and the helpers
/// built on it, which trap guest errors. Errors raised anywhere else reach
/// the interpreter's panic handler, which terminates the process.
#[derive(Clone)]
pub struct LuaSandbox {
    pub(crate) core: Rc<SandboxCore>,
}

impl LuaSandbox {
    /// Create a sandbox whose interpreter may hold at most `memory_limit`
    /// bytes (0 for unlimited). No standard libraries are opened.
    pub fn new(memory_limit: usize) -> Result<Self> {
        Self::with_config(SandboxConfig {
            memory_limit,
            ..SandboxConfig::default()
        })
    }

    /// Create a sandbox from a full configuration.
    ///
    /// Fails with [`SandboxError::OutOfMemory`] when the interpreter cannot
    /// be set up within the memory limit. No sandbox exists in that case.
    pub fn with_config(config: SandboxConfig) -> Result<Self> {
        let context = Box::new(GuestContext {
            budget: MemoryBudget::new(config.memory_limit),
            last_error: RefCell::new(None),
        });

        let ud = &context.budget as *const MemoryBudget as *mut c_void;
        // SAFETY: the budget is boxed, so its address is stable, and the core
        // closes the state before the box is dropped.
        let state = unsafe { ffi::lua_newstate(bounded_alloc, ud) };
        let Some(state) = NonNull::new(state) else {
            warn!(limit = config.memory_limit, "interpreter creation refused");
            return Err(SandboxError::OutOfMemory(format!(
                "cannot create interpreter within {} bytes",
                config.memory_limit
            )));
        };

        // SAFETY: the extra space is pointer-sized and reserved for the host.
        unsafe {
            *(ffi::lua_getextraspace(state.as_ptr()) as *mut *const GuestContext) =
                &*context as *const GuestContext;
            ffi::lua_atpanic(state.as_ptr(), panic_sink);
        }

        let chunk_name = CString::new(config.chunk_name.replace('\0', "")).unwrap_or_default();
        let libraries = config.libraries;
        let core = Rc::new(SandboxCore {
            state,
            context,
            config,
            chunk_name,
        });

        // SAFETY: fresh state with an empty stack.
        unsafe { protect::open_libraries(core.state(), libraries) }.map_err(|f| core.capture(f))?;

        debug!(
            limit = core.config.memory_limit,
            used = core.budget().used(),
            libraries = ?libraries,
            "sandbox created"
        );
        Ok(Self { core })
    }

    /// The configuration this sandbox was created with.
    pub fn config(&self) -> &SandboxConfig {
        self.core.config()
    }

    /// Current memory ceiling in bytes (0 for unlimited).
    pub fn memory_limit(&self) -> usize {
        self.core.budget().limit()
    }

    /// Change the memory ceiling. Applies from the next allocation request.
    pub fn set_memory_limit(&self, limit: usize) {
        self.core.budget().set_limit(limit);
    }

    /// Bytes the interpreter currently holds.
    pub fn memory_used(&self) -> usize {
        self.core.budget().used()
    }

    /// Highest `memory_used` observed so far.
    pub fn peak_memory(&self) -> usize {
        self.core.budget().peak()
    }

    /// Whether the budget has refused any allocation.
    pub fn limit_exceeded(&self) -> bool {
        self.core.budget().limit_exceeded()
    }

    /// The message of the most recent guest failure.
    pub fn last_error(&self) -> Option<String> {
        self.core.context.last_error.borrow().clone()
    }

    /// Number of values on the interpreter stack.
    pub fn stack_depth(&self) -> usize {
        // SAFETY: the state is alive for as long as the core.
        let top = unsafe { ffi::lua_gettop(self.core.state()) };
        usize::try_from(top).unwrap_or(0)
    }

    /// Drop values from the top of the stack until at most `depth` remain.
    pub fn truncate(&self, depth: usize) {
        if depth < self.stack_depth() {
            // SAFETY: `depth` is below the current top.
            unsafe { ffi::lua_settop(self.core.state(), depth as c_int) };
        }
    }

    /// Compile `source` and leave the resulting function on the stack.
    pub fn load_text(&self, source: impl AsRef<[u8]>) -> Result<()> {
        let source = source.as_ref();
        let state = self.core.state();
        // SAFETY: `source` and both C strings outlive the call; the loader
        // runs in protected mode.
        let status = unsafe {
            protect::reserve(state, 1).map_err(|f| self.core.capture(f))?;
            ffi::luaL_loadbufferx(
                state,
                source.as_ptr() as *const c_char,
                source.len(),
                self.core.chunk_name.as_ptr(),
                self.core.config.chunk_mode.as_c_str().as_ptr(),
            )
        };
        self.core.check(status)?;
        debug!(bytes = source.len(), "chunk loaded");
        Ok(())
    }

    /// Compile the file at `path` and leave the resulting function on the stack.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let c_path = path_to_c_string(path)?;

        let mode = self.core.config.chunk_mode.as_c_str();
        // SAFETY: both C strings outlive the protected call.
        unsafe { protect::load_file(self.core.state(), &c_path, mode) }
            .map_err(|f| self.core.capture(f))?;
        debug!(path = %path.display(), "chunk loaded from file");
        Ok(())
    }

    /// Call the function below the top `n_args` values in protected mode.
    ///
    /// `n_results` values (or all of them for [`MULTRET`]) replace the
    /// function and its arguments. `error_handler` is the absolute stack
    /// index of a message handler below the function, or 0 for none.
    pub fn call(&self, n_args: usize, n_results: i32, error_handler: usize) -> Result<()> {
        let state = self.core.state();
        let depth = self.stack_depth();

        if n_args >= depth {
            return Err(SandboxError::Stack(format!(
                "call needs a function and {} arguments but the stack holds {} values",
                n_args, depth
            )));
        }
        if n_results < MULTRET {
            return Err(SandboxError::Stack(format!("invalid result count {}", n_results)));
        }
        let function_index = depth - n_args;
        if error_handler >= function_index {
            return Err(SandboxError::Stack(format!(
                "error handler index {} must lie below the function at {}",
                error_handler, function_index
            )));
        }

        let n_args = c_int::try_from(n_args)
            .map_err(|_| SandboxError::Stack(format!("too many arguments: {}", n_args)))?;
        let handler = error_handler as c_int;

        // SAFETY: arity and handler index were validated against the stack.
        unsafe {
            if n_results > n_args && ffi::lua_checkstack(state, n_results - n_args) == 0 {
                return Err(SandboxError::Stack(format!(
                    "cannot make room for {} results",
                    n_results
                )));
            }
            let status = ffi::lua_pcall(state, n_args, n_results, handler);
            self.core.check(status)?;
        }

        debug!(n_args, n_results, depth = self.stack_depth(), "call completed");
        Ok(())
    }

    /// Push a host value onto the stack.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        to_guest(&self.core, &value.into())
    }

    /// Pop the top value. Tables come back as [`Value::Table`] references.
    ///
    /// A value that cannot be converted stays on the stack.
    pub fn pop(&self) -> Result<Value> {
        self.pop_with(TableMode::Reference)
    }

    /// Pop the top value, copying tables recursively into [`Value::Map`].
    pub fn pop_copied(&self) -> Result<Value> {
        self.pop_with(TableMode::Copy)
    }

    fn pop_with(&self, mode: TableMode) -> Result<Value> {
        if self.stack_depth() == 0 {
            return Err(SandboxError::Stack("pop from an empty stack".to_string()));
        }
        let value = to_host(&self.core, -1, mode).map_err(stack_error)?;
        // SAFETY: the stack holds at least one value.
        unsafe { ffi::lua_pop(self.core.state(), 1) };
        Ok(value)
    }

    /// Pop every value on the stack, returned bottom to top.
    ///
    /// Nothing is popped if any value cannot be converted.
    pub fn drain_stack(&self) -> Result<Vec<Value>> {
        self.take_from(1)
    }

    /// Convert the values from absolute index `first` to the top, then
    /// remove them.
    fn take_from(&self, first: usize) -> Result<Vec<Value>> {
        let depth = self.stack_depth();
        let mut values = Vec::with_capacity((depth + 1).saturating_sub(first));
        for index in first..=depth {
            values.push(to_host(&self.core, index as c_int, TableMode::Reference).map_err(stack_error)?);
        }
        self.truncate(first.saturating_sub(1));
        Ok(values)
    }

    /// Call the loaded chunk on top of the stack with `args` and return
    /// everything it returns.
    pub fn run<I, V>(&self, args: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let function_index = self.stack_depth();
        if function_index == 0 {
            return Err(SandboxError::Stack("no loaded chunk to run".to_string()));
        }

        // SAFETY: the guard is dropped before the state could be closed.
        let mut guard = unsafe { StackGuard::new(self.core.state()) };
        let mut n_args = 0;
        for arg in args {
            self.push(arg)?;
            n_args += 1;
        }
        guard.disarm();

        self.call(n_args, MULTRET, 0)?;
        self.take_from(function_index).inspect_err(|_| self.truncate(function_index - 1))
    }

    /// Compile and run `source`, returning its results.
    pub fn eval(&self, source: impl AsRef<[u8]>) -> Result<Vec<Value>> {
        self.load_text(source)?;
        self.run(std::iter::empty::<Value>())
    }

    /// Run a full garbage collection cycle.
    pub fn collect_garbage(&self) {
        // SAFETY: a full collection does not raise; finalizer errors become warnings.
        unsafe { ffi::lua_gc(self.core.state(), ffi::LUA_GCCOLLECT) };
    }
}

#[cfg(unix)]
fn path_to_c_string(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SandboxError::File(format!("path contains a NUL byte: {}", path.display())))
}

#[cfg(not(unix))]
fn path_to_c_string(path: &Path) -> Result<CString> {
    let text = path
        .to_str()
        .ok_or_else(|| SandboxError::File(format!("path is not valid UTF-8: {}", path.display())))?;
    CString::new(text)
        .map_err(|_| SandboxError::File(format!("path contains a NUL byte: {}", path.display())))
}

fn stack_error(err: SandboxError) -> SandboxError {
    match err {
        SandboxError::TypeMismatch(message) => SandboxError::Stack(message),
        other => other,
    }
}

impl fmt::Debug for LuaSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaSandbox")
            .field("memory_limit", &self.memory_limit())
            .field("memory_used", &self.memory_used())
            .field("stack_depth", &self.stack_depth())
            .finish()
    }
}
