//! Protected entry points into the interpreter.
//!
//! Any Lua API function that may allocate can raise an error. Raised outside
//! a protected call, that error reaches the panic handler and the process
//! aborts. The helpers here run such operations inside `lua_pcall` through
//! small trampolines, and turn a failure into a [`GuestFailure`].
//!
//! Trampolines are entered and left by `longjmp` on error, so they must not
//! own anything with a destructor.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::slice;

use mlua_sys as ffi;

use crate::sandbox::config::StdLib;

/// An interpreter status code together with the error text it left behind.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GuestFailure {
    pub status: c_int,
    pub message: String,
    /// False when the host refused the operation before the interpreter ran.
    pub from_guest: bool,
}

impl GuestFailure {
    fn stack_exhausted() -> Self {
        Self {
            status: ffi::LUA_ERRMEM,
            message: "stack overflow".to_string(),
            from_guest: false,
        }
    }
}

/// Render the value at `index` as error text without allocating inside the
/// interpreter.
pub(crate) unsafe fn error_text(state: *mut ffi::lua_State, index: c_int) -> String {
    match ffi::lua_type(state, index) {
        ffi::LUA_TSTRING => {
            let mut len = 0usize;
            let ptr = ffi::lua_tolstring(state, index, &mut len);
            if ptr.is_null() {
                return String::new();
            }
            String::from_utf8_lossy(slice::from_raw_parts(ptr as *const u8, len)).into_owned()
        }
        ffi::LUA_TNUMBER if ffi::lua_isinteger(state, index) != 0 => {
            ffi::lua_tointeger(state, index).to_string()
        }
        ffi::LUA_TNUMBER => ffi::lua_tonumber(state, index).to_string(),
        tag => format!("(error object is a {} value)", type_name(state, tag)),
    }
}

/// Name of a type tag, as the interpreter spells it.
pub(crate) unsafe fn type_name(state: *mut ffi::lua_State, tag: c_int) -> String {
    let name = ffi::lua_typename(state, tag);
    if name.is_null() {
        return "no value".to_string();
    }
    CStr::from_ptr(name).to_string_lossy().into_owned()
}

/// Pop the error object a failed operation left on top of the stack.
pub(crate) unsafe fn take_error(state: *mut ffi::lua_State, status: c_int) -> GuestFailure {
    let message = error_text(state, -1);
    ffi::lua_pop(state, 1);
    GuestFailure {
        status,
        message,
        from_guest: true,
    }
}

/// Make room for `slots` more values.
///
/// The interpreter grows its stack through the bounded allocator, so a
/// refusal here is reported as memory exhaustion.
pub(crate) unsafe fn reserve(state: *mut ffi::lua_State, slots: c_int) -> Result<(), GuestFailure> {
    if slots <= 0 || ffi::lua_checkstack(state, slots) != 0 {
        Ok(())
    } else {
        Err(GuestFailure::stack_exhausted())
    }
}

/// Restores the stack top to where it was when the guard was created.
pub(crate) struct StackGuard {
    state: *mut ffi::lua_State,
    top: c_int,
    armed: bool,
}

impl StackGuard {
    pub unsafe fn new(state: *mut ffi::lua_State) -> Self {
        Self {
            state,
            top: ffi::lua_gettop(state),
            armed: true,
        }
    }

    /// Keep whatever is on the stack when the guard goes out of scope.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        if self.armed {
            // SAFETY: the guard never outlives the state it was created for,
            // and `top` was a valid stack height at creation.
            unsafe { ffi::lua_settop(self.state, self.top) };
        }
    }
}

/// Call `f` in protected mode with the `n_args` values on top of the stack.
///
/// On success `n_results` values replace the arguments. On failure the
/// arguments are consumed and the error object is popped into the result.
pub(crate) unsafe fn call_protected(
    state: *mut ffi::lua_State,
    f: ffi::lua_CFunction,
    n_args: c_int,
    n_results: c_int,
) -> Result<(), GuestFailure> {
    if ffi::lua_checkstack(state, 1) == 0 {
        ffi::lua_pop(state, n_args);
        return Err(GuestFailure::stack_exhausted());
    }
    ffi::lua_pushcfunction(state, f);
    ffi::lua_insert(state, -(n_args + 1));

    match ffi::lua_pcall(state, n_args, n_results, 0) {
        ffi::LUA_OK => Ok(()),
        status => Err(take_error(state, status)),
    }
}

unsafe extern "C-unwind" fn push_bytes_trampoline(state: *mut ffi::lua_State) -> c_int {
    let ptr = ffi::lua_touserdata(state, 1) as *const c_char;
    let len = ffi::lua_tointeger(state, 2) as usize;
    ffi::lua_pushlstring(state, ptr, len);
    1
}

/// Push a byte string, keeping embedded NUL bytes.
pub(crate) unsafe fn push_bytes(state: *mut ffi::lua_State, bytes: &[u8]) -> Result<(), GuestFailure> {
    reserve(state, 3)?;
    ffi::lua_pushlightuserdata(state, bytes.as_ptr() as *mut c_void);
    ffi::lua_pushinteger(state, bytes.len() as ffi::lua_Integer);
    call_protected(state, push_bytes_trampoline, 2, 1)
}

unsafe extern "C-unwind" fn registry_ref_trampoline(state: *mut ffi::lua_State) -> c_int {
    let key = ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX);
    ffi::lua_pushinteger(state, key as ffi::lua_Integer);
    1
}

/// Pop the top value into the registry and return its key.
///
/// The value is consumed whether or not a key could be allocated.
pub(crate) unsafe fn registry_ref(state: *mut ffi::lua_State) -> Result<c_int, GuestFailure> {
    call_protected(state, registry_ref_trampoline, 1, 1)?;
    let key = ffi::lua_tointeger(state, -1);
    ffi::lua_pop(state, 1);
    Ok(c_int::try_from(key).unwrap_or(ffi::LUA_NOREF))
}

unsafe extern "C-unwind" fn get_field_trampoline(state: *mut ffi::lua_State) -> c_int {
    ffi::lua_gettable(state, 1);
    1
}

/// Replace a table and a key on top of the stack with `table[key]`.
///
/// Metamethods run, so the lookup may execute guest code.
pub(crate) unsafe fn get_field(state: *mut ffi::lua_State) -> Result<(), GuestFailure> {
    call_protected(state, get_field_trampoline, 2, 1)
}

unsafe extern "C-unwind" fn load_file_trampoline(state: *mut ffi::lua_State) -> c_int {
    let path = ffi::lua_touserdata(state, 1) as *const c_char;
    let mode = ffi::lua_touserdata(state, 2) as *const c_char;
    let status = ffi::luaL_loadfilex(state, path, mode);
    ffi::lua_pushinteger(state, status as ffi::lua_Integer);
    2
}

/// Compile the file at `path`, leaving the chunk on top of the stack.
pub(crate) unsafe fn load_file(
    state: *mut ffi::lua_State,
    path: &CStr,
    mode: &CStr,
) -> Result<(), GuestFailure> {
    reserve(state, 4)?;
    ffi::lua_pushlightuserdata(state, path.as_ptr() as *mut c_void);
    ffi::lua_pushlightuserdata(state, mode.as_ptr() as *mut c_void);
    call_protected(state, load_file_trampoline, 2, 2)?;

    let status = ffi::lua_tointeger(state, -1) as c_int;
    ffi::lua_pop(state, 1);
    match status {
        ffi::LUA_OK => Ok(()),
        status => Err(take_error(state, status)),
    }
}

/// Standard libraries in the order they are opened, with their global names.
const LIBRARIES: [(StdLib, &CStr, ffi::lua_CFunction); 10] = [
    (StdLib::BASE, c"_G", ffi::luaopen_base),
    (StdLib::PACKAGE, c"package", ffi::luaopen_package),
    (StdLib::COROUTINE, c"coroutine", ffi::luaopen_coroutine),
    (StdLib::TABLE, c"table", ffi::luaopen_table),
    (StdLib::IO, c"io", ffi::luaopen_io),
    (StdLib::OS, c"os", ffi::luaopen_os),
    (StdLib::STRING, c"string", ffi::luaopen_string),
    (StdLib::MATH, c"math", ffi::luaopen_math),
    (StdLib::UTF8, c"utf8", ffi::luaopen_utf8),
    (StdLib::DEBUG, c"debug", ffi::luaopen_debug),
];

unsafe extern "C-unwind" fn open_libraries_trampoline(state: *mut ffi::lua_State) -> c_int {
    let selected = StdLib::from_bits(ffi::lua_tointeger(state, 1) as u32);
    for &(lib, name, open) in LIBRARIES.iter() {
        if selected.contains(lib) {
            ffi::luaL_requiref(state, name.as_ptr(), open, 1);
            ffi::lua_pop(state, 1);
        }
    }
    // `dofile` and `loadfile` read host files and `load` accepts bytecode.
    if selected.contains(StdLib::BASE) && !selected.contains(StdLib::IO) {
        for &name in [c"dofile", c"loadfile", c"load"].iter() {
            ffi::lua_pushnil(state);
            ffi::lua_setglobal(state, name.as_ptr());
        }
    }
    0
}

/// Open the selected standard libraries as globals.
pub(crate) unsafe fn open_libraries(state: *mut ffi::lua_State, libraries: StdLib) -> Result<(), GuestFailure> {
    if libraries.is_empty() {
        return Ok(());
    }
    reserve(state, 2)?;
    ffi::lua_pushinteger(state, libraries.bits() as ffi::lua_Integer);
    call_protected(state, open_libraries_trampoline, 1, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::limits::{bounded_alloc, MemoryBudget};

    struct RawState {
        state: *mut ffi::lua_State,
        _budget: Box<MemoryBudget>,
    }

    impl RawState {
        fn new(limit: usize) -> Self {
            let budget = Box::new(MemoryBudget::new(limit));
            let ud = &*budget as *const MemoryBudget as *mut c_void;
            let state = unsafe { ffi::lua_newstate(bounded_alloc, ud) };
            assert!(!state.is_null());
            Self { state, _budget: budget }
        }
    }

    impl Drop for RawState {
        fn drop(&mut self) {
            unsafe { ffi::lua_close(self.state) };
        }
    }

    #[test]
    fn test_reserve_refusal_is_host_side() {
        let raw = RawState::new(0);
        let failure = unsafe { reserve(raw.state, 2_000_000) }.unwrap_err();

        assert_eq!(failure.status, ffi::LUA_ERRMEM);
        assert!(!failure.from_guest);
        assert_eq!(unsafe { ffi::lua_gettop(raw.state) }, 0);
    }

    #[test]
    fn test_push_bytes_keeps_nul() {
        let raw = RawState::new(0);
        unsafe {
            push_bytes(raw.state, b"a\0b").unwrap();
            assert_eq!(ffi::lua_gettop(raw.state), 1);
            assert_eq!(ffi::lua_rawlen(raw.state, -1), 3);
            assert_eq!(error_text(raw.state, -1), "a\u{0}b");
        }
    }

    #[test]
    fn test_error_text_for_non_strings() {
        let raw = RawState::new(0);
        unsafe {
            ffi::lua_pushinteger(raw.state, 42);
            assert_eq!(error_text(raw.state, -1), "42");
            ffi::lua_pushboolean(raw.state, 1);
            assert_eq!(error_text(raw.state, -1), "(error object is a boolean value)");
        }
    }

    #[test]
    fn test_stack_guard_restores_top() {
        let raw = RawState::new(0);
        unsafe {
            ffi::lua_pushnil(raw.state);
            {
                let _guard = StackGuard::new(raw.state);
                ffi::lua_pushnil(raw.state);
                ffi::lua_pushnil(raw.state);
            }
            assert_eq!(ffi::lua_gettop(raw.state), 1);

            let mut guard = StackGuard::new(raw.state);
            ffi::lua_pushnil(raw.state);
            guard.disarm();
            drop(guard);
            assert_eq!(ffi::lua_gettop(raw.state), 2);
        }
    }

    #[test]
    fn test_open_libraries_sets_globals() {
        let raw = RawState::new(0);
        unsafe {
            open_libraries(raw.state, StdLib::BASE | StdLib::MATH).unwrap();
            assert_eq!(ffi::lua_gettop(raw.state), 0);

            assert_eq!(ffi::lua_getglobal(raw.state, c"math".as_ptr()), ffi::LUA_TTABLE);
            assert_eq!(ffi::lua_getglobal(raw.state, c"io".as_ptr()), ffi::LUA_TNIL);
        }
    }

    #[test]
    fn test_missing_file_reports_file_status() {
        let raw = RawState::new(0);
        unsafe {
            let failure = load_file(raw.state, c"/nonexistent/dir/chunk.lua", c"t").unwrap_err();
            assert_eq!(failure.status, ffi::LUA_ERRFILE);
            assert!(failure.message.contains("chunk.lua"));
            assert_eq!(ffi::lua_gettop(raw.state), 0);
        }
    }
}
