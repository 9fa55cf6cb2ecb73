//! Conversion between host [`Value`]s and interpreter stack slots.
//!
//! Reading a slot never changes the stack depth; writing pushes exactly one
//! value on success and nothing on failure.

use std::collections::HashMap;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::rc::Rc;
use std::slice;

use mlua_sys as ffi;

use crate::error::{Result, SandboxError};
use crate::sandbox::executor::SandboxCore;
use crate::sandbox::protect::{self, StackGuard};
use crate::sandbox::table::TableRef;
use crate::sandbox::value::{MapKey, Value};

/// How tables are brought over to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableMode {
    /// Anchor the table in the registry and return a [`TableRef`].
    Reference,
    /// Copy the table's contents recursively into a [`Value::Map`].
    Copy,
}

/// Convert the value at `index` without removing it.
pub(crate) fn to_host(core: &Rc<SandboxCore>, index: c_int, mode: TableMode) -> Result<Value> {
    let state = core.state();
    // SAFETY: the index is checked against the live stack before any access.
    unsafe {
        let index = absolute_index(state, index)?;
        if ffi::lua_type(state, index) != ffi::LUA_TTABLE {
            return scalar(state, index);
        }

        match mode {
            TableMode::Reference => {
                protect::reserve(state, 2).map_err(|f| core.capture(f))?;
                ffi::lua_pushvalue(state, index);
                TableRef::mint(core).map(Value::Table)
            }
            TableMode::Copy => {
                let mut visited = Vec::new();
                copy_table(core, index, 1, &mut visited).map(Value::Map)
            }
        }
    }
}

/// Push `value` onto the stack.
pub(crate) fn to_guest(core: &SandboxCore, value: &Value) -> Result<()> {
    let state = core.state();
    // SAFETY: every push is preceded by a successful stack reservation.
    let pushed = unsafe {
        match value {
            Value::Table(_) | Value::Map(_) => {
                return Err(SandboxError::TypeMismatch(format!(
                    "cannot push a {} onto the stack",
                    value.type_name()
                )));
            }
            Value::String(bytes) => protect::push_bytes(state, bytes),
            Value::Nil => protect::reserve(state, 1).map(|()| ffi::lua_pushnil(state)),
            Value::Boolean(b) => {
                protect::reserve(state, 1).map(|()| ffi::lua_pushboolean(state, c_int::from(*b)))
            }
            Value::Number(n) => protect::reserve(state, 1).map(|()| ffi::lua_pushnumber(state, *n)),
        }
    };
    pushed.map_err(|f| core.capture(f))
}

unsafe fn absolute_index(state: *mut ffi::lua_State, index: c_int) -> Result<c_int> {
    let top = ffi::lua_gettop(state);
    let absolute = if index < 0 { top + index + 1 } else { index };
    if absolute < 1 || absolute > top {
        return Err(SandboxError::Stack(format!(
            "stack index {} is out of range for depth {}",
            index, top
        )));
    }
    Ok(absolute)
}

unsafe fn string_bytes(state: *mut ffi::lua_State, index: c_int) -> Vec<u8> {
    let mut len = 0usize;
    let ptr = ffi::lua_tolstring(state, index, &mut len);
    if ptr.is_null() {
        return Vec::new();
    }
    slice::from_raw_parts(ptr as *const u8, len).to_vec()
}

unsafe fn scalar(state: *mut ffi::lua_State, index: c_int) -> Result<Value> {
    match ffi::lua_type(state, index) {
        ffi::LUA_TNIL => Ok(Value::Nil),
        ffi::LUA_TBOOLEAN => Ok(Value::Boolean(ffi::lua_toboolean(state, index) != 0)),
        ffi::LUA_TNUMBER => Ok(Value::Number(ffi::lua_tonumber(state, index))),
        ffi::LUA_TSTRING => Ok(Value::String(string_bytes(state, index))),
        tag => Err(SandboxError::TypeMismatch(format!(
            "cannot convert a {} value",
            protect::type_name(state, tag)
        ))),
    }
}

unsafe fn map_key(state: *mut ffi::lua_State, index: c_int) -> Result<MapKey> {
    match ffi::lua_type(state, index) {
        ffi::LUA_TBOOLEAN => Ok(MapKey::Boolean(ffi::lua_toboolean(state, index) != 0)),
        ffi::LUA_TNUMBER if ffi::lua_isinteger(state, index) != 0 => {
            let integer = ffi::lua_tointegerx(state, index, ptr::null_mut());
            let number = integer as f64;
            // Distinct integer keys must not merge into one float key.
            if number as i128 != i128::from(integer) {
                return Err(SandboxError::TypeMismatch(format!(
                    "integer key {} has no exact number representation",
                    integer
                )));
            }
            Ok(MapKey::Number(number))
        }
        ffi::LUA_TNUMBER => Ok(MapKey::Number(ffi::lua_tonumber(state, index))),
        ffi::LUA_TSTRING => Ok(MapKey::String(string_bytes(state, index))),
        tag => Err(SandboxError::TypeMismatch(format!(
            "cannot copy a table with a {} key",
            protect::type_name(state, tag)
        ))),
    }
}

/// Copy the table at absolute `index`, `depth` levels below the root.
///
/// `visited` holds the identities of the tables on the current path, so a
/// table reached twice through different branches is copied twice while a
/// table containing itself is rejected.
unsafe fn copy_table(
    core: &Rc<SandboxCore>,
    index: c_int,
    depth: usize,
    visited: &mut Vec<*const c_void>,
) -> Result<HashMap<MapKey, Value>> {
    let state = core.state();
    let max_depth = core.config().max_copy_depth;
    if depth > max_depth {
        return Err(SandboxError::TypeMismatch(format!(
            "table nesting exceeds {} levels",
            max_depth
        )));
    }

    let identity = ffi::lua_topointer(state, index);
    if visited.contains(&identity) {
        return Err(SandboxError::TypeMismatch("cannot copy a cyclic table".to_string()));
    }

    protect::reserve(state, 3).map_err(|f| core.capture(f))?;
    let _guard = StackGuard::new(state);
    visited.push(identity);

    let mut map = HashMap::new();
    ffi::lua_pushnil(state);
    while ffi::lua_next(state, index) != 0 {
        let key = map_key(state, -2)?;
        let top = ffi::lua_gettop(state);
        let value = if ffi::lua_type(state, top) == ffi::LUA_TTABLE {
            Value::Map(copy_table(core, top, depth + 1, visited)?)
        } else {
            scalar(state, top)?
        };
        map.insert(key, value);
        ffi::lua_pop(state, 1);
    }

    visited.pop();
    Ok(map)
}
