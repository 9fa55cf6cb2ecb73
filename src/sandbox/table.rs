//! Long-lived references to tables that stay inside the interpreter.

use std::collections::HashMap;
use std::fmt;
use std::os::raw::c_int;
use std::rc::Rc;

use mlua_sys as ffi;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::sandbox::convert::{to_guest, to_host, TableMode};
use crate::sandbox::executor::{LuaSandbox, SandboxCore};
use crate::sandbox::protect::{self, StackGuard};
use crate::sandbox::value::{MapKey, Value};

/// One anchored registry slot, released when the last reference goes away.
struct RegistryEntry {
    core: Rc<SandboxCore>,
    key: c_int,
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        if self.key == ffi::LUA_NOREF || self.key == ffi::LUA_REFNIL {
            return;
        }
        let state = self.core.state();
        // SAFETY: the key was issued by this state's registry and is released
        // exactly once, here. Unref only overwrites existing slots.
        unsafe {
            if ffi::lua_checkstack(state, 1) == 0 {
                warn!(key = self.key, "no stack space to release table reference");
                return;
            }
            ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, self.key);
        }
        debug!(key = self.key, "table reference released");
    }
}

/// A handle to a table living in a sandbox.
///
/// The table is kept alive through the interpreter's registry for as long
/// as any clone of the handle exists. Reads go through the sandbox stack and
/// leave its depth unchanged.
#[derive(Clone)]
pub struct TableRef {
    entry: Rc<RegistryEntry>,
}

impl TableRef {
    /// Pop the table on top of the sandbox stack and anchor it.
    pub fn from_stack_top(sandbox: &LuaSandbox) -> Result<Self> {
        Self::mint(&sandbox.core)
    }

    pub(crate) fn mint(core: &Rc<SandboxCore>) -> Result<Self> {
        let state = core.state();
        // SAFETY: the top is checked before it is consumed.
        let key = unsafe {
            if ffi::lua_gettop(state) == 0 {
                return Err(exhausted());
            }
            let tag = ffi::lua_type(state, -1);
            if tag != ffi::LUA_TTABLE {
                return Err(SandboxError::TypeMismatch(format!(
                    "expected a table, found a {} value",
                    protect::type_name(state, tag)
                )));
            }
            protect::registry_ref(state).map_err(|f| core.capture(f))?
        };

        if key == ffi::LUA_NOREF || key == ffi::LUA_REFNIL {
            return Err(exhausted());
        }
        debug!(key, "table reference created");
        Ok(Self {
            entry: Rc::new(RegistryEntry {
                core: Rc::clone(core),
                key,
            }),
        })
    }

    /// The sandbox that owns the table.
    pub fn sandbox(&self) -> LuaSandbox {
        LuaSandbox {
            core: Rc::clone(&self.entry.core),
        }
    }

    fn core(&self) -> &Rc<SandboxCore> {
        &self.entry.core
    }

    /// Push the referenced table. The caller must have reserved a slot.
    unsafe fn push_table(&self) {
        ffi::lua_rawgeti(
            self.core().state(),
            ffi::LUA_REGISTRYINDEX,
            ffi::lua_Integer::from(self.entry.key),
        );
    }

    /// Length of the table's sequence part, without invoking `__len`.
    ///
    /// The length query itself cannot fail. The only error is
    /// [`SandboxError::OutOfMemory`] when
    /// the memory limit refuses the stack slot needed to push the table.
    pub fn len(&self) -> Result<usize> {
        let core = self.core();
        // SAFETY: one slot is reserved and the guard pops the table.
        unsafe {
            protect::reserve(core.state(), 1).map_err(|f| core.capture(f))?;
            let _guard = StackGuard::new(core.state());
            self.push_table();
            Ok(ffi::lua_rawlen(core.state(), -1))
        }
    }

    /// Whether the sequence part is empty. Hash entries are not counted.
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    /// Look up `key`, returning nested tables as references.
    pub fn get(&self, key: impl Into<Value>) -> Result<Value> {
        self.lookup(&key.into(), TableMode::Reference)
    }

    /// Look up `key`, copying a nested table into a [`Value::Map`].
    pub fn get_copied(&self, key: impl Into<Value>) -> Result<Value> {
        self.lookup(&key.into(), TableMode::Copy)
    }

    fn lookup(&self, key: &Value, mode: TableMode) -> Result<Value> {
        let core = self.core();
        let state = core.state();
        // SAFETY: the guard restores the stack on every path, including a
        // key that fails to convert after the table was pushed.
        unsafe {
            let _guard = StackGuard::new(state);
            protect::reserve(state, 1).map_err(|f| core.capture(f))?;
            self.push_table();
            to_guest(core, key)?;
            protect::get_field(state).map_err(|f| core.capture(f))?;
            to_host(core, -1, mode)
        }
    }

    /// Copy the whole table into a host map.
    pub fn to_map(&self) -> Result<HashMap<MapKey, Value>> {
        let core = self.core();
        // SAFETY: one slot is reserved and the guard pops the table.
        unsafe {
            protect::reserve(core.state(), 1).map_err(|f| core.capture(f))?;
            let _guard = StackGuard::new(core.state());
            self.push_table();
            match to_host(core, -1, TableMode::Copy)? {
                Value::Map(map) => Ok(map),
                other => Err(SandboxError::TypeMismatch(format!(
                    "expected a table, found a {} value",
                    other.type_name()
                ))),
            }
        }
    }

    /// Whether both handles refer to the same guest table.
    pub fn same_table(&self, other: &TableRef) -> bool {
        if !Rc::ptr_eq(self.core(), other.core()) {
            return false;
        }
        if self.entry.key == other.entry.key {
            return true;
        }
        let state = self.core().state();
        // SAFETY: two slots are reserved and the guard pops both tables.
        unsafe {
            if ffi::lua_checkstack(state, 2) == 0 {
                return false;
            }
            let _guard = StackGuard::new(state);
            self.push_table();
            other.push_table();
            ffi::lua_rawequal(state, -1, -2) != 0
        }
    }
}

fn exhausted() -> SandboxError {
    SandboxError::Runtime("empty stack or registry exhausted".to_string())
}

impl PartialEq for TableRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_table(other)
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRef").field("key", &self.entry.key).finish()
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table: ref {}", self.entry.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(source: &str) -> (LuaSandbox, TableRef) {
        let sandbox = LuaSandbox::new(0).unwrap();
        sandbox.load_text(source).unwrap();
        sandbox.call(0, 1, 0).unwrap();
        let table = TableRef::from_stack_top(&sandbox).unwrap();
        (sandbox, table)
    }

    #[test]
    fn test_mint_pops_table() {
        let (sandbox, table) = table("return {10, 20, 30}");
        assert_eq!(sandbox.stack_depth(), 0);
        assert_eq!(table.len().unwrap(), 3);
        assert_eq!(table.get(2).unwrap(), Value::Number(20.0));
    }

    #[test]
    fn test_mint_on_empty_stack() {
        let sandbox = LuaSandbox::new(0).unwrap();
        let err = TableRef::from_stack_top(&sandbox).unwrap_err();
        assert_eq!(err, SandboxError::Runtime("empty stack or registry exhausted".into()));
    }

    #[test]
    fn test_mint_rejects_non_tables() {
        let sandbox = LuaSandbox::new(0).unwrap();
        sandbox.push(1).unwrap();
        assert!(TableRef::from_stack_top(&sandbox).unwrap_err().is_type_mismatch());
        assert_eq!(sandbox.stack_depth(), 1);
    }

    #[test]
    fn test_nested_get_returns_reference() {
        let (sandbox, table) = table("return {inner = {x = 5}}");
        let inner = table.get("inner").unwrap();
        let inner = inner.as_table().unwrap();

        assert_eq!(inner.get("x").unwrap(), Value::Number(5.0));
        assert!(!inner.same_table(&table));
        assert_eq!(sandbox.stack_depth(), 0);
    }

    #[test]
    fn test_get_copied() {
        let (_sandbox, table) = table("return {inner = {x = 5}}");
        let inner = table.get_copied("inner").unwrap();
        let map = inner.as_map().unwrap();
        assert_eq!(map.get(&MapKey::from("x")), Some(&Value::Number(5.0)));
    }

    #[test]
    fn test_index_metamethod_error_is_runtime() {
        let sandbox = LuaSandbox::with_config(
            crate::sandbox::config::SandboxConfig::builder()
                .libraries(crate::sandbox::config::StdLib::BASE)
                .build(),
        )
        .unwrap();
        sandbox
            .load_text("return setmetatable({}, {__index = function() error('no such key') end})")
            .unwrap();
        sandbox.call(0, 1, 0).unwrap();
        let table = TableRef::from_stack_top(&sandbox).unwrap();

        let err = table.get("anything").unwrap_err();
        assert!(err.is_runtime());
        assert!(err.message().contains("no such key"));
        assert_eq!(sandbox.stack_depth(), 0);
    }

    #[test]
    fn test_same_table_across_keys() {
        let sandbox = LuaSandbox::new(0).unwrap();
        sandbox.load_text("local t = {}; return t, t, {}").unwrap();
        sandbox.call(0, 3, 0).unwrap();

        let other = TableRef::from_stack_top(&sandbox).unwrap();
        let second = TableRef::from_stack_top(&sandbox).unwrap();
        let first = TableRef::from_stack_top(&sandbox).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_ne!(first.to_string(), second.to_string());
        assert!(first.to_string().starts_with("table: ref "));
    }

    #[test]
    fn test_handle_keeps_sandbox_alive() {
        let (sandbox, table) = table("return {'kept'}");
        drop(sandbox);
        assert_eq!(table.get(1).unwrap(), Value::from("kept"));
        assert_eq!(table.sandbox().stack_depth(), 0);
    }
}
