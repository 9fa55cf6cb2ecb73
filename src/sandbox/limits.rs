//! Memory budget enforcement for the Lua interpreter.
//!
//! Every byte the interpreter owns passes through [`bounded_alloc`], the
//! allocation callback handed to `lua_newstate`. The callback consults a
//! [`MemoryBudget`] before growing any block and keeps its running total in
//! step with what was actually allocated.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::os::raw::c_void;
use std::ptr;

use mlua_sys as ffi;
use tracing::warn;

/// Alignment of every block handed to the interpreter.
const BLOCK_ALIGN: usize = ffi::SYS_MIN_ALIGN;

/// Byte accounting for one interpreter instance.
///
/// The budget is single-threaded (`Cell` based) because a sandbox and its
/// allocator are only ever driven from one thread at a time.
#[derive(Debug, Default)]
pub struct MemoryBudget {
    /// Ceiling in bytes; 0 means unlimited.
    limit: Cell<usize>,
    /// Bytes currently attributed to the interpreter.
    used: Cell<usize>,
    /// Highest value `used` has reached.
    peak: Cell<usize>,
    /// Number of growth requests refused.
    refused: Cell<u64>,
}

impl MemoryBudget {
    /// Create a budget with the given ceiling (0 for unlimited).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: Cell::new(limit),
            ..Self::default()
        }
    }

    /// The configured ceiling in bytes.
    pub fn limit(&self) -> usize {
        self.limit.get()
    }

    /// Change the ceiling. Takes effect on the next allocation request.
    pub fn set_limit(&self, limit: usize) {
        self.limit.set(limit);
    }

    /// Bytes currently attributed to the interpreter.
    pub fn used(&self) -> usize {
        self.used.get()
    }

    /// Get the peak memory usage (highest ever observed).
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    /// Number of growth requests the budget has refused.
    pub fn refused(&self) -> u64 {
        self.refused.get()
    }

    /// Check if any request has been refused.
    pub fn limit_exceeded(&self) -> bool {
        self.refused.get() > 0
    }

    /// Signed change in accounted bytes for a resize from `old` to `new`.
    ///
    /// `i128` holds the difference of any two `usize` values, so shrinking
    /// and freeing never wrap.
    fn delta(old: usize, new: usize) -> i128 {
        new as i128 - old as i128
    }

    /// Decide whether a resize from `old` to `new` bytes fits the budget.
    ///
    /// Shrinking and freeing are always admitted, even when the limit has
    /// been lowered below current usage. A refusal is counted but leaves
    /// `used` untouched.
    pub fn admit(&self, old: usize, new: usize) -> bool {
        let delta = Self::delta(old, new);
        let limit = self.limit.get();
        if delta <= 0 || limit == 0 {
            return true;
        }

        if self.used.get() as i128 + delta > limit as i128 {
            self.refused.set(self.refused.get() + 1);
            return false;
        }
        true
    }

    /// Record that a block went from `old` to `new` bytes.
    pub fn commit(&self, old: usize, new: usize) {
        let next = (self.used.get() as i128 + Self::delta(old, new)).max(0);
        let next = usize::try_from(next).unwrap_or(usize::MAX);
        self.used.set(next);
        if next > self.peak.get() {
            self.peak.set(next);
        }
    }
}

/// Allocation callback with the `lua_Alloc` shape.
///
/// `ud` must point to the [`MemoryBudget`] of the state being served, and
/// that budget must outlive the state.
///
/// When `ptr` is null, Lua 5.4 stores the type of the object being created in
/// `osize`, not a size; the effective old size is then zero.
pub(crate) unsafe extern "C-unwind" fn bounded_alloc(
    ud: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    // SAFETY: the sandbox registers its boxed budget as `ud` and closes the
    // state before dropping that box.
    let budget = unsafe { &*(ud as *const MemoryBudget) };
    let old = if ptr.is_null() { 0 } else { osize };

    if nsize == 0 {
        if !ptr.is_null() {
            // SAFETY: `ptr` was returned by this callback with size `old`.
            unsafe { alloc::dealloc(ptr as *mut u8, Layout::from_size_align_unchecked(old, BLOCK_ALIGN)) };
        }
        budget.commit(old, 0);
        return ptr::null_mut();
    }

    if !budget.admit(old, nsize) {
        warn!(
            requested = nsize,
            previous = old,
            used = budget.used(),
            limit = budget.limit(),
            "allocation refused by memory budget"
        );
        return ptr::null_mut();
    }

    let Ok(new_layout) = Layout::from_size_align(nsize, BLOCK_ALIGN) else {
        return ptr::null_mut();
    };

    let block = if ptr.is_null() {
        // SAFETY: `nsize` is non-zero.
        unsafe { alloc::alloc(new_layout) }
    } else {
        // SAFETY: `ptr` was returned by this callback with size `old`, and the
        // new size was validated against the same alignment.
        unsafe {
            alloc::realloc(
                ptr as *mut u8,
                Layout::from_size_align_unchecked(old, BLOCK_ALIGN),
                nsize,
            )
        }
    };

    // On failure the old block is still live and still accounted for.
    if !block.is_null() {
        budget.commit(old, nsize);
    }
    block as *mut c_void
}
