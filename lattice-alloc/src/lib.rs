//! Façade over the jemalloc native allocator.
//!
//! Exposes C-like alloc/free over the embedded jemalloc together with the
//! telemetry the index layers feed into capacity planning: process-wide
//! resident/allocated/dirty counters, per-size-class fragmentation, heap
//! profiling toggles, and serialized stats dumps in text and JSON form.
//!
//! The crate also registers jemalloc as the Rust global allocator, so
//! structures that allocate through `std` draw from the same heap the façade
//! reports on.

mod bin_stats;
mod error;
mod mallctl;

pub use bin_stats::BinStats;
pub use error::AllocatorError;

use std::ffi::{CStr, CString};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use libc::{c_char, c_void};
use serde_json::Value;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Runtime options for the embedded jemalloc: two arenas keep the merged bin
/// statistics cheap to aggregate; profiling is compiled in but starts
/// inactive until [`Allocator::profile_activate`].
#[cfg(not(target_env = "msvc"))]
#[unsafe(export_name = "_rjem_malloc_conf")]
pub static MALLOC_CONF: &[u8; 38] = b"narenas:2,prof:true,prof_active:false\0";

/// Construction-time options for an [`Allocator`] handle.
pub struct AllocatorConfig {
    /// Count every façade `alloc`/`free` call in a pair of atomic counters,
    /// exported by [`Allocator::alloc_counts`] and prefixed to the text dump.
    pub debug_stats: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig { debug_stats: true }
    }
}

/// Handle to the process-wide native allocator.
///
/// The heap itself is global; the handle carries the debug counters and the
/// mutex that keeps stats dumps from interleaving in the native writer.
pub struct Allocator {
    debug_stats: bool,
    allocs: AtomicU64,
    frees: AtomicU64,
    dump_lock: Mutex<()>,
}

impl Allocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Allocator {
            debug_stats: config.debug_stats,
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            dump_lock: Mutex::new(()),
        }
    }

    /// Allocate at least `size` bytes, aligned for any scalar type.
    /// Contents are uninitialized. Returns null on exhaustion.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        if self.debug_stats {
            self.allocs.fetch_add(1, Ordering::Relaxed);
        }
        unsafe { tikv_jemalloc_sys::malloc(size) as *mut u8 }
    }

    /// Release a region previously returned by [`alloc`](Allocator::alloc).
    ///
    /// # Safety
    /// `ptr` must come from this allocator and must not be used afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if self.debug_stats {
            self.frees.fetch_add(1, Ordering::Relaxed);
        }
        unsafe { tikv_jemalloc_sys::free(ptr as *mut c_void) }
    }

    /// The allocator's real usable size for a live region (>= requested).
    ///
    /// # Safety
    /// `ptr` must point to a live region returned by [`alloc`](Allocator::alloc).
    pub unsafe fn size_at(&self, ptr: *mut u8) -> usize {
        unsafe { tikv_jemalloc_sys::malloc_usable_size(ptr as *const c_void) }
    }

    /// Bytes in physically resident pages mapped by the allocator.
    pub fn total_size(&self) -> usize {
        mallctl::advance_epoch();
        mallctl::read("stats.resident").unwrap_or(0)
    }

    /// Bytes actively allocated by the application.
    pub fn alloc_size(&self) -> usize {
        mallctl::advance_epoch();
        mallctl::read("stats.allocated").unwrap_or(0)
    }

    /// Bytes held in dirty pages not yet returned to the OS.
    pub fn dirty_size(&self) -> usize {
        mallctl::advance_epoch();
        let page: usize = mallctl::read("arenas.page").unwrap_or(0);
        let pdirty: usize = mallctl::read(&format!(
            "stats.arenas.{}.pdirty",
            bin_stats::MALLCTL_ARENAS_ALL
        ))
        .unwrap_or(0);
        pdirty * page
    }

    /// Force unused dirty pages back to the OS.
    pub fn release_to_os(&self) -> Result<(), AllocatorError> {
        let narenas: u32 = mallctl::read("arenas.narenas")?;
        mallctl::exec(&format!("arena.{narenas}.purge"))
    }

    /// Start collecting heap-profile data.
    pub fn profile_activate(&self) -> Result<(), AllocatorError> {
        mallctl::write("prof.active", true)
    }

    /// Stop collecting heap-profile data.
    pub fn profile_deactivate(&self) -> Result<(), AllocatorError> {
        mallctl::write("prof.active", false)
    }

    /// Snapshot the heap profile to `path`.
    pub fn profile_dump(&self, path: &str) -> Result<(), AllocatorError> {
        let cpath = CString::new(path)
            .map_err(|_| AllocatorError::invalid("profile dump path contains NUL"))?;
        // jemalloc reads the dump path out of a char* value.
        mallctl::write::<*const c_char>("prof.dump", cpath.as_ptr())
    }

    /// Debug counters: (allocs, frees). Zero unless `debug_stats` is set.
    pub fn alloc_counts(&self) -> (u64, u64) {
        (
            self.allocs.load(Ordering::Relaxed),
            self.frees.load(Ordering::Relaxed),
        )
    }

    /// Human-readable allocator statistics.
    pub fn stats_text(&self) -> String {
        let _dump = self.dump_lock.lock().unwrap();

        let mut out = String::from("---- Stats ----\n");
        if self.debug_stats {
            out.push_str(&format!(
                "Mallocs = {}\nFrees   = {}\n",
                self.allocs.load(Ordering::Relaxed),
                self.frees.load(Ordering::Relaxed),
            ));
        }
        out.push_str(&raw_stats(c""));
        out
    }

    /// Structured allocator statistics: jemalloc's JSON dump with the derived
    /// per-bin numbers injected under `bin_stats`. Falls back to the raw dump
    /// if it cannot be parsed.
    pub fn stats_json(&self) -> String {
        let _dump = self.dump_lock.lock().unwrap();

        let raw = raw_stats(c"J");
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(mut map)) => {
                let bins = serde_json::to_value(bin_stats::collect()).unwrap_or(Value::Null);
                map.insert("bin_stats".to_string(), bins);
                Value::Object(map).to_string()
            }
            _ => raw,
        }
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator::new(AllocatorConfig::default())
    }
}

unsafe extern "C" fn write_cb(opaque: *mut c_void, msg: *const c_char) {
    unsafe {
        let out = &mut *(opaque as *mut Vec<u8>);
        out.extend_from_slice(CStr::from_ptr(msg).to_bytes());
    }
}

/// Run the native stats writer into a Rust buffer.
fn raw_stats(opts: &CStr) -> String {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    unsafe {
        tikv_jemalloc_sys::malloc_stats_print(
            Some(write_cb),
            &mut buf as *mut Vec<u8> as *mut c_void,
            opts.as_ptr(),
        );
    }
    String::from_utf8_lossy(&buf).into_owned()
}
