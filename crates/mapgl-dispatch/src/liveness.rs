//! Best-effort liveness probe for native renderer objects.
//!
//! Renderer and backend objects constructed on one thread are invoked
//! from another after a context switch. If such an object has already
//! been torn down, the first dereference of its dispatch table is a
//! native crash that no API contract can catch. This module reads the
//! object's first machine word (its dispatch-table pointer) and checks
//! that (a) the word's page is mapped and readable, and (b) the first
//! few table entries point into executable pages.
//!
//! This is a heuristic, not a proof of validity. It catches the common
//! failure (dereferencing a destroyed or not-yet-constructed object);
//! it is never a substitute for correct ownership discipline.

use std::ffi::c_void;

/// Number of leading dispatch-table entries checked for executability.
const PROBED_ENTRIES: usize = 4;

/// Policy applied when the probe fails, from `MAPGL_VPTR_GUARD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Probe disabled entirely.
    Off,
    /// Log a diagnostic and render anyway (default).
    Warn,
    /// Skip the frame when the probe fails.
    Strict,
}

impl GuardMode {
    /// Parse an environment value: `0/false/off/no` disables,
    /// `2/strict` is strict, anything else (including unset) warns.
    pub fn parse(value: Option<&str>) -> Self {
        let Some(v) = value else {
            return GuardMode::Warn;
        };
        match v.to_ascii_lowercase().as_str() {
            "0" | "false" | "off" | "no" => GuardMode::Off,
            "2" | "strict" => GuardMode::Strict,
            _ => GuardMode::Warn,
        }
    }
}

/// Check whether `object` plausibly points at a live native object with
/// a dispatch table.
///
/// Returns `false` for null, for unmapped or unreadable memory, and
/// for tables whose leading entries do not point into executable
/// pages. On platforms without a page-query facility the probe is
/// permissive and only rejects null.
pub fn looks_valid(object: *const c_void) -> bool {
    if object.is_null() {
        return false;
    }
    if !page::is_readable(object) {
        return false;
    }

    // SAFETY: the page backing `object` was just confirmed readable;
    // a word-sized read cannot fault within one query granule.
    let table = unsafe { *(object as *const *const c_void) };
    table_looks_valid(table)
}

/// Check a dispatch-table pointer directly (the object's first word).
pub fn table_looks_valid(table: *const c_void) -> bool {
    if table.is_null() || !page::is_readable(table) {
        return false;
    }
    let entries = table as *const *const c_void;
    for i in 0..PROBED_ENTRIES {
        // SAFETY: each entry address is checked readable before the read.
        let slot = unsafe { entries.add(i) };
        if !page::is_readable(slot as *const c_void) {
            return false;
        }
        let entry = unsafe { *slot };
        if !page::is_executable(entry) {
            return false;
        }
    }
    true
}

#[cfg(target_os = "windows")]
mod page {
    use super::*;
    use windows::Win32::System::Memory::{
        VirtualQuery, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE, PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_READONLY, PAGE_READWRITE,
        PAGE_WRITECOPY,
    };

    fn query(addr: *const c_void) -> Option<MEMORY_BASIC_INFORMATION> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(addr),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        (written == std::mem::size_of::<MEMORY_BASIC_INFORMATION>()).then_some(info)
    }

    pub(super) fn is_readable(addr: *const c_void) -> bool {
        let Some(info) = query(addr) else {
            return false;
        };
        // Mask off modifier bits (PAGE_GUARD etc.) before comparing.
        let prot = info.Protect.0 & 0xFF;
        [
            PAGE_READONLY.0,
            PAGE_READWRITE.0,
            PAGE_WRITECOPY.0,
            PAGE_EXECUTE_READ.0,
            PAGE_EXECUTE_READWRITE.0,
            PAGE_EXECUTE_WRITECOPY.0,
        ]
        .contains(&prot)
    }

    pub(super) fn is_executable(addr: *const c_void) -> bool {
        if addr.is_null() {
            return false;
        }
        let Some(info) = query(addr) else {
            return false;
        };
        let prot = info.Protect.0 & 0xFF;
        [
            PAGE_EXECUTE.0,
            PAGE_EXECUTE_READ.0,
            PAGE_EXECUTE_READWRITE.0,
            PAGE_EXECUTE_WRITECOPY.0,
        ]
        .contains(&prot)
    }
}

#[cfg(target_os = "linux")]
mod page {
    use super::*;
    use std::sync::RwLock;

    use once_cell::sync::Lazy;

    #[derive(Debug, Clone, Copy)]
    struct Region {
        start: usize,
        end: usize,
        read: bool,
        exec: bool,
    }

    /// Parsed `/proc/self/maps` regions. Mappings change as libraries
    /// load, so a lookup miss triggers one refresh before giving up.
    static REGIONS: Lazy<RwLock<Vec<Region>>> = Lazy::new(|| RwLock::new(read_maps()));

    fn read_maps() -> Vec<Region> {
        let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
            return Vec::new();
        };
        maps.lines().filter_map(parse_line).collect()
    }

    fn parse_line(line: &str) -> Option<Region> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        let (start, end) = range.split_once('-')?;
        Some(Region {
            start: usize::from_str_radix(start, 16).ok()?,
            end: usize::from_str_radix(end, 16).ok()?,
            read: perms.contains('r'),
            exec: perms.contains('x'),
        })
    }

    fn lookup(addr: usize) -> Option<Region> {
        let find = |regions: &[Region]| {
            regions
                .iter()
                .find(|r| r.start <= addr && addr < r.end)
                .copied()
        };
        if let Some(r) = find(&REGIONS.read().expect("maps lock poisoned")) {
            return Some(r);
        }
        let mut regions = REGIONS.write().expect("maps lock poisoned");
        *regions = read_maps();
        find(&regions)
    }

    pub(super) fn is_readable(addr: *const c_void) -> bool {
        lookup(addr as usize).is_some_and(|r| r.read)
    }

    pub(super) fn is_executable(addr: *const c_void) -> bool {
        !addr.is_null() && lookup(addr as usize).is_some_and(|r| r.exec)
    }
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
mod page {
    use super::*;

    // No portable page-query facility; stay permissive so the guard
    // never produces false skips.
    pub(super) fn is_readable(_addr: *const c_void) -> bool {
        true
    }

    pub(super) fn is_executable(addr: *const c_void) -> bool {
        !addr.is_null()
    }
}
