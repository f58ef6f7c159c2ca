use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

use crate::addr::{CodeAddr, CodeOffset, CodeRange};
use crate::config::CodeCacheConfig;
use crate::error::{SrcDbError, SrcDbResult};
use crate::tc::CodeMap;

/// Alignment used by `emit` for translation bodies.
pub const CODE_ALIGN: usize = 16;

const MAX_CACHE_BYTES: usize = i32::MAX as usize;

/// Priority-ordered regions a translation may be spread across.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeArea {
    Main,
    Cold,
    Frozen,
}

impl CodeArea {
    pub const ALL: [CodeArea; 3] = [CodeArea::Main, CodeArea::Cold, CodeArea::Frozen];

    pub fn name(self) -> &'static str {
        match self {
            CodeArea::Main => "main",
            CodeArea::Cold => "cold",
            CodeArea::Frozen => "frozen",
        }
    }

    fn index(self) -> usize {
        match self {
            CodeArea::Main => 0,
            CodeArea::Cold => 1,
            CodeArea::Frozen => 2,
        }
    }
}

struct AreaAllocator {
    start: usize,
    size: usize,
    frontier: usize,
    // offset -> length, disjoint and never adjacent
    free: BTreeMap<usize, usize>,
}

impl AreaAllocator {
    fn new(start: usize, size: usize) -> Self {
        Self {
            start,
            size,
            frontier: start,
            free: BTreeMap::new(),
        }
    }

    fn end(&self) -> usize {
        self.start + self.size
    }

    fn alloc(&mut self, len: usize, align: usize) -> Option<usize> {
        if let Some(offset) = self.alloc_from_free_list(len, align) {
            return Some(offset);
        }
        let aligned = align_up(self.frontier, align);
        if aligned + len > self.end() {
            return None;
        }
        if aligned > self.frontier {
            let gap_start = self.frontier;
            self.frontier = aligned + len;
            self.release(gap_start, aligned - gap_start);
        } else {
            self.frontier = aligned + len;
        }
        Some(aligned)
    }

    fn alloc_from_free_list(&mut self, len: usize, align: usize) -> Option<usize> {
        let (block, block_len, aligned) = self.free.iter().find_map(|(&off, &block_len)| {
            let aligned = align_up(off, align);
            (aligned + len <= off + block_len).then_some((off, block_len, aligned))
        })?;
        self.free.remove(&block);
        if aligned > block {
            self.free.insert(block, aligned - block);
        }
        let tail = aligned + len;
        if tail < block + block_len {
            self.free.insert(tail, block + block_len - tail);
        }
        Some(aligned)
    }

    fn release(&mut self, offset: usize, len: usize) {
        assert!(
            offset >= self.start && offset + len <= self.frontier,
            "freed range {offset:#x}+{len:#x} lies outside the allocated part of its area"
        );
        let mut start = offset;
        let mut end = offset + len;

        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            assert!(prev + prev_len <= start, "double free at offset {start:#x}");
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some((&next, &next_len)) = self.free.range(start..).next() {
            assert!(next >= end, "double free at offset {next:#x}");
            if next == end {
                self.free.remove(&next);
                end = next + next_len;
            }
        }
        self.free.insert(start, end - start);
    }

    fn free_bytes(&self) -> usize {
        (self.end() - self.frontier) + self.free.values().sum::<usize>()
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The translation cache: one contiguous mapping carved into main, cold
/// and frozen areas.
pub struct CodeCache {
    region: CodeRegion,
    config: CodeCacheConfig,
    areas: Mutex<[AreaAllocator; 3]>,
}

impl CodeCache {
    pub fn new(config: CodeCacheConfig) -> SrcDbResult<Self> {
        let total = config.total_size();
        if total > MAX_CACHE_BYTES {
            return Err(SrcDbError::CodeCacheTooLarge {
                requested: total,
                limit: MAX_CACHE_BYTES,
            });
        }
        if total == 0 {
            return Err(SrcDbError::CodeMapping(
                "cannot map an empty code cache".to_string(),
            ));
        }
        let region = CodeRegion::map(total, config.executable)?;
        let areas = [
            AreaAllocator::new(0, config.main_size),
            AreaAllocator::new(config.main_size, config.cold_size),
            AreaAllocator::new(config.main_size + config.cold_size, config.frozen_size),
        ];
        debug!(
            "mapped code cache at {} ({} bytes, main={} cold={} frozen={}, executable={})",
            CodeAddr::from_ptr(region.ptr),
            total,
            config.main_size,
            config.cold_size,
            config.frozen_size,
            config.executable
        );
        Ok(Self {
            region,
            config,
            areas: Mutex::new(areas),
        })
    }

    pub fn config(&self) -> &CodeCacheConfig {
        &self.config
    }

    pub fn base(&self) -> CodeAddr {
        CodeAddr::from_ptr(self.region.ptr)
    }

    pub fn capacity(&self) -> usize {
        self.region.len
    }

    pub fn area_range(&self, area: CodeArea) -> CodeRange {
        let areas = self.lock();
        let alloc = &areas[area.index()];
        CodeRange::new(self.base().add(alloc.start), alloc.size)
    }

    pub fn area_of(&self, addr: CodeAddr) -> Option<CodeArea> {
        CodeArea::ALL
            .into_iter()
            .find(|&area| self.area_range(area).contains(addr))
    }

    pub fn frontier(&self, area: CodeArea) -> CodeAddr {
        let areas = self.lock();
        self.base().add(areas[area.index()].frontier)
    }

    pub fn free_bytes(&self, area: CodeArea) -> usize {
        self.lock()[area.index()].free_bytes()
    }

    /// Reserves `len` bytes in `area`, preferring space returned by `free`.
    pub fn alloc(&self, area: CodeArea, len: usize, align: usize) -> SrcDbResult<CodeRange> {
        assert!(
            align.is_power_of_two() && align <= page_size(),
            "unsupported code alignment {align}"
        );
        let mut areas = self.lock();
        let offset = areas[area.index()]
            .alloc(len.max(1), align)
            .ok_or(SrcDbError::CodeCacheFull {
                area,
                requested: len,
            })?;
        Ok(CodeRange::new(self.base().add(offset), len))
    }

    /// Returns a range to its area for reuse. The caller guarantees nothing
    /// can still execute or patch inside it.
    pub fn free(&self, range: CodeRange) {
        if range.is_empty() {
            return;
        }
        let area = self
            .area_of(range.start)
            .unwrap_or_else(|| panic!("freed range at {} is outside the code cache", range.start));
        let offset = range.start.distance_from(self.base());
        self.lock()[area.index()].release(offset, range.len);
    }

    pub fn emit(&self, area: CodeArea, bytes: &[u8]) -> SrcDbResult<CodeRange> {
        self.emit_aligned(area, bytes, CODE_ALIGN)
    }

    /// Allocates fresh space and copies `bytes` into it. Nothing else can
    /// reference the new range yet, so a plain copy suffices.
    pub fn emit_aligned(
        &self,
        area: CodeArea,
        bytes: &[u8],
        align: usize,
    ) -> SrcDbResult<CodeRange> {
        let range = self.alloc(area, bytes.len(), align)?;
        // SAFETY: `range` was just carved out of the mapping and is not yet
        // reachable from any branch site or other thread.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), range.start.as_ptr(), bytes.len());
        }
        Ok(range)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [AreaAllocator; 3]> {
        self.areas.lock().expect("code cache lock poisoned")
    }
}

impl CodeMap for CodeCache {
    fn offset_to_addr(&self, offset: CodeOffset) -> CodeAddr {
        self.base().add(offset.0 as usize)
    }

    fn addr_to_offset(&self, addr: CodeAddr) -> CodeOffset {
        assert!(
            self.is_valid_code_address(addr),
            "{addr} is not inside the code cache"
        );
        CodeOffset(addr.distance_from(self.base()) as u32)
    }

    fn is_valid_code_address(&self, addr: CodeAddr) -> bool {
        CodeRange::new(self.base(), self.capacity()).contains(addr)
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("base", &self.base())
            .field("capacity", &self.capacity())
            .field("config", &self.config)
            .finish()
    }
}

struct CodeRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is fixed for the region's lifetime. Allocation state
// is behind a mutex and live code is only rewritten through atomics.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    fn map(len: usize, executable: bool) -> SrcDbResult<Self> {
        let ptr = map_code_region(len, executable)?;
        Ok(Self { ptr, len })
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        let _ = unmap_code_region(self.ptr, self.len);
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

#[cfg(windows)]
fn page_size() -> usize {
    4096
}

#[cfg(unix)]
fn map_code_region(len: usize, executable: bool) -> SrcDbResult<*mut u8> {
    let mut prot = libc::PROT_READ | libc::PROT_WRITE;
    if executable {
        prot |= libc::PROT_EXEC;
    }
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(SrcDbError::CodeMapping(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn unmap_code_region(ptr: *mut u8, len: usize) -> SrcDbResult<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(SrcDbError::CodeMapping(format!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(windows)]
fn map_code_region(len: usize, executable: bool) -> SrcDbResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE, VirtualAlloc,
    };

    let protect = if executable {
        PAGE_EXECUTE_READWRITE
    } else {
        PAGE_READWRITE
    };
    let ptr = unsafe {
        VirtualAlloc(std::ptr::null_mut(), len, MEM_COMMIT | MEM_RESERVE, protect) as *mut u8
    };
    if ptr.is_null() {
        return Err(SrcDbError::CodeMapping(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(windows)]
fn unmap_code_region(ptr: *mut u8, _len: usize) -> SrcDbResult<()> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return Ok(());
    }
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(SrcDbError::CodeMapping(format!(
            "VirtualFree failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
