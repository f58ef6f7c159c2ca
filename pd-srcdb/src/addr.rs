use std::fmt;

/// Absolute address inside generated code (a "TCA").
///
/// Stored as an integer so records holding addresses stay `Send + Sync`;
/// dereferencing happens only inside the smash primitives.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeAddr(usize);

impl CodeAddr {
    pub const NULL: CodeAddr = CodeAddr(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn from_ptr(ptr: *const u8) -> Self {
        Self(ptr as usize)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Byte distance from `base` to `self`; `self` must not precede `base`.
    pub const fn distance_from(self, base: CodeAddr) -> usize {
        self.0 - base.0
    }

    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 % align == 0
    }
}

impl fmt::Debug for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Offset from the code cache base. Survives relocation of the cache mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeOffset(pub u32);

/// Half-open `[start, start + len)` span of code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CodeRange {
    pub start: CodeAddr,
    pub len: usize,
}

impl CodeRange {
    pub const fn new(start: CodeAddr, len: usize) -> Self {
        Self { start, len }
    }

    pub const fn empty() -> Self {
        Self {
            start: CodeAddr::NULL,
            len: 0,
        }
    }

    pub const fn end(&self) -> CodeAddr {
        self.start.add(self.len)
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: CodeAddr) -> bool {
        self.start <= addr && addr < self.end()
    }
}
