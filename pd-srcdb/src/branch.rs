use crate::addr::CodeAddr;
use crate::smash;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BranchKind {
    /// Unconditional `jmp rel32`.
    Jmp,
    /// Conditional `jcc rel32`.
    Jcc,
    /// Code pointer slot read by an indirect jump.
    Addr,
}

/// One control transfer in generated code that is currently aimed at some
/// source location. Identity is the address being smashed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BranchSite {
    kind: BranchKind,
    to_smash: CodeAddr,
}

impl BranchSite {
    /// # Safety
    /// `to_smash` must be a smashable instruction (or pointer-aligned slot)
    /// of `kind`, laid out as in [`crate::smash`], that stays mapped for as
    /// long as this site is patched or read.
    pub unsafe fn new(kind: BranchKind, to_smash: CodeAddr) -> Self {
        Self { kind, to_smash }
    }

    pub fn kind(&self) -> BranchKind {
        self.kind
    }

    pub fn to_smash(&self) -> CodeAddr {
        self.to_smash
    }

    /// Atomically redirects the site to `dest`.
    pub fn patch(&self, dest: CodeAddr) {
        // SAFETY: upheld by the contract of `BranchSite::new`.
        unsafe {
            match self.kind {
                BranchKind::Jmp => smash::smash_jmp(self.to_smash, dest),
                BranchKind::Jcc => smash::smash_jcc(self.to_smash, dest),
                BranchKind::Addr => smash::smash_addr(self.to_smash, dest),
            }
        }
    }

    /// Current destination of the site.
    pub fn target(&self) -> CodeAddr {
        // SAFETY: upheld by the contract of `BranchSite::new`.
        unsafe {
            match self.kind {
                BranchKind::Jmp => smash::smashable_jmp_target(self.to_smash),
                BranchKind::Jcc => smash::smashable_jcc_target(self.to_smash),
                BranchKind::Addr => smash::smashable_addr_target(self.to_smash),
            }
        }
    }
}
