pub mod addr;
pub mod branch;
pub mod code_cache;
pub mod config;
pub mod error;
pub mod smash;
pub mod srcdb;
pub mod srcrec;
pub mod tc;
pub mod trans_loc;
pub mod treadmill;

pub use addr::{CodeAddr, CodeOffset, CodeRange};
pub use branch::{BranchKind, BranchSite};
pub use code_cache::{CODE_ALIGN, CodeArea, CodeCache};
pub use config::{CodeCacheConfig, SrcDbConfig};
pub use error::{SrcDbError, SrcDbResult};
pub use smash::{ConditionCode, emit_smashable_addr, emit_smashable_jcc, emit_smashable_jmp};
pub use srcdb::{JumpIndex, SrcDb, SrcKey};
pub use srcrec::SrcRec;
pub use tc::{CodeMap, JumpRecorder, TcServices, TranslationReclaimer};
pub use trans_loc::TransLoc;
pub use treadmill::{RequestGuard, Treadmill, TreadmillReclaimer};
