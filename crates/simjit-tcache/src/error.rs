use thiserror::Error;

use crate::GuestAddr;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the translation cache.
///
/// Apart from [`CacheError::BuilderFull`] every variant describes a sizing mistake or a broken
/// internal invariant. Embeddings are expected to route them to their fatal-exit path instead of
/// continuing with a possibly corrupt cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("invalid translation cache config: {0}")]
    InvalidConfig(&'static str),

    #[error("translation block pool exhausted ({capacity} slots)")]
    PoolExhausted { capacity: usize },

    #[error("translation index deeper than {depth} levels while searching for {key:#010x}")]
    IndexTooDeep { key: GuestAddr, depth: usize },

    #[error("invalid build record for {key:#010x}: {reason}")]
    InvalidBuild { key: GuestAddr, reason: &'static str },

    #[error("block builder full after {max} instructions")]
    BuilderFull { max: usize },

    #[error("dangling backreference: block {owner:#010x} -> {target:#010x}")]
    DanglingBackref { owner: GuestAddr, target: GuestAddr },

    #[error("corrupt link in block {key:#010x}: {reason}")]
    CorruptLink { key: GuestAddr, reason: &'static str },

    #[error("cannot break block {key:#010x} at host address {host_addr:#x}")]
    BreakFailed { key: GuestAddr, host_addr: u64 },

    #[error("code still marked in {lo:#010x}..{hi:#010x} after invalidation")]
    StaleProtection { lo: GuestAddr, hi: GuestAddr },
}
