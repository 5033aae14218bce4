//! Host memory plumbing: memfd-backed mappings and the executable
//! code pool that turns emitted bytes into stable [`HostCode`]
//! addresses.
//!
//! [`HostCode`]: xlat_core::HostCode

pub mod code_pool;
pub mod mmap;

pub use code_pool::CodePool;
pub use mmap::{MappedRegion, Memfd};
