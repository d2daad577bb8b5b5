//! Fact log implementation.
//!
//! Facts are stored in an append-only file of checksummed frames. The
//! in-memory index is rebuilt from the file on open and maps ids,
//! serials and unique identifiers to frame offsets.

mod file;
mod index;

pub use file::{FactLog, RecoveredFrame};
pub use index::{FactIndex, IndexEntry};
