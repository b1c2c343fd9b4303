//! Durable home of work items and their processing markers.
//!
//! Workers coordinate only through this store. The claim is a single
//! conditional update, so it holds across processes, not just tasks.

pub mod error;
pub mod memory;
pub mod postgres;
#[cfg(feature = "test-utils")]
pub mod testutil;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryWorkStore;
pub use postgres::PgWorkStore;
pub use traits::{RequeueScope, WorkStore};
