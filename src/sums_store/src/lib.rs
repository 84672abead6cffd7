pub mod alloc_engine;
pub mod dates;
pub mod partition;
pub mod store_db;
pub mod undo;

pub use alloc_engine::*;
pub use partition::*;
pub use store_db::{DbHandle, SumsStoreDb};
pub use undo::*;
