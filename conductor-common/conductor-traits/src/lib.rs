pub mod filter;
pub mod storage;

pub use filter::{Condition, Filter};
pub use storage::{EntityKind, Store, StoreError, StoreExt, StoreResult};
