pub mod sync {
    pub use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
    pub use std::sync::Arc;
}

pub mod call;
pub mod error;
pub mod quiz;
pub mod rtc;
pub mod speech;
pub mod store;
