#![forbid(unsafe_code)]

mod lock;
mod store;

pub use lock::{FileLock, LockError, LockGuard};
pub use store::*;
