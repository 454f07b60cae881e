//! OS backends for shared areas

pub mod posix;
pub mod xsi;

pub use posix::{PosixAreaLock, PosixSharedMemory};
pub use xsi::{XsiAreaLock, XsiSharedMemory};
