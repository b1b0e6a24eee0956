pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod property;
pub mod session;
