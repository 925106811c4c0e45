pub mod connection;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod postgres;
