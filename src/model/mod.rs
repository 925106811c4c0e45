pub mod job;
pub mod policy;
