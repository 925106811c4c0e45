pub mod mover;
pub mod orchestrator;
pub mod sql;
pub mod store;
