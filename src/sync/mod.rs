pub mod binary;
pub mod rest;
pub mod supervisor;

pub use rest::SyncEndpoint;
pub use supervisor::{SyncMode, SyncSupervisor};
