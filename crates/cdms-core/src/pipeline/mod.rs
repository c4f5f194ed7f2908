//! Pipeline wiring: status channel, worker threads, and the coordinator

pub mod coordinator;
pub mod status;
pub mod workers;
