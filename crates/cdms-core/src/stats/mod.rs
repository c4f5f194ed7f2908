//! Event statistics: counters, recent-event log, f0 histogram, rate

pub mod aggregator;
pub mod histogram;
pub mod rate;
