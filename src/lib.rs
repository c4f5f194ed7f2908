//! CDMS Monitor - command-line front-end for the CDMS read-out pipeline
//!
//! This library re-exports the pipeline from `cdms-core` and adds the
//! persistent configuration used by the `cdms-monitor` binary.

pub mod config;

pub use cdms_core::analysis;
pub use cdms_core::pipeline;
pub use cdms_core::source;
pub use cdms_core::stats;

pub use cdms_core::{
    EventClass, EventResult, Pipeline, PipelineError, PipelineOptions, PipelineState, Snapshot,
    SourceConfig, SourceKind, StatusEvent,
};
pub use cdms_core::{BUILD_DATE, EVENT_LOG_CAPACITY, VERSION};
