//! # ClassCall Diagnostics
//!
//! Connection-health diagnostics for classroom calls.
//! Records what happened during a call's first seconds, classifies it into a
//! [`Verdict`], and sets up structured logging.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod aggregator;
pub mod connection_analyzer;
pub mod debug_logger;
pub mod snapshot;

// Re-export main types
pub use aggregator::{
    DiagnosticEvent, DiagnosticsAggregator, DiagnosticsSink, TracingSink, DEFAULT_WINDOW,
    PLAYBACK_GRACE,
};
pub use connection_analyzer::{classify, Verdict};
pub use debug_logger::{init_logging, DEFAULT_FILTER};
pub use snapshot::DiagnosticSnapshot;
