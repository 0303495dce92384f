// lib.rs
// Lossless Context Management (LCM) engine: a lineage-tracked conversation
// store, two-tier compaction pipeline, and bounded retrieval layer for chat
// agents. See `SPEC_FULL.md` for the full component breakdown; each module
// below corresponds to one of its numbered components.

#![allow(clippy::collapsible_if)]
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod assembler;
pub mod compaction;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod integrity;
pub mod model;
pub mod retrieval;
pub mod store;

pub use config::LcmConfig;
pub use engine::{ContextEngine, LcmEngine};
pub use error::{LcmError, Result};
