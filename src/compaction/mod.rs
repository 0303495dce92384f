// compaction/mod.rs
// Two-tier compaction: leaf summaries over raw messages, condensed summaries
// over leaves. See spec §4.4.

pub mod engine;
pub mod summarizer;

pub use engine::{CompactDetail, CompactOutcome, CompactParams, CompactResult, CompactionEngine, CompactionTarget};
pub use summarizer::{
    FailingSummarizer, FixedSummarizer, SummarizeInput, SummarizeRequest, SummarizeResponse, Summarizer,
    SummarizerFailure, SummarizerFailureKind,
};
