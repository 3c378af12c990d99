//! Merge a device FIT recording with a simulator FIT recording of the same activity.
//!
//! The simulator stream is indexed by timestamp; device records with a matching
//! sample get their position, elevation, speed and distance rewritten, and lap and
//! session summaries are recomputed from the rewritten records.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod aggregate;
pub mod codec;
pub mod index;
pub mod message;
pub mod pipeline;

pub use aggregate::{
    average_speed, AggregationState, Disposition, LapSummary, RecordCorrelator, SessionSummary,
};
pub use codec::{decode_fit, fit_crc, JsonLinesSink, MemorySink, MessageSink};
pub use index::{Sample, SampleIndex, SourceAuthenticator};
pub use message::{FieldValue, FitField, FitMessage, MessageDefinition, MessageKind, StreamEvent};
pub use pipeline::{merge, MergePipeline, MergeReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    Primary,
    Secondary,
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRole::Primary => f.write_str("primary"),
            StreamRole::Secondary => f.write_str("secondary"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("{stream} stream declares source '{found}', expected '{expected}'")]
    SourceMismatch {
        stream: StreamRole,
        expected: String,
        found: String,
    },
    #[error("failed to read FIT stream: {0}")]
    StreamRead(String),
    #[error("failed to write merged stream: {0}")]
    StreamWrite(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeParams {
    pub primary_source: String,
    pub secondary_source: String,
    pub sub_sport: String,
    pub require_primary_source: bool,
}

impl Default for MergeParams {
    fn default() -> Self {
        Self {
            primary_source: "garmin".to_string(),
            secondary_source: "zwift".to_string(),
            sub_sport: "virtual_activity".to_string(),
            require_primary_source: false,
        }
    }
}

impl MergeParams {
    pub fn validate(&self) -> Result<(), MergeError> {
        if self.primary_source.trim().is_empty() {
            return Err(MergeError::InvalidParameter(
                "primary source tag is empty".into(),
            ));
        }
        if self.secondary_source.trim().is_empty() {
            return Err(MergeError::InvalidParameter(
                "secondary source tag is empty".into(),
            ));
        }
        if self.sub_sport.trim().is_empty() {
            return Err(MergeError::InvalidParameter("sub_sport is empty".into()));
        }
        Ok(())
    }
}
