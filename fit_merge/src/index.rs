use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::message::{file_id, record, FitMessage, MessageKind, StreamEvent};
use crate::{MergeError, StreamRole};

/// One simulator reading. Position is kept in the units the codec reports.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub altitude: f64,
    pub distance: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
}

impl Sample {
    /// `None` unless all five fields are present and numeric.
    pub fn from_record(msg: &FitMessage) -> Option<Self> {
        Some(Self {
            altitude: msg
                .f64_field(record::ALTITUDE.name)
                .or_else(|| msg.f64_field(record::ENHANCED_ALTITUDE.name))?,
            distance: msg.f64_field(record::DISTANCE.name)?,
            latitude: msg.f64_field(record::POSITION_LAT.name)?,
            longitude: msg.f64_field(record::POSITION_LONG.name)?,
            speed: msg
                .f64_field(record::SPEED.name)
                .or_else(|| msg.f64_field(record::ENHANCED_SPEED.name))?,
        })
    }
}

/// Checks the declared source of a stream's identity message.
#[derive(Clone, Debug)]
pub struct SourceAuthenticator {
    role: StreamRole,
    expected: String,
    require_tag: bool,
}

impl SourceAuthenticator {
    pub fn new(role: StreamRole, expected: &str) -> Self {
        Self {
            role,
            expected: expected.to_string(),
            require_tag: false,
        }
    }

    /// Treat an identity message without a source tag as a mismatch.
    pub fn require_tag(mut self, require: bool) -> Self {
        self.require_tag = require;
        self
    }

    pub fn check(&self, identity: &FitMessage) -> Result<(), MergeError> {
        let declared = identity
            .field(file_id::MANUFACTURER.name)
            .and_then(|v| v.as_tag());
        match declared {
            Some(tag) if tag.eq_ignore_ascii_case(&self.expected) => Ok(()),
            Some(tag) => Err(self.mismatch(tag)),
            None if self.require_tag => Err(self.mismatch("<none>".to_string())),
            None => Ok(()),
        }
    }

    fn mismatch(&self, found: String) -> MergeError {
        MergeError::SourceMismatch {
            stream: self.role,
            expected: self.expected.clone(),
            found,
        }
    }
}

/// Simulator samples keyed by unix timestamp in seconds.
#[derive(Clone, Debug, Default)]
pub struct SampleIndex {
    samples: HashMap<i64, Sample>,
    skipped: usize,
}

impl SampleIndex {
    /// Consume the whole secondary stream. Records lacking any sample field (or a
    /// timestamp) are skipped; a repeated timestamp keeps the later sample.
    pub fn build<I>(events: I, expected_source: &str) -> Result<Self, MergeError>
    where
        I: IntoIterator<Item = Result<StreamEvent, MergeError>>,
    {
        let auth = SourceAuthenticator::new(StreamRole::Secondary, expected_source);
        let mut index = SampleIndex::default();
        for event in events {
            let msg = match event? {
                StreamEvent::Data(msg) => msg,
                StreamEvent::Definition(_) => continue,
            };
            match msg.kind {
                MessageKind::FileId => auth.check(&msg)?,
                MessageKind::Record => index.absorb(&msg),
                _ => {}
            }
        }
        info!(
            "indexed {} secondary samples ({} incomplete records skipped)",
            index.len(),
            index.skipped
        );
        Ok(index)
    }

    fn absorb(&mut self, msg: &FitMessage) {
        match (msg.timestamp(), Sample::from_record(msg)) {
            (Some(t), Some(sample)) => {
                if self.samples.insert(t, sample).is_some() {
                    debug!("secondary timestamp {} repeated, keeping later sample", t);
                }
            }
            _ => self.skipped += 1,
        }
    }

    pub fn get(&self, timestamp: i64) -> Option<&Sample> {
        self.samples.get(&timestamp)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}
