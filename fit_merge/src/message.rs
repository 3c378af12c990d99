//! Owned message model shared by the decoder, the merge pipeline and the sinks.
//!
//! Values are decoupled from `fitparser` so streams can be built by hand in tests
//! or supplied by another codec.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    FileId,
    Record,
    Lap,
    Session,
    /// Known to the FIT profile but passed through untouched.
    Other(String),
    /// Global message number absent from the profile registry.
    Unrecognized(u16),
}

impl MessageKind {
    pub fn is_recognized(&self) -> bool {
        !matches!(self, MessageKind::Unrecognized(_))
    }

    pub fn label(&self) -> String {
        match self {
            MessageKind::FileId => "file_id".to_string(),
            MessageKind::Record => "record".to_string(),
            MessageKind::Lap => "lap".to_string(),
            MessageKind::Session => "session".to_string(),
            MessageKind::Other(name) => name.clone(),
            MessageKind::Unrecognized(num) => format!("unknown_{}", num),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Timestamp(i64),
    Integer(i64),
    Float(f64),
    Text(String),
    Array(Vec<FieldValue>),
    Invalid,
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Array(values) => values.iter().find_map(FieldValue::as_f64),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Source tags arrive as profile names (`"garmin"`) or, for manufacturers the
    /// profile does not know, as raw numbers.
    pub fn as_tag(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Integer(v) => Some(v.to_string()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitField {
    pub name: String,
    pub number: u8,
    pub value: FieldValue,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub units: String,
}

impl FitField {
    pub fn new(name: &str, number: u8, value: FieldValue, units: &str) -> Self {
        Self {
            name: name.to_string(),
            number,
            value,
            units: units.to_string(),
        }
    }
}

/// Profile coordinates of a field the merge writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub number: u8,
    pub units: &'static str,
}

const fn spec(name: &'static str, number: u8, units: &'static str) -> FieldSpec {
    FieldSpec { name, number, units }
}

pub mod record {
    use super::{spec, FieldSpec};

    pub const TIMESTAMP: FieldSpec = spec("timestamp", 253, "s");
    pub const POSITION_LAT: FieldSpec = spec("position_lat", 0, "semicircles");
    pub const POSITION_LONG: FieldSpec = spec("position_long", 1, "semicircles");
    pub const ALTITUDE: FieldSpec = spec("altitude", 2, "m");
    pub const DISTANCE: FieldSpec = spec("distance", 5, "m");
    pub const SPEED: FieldSpec = spec("speed", 6, "m/s");
    pub const ENHANCED_SPEED: FieldSpec = spec("enhanced_speed", 73, "m/s");
    pub const ENHANCED_ALTITUDE: FieldSpec = spec("enhanced_altitude", 78, "m");
}

pub mod lap {
    use super::{spec, FieldSpec};

    pub const TOTAL_ELAPSED_TIME: FieldSpec = spec("total_elapsed_time", 7, "s");
    pub const TOTAL_TIMER_TIME: FieldSpec = spec("total_timer_time", 8, "s");
    pub const TOTAL_DISTANCE: FieldSpec = spec("total_distance", 9, "m");
    pub const AVG_SPEED: FieldSpec = spec("avg_speed", 13, "m/s");
    pub const MAX_SPEED: FieldSpec = spec("max_speed", 14, "m/s");
    pub const TOTAL_ASCENT: FieldSpec = spec("total_ascent", 21, "m");
    pub const TOTAL_DESCENT: FieldSpec = spec("total_descent", 22, "m");
    pub const SUB_SPORT: FieldSpec = spec("sub_sport", 39, "");
    pub const ENHANCED_AVG_SPEED: FieldSpec = spec("enhanced_avg_speed", 110, "m/s");
    pub const ENHANCED_MAX_SPEED: FieldSpec = spec("enhanced_max_speed", 111, "m/s");
}

pub mod session {
    use super::{spec, FieldSpec};

    pub const SUB_SPORT: FieldSpec = spec("sub_sport", 6, "");
    pub const TOTAL_ELAPSED_TIME: FieldSpec = spec("total_elapsed_time", 7, "s");
    pub const TOTAL_TIMER_TIME: FieldSpec = spec("total_timer_time", 8, "s");
    pub const TOTAL_DISTANCE: FieldSpec = spec("total_distance", 9, "m");
    pub const AVG_SPEED: FieldSpec = spec("avg_speed", 14, "m/s");
    pub const MAX_SPEED: FieldSpec = spec("max_speed", 15, "m/s");
    pub const TOTAL_ASCENT: FieldSpec = spec("total_ascent", 22, "m");
    pub const TOTAL_DESCENT: FieldSpec = spec("total_descent", 23, "m");
    pub const ENHANCED_AVG_SPEED: FieldSpec = spec("enhanced_avg_speed", 124, "m/s");
    pub const ENHANCED_MAX_SPEED: FieldSpec = spec("enhanced_max_speed", 125, "m/s");
}

pub mod file_id {
    use super::{spec, FieldSpec};

    pub const MANUFACTURER: FieldSpec = spec("manufacturer", 1, "");
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitMessage {
    pub kind: MessageKind,
    pub fields: Vec<FitField>,
}

impl FitMessage {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, spec: FieldSpec, value: FieldValue) -> Self {
        self.set_field(spec, value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn f64_field(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(FieldValue::as_f64)
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.field(record::TIMESTAMP.name)
            .and_then(FieldValue::as_timestamp)
    }

    /// Replace the value of `spec`, appending the field when the message lacks it.
    pub fn set_field(&mut self, spec: FieldSpec, value: FieldValue) {
        match self.fields.iter_mut().find(|f| f.name == spec.name) {
            Some(existing) => existing.value = value,
            None => self
                .fields
                .push(FitField::new(spec.name, spec.number, value, spec.units)),
        }
    }

    pub fn set_f64(&mut self, spec: FieldSpec, value: f64) {
        self.set_field(spec, FieldValue::Float(value));
    }
}

/// Structural description of a message layout, forwarded ahead of its data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageDefinition {
    pub kind: MessageKind,
    pub local_number: u8,
    pub field_numbers: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Definition(MessageDefinition),
    Data(FitMessage),
}

impl StreamEvent {
    pub fn kind(&self) -> &MessageKind {
        match self {
            StreamEvent::Definition(def) => &def.kind,
            StreamEvent::Data(msg) => &msg.kind,
        }
    }

    pub fn as_message(&self) -> Option<&FitMessage> {
        match self {
            StreamEvent::Data(msg) => Some(msg),
            StreamEvent::Definition(_) => None,
        }
    }
}
