//! Remote Update Protocol
//!
//! Decodes inbound update requests, applies them to the parameter registry and
//! encodes the acknowledgment.
//!
//! # Message Flow
//!
//! ```text
//! Received ──decode ok──► Decoded ──► Applying ──► Acknowledged (updated | failed)
//!     │
//!     └──decode fails──► Dropped (no acknowledgment)
//! ```
//!
//! # Wire Format
//!
//! ```text
//! request: { "id": "<string>", "parameters": { "<name>": <int|float|bool|string>, ... },
//!            "Device": "<name>" (optional) }
//! ack:     { "id": "<string>", "Device": "<deviceName>", "status": "updated" | "failed" }
//! ```
//!
//! # Apply Policy
//!
//! Fields are applied one by one in document order. Unknown names are skipped.
//! The first field that fails is restored to its previous value and ends the
//! request with status `failed`; fields before it stay applied (partial apply),
//! fields after it are never touched.

use crate::parameters::registry::{ApplyError, ParameterRegistry};
use crate::parameters::storage::PersistentStore;
use crate::parameters::value::{ParamKind, ParamString, ParamValue};
use crate::{log_debug, log_warn};
use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use serde::de::{self, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

/// Raw value from the wire, before conversion to a parameter type
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// null, array or object
    Unsupported,
}

impl WireValue {
    /// Convert to a value of `kind`
    ///
    /// - Int accepts integers in i32 range
    /// - Float and Double accept any number (Float rejects f32 overflow)
    /// - Bool accepts booleans only
    /// - Str accepts strings of at most 63 bytes
    pub fn coerce(&self, kind: ParamKind) -> Option<ParamValue> {
        match (kind, self) {
            (ParamKind::Int, WireValue::Int(v)) => i32::try_from(*v).ok().map(ParamValue::Int),
            (ParamKind::Float, WireValue::Int(v)) => Some(ParamValue::Float(*v as f32)),
            (ParamKind::Float, WireValue::Float(v)) => {
                let narrowed = *v as f32;
                narrowed.is_finite().then_some(ParamValue::Float(narrowed))
            }
            (ParamKind::Double, WireValue::Int(v)) => Some(ParamValue::Double(*v as f64)),
            (ParamKind::Double, WireValue::Float(v)) => Some(ParamValue::Double(*v)),
            (ParamKind::Bool, WireValue::Bool(v)) => Some(ParamValue::Bool(*v)),
            (ParamKind::Str, WireValue::Str(s)) => {
                ParamString::try_from(s.as_str()).ok().map(ParamValue::Str)
            }
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct WireValueVisitor;

        impl<'de> Visitor<'de> for WireValueVisitor {
            type Value = WireValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON value")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<WireValue, E> {
                Ok(WireValue::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<WireValue, E> {
                Ok(WireValue::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<WireValue, E> {
                Ok(i64::try_from(v)
                    .map(WireValue::Int)
                    .unwrap_or(WireValue::Float(v as f64)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<WireValue, E> {
                Ok(WireValue::Float(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<WireValue, E> {
                Ok(WireValue::Str(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<WireValue, E> {
                Ok(WireValue::Str(v))
            }

            fn visit_unit<E: de::Error>(self) -> Result<WireValue, E> {
                Ok(WireValue::Unsupported)
            }

            fn visit_none<E: de::Error>(self) -> Result<WireValue, E> {
                Ok(WireValue::Unsupported)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<WireValue, A::Error> {
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(WireValue::Unsupported)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<WireValue, A::Error> {
                while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
                Ok(WireValue::Unsupported)
            }
        }

        deserializer.deserialize_any(WireValueVisitor)
    }
}

/// Parameters object as (name, value) pairs in document order
fn ordered_fields<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<(String, WireValue)>, D::Error> {
    struct FieldsVisitor;

    impl<'de> Visitor<'de> for FieldsVisitor {
        type Value = Vec<(String, WireValue)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of parameter names to values")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut fields = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, WireValue>()? {
                fields.push(entry);
            }
            Ok(fields)
        }
    }

    deserializer.deserialize_map(FieldsVisitor)
}

/// Decoded update request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateRequest {
    pub id: String,
    /// Target device; present when the request crossed a shared medium (LoRa)
    #[serde(rename = "Device", default)]
    pub device: Option<String>,
    #[serde(rename = "parameters", deserialize_with = "ordered_fields")]
    pub fields: Vec<(String, WireValue)>,
}

impl UpdateRequest {
    /// Whether this request is meant for `device`
    pub fn addresses(&self, device: &str) -> bool {
        self.device.as_deref().is_none_or(|target| target == device)
    }
}

/// Why an inbound message could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// Not valid JSON
    Syntax,
    /// Valid JSON, but no string `id` or no `parameters` object
    Shape,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Syntax => write!(f, "malformed JSON"),
            DecodeError::Shape => write!(f, "missing or invalid id/parameters"),
        }
    }
}

/// Decode an inbound update message
pub fn decode(payload: &[u8]) -> Result<UpdateRequest, DecodeError> {
    serde_json::from_slice(payload).map_err(|e| {
        if e.is_data() {
            DecodeError::Shape
        } else {
            DecodeError::Syntax
        }
    })
}

/// Final status of an update request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateStatus {
    Updated,
    Failed,
}

/// Acknowledgment sent for every decoded request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateResult<'a> {
    pub id: &'a str,
    #[serde(rename = "Device")]
    pub device: &'a str,
    pub status: UpdateStatus,
}

impl UpdateResult<'_> {
    /// JSON bytes for the confirmation channel
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// The field that ended a failed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFailure {
    pub name: String,
    pub error: ApplyError,
}

/// What applying a request did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub status: UpdateStatus,
    /// Fields committed to memory and store
    pub applied: usize,
    /// Unknown names passed over
    pub skipped: usize,
    pub failure: Option<FieldFailure>,
}

/// Apply `request` to `registry` in document order
///
/// Stops at the first failing field after restoring its previous value.
pub fn apply<S: PersistentStore>(
    registry: &mut ParameterRegistry<S>,
    request: &UpdateRequest,
) -> ApplyReport {
    let mut report = ApplyReport {
        status: UpdateStatus::Updated,
        applied: 0,
        skipped: 0,
        failure: None,
    };

    for (name, raw) in &request.fields {
        let Some(snapshot) = registry.value(name).cloned() else {
            log_debug!("Update {}: skipping unknown parameter {}", request.id.as_str(), name.as_str());
            report.skipped += 1;
            continue;
        };

        if let Err(error) = registry.apply_typed(name, raw) {
            registry.restore(name, snapshot);
            log_warn!(
                "Update {}: parameter {} rejected: {}",
                request.id.as_str(),
                name.as_str(),
                error
            );
            report.status = UpdateStatus::Failed;
            report.failure = Some(FieldFailure {
                name: name.clone(),
                error,
            });
            break;
        }
        report.applied += 1;
    }

    report
}

/// Why an inbound message produced no acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DropReason {
    Malformed(DecodeError),
    /// Addressed to another device
    NotAddressed,
}

/// End state of one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InboundOutcome {
    Dropped(DropReason),
    /// Request processed; `ack_sent` is false if the acknowledgment could not be delivered
    Acknowledged { status: UpdateStatus, ack_sent: bool },
}
