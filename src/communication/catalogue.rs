//! Catalogue broadcast
//!
//! A device announces itself and its current parameter values on the shared
//! registry route:
//!
//! ```text
//! {"Device":"pump-7","Ip":"192.168.1.50","parameters":[{"threshold":"42"},{"mode":"auto"}]}
//! ```
//!
//! Values are sent in their text form. `Ip` is present only when known, and
//! HIDDEN parameters are left out.
//!
//! On transports with a bounded frame the catalogue goes out as several
//! documents, each carrying `Device` and a run of consecutive parameters.

use crate::log_warn;
use crate::parameters::registry::ParameterRegistry;
use crate::parameters::storage::PersistentStore;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// One `{"<name>": "<value>"}` element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueEntry {
    pub name: String,
    pub value: String,
}

impl Serialize for CatalogueEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.name, &self.value)?;
        map.end()
    }
}

/// Catalogue document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Catalogue<'a> {
    #[serde(rename = "Device")]
    pub device: &'a str,
    #[serde(rename = "Ip", skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub parameters: Vec<CatalogueEntry>,
}

impl<'a> Catalogue<'a> {
    /// Snapshot the visible parameters of `registry` in registration order
    pub fn from_registry<S: PersistentStore>(
        device: &'a str,
        ip: Option<[u8; 4]>,
        registry: &ParameterRegistry<S>,
    ) -> Self {
        let parameters = registry
            .iter()
            .filter(|slot| !slot.is_hidden())
            .map(|slot| CatalogueEntry {
                name: slot.name().to_string(),
                value: slot.value().stringify(),
            })
            .collect();

        Self {
            device,
            ip: ip.map(|[a, b, c, d]| format!("{}.{}.{}.{}", a, b, c, d)),
            parameters,
        }
    }

    /// JSON bytes for the registry route
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Encode as documents of at most `max_len` bytes each
    ///
    /// Parameters keep their order across documents. A parameter too large
    /// for a document of its own is left out.
    pub fn encode_split(&self, max_len: usize) -> Result<Vec<Vec<u8>>, serde_json::Error> {
        let mut frames = Vec::new();
        let mut part = Catalogue {
            device: self.device,
            ip: self.ip.clone(),
            parameters: Vec::new(),
        };
        let mut pending: Option<Vec<u8>> = None;

        for entry in &self.parameters {
            part.parameters.push(entry.clone());
            let bytes = part.encode()?;
            if bytes.len() <= max_len {
                pending = Some(bytes);
                continue;
            }

            part.parameters.pop();
            let alone = Catalogue {
                device: self.device,
                ip: self.ip.clone(),
                parameters: vec![entry.clone()],
            }
            .encode()?;
            if alone.len() > max_len {
                log_warn!("Parameter {} does not fit one frame", entry.name.as_str());
                continue;
            }

            // Close the current document and start a new one with this entry
            if let Some(done) = pending.take() {
                frames.push(done);
            }
            part.parameters.clear();
            part.parameters.push(entry.clone());
            pending = Some(alone);
        }

        match pending {
            Some(bytes) => frames.push(bytes),
            None if frames.is_empty() => frames.push(part.encode()?),
            None => {}
        }
        Ok(frames)
    }
}
