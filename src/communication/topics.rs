//! MQTT topic naming
//!
//! Every device owns three topics under `boards/<device>` and shares one
//! registry topic with all other devices:
//!
//! ```text
//! boards/<device>               inbound update requests
//! boards/<device>/confirmation  update acknowledgments
//! boards/<device>/log           device log lines
//! boards/registry               catalogue broadcasts (retained)
//! ```

use crate::parameters::network::DeviceName;
use core::fmt::Write;
use heapless::String;

/// Prefix shared by all device topics
pub const BOARDS_PREFIX: &str = "boards/";

/// Shared catalogue/discovery topic
pub const REGISTRY_TOPIC: &str = "boards/registry";

/// Suffix of the acknowledgment topic
pub const CONFIRMATION_SUFFIX: &str = "/confirmation";

/// Suffix of the log topic
pub const LOG_SUFFIX: &str = "/log";

/// Topic buffer length; holds the prefix, a full device name and the longest suffix
pub const TOPIC_LEN: usize = 64;

/// Bounded topic string
pub type Topic = String<TOPIC_LEN>;

/// Per-device topic set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub update: Topic,
    pub confirmation: Topic,
    pub log: Topic,
}

impl Topics {
    /// Build the topic set for `device`
    pub fn for_device(device: &DeviceName) -> Self {
        Self {
            update: update_topic(device),
            confirmation: device_topic(device, CONFIRMATION_SUFFIX),
            log: device_topic(device, LOG_SUFFIX),
        }
    }
}

/// `boards/<device>`
pub fn update_topic(device: &DeviceName) -> Topic {
    device_topic(device, "")
}

/// `boards/<device>/confirmation`
pub fn confirmation_topic(device: &DeviceName) -> Topic {
    device_topic(device, CONFIRMATION_SUFFIX)
}

fn device_topic(device: &DeviceName, suffix: &str) -> Topic {
    let mut topic = Topic::new();
    // Cannot overflow: DeviceName is bounded well below TOPIC_LEN minus affixes
    let _ = write!(topic, "{}{}{}", BOARDS_PREFIX, device, suffix);
    topic
}

/// Extract `<device>` from `boards/<device>` or `boards/<device>/...`
///
/// Returns `None` for the registry topic and for topics outside `boards/`.
pub fn device_from_topic(topic: &str) -> Option<&str> {
    let rest = topic.strip_prefix(BOARDS_PREFIX)?;
    let device = rest.split('/').next()?;
    if device.is_empty() || topic == REGISTRY_TOPIC {
        return None;
    }
    Some(device)
}
