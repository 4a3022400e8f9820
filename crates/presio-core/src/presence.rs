//! The compiled presence snapshot.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use presio_protocol::ActivityButton;

/// An immutable, fully-resolved presence snapshot.
///
/// Produced atomically by the compiler; never partially overwritten.
/// Text fields are already sanitized, image keys already resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledPresence {
    pub details: String,
    pub state: String,
    /// Image key text before index resolution.
    pub raw_large_image: String,
    pub raw_small_image: String,
    /// Resolved image keys (canonical name or custom URL).
    pub large_image: String,
    pub small_image: String,
    pub large_image_text: String,
    pub small_image_text: String,
    /// Unix seconds; zero means unset.
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub buttons: Vec<ActivityButton>,
}

impl CompiledPresence {
    /// Elapsed or remaining session time, rendered `H:MM:SS`.
    ///
    /// With an end timestamp set, counts down toward it; otherwise counts
    /// up from the start. Empty when no start is set.
    #[must_use]
    pub fn time_string(&self) -> String {
        self.time_string_at(now_seconds())
    }

    fn time_string_at(&self, now: i64) -> String {
        if self.start_timestamp <= 0 {
            return String::new();
        }
        let seconds = if self.end_timestamp > 0 {
            (self.end_timestamp - now).max(0)
        } else {
            (now - self.start_timestamp).max(0)
        };
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        let secs = seconds % 60;
        format!("{hours}:{minutes:02}:{secs:02}")
    }

    /// Accepted buttons as a label→url map.
    #[must_use]
    pub fn button_data(&self) -> BTreeMap<String, String> {
        self.buttons
            .iter()
            .map(|button| (button.label.clone(), button.url.clone()))
            .collect()
    }
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
