//! User-authored presence templates.
//!
//! A [`PresenceTemplate`] holds raw expression strings; nothing here is
//! evaluated or sanitized. The compiler resolves each field against the
//! registry with an override target equal to the field's name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A labeled action button, both sides raw expression text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub url: String,
}

impl Button {
    /// Create a new button.
    #[must_use]
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// Raw expression strings for every presence field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceTemplate {
    /// Whether this template participates in selection at all.
    pub enabled: bool,
    /// Whether a forced-override entry replaces the default template.
    pub use_as_main: bool,
    pub details: String,
    pub state: String,
    pub large_image_key: String,
    pub large_image_text: String,
    pub small_image_key: String,
    pub small_image_text: String,
    pub start_timestamp: String,
    pub end_timestamp: String,
    /// Buttons keyed by override identifier; the `default` key is a
    /// placeholder slot and never transmits.
    pub buttons: BTreeMap<String, Button>,
}

impl Default for PresenceTemplate {
    fn default() -> Self {
        Self {
            enabled: true,
            use_as_main: false,
            details: String::new(),
            state: String::new(),
            large_image_key: String::new(),
            large_image_text: String::new(),
            small_image_key: String::new(),
            small_image_text: String::new(),
            start_timestamp: String::new(),
            end_timestamp: String::new(),
            buttons: BTreeMap::new(),
        }
    }
}

impl PresenceTemplate {
    /// Look up a field's raw text by override-target name.
    ///
    /// Button fields are addressed as `<id>.label` and `<id>.url`.
    #[must_use]
    pub fn field_by_name(&self, name: &str) -> Option<&str> {
        match name {
            "details" => Some(&self.details),
            "state" => Some(&self.state),
            "large_image_key" => Some(&self.large_image_key),
            "large_image_text" => Some(&self.large_image_text),
            "small_image_key" => Some(&self.small_image_key),
            "small_image_text" => Some(&self.small_image_text),
            "start_timestamp" => Some(&self.start_timestamp),
            "end_timestamp" => Some(&self.end_timestamp),
            other => {
                let (id, field) = other.rsplit_once('.')?;
                let button = self.buttons.get(id)?;
                match field {
                    "label" => Some(&button.label),
                    "url" => Some(&button.url),
                    _ => None,
                }
            }
        }
    }
}
