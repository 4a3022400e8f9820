//! The rich-presence activity payload.
//!
//! An [`Activity`] is the externally displayed status: two text lines,
//! large/small images with hover texts, start/end timestamps, party and
//! secret metadata, and up to two action buttons. Optional groups are
//! skipped during serialization so an empty activity stays an empty JSON
//! object. Structural equality between activities drives duplicate
//! suppression in the connection layer.

use serde::{Deserialize, Serialize};

/// A user identity on the presence service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique user id.
    pub id: String,
    /// Display name.
    pub username: String,
}

impl User {
    /// Create a new user.
    #[must_use]
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// Privacy level of a party session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PartyPrivacy {
    /// Join requests are routed through the owner.
    Private = 0,
    /// Anyone with the session visible may join.
    #[default]
    Public = 1,
}

impl From<PartyPrivacy> for u8 {
    fn from(privacy: PartyPrivacy) -> u8 {
        privacy as u8
    }
}

impl TryFrom<u8> for PartyPrivacy {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PartyPrivacy::Private),
            1 => Ok(PartyPrivacy::Public),
            _ => Err("Invalid party privacy"),
        }
    }
}

/// Start/end timestamps for elapsed or remaining time display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

impl Timestamps {
    fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// Large/small image keys and hover texts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityAssets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_text: Option<String>,
}

impl ActivityAssets {
    fn is_empty(&self) -> bool {
        self.large_image.is_none()
            && self.large_text.is_none()
            && self.small_image.is_none()
            && self.small_text.is_none()
    }
}

/// Party session metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: String,
    /// `[current, max]` pair.
    pub size: [u32; 2],
    pub privacy: PartyPrivacy,
}

/// Join / match / spectate secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spectate: Option<String>,
}

impl Secrets {
    fn is_empty(&self) -> bool {
        self.join.is_none() && self.match_secret.is_none() && self.spectate.is_none()
    }
}

/// A labeled action button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityButton {
    pub label: String,
    pub url: String,
}

impl ActivityButton {
    /// Create a new button.
    #[must_use]
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// The full presence payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Timestamps::is_empty")]
    pub timestamps: Timestamps,
    #[serde(default, skip_serializing_if = "ActivityAssets::is_empty")]
    pub assets: ActivityAssets,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party: Option<Party>,
    #[serde(default, skip_serializing_if = "Secrets::is_empty")]
    pub secrets: Secrets,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub buttons: Vec<ActivityButton>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub instance: bool,
}

impl Activity {
    /// Create an empty activity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the details line, omitting it when empty.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = non_empty(details.into());
        self
    }

    /// Set the state line, omitting it when empty.
    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = non_empty(state.into());
        self
    }

    /// Set start/end timestamps; non-positive values are omitted.
    #[must_use]
    pub fn with_timestamps(mut self, start: i64, end: i64) -> Self {
        self.timestamps = Timestamps {
            start: (start > 0).then_some(start as u64),
            end: (end > 0).then_some(end as u64),
        };
        self
    }

    /// Set the large image key and hover text, omitting empty values.
    #[must_use]
    pub fn with_large_image(mut self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.assets.large_image = non_empty(key.into());
        self.assets.large_text = non_empty(text.into());
        self
    }

    /// Set the small image key and hover text, omitting empty values.
    #[must_use]
    pub fn with_small_image(mut self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.assets.small_image = non_empty(key.into());
        self.assets.small_text = non_empty(text.into());
        self
    }

    /// Set the party block; an empty id omits the block entirely.
    #[must_use]
    pub fn with_party(
        mut self,
        id: impl Into<String>,
        size: u32,
        max: u32,
        privacy: PartyPrivacy,
    ) -> Self {
        let id = id.into();
        self.party = (!id.is_empty()).then(|| Party {
            id,
            size: [size, max],
            privacy,
        });
        self
    }

    /// Set the secrets block, omitting empty entries.
    #[must_use]
    pub fn with_secrets(
        mut self,
        join: impl Into<String>,
        match_secret: impl Into<String>,
        spectate: impl Into<String>,
    ) -> Self {
        self.secrets = Secrets {
            join: non_empty(join.into()),
            match_secret: non_empty(match_secret.into()),
            spectate: non_empty(spectate.into()),
        };
        self
    }

    /// Append a button.
    #[must_use]
    pub fn with_button(mut self, button: ActivityButton) -> Self {
        self.buttons.push(button);
        self
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_activity_serializes_to_empty_object() {
        let activity = Activity::new();
        let json = serde_json::to_string(&activity).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_activity_omits_empty_groups() {
        let activity = Activity::new()
            .with_details("Exploring")
            .with_timestamps(1000, 0);
        let value = serde_json::to_value(&activity).unwrap();

        assert_eq!(value["details"], "Exploring");
        assert_eq!(value["timestamps"]["start"], 1000);
        assert!(value["timestamps"].get("end").is_none());
        assert!(value.get("assets").is_none());
        assert!(value.get("party").is_none());
        assert!(value.get("secrets").is_none());
        assert!(value.get("buttons").is_none());
    }

    #[test]
    fn test_activity_structural_equality() {
        let build = || {
            Activity::new()
                .with_details("Exploring")
                .with_state("Level 5")
                .with_large_image("world", "The Overworld")
                .with_button(ActivityButton::new("Site", "https://example.com"))
        };
        assert_eq!(build(), build());
        assert_ne!(build(), build().with_state("Level 6"));
    }

    #[test]
    fn test_party_privacy_conversion() {
        assert_eq!(PartyPrivacy::try_from(0), Ok(PartyPrivacy::Private));
        assert_eq!(PartyPrivacy::try_from(1), Ok(PartyPrivacy::Public));
        assert!(PartyPrivacy::try_from(2).is_err());
    }

    #[test]
    fn test_empty_party_id_omits_block() {
        let activity = Activity::new().with_party("", 1, 4, PartyPrivacy::Public);
        assert!(activity.party.is_none());

        let activity = Activity::new().with_party("party-1", 1, 4, PartyPrivacy::Private);
        let party = activity.party.unwrap();
        assert_eq!(party.size, [1, 4]);
        assert_eq!(party.privacy, PartyPrivacy::Private);
    }

    #[test]
    fn test_match_secret_rename() {
        let activity = Activity::new().with_secrets("", "abc123", "");
        let value = serde_json::to_value(&activity).unwrap();
        assert_eq!(value["secrets"]["match"], "abc123");
        assert!(value["secrets"].get("join").is_none());
    }
}
