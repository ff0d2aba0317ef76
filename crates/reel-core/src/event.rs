//! Content-description events delivered by relays.
//!
//! Events are the wire-level unit of the relay protocol: a signed,
//! id-addressed description of one piece of content. The feed engine
//! consumes them transiently; only the id outlives admission.

use serde::{Deserialize, Serialize};

/// Recognized media file extensions for a primary resource locator.
pub const MEDIA_EXTENSIONS: &[&str] = &[
    ".mp4", ".m4v", ".mov", ".webm", ".mkv", ".m3u8", ".mpd",
];

/// A signed event received from (or published to) a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// Lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// Lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// Primary resource locator for this event.
    ///
    /// Prefers a plain `url` tag; falls back to the `url` field of the
    /// first `imeta` tag.
    pub fn media_url(&self) -> Option<&str> {
        if let Some(url) = self.tag_value("url") {
            return Some(url);
        }
        self.tags
            .iter()
            .find(|t| !t.is_empty() && t[0] == "imeta")
            .and_then(|t| {
                t.iter()
                    .skip(1)
                    .find_map(|field| field.strip_prefix("url "))
            })
    }

    /// Display title, if the event carries one.
    pub fn title(&self) -> Option<&str> {
        self.tag_value("title")
    }

    /// Age of the event relative to `now`, in seconds.
    ///
    /// Events dated in the future report an age of zero.
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }
}

/// The unsigned portion of an event, handed to a [`crate::Signer`].
///
/// The pubkey is derived from the signing key, so templates do not
/// carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event_with_tags(tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "id1".to_string(),
            pubkey: "pk1".to_string(),
            created_at: 1_700_000_000,
            kind: 34236,
            tags,
            content: "a clip".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn test_tag_value_first_match_wins() {
        let event = event_with_tags(vec![
            vec!["t".to_string(), "first".to_string()],
            vec!["t".to_string(), "second".to_string()],
        ]);
        assert_eq!(event.tag_value("t"), Some("first"));
        assert_eq!(event.tag_value("missing"), None);
    }

    #[test]
    fn test_media_url_prefers_url_tag() {
        let event = event_with_tags(vec![
            vec![
                "imeta".to_string(),
                "url https://cdn.example.com/other.mp4".to_string(),
            ],
            vec!["url".to_string(), "https://cdn.example.com/a.mp4".to_string()],
        ]);
        assert_eq!(event.media_url(), Some("https://cdn.example.com/a.mp4"));
    }

    #[test]
    fn test_media_url_from_imeta() {
        let event = event_with_tags(vec![vec![
            "imeta".to_string(),
            "dim 1080x1920".to_string(),
            "url https://cdn.example.com/clip.mp4".to_string(),
        ]]);
        assert_eq!(event.media_url(), Some("https://cdn.example.com/clip.mp4"));
    }

    #[test]
    fn test_media_url_absent() {
        let event = event_with_tags(vec![vec!["p".to_string(), "pk2".to_string()]]);
        assert_eq!(event.media_url(), None);
    }

    #[test]
    fn test_age_secs_saturates_for_future_events() {
        let event = event_with_tags(vec![]);
        assert_eq!(event.age_secs(1_700_000_060), 60);
        assert_eq!(event.age_secs(1_600_000_000), 0);
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let event = event_with_tags(vec![vec!["title".to_string(), "hi".to_string()]]);
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.title(), Some("hi"));
    }
}
