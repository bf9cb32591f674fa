//! Classification of event payloads for batching.

use hookwire_webhook::Headers;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Payload classification; part of the batching key and selects the merge rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContentCategory {
    /// `application/json` or any `+json` structured syntax suffix.
    Json,
    /// Plain text and anything unrecognized, including a missing content type.
    Text,
}

impl ContentCategory {
    /// Classifies an event by its declared `Content-Type` header.
    pub fn of(headers: &Headers) -> Self {
        headers
            .content_type()
            .map_or(Self::Text, Self::from_content_type)
    }

    /// Classifies a `Content-Type` value; parameters such as `charset` are ignored.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if essence == "application/json" || essence.ends_with("+json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}
