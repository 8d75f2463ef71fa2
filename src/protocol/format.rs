//! Wire format negotiation and frame codec

use super::Frame;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Encoding of protocol messages on a connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// JSON in text frames
    #[default]
    Json,
    /// bincode in binary frames
    Bincode,
}

impl WireFormat {
    /// Media type announced for this format
    pub fn content_type(self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::Bincode => "application/x-bincode",
        }
    }

    /// Format served for a single media type, if any
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type.trim().to_ascii_lowercase().as_str() {
            "application/json" => Some(WireFormat::Json),
            "application/x-bincode" | "application/octet-stream" => Some(WireFormat::Bincode),
            _ => None,
        }
    }

    /// Pick a format from an `Accept`-style header
    ///
    /// Candidates are tried by descending `q` weight, keeping header order for
    /// equal weights; candidates with `q=0` are skipped. Falls back to JSON.
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return WireFormat::default();
        };

        let mut candidates: Vec<(&str, f32)> = accept
            .split(',')
            .filter_map(|part| {
                let mut pieces = part.split(';');
                let media_type = pieces.next()?.trim();
                if media_type.is_empty() {
                    return None;
                }
                let quality = pieces
                    .filter_map(|param| param.trim().strip_prefix("q="))
                    .next()
                    .map_or(1.0, |q| q.trim().parse::<f32>().unwrap_or(0.0));
                Some((media_type, quality))
            })
            .filter(|(_, quality)| *quality > 0.0)
            .collect();

        // sort_by is stable, so equal weights keep header order
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        candidates
            .into_iter()
            .find_map(|(media_type, _)| Self::from_media_type(media_type))
            .unwrap_or_default()
    }

    /// Encode a message into a frame of this format
    pub fn encode<T: Serialize>(self, message: &T) -> Result<Frame> {
        match self {
            WireFormat::Json => Ok(Frame::Text(serde_json::to_string(message)?)),
            WireFormat::Bincode => bincode::serde::encode_to_vec(message, bincode::config::standard())
                .map(Frame::Binary)
                .map_err(|e| Error::Protocol(format!("bincode encoding failed: {e}"))),
        }
    }

    /// Decode a frame; frames of the other format's kind yield `None`
    pub fn decode<T: DeserializeOwned>(self, frame: &Frame) -> Result<Option<T>> {
        match (self, frame) {
            (WireFormat::Json, Frame::Text(text)) => serde_json::from_str(text)
                .map(Some)
                .map_err(|e| Error::Protocol(format!("invalid JSON message: {e}"))),
            (WireFormat::Bincode, Frame::Binary(bytes)) => {
                bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                    .map(|(message, _)| Some(message))
                    .map_err(|e| Error::Protocol(format!("invalid bincode message: {e}")))
            }
            _ => Ok(None),
        }
    }
}
