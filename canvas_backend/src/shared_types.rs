use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors raised while turning an inbound frame into an [`InboundMessage`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid color {0:?}, expected #RRGGBB")]
    InvalidColor(String),
}

/// A `#RRGGBB` color. Input is accepted in either case and kept upper case.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug)]
#[serde(try_from = "String", into = "String")]
pub struct Color(String);

impl Color {
    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        let hex = raw
            .strip_prefix('#')
            .filter(|hex| hex.len() == 6 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| DecodeError::InvalidColor(raw.to_string()))?;
        Ok(Color(format!("#{}", hex.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Color {
    type Error = DecodeError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Color::parse(&raw)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a pixel on the canvas. Each key holds at most one color.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PixelKey {
    pub x: i32,
    pub y: i32,
}

impl PixelKey {
    /// Field name used for this key inside the canvas hash.
    pub fn to_field(self) -> String {
        format!("{}:{}", self.x, self.y)
    }

    pub fn parse_field(field: &str) -> Option<Self> {
        let (x, y) = field.split_once(':')?;
        Some(PixelKey {
            x: x.parse().ok()?,
            y: y.parse().ok()?,
        })
    }
}

// A single painted cell. Stored by the pixel store and sent over WebSockets.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Pixel {
    pub x: i32,
    pub y: i32,
    pub color: Color,
}

impl Pixel {
    pub fn new(x: i32, y: i32, color: Color) -> Self {
        Pixel { x, y, color }
    }

    pub fn key(&self) -> PixelKey {
        PixelKey {
            x: self.x,
            y: self.y,
        }
    }
}

/// Messages a painter may send.
#[derive(Deserialize, Clone, PartialEq, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Update { pixel: Pixel },
}

impl InboundMessage {
    /// Decode a text frame, refusing anything over `limit` bytes.
    pub fn decode(text: &str, limit: usize) -> Result<Self, DecodeError> {
        if text.len() > limit {
            return Err(DecodeError::TooLarge {
                size: text.len(),
                limit,
            });
        }
        Ok(serde_json::from_str(text)?)
    }
}

/// Messages pushed to viewers.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Update { pixel: Pixel },
    Initial { pixels: Vec<Pixel> },
}

impl OutboundMessage {
    /// Serialize once into a frame that every viewer queue can share.
    pub fn to_frame(&self) -> Result<Utf8Bytes, serde_json::Error> {
        serde_json::to_string(self).map(Utf8Bytes::from)
    }
}
