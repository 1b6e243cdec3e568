use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned identifier for one connected session. Unique among the
/// clients connected at any moment; also the key of that client's marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Pixel offsets of a marker on the shared page.
///
/// `width`/`height` are viewport annotations some senders attach to `move`
/// payloads; nothing consumes them on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub pagex: f64,
    pub pagey: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl Position {
    pub fn new(pagex: f64, pagey: f64) -> Self {
        Self {
            pagex,
            pagey,
            width: None,
            height: None,
        }
    }
}
