//! Wire codec for watch frames.
//!
//! Frames are JSON objects `{ "type": ..., "object"?: ..., "list"?: [...] }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource::object_name;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    Init,
    Added,
    Modified,
    Deleted,
    Closed,
}

/// Raw frame as it travels over the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<Value>>,
}

/// Domain change delivered over a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Init(Vec<Value>),
    Added(Value),
    Modified(Value),
    Deleted(Value),
}

impl WatchEvent {
    pub fn frame_type(&self) -> FrameType {
        match self {
            WatchEvent::Init(_) => FrameType::Init,
            WatchEvent::Added(_) => FrameType::Added,
            WatchEvent::Modified(_) => FrameType::Modified,
            WatchEvent::Deleted(_) => FrameType::Deleted,
        }
    }

    /// Embedded object of a single-object event.
    pub fn object(&self) -> Option<&Value> {
        match self {
            WatchEvent::Init(_) => None,
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
        }
    }

    /// Name of the embedded object, if any.
    pub fn name(&self) -> Option<&str> {
        self.object().and_then(object_name)
    }

    pub fn to_wire(&self) -> WireFrame {
        match self {
            WatchEvent::Init(list) => WireFrame { kind: FrameType::Init, object: None, list: Some(list.clone()) },
            other => WireFrame { kind: other.frame_type(), object: other.object().cloned(), list: None },
        }
    }
}

/// Decoded frame: a domain event or the end-of-stream signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(WatchEvent),
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid frame json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0:?} frame without object")]
    MissingObject(FrameType),
}

impl TryFrom<WireFrame> for Frame {
    type Error = DecodeError;

    fn try_from(w: WireFrame) -> Result<Self, Self::Error> {
        let ev = match w.kind {
            FrameType::Closed => return Ok(Frame::Closed),
            // Log streams send their starting text as a lone object.
            FrameType::Init => WatchEvent::Init(match (w.list, w.object) {
                (Some(list), _) => list,
                (None, Some(obj)) => vec![obj],
                (None, None) => Vec::new(),
            }),
            FrameType::Added => WatchEvent::Added(w.object.ok_or(DecodeError::MissingObject(w.kind))?),
            FrameType::Modified => WatchEvent::Modified(w.object.ok_or(DecodeError::MissingObject(w.kind))?),
            FrameType::Deleted => WatchEvent::Deleted(w.object.ok_or(DecodeError::MissingObject(w.kind))?),
        };
        Ok(Frame::Event(ev))
    }
}

/// Decode one text frame.
pub fn decode_frame(text: &str) -> Result<Frame, DecodeError> {
    let wire: WireFrame = serde_json::from_str(text)?;
    Frame::try_from(wire)
}
