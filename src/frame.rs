//! Wire format.
//!
//! A frame is ASCII/UTF-8 text of the form `<endpoint>;<segment>;<segment>...$`. The broker
//! only looks at the target; the payload after the first `;` is forwarded untouched and
//! delivered as `<payload>$`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::spatial::{CoordinateText, Position};

pub const SENTINEL: u8 = b'$';
pub const SEGMENT_SEPARATOR: char = ';';
pub const LIST_SEPARATOR: char = ',';
pub const PAIR_SEPARATOR: char = ':';

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// A logical peer addressable through the broker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointName(String);

impl EndpointName {
    pub const ROBOT_EXECUTOR: &'static str = "robot-executor";
    pub const AR_DISPLAY: &'static str = "ar-display";
    pub const INTERPRETER: &'static str = "interpreter";
    pub const TRAJECTORY_SOURCE: &'static str = "trajectory-source";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn robot_executor() -> Self {
        Self::new(Self::ROBOT_EXECUTOR)
    }

    pub fn ar_display() -> Self {
        Self::new(Self::AR_DISPLAY)
    }

    pub fn interpreter() -> Self {
        Self::new(Self::INTERPRETER)
    }

    pub fn trajectory_source() -> Self {
        Self::new(Self::TRAJECTORY_SOURCE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The set of endpoint names the broker accepts, plus alternate spellings.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    names: BTreeSet<EndpointName>,
    aliases: BTreeMap<String, EndpointName>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self {
            names: [
                EndpointName::robot_executor(),
                EndpointName::ar_display(),
                EndpointName::interpreter(),
                EndpointName::trajectory_source(),
            ]
            .into_iter()
            .collect(),
            aliases: BTreeMap::new(),
        }
    }
}

impl EndpointRegistry {
    /// Adds a name to the registry.
    pub fn register(&mut self, name: impl Into<String>) -> &mut Self {
        self.names.insert(EndpointName::new(name));
        self
    }

    /// Makes `alias` resolve to `canonical`. Aliases of unregistered names are ignored.
    pub fn alias(&mut self, alias: impl Into<String>, canonical: impl Into<String>) -> &mut Self {
        let canonical = EndpointName::new(canonical);
        if self.names.contains(&canonical) {
            self.aliases.insert(alias.into(), canonical);
        } else {
            tracing::warn!(endpoint = %canonical, "alias target is not a registered endpoint");
        }
        self
    }

    /// Resolves a declared name (or alias) to its registered endpoint.
    pub fn resolve(&self, name: &str) -> Option<EndpointName> {
        let name = name.trim();
        self.names
            .iter()
            .find(|known| known.as_str() == name)
            .cloned()
            .or_else(|| self.aliases.get(name).cloned())
    }

    pub fn names(&self) -> impl Iterator<Item = &EndpointName> {
        self.names.iter()
    }
}

/// One `;`-separated unit of a frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Token(String),
    Pair { key: String, value: String },
    /// Comma-separated items, e.g. a coordinate pair or a trajectory waypoint.
    List(Vec<String>),
}

impl Segment {
    pub fn token(text: impl Into<String>) -> Self {
        Self::Token(text.into())
    }

    pub fn pair(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Pair {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    pub fn coordinates(text: &CoordinateText) -> Self {
        Self::list([text.x.clone(), text.y.clone()])
    }

    /// Parses one segment. Commas take precedence over colons.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.contains(LIST_SEPARATOR) {
            Self::List(text.split(LIST_SEPARATOR).map(|s| s.trim().to_string()).collect())
        } else if let Some((key, value)) = text.split_once(PAIR_SEPARATOR) {
            Self::pair(key.trim(), value.trim())
        } else {
            Self::token(text)
        }
    }

    /// Interprets a two-element numeric list as a position.
    pub fn as_coordinates(&self) -> Option<Position> {
        match self {
            Self::List(items) if items.len() == 2 => {
                let x = items[0].parse().ok()?;
                let y = items[1].parse().ok()?;
                Some(Position::new(x, y))
            }
            _ => None,
        }
    }

    pub fn as_token(&self) -> Option<&str> {
        match self {
            Self::Token(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(text) => f.write_str(text),
            Self::Pair { key, value } => write!(f, "{key}{PAIR_SEPARATOR}{value}"),
            Self::List(items) => f.write_str(&items.join(",")),
        }
    }
}

/// A typed frame: a target endpoint and its payload segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub target: EndpointName,
    pub segments: Vec<Segment>,
}

impl Frame {
    pub fn new(target: EndpointName, segments: Vec<Segment>) -> Self {
        Self { target, segments }
    }

    /// Parses a full frame (`target;...`), with or without the trailing sentinel.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw = RawFrame::parse(text)?;
        Ok(Self {
            target: EndpointName::new(raw.target),
            segments: parse_segments(&raw.payload),
        })
    }

    /// Payload text without target or sentinel.
    pub fn payload(&self) -> String {
        self.segments
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Wire text including the sentinel.
    pub fn encode(&self) -> String {
        if self.segments.is_empty() {
            format!("{}$", self.target)
        } else {
            format!("{};{}$", self.target, self.payload())
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Splits payload text into segments.
pub fn parse_segments(payload: &str) -> Vec<Segment> {
    payload
        .split(SEGMENT_SEPARATOR)
        .filter(|s| !s.trim().is_empty())
        .map(Segment::parse)
        .collect()
}

/// A frame split only at its target. Used by the broker to forward payloads verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub target: String,
    pub payload: String,
}

impl RawFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let text = text.trim();
        let text = text.strip_suffix('$').unwrap_or(text);
        if text.contains('$') {
            return Err(FrameError::SentinelInPayload);
        }
        let (target, payload) = text.split_once(SEGMENT_SEPARATOR).unwrap_or((text, ""));
        let target = target.trim();
        if target.is_empty() {
            return Err(FrameError::malformed("frame has no target"));
        }
        Ok(Self {
            target: target.to_string(),
            payload: payload.to_string(),
        })
    }
}

/// `$`-delimited framing for a byte stream.
///
/// Decoded frames have the sentinel and surrounding whitespace removed; empty frames are
/// skipped. The encoder appends the sentinel when it is missing.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_len: usize,
    // Bytes already scanned without finding a sentinel.
    scanned: usize,
}

impl FrameCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len, scanned: 0 }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == SENTINEL) else {
                if src.len() > self.max_len {
                    return Err(FrameError::TooLong {
                        limit: self.max_len,
                    });
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            if end > self.max_len {
                return Err(FrameError::TooLong {
                    limit: self.max_len,
                });
            }
            let mut frame = src.split_to(end);
            src.advance(1);

            let (start, end) = trim_ascii(&frame);
            if start == end {
                continue;
            }
            frame.truncate(end);
            frame.advance(start);
            return Ok(Some(frame));
        }
    }
}

/// Bounds of `bytes` without leading and trailing ASCII whitespace.
fn trim_ascii(bytes: &[u8]) -> (usize, usize) {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    (start, end)
}

impl<T: AsRef<str>> Encoder<T> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), FrameError> {
        let text = item.as_ref();
        let body = text.strip_suffix('$').unwrap_or(text);
        if body.contains('$') {
            return Err(FrameError::SentinelInPayload);
        }
        if body.len() > self.max_len {
            return Err(FrameError::TooLong {
                limit: self.max_len,
            });
        }
        dst.reserve(body.len() + 1);
        dst.put_slice(body.as_bytes());
        dst.put_u8(SENTINEL);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).expect("decodable") {
            out.push(String::from_utf8(frame.to_vec()).expect("utf-8"));
        }
        out
    }

    #[test]
    fn registry_resolves_names_and_aliases() {
        let mut registry = EndpointRegistry::default();
        registry.alias("yumi", "robot-executor").alias("ghost", "nowhere");
        assert_eq!(
            registry.resolve("robot-executor"),
            Some(EndpointName::robot_executor())
        );
        assert_eq!(registry.resolve("yumi"), Some(EndpointName::robot_executor()));
        assert_eq!(registry.resolve("ghost"), None);
        assert_eq!(registry.resolve("toaster"), None);

        registry.register("nlu");
        assert_eq!(registry.resolve("nlu"), Some(EndpointName::new("nlu")));
    }

    #[test]
    fn segments_parse_by_separator() {
        assert_eq!(Segment::parse("execute"), Segment::token("execute"));
        assert_eq!(Segment::parse("color:red"), Segment::pair("color", "red"));
        assert_eq!(Segment::parse("0.1,0.2"), Segment::list(["0.1", "0.2"]));
        assert_eq!(
            Segment::parse("0.1,0.2,color:red"),
            Segment::list(["0.1", "0.2", "color:red"])
        );
    }

    #[test]
    fn coordinates_round_trip_through_segment() {
        let segment = Segment::parse("0.35,-0.1");
        assert_eq!(segment.as_coordinates(), Some(Position::new(0.35, -0.1)));
        assert_eq!(Segment::list(["a", "b", "c"]).as_coordinates(), None);
    }

    #[test]
    fn frame_encodes_with_sentinel() {
        let frame = Frame::new(
            EndpointName::robot_executor(),
            vec![
                Segment::token("pick"),
                Segment::coordinates(&CoordinateText::new("0.30", "0.4")),
            ],
        );
        assert_eq!(frame.encode(), "robot-executor;pick;0.30,0.4$");
        assert_eq!(Frame::parse(&frame.encode()).expect("parses"), frame);
    }

    #[test]
    fn raw_frame_splits_at_first_separator() {
        let raw = RawFrame::parse("ar-display;speech;ok$").expect("parses");
        assert_eq!(raw.target, "ar-display");
        assert_eq!(raw.payload, "speech;ok");

        let bare = RawFrame::parse("interpreter").expect("parses");
        assert_eq!(bare.payload, "");

        assert!(RawFrame::parse(";orphan").is_err());
        assert!(RawFrame::parse("a;b$c").is_err());
    }

    #[test]
    fn decoder_handles_partial_and_batched_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"robot-executor;exe"[..]);
        assert!(decode_all(&mut codec, &mut buf).is_empty());

        buf.extend_from_slice(b"cute$\n$ ar-display;speech;ok $interp");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec!["robot-executor;execute", "ar-display;speech;ok"]
        );
        assert_eq!(&buf[..], b"interp");
    }

    #[test]
    fn decoder_rejects_oversized_frames() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLong { limit: 8 })
        ));
    }

    #[test]
    fn encoder_appends_sentinel_once() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode("a;b", &mut buf).expect("encodes");
        codec.encode("c;d$", &mut buf).expect("encodes");
        assert_eq!(&buf[..], b"a;b$c;d$");
        assert!(matches!(
            codec.encode("a$b", &mut buf),
            Err(FrameError::SentinelInPayload)
        ));
    }
}
