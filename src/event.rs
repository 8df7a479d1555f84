//! Messages consumed by the interpreter.
//!
//! Three header-dispatched forms arrive through the broker:
//!
//! - `update;<x>,<y>[,<key>:<value>...];...` position/attribute corrections from the tracker
//! - `action;skills:<a,b>;attributes:<a,b>;objects:<a,b>` a natural-language interpretation
//! - `confirm;feedback:<yes|no>` confirmation of a proposed candidate
//!
//! An interpretation may also arrive as an object with the same four fields, either as JSON or
//! in the single-quoted literal form the language-understanding stage prints
//! (`{'skills': [], 'attributes': ['blue'], 'objects': ['lego'], 'feedback': []}`).

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::RecordUpdate;
use crate::error::FrameError;
use crate::spatial::{CoordinateText, Position};

pub const UPDATE_HEADER: &str = "update";
pub const ACTION_HEADER: &str = "action";
pub const CONFIRM_HEADER: &str = "confirm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Yes,
    No,
}

impl FromStr for Feedback {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, FrameError> {
        match s.trim().to_lowercase().as_str() {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            other => Err(FrameError::malformed(format!("unknown feedback {other:?}"))),
        }
    }
}

/// Structured output of the upstream language-understanding stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpretationEvent {
    /// Action keywords in utterance order; the first one wins.
    pub skills: Vec<String>,
    /// Descriptors such as colors or shapes.
    pub attributes: Vec<String>,
    pub objects: Vec<String>,
    pub feedback: Vec<Feedback>,
}

impl InterpretationEvent {
    pub fn has_feedback(&self) -> bool {
        !self.feedback.is_empty()
    }

    pub fn is_confirmation(&self) -> bool {
        self.feedback.contains(&Feedback::Yes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Interpretation(InterpretationEvent),
    Update(Vec<RecordUpdate>),
}

impl InboundMessage {
    /// Parses one delivered frame body.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let text = text.trim();
        let text = text.strip_suffix('$').unwrap_or(text).trim();

        if text.starts_with('{') {
            return serde_json::from_str(&literal_to_json(text))
                .map(Self::Interpretation)
                .map_err(|err| FrameError::malformed(format!("invalid interpretation: {err}")));
        }

        let mut segments = text.split(';').map(str::trim).filter(|s| !s.is_empty());
        let header = segments
            .next()
            .ok_or_else(|| FrameError::malformed("empty message"))?;

        match header.to_lowercase().as_str() {
            UPDATE_HEADER => segments
                .map(parse_update)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Update),
            ACTION_HEADER | CONFIRM_HEADER => parse_event(segments).map(Self::Interpretation),
            other => Err(FrameError::malformed(format!("unknown header {other:?}"))),
        }
    }
}

/// Rewrites single-quoted string literals as JSON strings and drops trailing commas.
///
/// Double-quoted input passes through unchanged, so plain JSON is accepted as well.
fn literal_to_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                out.push('"');
                while let Some(c) = chars.next() {
                    out.push(c);
                    match c {
                        '\\' => out.extend(chars.next()),
                        '"' => break,
                        _ => {}
                    }
                }
            }
            '\'' => {
                out.push('"');
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some('\'') => out.push('\''),
                            Some(escaped) => {
                                out.push('\\');
                                out.push(escaped);
                            }
                            None => {}
                        },
                        '\'' => break,
                        '"' => out.push_str("\\\""),
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            ',' => {
                let rest = chars.clone().find(|c| !c.is_whitespace());
                if !matches!(rest, Some(']' | '}')) {
                    out.push(',');
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn list(values: &str) -> Vec<String> {
    values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_event<'a>(
    segments: impl Iterator<Item = &'a str>,
) -> Result<InterpretationEvent, FrameError> {
    let mut event = InterpretationEvent::default();
    for segment in segments {
        let Some((key, values)) = segment.split_once(':') else {
            // Bare `yes`/`no` after a confirm header.
            event.feedback.push(segment.parse()?);
            continue;
        };
        match key.trim().to_lowercase().as_str() {
            "skills" => event.skills.extend(list(values)),
            "attributes" => event.attributes.extend(list(values)),
            "objects" => event.objects.extend(list(values)),
            "feedback" => {
                for value in list(values) {
                    event.feedback.push(value.parse()?);
                }
            }
            other => return Err(FrameError::malformed(format!("unknown field {other:?}"))),
        }
    }
    Ok(event)
}

fn parse_update(segment: &str) -> Result<RecordUpdate, FrameError> {
    let mut items = segment.split(',').map(str::trim);
    let mut coordinate = |axis: &str| {
        items
            .next()
            .and_then(|text| {
                let value = text.parse::<f64>().ok().filter(|v| v.is_finite())?;
                Some((value, text))
            })
            .ok_or_else(|| {
                FrameError::malformed(format!("update {segment:?} lacks a numeric {axis}"))
            })
    };
    let (x, x_text) = coordinate("x")?;
    let (y, y_text) = coordinate("y")?;

    let mut update = RecordUpdate::at(Position::new(x, y));
    update.coordinate_text = Some(CoordinateText::new(x_text, y_text));
    for item in items {
        let (key, value) = item.split_once(':').ok_or_else(|| {
            FrameError::malformed(format!("update attribute {item:?} is not key:value"))
        })?;
        update
            .attributes
            .insert(key.trim().to_lowercase(), value.trim().to_string());
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_message() {
        let message =
            InboundMessage::parse("action;skills:pick,place;attributes:blue;objects:lego$")
                .expect("parses");
        let InboundMessage::Interpretation(event) = message else {
            panic!("expected interpretation");
        };
        assert_eq!(event.skills, vec!["pick", "place"]);
        assert_eq!(event.attributes, vec!["blue"]);
        assert_eq!(event.objects, vec!["lego"]);
        assert!(!event.has_feedback());
    }

    #[test]
    fn confirm_message_forms() {
        for text in ["confirm;feedback:yes", "confirm;YES", "CONFIRM;feedback:no,yes"] {
            let Ok(InboundMessage::Interpretation(event)) = InboundMessage::parse(text) else {
                panic!("{text} should parse");
            };
            assert!(event.is_confirmation(), "{text}");
        }
        assert!(InboundMessage::parse("confirm;maybe").is_err());
    }

    #[test]
    fn json_interpretation() {
        let text =
            r#"{"skills": [], "attributes": ["blue"], "objects": ["lego"], "feedback": ["no"]}"#;
        let Ok(InboundMessage::Interpretation(event)) = InboundMessage::parse(text) else {
            panic!("json should parse");
        };
        assert_eq!(event.feedback, vec![Feedback::No]);
        assert!(event.has_feedback());
        assert!(!event.is_confirmation());
    }

    #[test]
    fn quoted_literal_interpretation() {
        let text = "{'skills': [], 'attributes': ['blue'], 'objects': ['lego'], 'feedback': []}";
        let Ok(InboundMessage::Interpretation(event)) = InboundMessage::parse(text) else {
            panic!("literal should parse");
        };
        assert!(event.skills.is_empty());
        assert_eq!(event.attributes, vec!["blue"]);
        assert_eq!(event.objects, vec!["lego"]);
        assert!(!event.has_feedback());

        let text = concat!(
            r#"{'skills': ['pick',], 'objects': ['Bob\'s "big" brick'], "#,
            r#"'feedback': ['yes'],}"#,
        );
        let Ok(InboundMessage::Interpretation(event)) = InboundMessage::parse(text) else {
            panic!("literal with escapes should parse");
        };
        assert_eq!(event.skills, vec!["pick"]);
        assert_eq!(event.objects, vec![r#"Bob's "big" brick"#]);
        assert!(event.is_confirmation());
    }

    #[test]
    fn update_message() {
        let message = InboundMessage::parse("update;0.1,0.2,color:red;0.3,0.4").expect("parses");
        let InboundMessage::Update(updates) = message else {
            panic!("expected update");
        };
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].position, Position::new(0.1, 0.2));
        assert_eq!(updates[0].coordinate_text, Some(CoordinateText::new("0.1", "0.2")));
        assert_eq!(updates[0].attributes.get("color").map(String::as_str), Some("red"));
        assert!(updates[1].attributes.is_empty());
    }

    #[test]
    fn malformed_messages_are_rejected() {
        for text in [
            "",
            "dance;now",
            "update;0.1",
            "update;north,0.2",
            "update;0.1,0.2,red",
            "action;mood:happy",
            "{not json",
        ] {
            assert!(
                matches!(InboundMessage::parse(text), Err(FrameError::Malformed(_))),
                "{text:?} should be malformed"
            );
        }
    }
}
