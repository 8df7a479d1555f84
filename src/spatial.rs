//! Planar position primitives.
//!
//! Objects on the work surface are located by two decimal coordinates. The wrapper keeps
//! [`nalgebra`] available for distance math without leaking it into every signature.

use std::fmt;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// A position on the work surface.
///
/// Internally uses [`nalgebra::Point2<f64>`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position(pub Point2<f64>);

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self(Point2::new(x, y))
    }

    pub fn x(&self) -> f64 {
        self.0.x
    }

    pub fn y(&self) -> f64 {
        self.0.y
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Position) -> f64 {
        nalgebra::distance(&self.0, &other.0)
    }

}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}",
            format_coordinate(self.x()),
            format_coordinate(self.y())
        )
    }
}

/// Shortest decimal text that round-trips the coordinate.
pub fn format_coordinate(value: f64) -> String {
    format!("{value}")
}

/// Coordinates as text, the way they appear on the wire.
///
/// Imported and reported positions keep the text they arrived with, so `0.10` goes out as
/// `0.10` rather than the re-rendered `0.1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateText {
    pub x: String,
    pub y: String,
}

impl CoordinateText {
    pub fn new(x: impl Into<String>, y: impl Into<String>) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
        }
    }

    /// Each axis cut to `width` characters, as shown on the display.
    pub fn truncated(&self, width: usize) -> (String, String) {
        (truncate(&self.x, width), truncate(&self.y, width))
    }
}

impl From<&Position> for CoordinateText {
    fn from(position: &Position) -> Self {
        Self::new(format_coordinate(position.x()), format_coordinate(position.y()))
    }
}

impl fmt::Display for CoordinateText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

fn truncate(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(0.03, 0.04);
        assert!((a.distance(&b) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn display_joins_axes_with_comma() {
        assert_eq!(Position::new(0.35, -0.1).to_string(), "0.35,-0.1");
    }

    #[test]
    fn truncation_keeps_five_characters() {
        let (x, y) = CoordinateText::from(&Position::new(0.351234, -0.127)).truncated(5);
        assert_eq!(x, "0.351");
        assert_eq!(y, "-0.12");
    }

    #[test]
    fn source_text_is_kept_verbatim() {
        let text = CoordinateText::new("0.10", "-0.250");
        assert_eq!(text.to_string(), "0.10,-0.250");
        assert_eq!(text.truncated(3), ("0.1".to_string(), "-0.".to_string()));
    }
}
