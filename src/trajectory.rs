//! Adapter from the motion planner's trajectory feed to display frames.
//!
//! Each trajectory becomes one `ar-display;trajectory;<joints>;<positions>;...` frame: the joint
//! names first, then one comma-joined position list per waypoint.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::frame::{EndpointName, Frame, Segment};
use crate::link::FrameSink;

pub const TRAJECTORY_HEADER: &str = "trajectory";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub positions: Vec<f64>,
}

/// A joint-space trajectory as published by the motion planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointTrajectory {
    pub joint_names: Vec<String>,
    pub points: Vec<TrajectoryPoint>,
}

impl JointTrajectory {
    pub fn to_frame(&self) -> Frame {
        let mut segments = Vec::with_capacity(self.points.len() + 2);
        segments.push(Segment::token(TRAJECTORY_HEADER));
        segments.push(Segment::list(self.joint_names.iter().cloned()));
        segments.extend(
            self.points
                .iter()
                .map(|point| Segment::list(point.positions.iter().map(|p| p.to_string()))),
        );
        Frame::new(EndpointName::ar_display(), segments)
    }
}

/// Stateless translator: one trajectory in, one frame out.
#[derive(Debug, Default)]
pub struct TrajectoryBridge;

impl TrajectoryBridge {
    pub fn new() -> Self {
        Self
    }

    /// Forwards every trajectory of a JSON-lines feed to `sink` until the feed ends.
    ///
    /// Lines that do not decode are logged and skipped. Returns the number of frames sent.
    pub async fn run<R, S>(&self, feed: R, sink: &mut S) -> Result<usize, LinkError>
    where
        R: AsyncBufRead + Unpin,
        S: FrameSink,
    {
        let mut lines = feed.lines();
        let mut sent = 0;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "trajectory feed failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JointTrajectory>(&line) {
                Ok(trajectory) => {
                    debug!(waypoints = trajectory.points.len(), "trajectory received");
                    sink.deliver(trajectory.to_frame()).await?;
                    sent += 1;
                }
                Err(err) => warn!(error = %err, "skipping malformed trajectory"),
            }
        }
        info!(sent, "trajectory feed ended");
        Ok(sent)
    }
}
