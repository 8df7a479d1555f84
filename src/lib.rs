//! Human-robot interaction core library.
//!
//! This crate defines:
//! - [`frame`]: the `$`-terminated text protocol and the endpoint registry.
//! - [`broker`]: the router that binds each connection to one endpoint and forwards frames.
//! - [`link`]: [`ClientLink`], the byte-forwarding proxy between a component and the broker.
//! - [`dialogue`]: [`DialogueEngine`], which turns interpretations into robot and display
//!   commands against the [`catalog`] of objects.
//! - [`trajectory`]: the adapter from motion-planner trajectories to display frames.
//! - [`kernel`]: the supervisor that starts the above in one process.

pub mod broker;
pub mod catalog;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod event;
pub mod frame;
pub mod kernel;
pub mod link;
pub mod spatial;
pub mod store;
pub mod trajectory;
pub mod transport;

// Re-export for downstream crates so tools can inspect a catalog store without declaring a
// direct dependency on `sled`.
pub use sled;

pub use broker::{Broker, BrokerHandle};
pub use catalog::{ObjectCatalog, ObjectRecord};
pub use config::{BrokerAddr, KernelConfig};
pub use dialogue::{DialogueEngine, DialoguePolicy, DialogueState, Phase};
pub use error::{BrokerError, ImportError, KernelError, LinkError};
pub use event::{Feedback, InboundMessage, InterpretationEvent};
pub use frame::{EndpointName, EndpointRegistry, Frame, Segment};
pub use link::{ClientLink, FrameSink};
pub use spatial::{CoordinateText, Position};
