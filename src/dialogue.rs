//! Dialogue and disambiguation.
//!
//! The engine narrows the catalog with the descriptors of each interpretation. A handful of
//! candidates are proposed to the robot one at a time and confirmed or rejected by the user;
//! larger sets are highlighted on the display until further descriptors narrow them down.
//!
//! ```text
//! IDLE --event--> FILTERING --0 matches--> IDLE
//!                           --few-------> PROPOSING --yes--> execute, IDLE
//!                           |                       --no---> next candidate | IDLE
//!                           --many------> HIGHLIGHTING --event--> FILTERING
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::catalog::{
    filter_records, ObjectCatalog, ObjectRecord, Predicates, RecordUpdate, UpdateOutcome,
};
use crate::error::LinkError;
use crate::event::{InboundMessage, InterpretationEvent};
use crate::frame::{EndpointName, Frame, Segment};
use crate::link::{ClientLink, FrameSink};
use crate::store::CatalogStore;

/// Action token sent to the robot when no skill has been named yet.
pub const NO_ACTION: &str = "none";

/// Tunable thresholds of the dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialoguePolicy {
    /// Candidate sets smaller than this are proposed one by one; larger ones are highlighted.
    pub few_candidates_limit: usize,
    /// Maximum distance between a tracker report and the object it corrects.
    pub update_threshold: f64,
    /// Pause between the `execute` command and the spoken acknowledgement.
    pub execute_pause_ms: u64,
    /// Characters of each coordinate shown on the display.
    pub coordinate_width: usize,
    /// Queue depth of the interpreter's broker link.
    pub link_capacity: usize,
}

impl Default for DialoguePolicy {
    fn default() -> Self {
        Self {
            few_candidates_limit: 4,
            update_threshold: 0.02,
            execute_pause_ms: 1_000,
            coordinate_width: 5,
            link_capacity: 64,
        }
    }
}

impl DialoguePolicy {
    pub fn execute_pause(&self) -> Duration {
        Duration::from_millis(self.execute_pause_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    /// Transient while an interpretation is applied.
    Filtering,
    /// One candidate sent to the robot, awaiting confirmation.
    Proposing,
    /// Many candidates shown on the display, awaiting narrowing.
    Highlighting,
}

/// Per-turn dialogue state. Reset whenever a turn ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DialogueState {
    pub current_action: Option<String>,
    /// Candidates not yet proposed (or all candidates while highlighting).
    pub current_filter: VecDeque<ObjectRecord>,
    /// The candidate currently proposed to the robot.
    pub current_block: Option<ObjectRecord>,
    /// Descriptors applied during this turn.
    pub attributes: Vec<String>,
    phase: Phase,
}

impl DialogueState {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Every candidate of the turn: the proposed one first, then the rest.
    pub fn candidates(&self) -> Vec<ObjectRecord> {
        self.current_block
            .iter()
            .chain(self.current_filter.iter())
            .cloned()
            .collect()
    }
}

pub struct DialogueEngine {
    catalog: ObjectCatalog,
    state: DialogueState,
    policy: DialoguePolicy,
    store: Option<CatalogStore>,
}

impl std::fmt::Debug for DialogueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogueEngine")
            .field("objects", &self.catalog.len())
            .field("phase", &self.state.phase)
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl DialogueEngine {
    pub fn new(catalog: ObjectCatalog, policy: DialoguePolicy) -> Self {
        Self {
            catalog,
            state: DialogueState::default(),
            policy,
            store: None,
        }
    }

    /// Mirrors catalog mutations into `store`.
    pub fn with_store(mut self, store: CatalogStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn state(&self) -> &DialogueState {
        &self.state
    }

    pub fn catalog(&self) -> &ObjectCatalog {
        &self.catalog
    }

    pub fn policy(&self) -> &DialoguePolicy {
        &self.policy
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Parses and handles one delivered frame body. Malformed input is logged and ignored.
    pub fn handle_text(&mut self, text: &str) -> Vec<Frame> {
        match InboundMessage::parse(text) {
            Ok(message) => self.handle(message),
            Err(err) => {
                warn!(error = %err, frame = %text, "ignoring malformed message");
                Vec::new()
            }
        }
    }

    /// Applies one message and returns the frames to emit, in order.
    pub fn handle(&mut self, message: InboundMessage) -> Vec<Frame> {
        let frames = match message {
            InboundMessage::Interpretation(event) if event.has_feedback() => self.confirm(&event),
            InboundMessage::Interpretation(event) => self.interpret(event),
            InboundMessage::Update(updates) => {
                self.update(&updates);
                Vec::new()
            }
        };
        self.log_state();
        frames
    }

    fn confirm(&mut self, event: &InterpretationEvent) -> Vec<Frame> {
        if self.state.phase != Phase::Proposing {
            debug!(phase = ?self.state.phase, "feedback without a proposal ignored");
            return Vec::new();
        }

        if event.is_confirmation() {
            if let Some(block) = self.state.current_block.take() {
                self.catalog.remove(&block.id);
                if let Some(store) = &self.store {
                    if let Err(err) = store.remove(&block.id) {
                        error!(id = %block.id, error = %err, "failed to remove object from store");
                    }
                }
                info!(id = %block.id, "action confirmed");
            }
            self.state.reset();
            return vec![
                Frame::new(EndpointName::robot_executor(), vec![Segment::token("execute")]),
                Frame::new(
                    EndpointName::ar_display(),
                    vec![Segment::token("speech"), Segment::token("ok")],
                ),
            ];
        }

        match self.propose_next() {
            Some(frame) => vec![frame],
            None => {
                info!("no candidates left, turn restarted");
                self.state.reset();
                Vec::new()
            }
        }
    }

    fn interpret(&mut self, event: InterpretationEvent) -> Vec<Frame> {
        let turn_active = self.state.phase != Phase::Idle;
        self.state.phase = Phase::Filtering;
        if let Some(skill) = event.skills.first() {
            self.state.current_action = Some(skill.clone());
        }

        let base: Vec<ObjectRecord> = if turn_active {
            self.state.candidates()
        } else {
            self.catalog.records().cloned().collect()
        };
        let matches = match self.predicates(&event.attributes) {
            Some(predicates) => filter_records(&base, &predicates),
            None => Vec::new(),
        };
        self.state.attributes.extend(event.attributes);

        if matches.is_empty() {
            info!(attributes = ?self.state.attributes, "no objects match, turn restarted");
            self.state.reset();
            return Vec::new();
        }

        self.state.current_block = None;
        self.state.current_filter = matches.into();
        if self.state.current_filter.len() < self.policy.few_candidates_limit {
            self.propose_next().into_iter().collect()
        } else {
            self.state.phase = Phase::Highlighting;
            vec![self.highlight()]
        }
    }

    /// Maps descriptors to attribute predicates.
    ///
    /// `None` if a descriptor names no known value, or if two descriptors demand different
    /// values of the same attribute (`red,blue`), since no object can satisfy both.
    fn predicates(&self, descriptors: &[String]) -> Option<Predicates> {
        let mut predicates = Predicates::new();
        for descriptor in descriptors {
            let Some(key) = self.catalog.attribute_for(descriptor) else {
                debug!(%descriptor, "descriptor matches no attribute");
                return None;
            };
            match predicates.get(&key) {
                Some(existing) if !existing.eq_ignore_ascii_case(descriptor) => {
                    debug!(attribute = %key, %existing, %descriptor, "conflicting descriptors");
                    return None;
                }
                Some(_) => {}
                None => {
                    predicates.insert(key, descriptor.clone());
                }
            }
        }
        Some(predicates)
    }

    /// Moves the next candidate into the proposal slot and addresses it to the robot.
    fn propose_next(&mut self) -> Option<Frame> {
        let block = self.state.current_filter.pop_front()?;
        let action = self
            .state
            .current_action
            .clone()
            .unwrap_or_else(|| NO_ACTION.to_string());
        let frame = Frame::new(
            EndpointName::robot_executor(),
            vec![Segment::token(action), Segment::coordinates(&block.coordinates())],
        );
        self.state.current_block = Some(block);
        self.state.phase = Phase::Proposing;
        Some(frame)
    }

    fn highlight(&self) -> Frame {
        let width = self.policy.coordinate_width;
        let segments = self
            .state
            .current_filter
            .iter()
            .map(|record| {
                let (x, y) = record.coordinates().truncated(width);
                Segment::list([record.id.clone(), x, y])
            })
            .collect();
        Frame::new(EndpointName::ar_display(), segments)
    }

    fn update(&mut self, updates: &[RecordUpdate]) {
        for update in updates {
            match self.catalog.update_nearest(update, self.policy.update_threshold) {
                UpdateOutcome::Applied { id, distance } => {
                    debug!(%id, distance, "object position corrected");
                    if let (Some(store), Some(record)) = (&self.store, self.catalog.get(&id)) {
                        if let Err(err) = store.put(record) {
                            error!(%id, error = %err, "failed to persist object update");
                        }
                    }
                }
                UpdateOutcome::NoCloseMatch { distance } => {
                    info!(
                        position = %update.position,
                        nearest = ?distance,
                        "no object close enough, update discarded"
                    );
                }
            }
        }
    }

    fn log_state(&self) {
        debug!(
            phase = ?self.state.phase,
            current_action = ?self.state.current_action,
            items = self.state.current_filter.len(),
            attributes = ?self.state.attributes,
            "interpreter state"
        );
    }

    /// Writes frames to `sink`, pausing after an `execute` command.
    pub async fn emit<S: FrameSink>(
        &self,
        sink: &mut S,
        frames: Vec<Frame>,
    ) -> Result<(), LinkError> {
        for frame in frames {
            info!("Interpreter is sending: {frame}");
            let executes = frame.target.as_str() == EndpointName::ROBOT_EXECUTOR
                && frame.segments.first().and_then(Segment::as_token) == Some("execute");
            sink.deliver(frame).await?;
            if executes && self.policy.execute_pause_ms > 0 {
                tokio::time::sleep(self.policy.execute_pause()).await;
            }
        }
        Ok(())
    }

    /// Serves the interpreter endpoint until the broker connection ends.
    pub async fn run(mut self, mut link: ClientLink) -> Result<(), LinkError> {
        while let Some(text) = link.recv().await {
            let frames = self.handle_text(&text);
            self.emit(&mut link, frames).await?;
        }
        info!("Disconnected from broker");
        Ok(())
    }
}
