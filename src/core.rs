//! The functional core: a deterministic, synchronous, in-memory
//! interpreter of commands and events.
//!
//! The core owns every projection and the state of the current
//! transaction (event buffer, pre-change snapshots, dirty-view markers).
//! It never performs I/O and never suspends; binding its output to
//! durable storage is the coordinator's job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::CoreError;
use crate::event::{Command, EventDraft};

/// Maximum nesting of `produce`/`consume` reached through state-machine
/// triggers before the transaction is failed with
/// [`CoreError::FixpointOverflow`].
pub const MAX_TRIGGER_DEPTH: u32 = 32;

/// A projection consulted by command mappers.
///
/// Each entry owns one named state and two pure functions: a reducer that
/// folds matching events into that state, and a mapper that turns a
/// command payload into the events to append.
///
/// # Contract
///
/// - [`map`](ChangeState::map) must be pure given the current state: no
///   I/O, no mutation of the entry or anything else. Identifiers the
///   mapper allocates (e.g. a `next_id` counter) must be derived
///   exclusively from the reducer fold of previously emitted events, so
///   that rollback and replay stay exact.
/// - [`reduce`](ChangeState::reduce) must be a pure, total state
///   transition. It is only invoked for event types [`handles`](ChangeState::handles)
///   returns `true` for.
/// - [`snapshot`](ChangeState::snapshot) must produce an independent deep
///   copy; the core restores it wholesale on rollback.
pub trait ChangeState: Send {
    /// Names this entry; commands are routed by `Command::kind == view_id()`.
    fn view_id(&self) -> &'static str;

    /// Turn a command payload into the ordered list of events to append.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mapper`] to reject the command; the
    /// coordinator rolls the whole transaction back.
    fn map(&self, data: &Value) -> Result<Vec<EventDraft>, CoreError>;

    /// Whether the reducer folds events of this type.
    fn handles(&self, event_type: &str) -> bool;

    /// Fold one matching event into the state.
    fn reduce(&mut self, event_type: &str, data: &Value);

    /// An independent deep copy of the current state.
    fn snapshot(&self) -> Box<dyn ChangeState>;
}

/// A projection consulted by queries and state machines.
///
/// Same reducer contract as [`ChangeState`]; additionally exposes its
/// state as a JSON tree for [`Core::query`] path-walking.
pub trait ViewState: Send {
    /// Names this view; the first element of every query path.
    fn view_id(&self) -> &'static str;

    /// Whether the reducer folds events of this type.
    fn handles(&self, event_type: &str) -> bool;

    /// Fold one matching event into the state.
    fn reduce(&mut self, event_type: &str, data: &Value);

    /// The state as a JSON tree, rooted at this view.
    fn value(&self) -> Value;

    /// An independent deep copy of the current state.
    fn snapshot(&self) -> Box<dyn ViewState>;
}

/// A reactive rule that runs when a named view is dirtied inside a
/// transaction.
///
/// # Contract
///
/// - [`trigger`](StateMachine::trigger) may observe state only through
///   [`TriggerCtx::query`] and effect change only through
///   [`TriggerCtx::produce`].
/// - Triggers must eventually stop dirtying views; the core caps the
///   recursion at [`MAX_TRIGGER_DEPTH`] and fails the transaction on
///   overflow, but termination below the cap is the application's
///   obligation.
pub trait StateMachine: Send + Sync {
    /// The view whose dirtying invokes this machine.
    fn view_id(&self) -> &'static str;

    /// React to the watched view having changed in this transaction.
    ///
    /// # Errors
    ///
    /// Any error fails the enclosing transaction.
    fn trigger(&self, tx: &mut TriggerCtx<'_>) -> Result<(), CoreError>;
}

/// The capability surface handed to a state-machine trigger: bound
/// `query` and `produce`, nothing else.
pub struct TriggerCtx<'a> {
    core: &'a mut Core,
}

impl TriggerCtx<'_> {
    /// Path-walk the view-state tree; see [`Core::query`].
    pub fn query<S: AsRef<str>>(&self, path: &[S]) -> Option<Value> {
        self.core.query(path)
    }

    /// Issue a follow-up command inside the current transaction; see
    /// [`Core::produce`].
    ///
    /// # Errors
    ///
    /// Propagates any failure of the nested command, failing the
    /// enclosing transaction.
    pub fn produce(&mut self, command: &Command) -> Result<Vec<EventDraft>, CoreError> {
        self.core.produce(command)
    }
}

/// Registers projections and machines, then builds a [`Core`].
#[derive(Default)]
pub struct CoreBuilder {
    changes: HashMap<String, Box<dyn ChangeState>>,
    views: HashMap<String, Box<dyn ViewState>>,
    machines: Vec<Arc<dyn StateMachine>>,
}

impl CoreBuilder {
    /// Register a change-state entry. A later registration under the same
    /// `view_id` replaces the earlier one.
    pub fn change(mut self, entry: Box<dyn ChangeState>) -> Self {
        let id = entry.view_id().to_string();
        if self.changes.insert(id.clone(), entry).is_some() {
            tracing::warn!(view_id = %id, "change state registered twice, keeping the later one");
        }
        self
    }

    /// Register a view-state entry.
    pub fn view(mut self, entry: Box<dyn ViewState>) -> Self {
        let id = entry.view_id().to_string();
        if self.views.insert(id.clone(), entry).is_some() {
            tracing::warn!(view_id = %id, "view state registered twice, keeping the later one");
        }
        self
    }

    /// Register a state machine.
    pub fn machine(mut self, machine: Arc<dyn StateMachine>) -> Self {
        self.machines.push(machine);
        self
    }

    /// Build the core with all projections at their initial states.
    pub fn build(self) -> Core {
        Core {
            changes: self.changes,
            views: self.views,
            machines: self.machines,
            buffer: Vec::new(),
            change_snaps: HashMap::new(),
            view_snaps: HashMap::new(),
            dirty: HashSet::new(),
            depth: 0,
        }
    }
}

/// The functional core.
///
/// All mutation happens inside a critical section owned by the
/// coordinator; the core itself assumes single-threaded access.
pub struct Core {
    changes: HashMap<String, Box<dyn ChangeState>>,
    views: HashMap<String, Box<dyn ViewState>>,
    machines: Vec<Arc<dyn StateMachine>>,
    /// Events accumulated during the current critical section.
    buffer: Vec<EventDraft>,
    /// Lazily captured deep copies of projections mutated this transaction.
    change_snaps: HashMap<String, Box<dyn ChangeState>>,
    view_snaps: HashMap<String, Box<dyn ViewState>>,
    /// Views whose reducer matched since the last trigger pass.
    dirty: HashSet<String>,
    /// Current `produce`/`consume` nesting through machine triggers.
    depth: u32,
}

impl Core {
    /// Start registering projections for a new core.
    pub fn builder() -> CoreBuilder {
        CoreBuilder::default()
    }

    /// Interpret a command: map it to events, fold them, run the
    /// state-machine trigger pass.
    ///
    /// Returns only the events produced directly by this call, not those
    /// produced transitively by triggered machines (which still land in
    /// the transaction buffer).
    ///
    /// # Errors
    ///
    /// - [`CoreError::UnknownCommand`] when no change state matches `command.kind`.
    /// - [`CoreError::Mapper`] when the mapper rejects the payload.
    /// - [`CoreError::FixpointOverflow`] when triggers recurse past the cap.
    pub fn produce(&mut self, command: &Command) -> Result<Vec<EventDraft>, CoreError> {
        self.depth += 1;
        let result = self.produce_inner(command);
        self.depth = self.depth.saturating_sub(1);
        result
    }

    fn produce_inner(&mut self, command: &Command) -> Result<Vec<EventDraft>, CoreError> {
        if self.depth > MAX_TRIGGER_DEPTH {
            return Err(CoreError::FixpointOverflow { depth: self.depth });
        }
        let entry = self
            .changes
            .get(&command.kind)
            .ok_or_else(|| CoreError::UnknownCommand {
                command_type: command.kind.clone(),
            })?;
        let events = entry.map(&command.data)?;
        tracing::debug!(command = %command.kind, count = events.len(), "command mapped");

        for event in &events {
            self.buffer.push(event.clone());
            self.reduce(&event.event_type, &event.data);
        }
        self.run_machines()?;
        Ok(events)
    }

    /// Record an externally-sourced fact (e.g. `Email.Succeeded`).
    ///
    /// The event is buffered for persistence, folded into every matching
    /// projection, and the state-machine trigger pass runs.
    ///
    /// # Errors
    ///
    /// - [`CoreError::FixpointOverflow`] when triggers recurse past the cap.
    /// - Any error a triggered machine propagates.
    pub fn consume(&mut self, event: EventDraft) -> Result<(), CoreError> {
        self.depth += 1;
        let result = self.consume_inner(event);
        self.depth = self.depth.saturating_sub(1);
        result
    }

    fn consume_inner(&mut self, event: EventDraft) -> Result<(), CoreError> {
        if self.depth > MAX_TRIGGER_DEPTH {
            return Err(CoreError::FixpointOverflow { depth: self.depth });
        }
        let event_type = event.event_type.clone();
        let data = event.data.clone();
        self.buffer.push(event);
        self.reduce(&event_type, &data);
        self.run_machines()
    }

    /// Fold one event into every matching projection.
    ///
    /// Projections touched for the first time this transaction are
    /// snapshotted before mutation; each view whose reducer matched is
    /// marked dirty. An event type with no matching reducer anywhere is a
    /// no-op (it is still persisted when buffered).
    pub fn reduce(&mut self, event_type: &str, data: &Value) {
        for (id, state) in self.changes.iter_mut() {
            if state.handles(event_type) {
                if !self.change_snaps.contains_key(id) {
                    self.change_snaps.insert(id.clone(), state.snapshot());
                }
                state.reduce(event_type, data);
            }
        }
        for (id, view) in self.views.iter_mut() {
            if view.handles(event_type) {
                if !self.view_snaps.contains_key(id) {
                    self.view_snaps.insert(id.clone(), view.snapshot());
                }
                view.reduce(event_type, data);
                self.dirty.insert(id.clone());
            }
        }
    }

    /// Path-walk the view-state tree.
    ///
    /// The path is a sequence of keys starting with a view id; array
    /// elements are addressed by their decimal index. Returns `None` --
    /// the "absent" sentinel, distinct from any present value including
    /// `null` and empty containers -- when any prefix of the path is not
    /// present. Read-only; never mutates.
    pub fn query<S: AsRef<str>>(&self, path: &[S]) -> Option<Value> {
        let (first, rest) = path.split_first()?;
        let root = self.views.get(first.as_ref())?.value();
        let mut current = &root;
        for key in rest {
            let key = key.as_ref();
            current = match current {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    /// End the transaction: return the buffered events and clear the
    /// buffer, the snapshot maps, and the dirty markers.
    ///
    /// Does not persist anything; that is the coordinator's job. Calling
    /// `commit` twice in a row yields an empty list.
    pub fn commit(&mut self) -> Vec<EventDraft> {
        self.change_snaps.clear();
        self.view_snaps.clear();
        self.dirty.clear();
        self.depth = 0;
        std::mem::take(&mut self.buffer)
    }

    /// Undo the transaction: restore every touched projection from its
    /// pre-change snapshot and clear all transaction state. Idempotent.
    pub fn rollback(&mut self) {
        for (id, snap) in self.change_snaps.drain() {
            self.changes.insert(id, snap);
        }
        for (id, snap) in self.view_snaps.drain() {
            self.views.insert(id, snap);
        }
        self.buffer.clear();
        self.dirty.clear();
        self.depth = 0;
    }

    /// Whether the current transaction has buffered events.
    pub fn is_dirty(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Discard the reactive residue of a log replay.
    ///
    /// Recovery feeds the whole log through [`reduce`](Core::reduce)
    /// without running machines; the dirty markers and snapshots it
    /// accumulates must not leak into the first live transaction.
    pub(crate) fn finish_recovery(&mut self) {
        self.change_snaps.clear();
        self.view_snaps.clear();
        self.dirty.clear();
    }

    /// One pass of the state-machine fixpoint: drain the dirty markers
    /// and invoke each machine watching one of them exactly once.
    /// Recursive `produce` calls from triggers re-populate the dirty set
    /// and repeat the pass through re-entry.
    fn run_machines(&mut self) -> Result<(), CoreError> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let dirty = std::mem::take(&mut self.dirty);
        let triggered: Vec<Arc<dyn StateMachine>> = self
            .machines
            .iter()
            .filter(|m| dirty.contains(m.view_id()))
            .cloned()
            .collect();
        for machine in triggered {
            tracing::debug!(view_id = machine.view_id(), "state machine triggered");
            machine.trigger(&mut TriggerCtx { core: self })?;
        }
        Ok(())
    }
}
