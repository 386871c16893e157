//! Variable replication: LWW-stamped active/lazy variables and the per-mode store.

use std::collections::HashMap;

use serde_json::Value;

use crate::identity::PeerId;
use crate::protocol::{VarMode, VarState, VariableSnapshot};

/// Write stamp. Total order: time first, then updater ID (lexical).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub time: u64,
    pub updater: PeerId,
}

impl Stamp {
    pub fn new(time: u64, updater: PeerId) -> Self {
        Self { time, updater }
    }

    /// Stamp of a never-written variable; every real write supersedes it.
    pub fn origin() -> Self {
        Self {
            time: 0,
            updater: PeerId::default(),
        }
    }

    /// True if a write carrying `self` wins over the current stamp.
    pub fn supersedes(&self, current: &Stamp) -> bool {
        self.time > current.time || (self.time == current.time && self.updater > current.updater)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariableKind {
    /// Held locally, read synchronously, pushed to every peer on change.
    Active { value: Value },
    /// Authoritative at the server; elsewhere only a possibly stale cache.
    Lazy { cached: Value },
}

/// Result of applying a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Lost the LWW comparison; nothing changed.
    Stale,
    Applied { previous: Value },
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied { .. })
    }

    /// True if the write won and replaced a different value.
    pub fn changed(&self, current: &Value) -> bool {
        match self {
            WriteOutcome::Applied { previous } => previous != current,
            WriteOutcome::Stale => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    name: String,
    kind: VariableKind,
    owner: PeerId,
    stamp: Stamp,
}

impl Variable {
    /// New `null` variable with the origin stamp.
    pub fn new(name: impl Into<String>, mode: VarMode, owner: PeerId) -> Self {
        let kind = match mode {
            VarMode::Active => VariableKind::Active { value: Value::Null },
            VarMode::Lazy => VariableKind::Lazy { cached: Value::Null },
        };
        Self {
            name: name.into(),
            kind,
            owner,
            stamp: Stamp::origin(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> VarMode {
        match self.kind {
            VariableKind::Active { .. } => VarMode::Active,
            VariableKind::Lazy { .. } => VarMode::Lazy,
        }
    }

    pub fn kind(&self) -> &VariableKind {
        &self.kind
    }

    /// Active value, or the lazy cache.
    pub fn value(&self) -> &Value {
        match &self.kind {
            VariableKind::Active { value } => value,
            VariableKind::Lazy { cached } => cached,
        }
    }

    /// Peer that caused this variable to exist.
    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    /// Apply a write under the LWW rule. Losing writes are silent no-ops.
    pub fn apply(&mut self, value: Value, stamp: Stamp) -> WriteOutcome {
        if !stamp.supersedes(&self.stamp) {
            return WriteOutcome::Stale;
        }
        self.stamp = stamp;
        let slot = match &mut self.kind {
            VariableKind::Active { value } => value,
            VariableKind::Lazy { cached } => cached,
        };
        let previous = std::mem::replace(slot, value);
        WriteOutcome::Applied { previous }
    }

    pub fn state(&self) -> VarState {
        VarState {
            value: self.value().clone(),
            time: self.stamp.time,
            from: self.stamp.updater.clone(),
        }
    }
}

/// One map per mode; the same name may exist independently in both.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    active: HashMap<String, Variable>,
    lazy: HashMap<String, Variable>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, mode: VarMode) -> &HashMap<String, Variable> {
        match mode {
            VarMode::Active => &self.active,
            VarMode::Lazy => &self.lazy,
        }
    }

    fn map_mut(&mut self, mode: VarMode) -> &mut HashMap<String, Variable> {
        match mode {
            VarMode::Active => &mut self.active,
            VarMode::Lazy => &mut self.lazy,
        }
    }

    pub fn get(&self, mode: VarMode, name: &str) -> Option<&Variable> {
        self.map(mode).get(name)
    }

    pub fn get_or_create(&mut self, mode: VarMode, name: &str, owner: &PeerId) -> &mut Variable {
        self.map_mut(mode)
            .entry(name.to_owned())
            .or_insert_with(|| Variable::new(name, mode, owner.clone()))
    }

    /// Apply a write, creating the variable (owned by the writer) on first touch.
    pub fn apply(&mut self, mode: VarMode, name: &str, value: Value, stamp: Stamp) -> WriteOutcome {
        let owner = stamp.updater.clone();
        self.get_or_create(mode, name, &owner).apply(value, stamp)
    }

    /// Apply every entry of a snapshot. Returns the entries whose value actually changed.
    pub fn seed(&mut self, snapshot: VariableSnapshot) -> Vec<(VarMode, String, Value)> {
        let mut changed = Vec::new();
        let entries = snapshot
            .active
            .into_iter()
            .map(|e| (VarMode::Active, e))
            .chain(snapshot.lazy.into_iter().map(|e| (VarMode::Lazy, e)));
        for (mode, (name, state)) in entries {
            let outcome = self.apply(mode, &name, state.value, Stamp::new(state.time, state.from));
            if let Some(var) = self.get(mode, &name) {
                if outcome.changed(var.value()) {
                    changed.push((mode, name, var.value().clone()));
                }
            }
        }
        changed
    }

    pub fn snapshot(&self) -> VariableSnapshot {
        VariableSnapshot {
            active: self
                .active
                .iter()
                .map(|(name, var)| (name.clone(), var.state()))
                .collect(),
            lazy: self
                .lazy
                .iter()
                .map(|(name, var)| (name.clone(), var.state()))
                .collect(),
        }
    }

    pub fn len(&self, mode: VarMode) -> usize {
        self.map(mode).len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.lazy.is_empty()
    }
}
