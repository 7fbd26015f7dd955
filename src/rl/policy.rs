//! Learned policy state and its scoped, single-writer access
//!
//! Readers go through [`PolicyManager::with_state`]. Writers take a
//! [`PolicyLease`], edit a draft copy and [`commit`](PolicyLease::commit) it,
//! which persists the draft and publishes it. Dropping a lease without
//! committing discards the draft. The lease holds the manager's lock for its
//! whole lifetime, so concurrent feedback ingestion cannot lose updates.

use crate::model::{NodeId, RelationKind, SemanticChangeType};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Learned state for one (changed node, test) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PairPolicy {
    /// Additive score adjustment, bounded by `max_adjustment`.
    pub adjustment: f64,
    /// Consecutive passes observed for this pair.
    pub pass_streak: u32,
    pub observations: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyState {
    /// Completed feedback rounds.
    pub runs: u64,
    pairs: HashMap<NodeId, HashMap<NodeId, PairPolicy>>,
    kind_biases: HashMap<(SemanticChangeType, RelationKind), f64>,
}

impl PolicyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pair(&self, change_node_id: &str, test_id: &str) -> PairPolicy {
        self.pairs
            .get(change_node_id)
            .and_then(|tests| tests.get(test_id))
            .copied()
            .unwrap_or_default()
    }

    pub fn pair_mut(&mut self, change_node_id: &str, test_id: &str) -> &mut PairPolicy {
        self.pairs
            .entry(change_node_id.to_string())
            .or_default()
            .entry(test_id.to_string())
            .or_default()
    }

    pub fn set_pair(&mut self, change_node_id: &str, test_id: &str, policy: PairPolicy) {
        *self.pair_mut(change_node_id, test_id) = policy;
    }

    pub fn kind_bias(&self, semantic_type: SemanticChangeType, relation: RelationKind) -> f64 {
        self.kind_biases
            .get(&(semantic_type, relation))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn kind_bias_mut(&mut self, semantic_type: SemanticChangeType, relation: RelationKind) -> &mut f64 {
        self.kind_biases.entry((semantic_type, relation)).or_insert(0.0)
    }

    pub fn set_kind_bias(&mut self, semantic_type: SemanticChangeType, relation: RelationKind, bias: f64) {
        *self.kind_bias_mut(semantic_type, relation) = bias;
    }

    /// All pairs as `(change node, test, policy)`, in no particular order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str, &PairPolicy)> {
        self.pairs.iter().flat_map(|(change, tests)| {
            tests
                .iter()
                .map(move |(test, policy)| (change.as_str(), test.as_str(), policy))
        })
    }

    pub fn kind_biases(&self) -> impl Iterator<Item = (SemanticChangeType, RelationKind, f64)> + '_ {
        self.kind_biases
            .iter()
            .map(|((semantic_type, relation), bias)| (*semantic_type, *relation, *bias))
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.values().map(HashMap::len).sum()
    }
}

/// Durable home of the policy state.
pub trait PolicyStore: Send {
    fn load_policy(&self) -> Result<PolicyState>;
    fn save_policy(&mut self, state: &PolicyState) -> Result<()>;
}

/// Process-local store; state is lost on exit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPolicyStore {
    state: PolicyState,
    saves: usize,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PolicyState) -> Self {
        Self { state, saves: 0 }
    }

    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn load_policy(&self) -> Result<PolicyState> {
        Ok(self.state.clone())
    }

    fn save_policy(&mut self, state: &PolicyState) -> Result<()> {
        self.state = state.clone();
        self.saves += 1;
        Ok(())
    }
}

struct Slot {
    store: Box<dyn PolicyStore>,
    state: PolicyState,
}

pub struct PolicyManager {
    slot: Mutex<Slot>,
}

impl PolicyManager {
    /// Load the current state from `store` and take ownership of it.
    pub fn new(store: Box<dyn PolicyStore>) -> Result<Self> {
        let state = store.load_policy()?;
        Ok(Self {
            slot: Mutex::new(Slot { store, state }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            slot: Mutex::new(Slot {
                store: Box::new(InMemoryPolicyStore::new()),
                state: PolicyState::new(),
            }),
        }
    }

    /// Read the committed state.
    pub fn with_state<R>(&self, f: impl FnOnce(&PolicyState) -> R) -> R {
        f(&self.lock().state)
    }

    /// Start a write session. Blocks while another lease is alive.
    pub fn acquire(&self) -> PolicyLease<'_> {
        let guard = self.lock();
        let draft = guard.state.clone();
        PolicyLease { guard, draft }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PolicyLease<'a> {
    guard: MutexGuard<'a, Slot>,
    draft: PolicyState,
}

impl PolicyLease<'_> {
    pub fn state(&self) -> &PolicyState {
        &self.draft
    }

    pub fn state_mut(&mut self) -> &mut PolicyState {
        &mut self.draft
    }

    /// Persist the draft, then publish it. On a store error the committed
    /// state is left untouched.
    pub fn commit(mut self) -> Result<()> {
        self.guard.store.save_policy(&self.draft)?;
        self.guard.state = std::mem::take(&mut self.draft);
        Ok(())
    }
}
