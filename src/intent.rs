//! Order intent tracking for eventual confirmation
//!
//! An order the executor accepted but has not filled stays here until a
//! later cycle sees it fill, fail, or wait too long.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::strategy::OrderRequest;

/// Intent states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum IntentState {
    Pending { cycles_waited: u32 },
    Filled,
    Failed { error: String },
    Cancelled { reason: String },
}

impl IntentState {
    pub fn is_finalized(&self) -> bool {
        !matches!(self, IntentState::Pending { .. })
    }
}

/// A submitted request and where it stands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedIntent {
    pub request: OrderRequest,
    pub state: IntentState,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Intent registry for one asset
pub struct IntentRegistry {
    intents: HashMap<Uuid, TrackedIntent>,
    max_pending_cycles: u32,
    max_age: Duration,
}

impl IntentRegistry {
    pub fn new(max_pending_cycles: u32) -> Self {
        Self {
            intents: HashMap::new(),
            max_pending_cycles,
            max_age: Duration::hours(1),
        }
    }

    /// Start tracking a request the executor left pending
    pub fn track_pending(&mut self, request: OrderRequest, now: DateTime<Utc>) {
        let id = request.intent.id;
        debug!("Tracking pending order {} for {}", id, request.intent.asset);
        self.intents.insert(
            id,
            TrackedIntent {
                request,
                state: IntentState::Pending { cycles_waited: 0 },
                submitted_at: now,
                updated_at: now,
            },
        );
    }

    /// The request still waiting for confirmation, if any
    pub fn pending(&self) -> Option<&TrackedIntent> {
        self.intents.values().find(|i| !i.state.is_finalized())
    }

    pub fn has_pending(&self) -> bool {
        self.pending().is_some()
    }

    pub fn get(&self, id: Uuid) -> Option<&TrackedIntent> {
        self.intents.get(&id)
    }

    /// Count one more cycle without confirmation. Returns true once the
    /// order has waited as many cycles as allowed.
    pub fn tick(&mut self, id: Uuid, now: DateTime<Utc>) -> bool {
        let max = self.max_pending_cycles;
        match self.intents.get_mut(&id) {
            Some(TrackedIntent {
                state: IntentState::Pending { cycles_waited },
                updated_at,
                ..
            }) => {
                *cycles_waited += 1;
                *updated_at = now;
                *cycles_waited >= max
            }
            _ => false,
        }
    }

    /// Record the final state of an intent
    pub fn finalize(&mut self, id: Uuid, state: IntentState, now: DateTime<Utc>) {
        match self.intents.get_mut(&id) {
            Some(intent) => {
                debug!("Intent {} state: {:?} -> {:?}", id, intent.state, state);
                intent.state = state;
                intent.updated_at = now;
            }
            None => warn!("Finalizing unknown intent {}", id),
        }
    }

    /// Drop finalized intents older than the retention window
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let max_age = self.max_age;
        let before = self.intents.len();
        self.intents
            .retain(|_, intent| !intent.state.is_finalized() || now - intent.updated_at < max_age);
        let removed = before - self.intents.len();
        if removed > 0 {
            debug!("Cleaned up {} old intents", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}
