//! Registry of open grid legs

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::types::TrackedPosition;

/// In-memory collection of legs awaiting their take-profit exit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionRegistry {
    positions: Vec<TrackedPosition>,
    /// Highest position id ever handed out
    #[serde(default)]
    last_id: u64,
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a leg, assigning a fresh id if it has none
    ///
    /// Returns the leg's position id.
    pub fn track(&mut self, mut position: TrackedPosition) -> u64 {
        if position.position_id == 0 {
            position.position_id = self.reserve_id();
        } else {
            self.advance_ids_to(position.position_id);
        }
        let id = position.position_id;
        debug!(
            "Tracking position {}: {} {} @ {}",
            id,
            position.side.as_str(),
            position.size,
            position.entry_price
        );
        self.positions.push(position);
        id
    }

    /// Hand out the next unused position id
    pub fn reserve_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    /// Never hand out an id at or below `id`
    pub fn advance_ids_to(&mut self, id: u64) {
        self.last_id = self.last_id.max(id);
    }

    /// Remove legs whose exit orders are no longer resting
    ///
    /// Legs that never had an exit order accepted are kept for the retry path.
    pub fn prune_by_active_orders(&mut self, active_ids: &HashSet<String>) -> Vec<TrackedPosition> {
        let (pruned, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.positions)
            .into_iter()
            .partition(|p| p.exit_vanished(active_ids));
        self.positions = kept;
        pruned
    }

    pub fn all(&self) -> &[TrackedPosition] {
        &self.positions
    }

    pub fn get(&self, position_id: u64) -> Option<&TrackedPosition> {
        self.positions.iter().find(|p| p.position_id == position_id)
    }

    pub fn get_mut(&mut self, position_id: u64) -> Option<&mut TrackedPosition> {
        self.positions.iter_mut().find(|p| p.position_id == position_id)
    }

    pub fn remove(&mut self, position_id: u64) -> Option<TrackedPosition> {
        let idx = self.positions.iter().position(|p| p.position_id == position_id)?;
        Some(self.positions.remove(idx))
    }

    /// Replace the tracked set wholesale
    pub fn replace(&mut self, positions: Vec<TrackedPosition>) {
        if let Some(max_id) = positions.iter().map(|p| p.position_id).max() {
            self.advance_ids_to(max_id);
        }
        self.positions = positions;
    }

    /// Drain every leg
    pub fn clear(&mut self) -> Vec<TrackedPosition> {
        std::mem::take(&mut self.positions)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Sum of signed leg sizes, ignoring hedged legs
    pub fn signed_exposure(&self) -> Decimal {
        self.positions
            .iter()
            .filter(|p| !p.hedged)
            .map(|p| p.signed_size())
            .sum()
    }

    /// Ids of unhedged legs open for at least `timeout`
    pub fn stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<u64> {
        self.positions
            .iter()
            .filter(|p| !p.hedged && p.is_stale(now, timeout))
            .map(|p| p.position_id)
            .collect()
    }
}
