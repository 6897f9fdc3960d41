//! Engine state aggregate

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::registry::PositionRegistry;
use super::types::{CycleState, ExitOrderRef};

/// Mutable state the engine operates on
///
/// Singly owned by the engine; components receive it by `&mut` for the
/// duration of one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub cycle_state: CycleState,

    /// Resting exit-side orders, rebuilt every tick from the gateway listing
    #[serde(default)]
    pub active_exit_orders: Vec<ExitOrderRef>,

    #[serde(default)]
    pub tracked_positions: PositionRegistry,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_entry_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_entry_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_entry_quantity: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_entry_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_entry_correlation_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_entry_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_entry_quantity: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filled_entry_correlation_id: Option<u64>,

    /// Position id allocated for the in-flight cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_position_id: Option<u64>,

    /// Signed net position (+ long, - short)
    #[serde(default)]
    pub last_known_net_position: Decimal,
    #[serde(default)]
    pub last_known_margin_used: Decimal,
    /// Live margin/exposure ratio from the last snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_margin_ratio: Option<Decimal>,
    /// 1 / effective leverage, set during leverage preparation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage_margin_ratio: Option<Decimal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stop_loss_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_exit_order_count: usize,

    #[serde(default)]
    pub position_sequence: u64,
    /// Market closes submitted so far; keeps their client ids unique
    #[serde(default)]
    pub close_sequence: u64,

    /// correlation id -> position id
    #[serde(default)]
    pub correlation_to_position: HashMap<u64, u64>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a position id that has never been used
    pub fn allocate_position_id(&mut self) -> u64 {
        let floor = self.position_sequence.max(self.tracked_positions.last_id());
        self.tracked_positions.advance_ids_to(floor);
        let id = self.tracked_positions.reserve_id();
        self.position_sequence = id;
        id
    }

    /// An entry order is resting; wait for its fill
    pub fn begin_pending_entry(
        &mut self,
        order_id: String,
        price: Decimal,
        quantity: Decimal,
        correlation_id: u64,
        position_id: u64,
        now: DateTime<Utc>,
    ) {
        self.cycle_state = CycleState::AwaitingFill;
        self.pending_entry_order_id = Some(order_id);
        self.pending_entry_price = Some(price);
        self.pending_entry_quantity = Some(quantity);
        self.pending_entry_time = Some(now);
        self.pending_entry_correlation_id = Some(correlation_id);
        self.cycle_position_id = Some(position_id);
        self.correlation_to_position.insert(correlation_id, position_id);
    }

    /// The pending entry filled
    pub fn record_entry_fill(&mut self, price: Decimal, quantity: Decimal) {
        self.filled_entry_price = Some(price);
        self.filled_entry_quantity = Some(quantity);
        self.filled_entry_correlation_id = self.pending_entry_correlation_id.take();
        self.pending_entry_order_id = None;
        self.pending_entry_price = None;
        self.pending_entry_quantity = None;
        self.pending_entry_time = None;
    }

    /// The entry order filled on submission
    pub fn record_immediate_fill(
        &mut self,
        position_id: u64,
        correlation_id: u64,
        price: Decimal,
        quantity: Decimal,
    ) {
        self.cycle_state = CycleState::AwaitingFill;
        self.filled_entry_price = Some(price);
        self.filled_entry_quantity = Some(quantity);
        self.filled_entry_correlation_id = Some(correlation_id);
        self.cycle_position_id = Some(position_id);
        self.correlation_to_position.insert(correlation_id, position_id);
    }

    /// Exit submitted (or attempted); back to READY
    pub fn complete_cycle(&mut self) {
        self.clear_cycle();
    }

    /// Drop the in-flight entry without a fill
    ///
    /// Returns the correlation id of the abandoned entry, if any.
    pub fn abort_pending_entry(&mut self) -> Option<u64> {
        let correlation_id = self.pending_entry_correlation_id;
        if let Some(id) = correlation_id {
            self.correlation_to_position.remove(&id);
        }
        self.clear_cycle();
        correlation_id
    }

    fn clear_cycle(&mut self) {
        self.cycle_state = CycleState::Ready;
        self.pending_entry_order_id = None;
        self.pending_entry_price = None;
        self.pending_entry_quantity = None;
        self.pending_entry_time = None;
        self.pending_entry_correlation_id = None;
        self.filled_entry_price = None;
        self.filled_entry_quantity = None;
        self.filled_entry_correlation_id = None;
        self.cycle_position_id = None;
    }

    /// Next market-close sequence number
    pub fn next_close_sequence(&mut self) -> u64 {
        self.close_sequence += 1;
        self.close_sequence
    }

    pub fn has_pending_entry(&self) -> bool {
        self.pending_entry_order_id.is_some()
    }

    pub fn has_filled_entry(&self) -> bool {
        self.filled_entry_price.is_some() && self.filled_entry_quantity.is_some()
    }

    /// READY iff no entry in flight; AWAITING_FILL iff exactly one of pending/filled
    pub fn check_cycle_invariant(&self) -> bool {
        let pending = self.has_pending_entry();
        let filled = self.has_filled_entry();
        let ok = match self.cycle_state {
            CycleState::Ready => !pending && !filled,
            CycleState::AwaitingFill => pending ^ filled,
        };
        if !ok {
            warn!(
                "Cycle invariant violated: state={:?} pending={} filled={}",
                self.cycle_state, pending, filled
            );
        }
        ok
    }

    /// Margin per unit notional: live ratio, then leverage fallback, then 1
    pub fn margin_ratio(&self) -> Decimal {
        self.cached_margin_ratio
            .or(self.leverage_margin_ratio)
            .unwrap_or(Decimal::ONE)
    }

    /// Forget correlation ids of a closed leg
    pub fn remove_correlations(&mut self, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            if self.correlation_to_position.remove(&id).is_some() {
                debug!("Released correlation id {}", id);
            }
        }
    }

    pub fn active_exit_ids(&self) -> HashSet<String> {
        self.active_exit_orders.iter().map(|o| o.id.clone()).collect()
    }

    pub fn active_exit_count(&self) -> usize {
        self.active_exit_orders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::Direction;
    use crate::grid::types::{OrderSide, TrackedPosition};
    use rust_decimal_macros::dec;

    #[test]
    fn test_state_serialization() {
        let now = Utc::now();
        let mut state = State::new();
        let id = state.allocate_position_id();
        let mut leg = TrackedPosition::new(id, dec!(100), dec!(0.5), Direction::Long, now, 42);
        leg.record_exit_order("ord-1", 43, dec!(100.8));
        state.tracked_positions.track(leg);
        state.correlation_to_position.insert(42, id);
        state
            .active_exit_orders
            .push(ExitOrderRef::new("ord-1", dec!(100.8), dec!(0.5), OrderSide::Sell));
        state.last_known_net_position = dec!(0.5);
        state.cached_margin_ratio = Some(dec!(0.1));
        state.last_stop_loss_time = Some(now);

        let json = serde_json::to_string(&state).unwrap();
        let loaded: State = serde_json::from_str(&json).unwrap();

        assert_eq!(loaded, state);
        assert_eq!(loaded.tracked_positions.all()[0].exit_order_ids, vec!["ord-1"]);
    }

    #[test]
    fn test_cycle_invariant() {
        let now = Utc::now();
        let mut state = State::new();
        assert!(state.check_cycle_invariant());

        let pid = state.allocate_position_id();
        state.begin_pending_entry("ord-1".into(), dec!(99), dec!(1), 99, pid, now);
        assert_eq!(state.cycle_state, CycleState::AwaitingFill);
        assert!(state.check_cycle_invariant());

        state.record_entry_fill(dec!(100), dec!(1));
        assert!(!state.has_pending_entry());
        assert_eq!(state.pending_entry_price, None);
        assert_eq!(state.filled_entry_correlation_id, Some(99));
        assert!(state.check_cycle_invariant());

        state.complete_cycle();
        assert_eq!(state.cycle_state, CycleState::Ready);
        assert!(state.check_cycle_invariant());

        state.filled_entry_price = Some(dec!(1));
        state.filled_entry_quantity = Some(dec!(1));
        assert!(!state.check_cycle_invariant());
    }

    #[test]
    fn test_abort_pending_entry_releases_correlation() {
        let mut state = State::new();
        let pid = state.allocate_position_id();
        state.begin_pending_entry("ord-1".into(), dec!(99), dec!(1), 7, pid, Utc::now());

        assert_eq!(state.abort_pending_entry(), Some(7));
        assert!(state.correlation_to_position.is_empty());
        assert_eq!(state.cycle_state, CycleState::Ready);
    }

    #[test]
    fn test_position_ids_never_reused() {
        let mut state = State::new();
        let a = state.allocate_position_id();
        let b = state.allocate_position_id();
        assert!(b > a);

        let leg = TrackedPosition::new(50, dec!(1), dec!(1), Direction::Long, Utc::now(), 1);
        state.tracked_positions.track(leg);
        assert_eq!(state.allocate_position_id(), 51);
    }

    #[test]
    fn test_margin_ratio_resolution() {
        let mut state = State::new();
        assert_eq!(state.margin_ratio(), Decimal::ONE);
        state.leverage_margin_ratio = Some(dec!(0.2));
        assert_eq!(state.margin_ratio(), dec!(0.2));
        state.cached_margin_ratio = Some(dec!(0.1));
        assert_eq!(state.margin_ratio(), dec!(0.1));
    }
}
