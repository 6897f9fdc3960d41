//! Take-profit exits, exit retries and market unwinds

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;

use super::config::{Direction, EngineConfig};
use super::correlation::{CorrelationIds, OrderCategory};
use super::errors::{GridError, GridResult};
use super::gateway::ExchangeGateway;
use super::state::State;
use super::types::{Bbo, ExitOrderRef, OrderRequest, OrderResultStatus, OrderSide, TrackedPosition};

/// Minimum spacing between exit resubmissions for one leg
const EXIT_RETRY_BACKOFF_SECS: i64 = 2;
/// Resubmissions before a leg is closed at market
const MAX_EXIT_RETRIES: u32 = 3;

/// What a market unwind closes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CloseTarget {
    /// The whole signed net position; every tracked leg is dropped
    NetPosition(Decimal),
    /// One tracked leg
    Leg(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    StopLoss,
    Recovery,
    ExitRetriesExhausted,
    BoostExit,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::StopLoss => "stop-loss",
            CloseReason::Recovery => "recovery",
            CloseReason::ExitRetriesExhausted => "exit retries exhausted",
            CloseReason::BoostExit => "boost exit",
        };
        f.write_str(s)
    }
}

/// Result of one `handle_filled_entry` call
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    /// Entry still resting
    AwaitingFill,
    /// Entry exceeded its timeout and was cancelled
    EntryTimedOut,
    /// Entry could not be cancelled and the net position shows it filled
    EntryFillInferred { price: Decimal, quantity: Decimal },
    /// Exit resting on the book
    ExitPlaced { order_id: String, price: Decimal },
    /// Exit filled on submission; nothing left to track
    ExitFilled { price: Decimal },
    /// Exit refused; the leg is tracked and the retry path resubmits
    ExitRejected(String),
}

/// Converts entry fills into exit orders and keeps them alive
pub struct ExitManager {
    config: Arc<EngineConfig>,
    ids: CorrelationIds,
}

impl ExitManager {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let ids = CorrelationIds::new(&config.contract, config.direction);
        Self { config, ids }
    }

    /// Take-profit price for a fill, before tick rounding
    ///
    /// The target is a return on margin, so the price move is scaled by the
    /// margin ratio. Short targets are clamped at zero.
    pub fn exit_price(&self, filled_price: Decimal, margin_ratio: Decimal) -> Decimal {
        let move_fraction = self.config.take_profit_fraction() * margin_ratio;
        match self.config.direction {
            Direction::Long => filled_price * (Decimal::ONE + move_fraction),
            Direction::Short => {
                (filled_price * (Decimal::ONE - move_fraction)).max(Decimal::ZERO)
            }
        }
    }

    /// Submit the exit for a filled entry and return the cycle to READY
    ///
    /// A gateway error leaves the state untouched so the next tick retries.
    pub async fn handle_filled_entry<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut State,
        now: DateTime<Utc>,
    ) -> GridResult<ExitOutcome> {
        let (Some(fill_price), Some(fill_qty)) =
            (state.filled_entry_price, state.filled_entry_quantity)
        else {
            return self.check_entry_timeout(gateway, state, now).await;
        };

        let position_id = match state.cycle_position_id {
            Some(id) => id,
            None => state.allocate_position_id(),
        };
        let entry_correlation_id = state
            .filled_entry_correlation_id
            .unwrap_or_else(|| self.ids.derive(position_id, OrderCategory::Entry));
        state.correlation_to_position.insert(entry_correlation_id, position_id);

        let target = gateway.round_to_tick(self.exit_price(fill_price, state.margin_ratio()));
        let side = self.config.direction.exit_side();
        let exit_correlation_id = self.ids.derive(position_id, OrderCategory::Exit);

        let result = if self.config.boost_mode {
            let request = OrderRequest::market(fill_qty, side)
                .reduce_only(true)
                .with_correlation_id(exit_correlation_id);
            gateway.place_market_order(&self.config.contract, &request).await?
        } else {
            let request = OrderRequest::limit(fill_qty, target, side)
                .reduce_only(true)
                .post_only(true)
                .with_correlation_id(exit_correlation_id);
            gateway.place_limit_order(&self.config.contract, &request).await?
        };

        let mut leg = TrackedPosition::new(
            position_id,
            fill_price,
            fill_qty,
            self.config.direction,
            now,
            entry_correlation_id,
        );

        let outcome = match (result.status, result.order_id) {
            (OrderResultStatus::Resting, Some(order_id)) => {
                info!(
                    "Exit placed for position {}: {} {} @ {} (entry {})",
                    position_id,
                    side.as_str(),
                    fill_qty,
                    target,
                    fill_price
                );
                leg.record_exit_order(order_id.clone(), exit_correlation_id, target);
                state
                    .active_exit_orders
                    .push(ExitOrderRef::new(order_id.clone(), target, fill_qty, side));
                state.correlation_to_position.insert(exit_correlation_id, position_id);
                state.tracked_positions.track(leg);
                ExitOutcome::ExitPlaced { order_id, price: target }
            }
            (OrderResultStatus::Filled { avg_price, .. }, _) => {
                info!(
                    "Position {} closed on submission: entry {} exit {}",
                    position_id, fill_price, avg_price
                );
                state.remove_correlations([entry_correlation_id]);
                ExitOutcome::ExitFilled { price: avg_price }
            }
            (OrderResultStatus::Resting, None) => {
                warn!("Exit for position {} resting without an order id", position_id);
                leg.exit_price = Some(target);
                state.tracked_positions.track(leg);
                ExitOutcome::ExitRejected("missing order id".into())
            }
            (OrderResultStatus::Rejected(reason), _) => {
                warn!(
                    "Exit for position {} rejected ({}); will retry",
                    position_id, reason
                );
                leg.exit_price = Some(target);
                state.tracked_positions.track(leg);
                ExitOutcome::ExitRejected(reason)
            }
        };

        state.complete_cycle();
        Ok(outcome)
    }

    async fn check_entry_timeout<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut State,
        now: DateTime<Utc>,
    ) -> GridResult<ExitOutcome> {
        let (Some(order_id), Some(placed_at)) =
            (state.pending_entry_order_id.clone(), state.pending_entry_time)
        else {
            warn!("Awaiting fill without a pending or filled entry; resetting cycle");
            state.abort_pending_entry();
            return Ok(ExitOutcome::EntryTimedOut);
        };

        if now - placed_at < self.config.entry_timeout() {
            return Ok(ExitOutcome::AwaitingFill);
        }

        match gateway.cancel_order(&self.config.contract, &order_id).await {
            Ok(true) => {
                info!("Entry {} timed out and was cancelled", order_id);
                state.abort_pending_entry();
                Ok(ExitOutcome::EntryTimedOut)
            }
            Ok(false) => {
                warn!("Entry {} timed out but was not cancelled", order_id);
                self.resolve_uncancelled_entry(gateway, state, &order_id, now)
                    .await
            }
            Err(e) => {
                warn!("Failed to cancel timed-out entry {}: {}", order_id, e);
                Ok(ExitOutcome::AwaitingFill)
            }
        }
    }

    /// Decide what happened to an entry the venue would not cancel
    ///
    /// Exposure gained since the entry was placed is recorded as its fill.
    /// An entry still resting keeps the cycle waiting for the push fill with a
    /// fresh timeout; one that is gone without exposure aborts the cycle.
    async fn resolve_uncancelled_entry<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut State,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> GridResult<ExitOutcome> {
        let contract = &self.config.contract;

        let position = match gateway.get_net_position(contract).await {
            Ok(position) => position,
            Err(e) => {
                warn!("Failed to read net position for entry {}: {}", order_id, e);
                state.pending_entry_time = Some(now);
                return Ok(ExitOutcome::AwaitingFill);
            }
        };

        let gained = (position - state.last_known_net_position) * self.config.direction.sign();
        if let (Some(price), Some(quantity)) =
            (state.pending_entry_price, state.pending_entry_quantity)
        {
            if gained > Decimal::ZERO {
                let filled = gained.min(quantity);
                info!("Entry {} filled before its cancel: {} @ {}", order_id, filled, price);
                state.record_entry_fill(price, filled);
                return Ok(ExitOutcome::EntryFillInferred {
                    price,
                    quantity: filled,
                });
            }
        }

        match gateway.get_active_orders(contract).await {
            Ok(orders) if orders.iter().any(|o| o.id == order_id) => {
                debug!("Entry {} still resting; waiting for its fill", order_id);
                state.pending_entry_time = Some(now);
                Ok(ExitOutcome::AwaitingFill)
            }
            Ok(_) => {
                info!("Entry {} is gone without a fill; aborting cycle", order_id);
                state.abort_pending_entry();
                Ok(ExitOutcome::EntryTimedOut)
            }
            Err(e) => {
                warn!("Failed to list orders for entry {}: {}", order_id, e);
                state.pending_entry_time = Some(now);
                Ok(ExitOutcome::AwaitingFill)
            }
        }
    }

    /// Resubmit exits for legs that have none resting
    ///
    /// Prices walk away from the touch by tick * multiplier * attempt. After
    /// the retry ceiling the leg is closed at market. Returns the number of
    /// orders submitted.
    pub async fn ensure_exit_orders<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut State,
        current_position: Decimal,
        bbo: Bbo,
        now: DateTime<Utc>,
    ) -> GridResult<usize> {
        let active = state.active_exit_ids();
        let needing: Vec<u64> = state
            .tracked_positions
            .all()
            .iter()
            .filter(|p| !p.hedged && !p.has_active_exit(&active))
            .map(|p| p.position_id)
            .collect();

        if needing.is_empty() {
            return Ok(0);
        }

        if current_position.is_zero() {
            for id in needing {
                if let Some(leg) = state.tracked_positions.remove(id) {
                    info!("Position {} has no exposure left; dropping", id);
                    state.remove_correlations(leg.correlation_ids().collect::<Vec<_>>());
                }
            }
            return Ok(0);
        }

        let backoff = Duration::seconds(EXIT_RETRY_BACKOFF_SECS);
        let mut submitted = 0;

        for id in needing {
            let Some(leg) = state.tracked_positions.get(id).cloned() else {
                continue;
            };

            if leg
                .last_exit_retry_time
                .is_some_and(|last| now - last < backoff)
            {
                continue;
            }

            if leg.exit_retry_count >= MAX_EXIT_RETRIES || self.config.boost_mode {
                let reason = if self.config.boost_mode {
                    CloseReason::BoostExit
                } else {
                    CloseReason::ExitRetriesExhausted
                };
                match self.market_close(gateway, state, CloseTarget::Leg(id), reason, now).await {
                    Ok(true) => submitted += 1,
                    Ok(false) => self.mark_retry(state, id, now),
                    Err(e) => {
                        warn!("Market close of position {} failed: {}", id, e);
                        self.mark_retry(state, id, now);
                    }
                }
                continue;
            }

            if self.resubmit_exit(gateway, state, &leg, bbo, now).await {
                submitted += 1;
            }
        }

        Ok(submitted)
    }

    async fn resubmit_exit<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut State,
        leg: &TrackedPosition,
        bbo: Bbo,
        now: DateTime<Utc>,
    ) -> bool {
        let attempt = leg.exit_retry_count + 1;
        let side = leg.side.exit_side();
        let target = gateway.round_to_tick(self.exit_price(leg.entry_price, state.margin_ratio()));
        let offset = gateway.precision().tick_size
            * Decimal::from(self.config.post_only_tick_multiplier)
            * Decimal::from(attempt);
        let price = match side {
            OrderSide::Sell => target.max(bbo.ask + offset),
            OrderSide::Buy => target.min(bbo.bid - offset),
        };
        let price = gateway.round_to_tick(price);

        if let Some(p) = state.tracked_positions.get_mut(leg.position_id) {
            p.exit_retry_count = attempt;
            p.last_exit_retry_time = Some(now);
        }

        if price <= Decimal::ZERO {
            warn!("Exit retry price for position {} is not positive", leg.position_id);
            return false;
        }

        let correlation_id = self.ids.derive(leg.position_id, OrderCategory::ExitRetry(attempt));
        let request = OrderRequest::limit(leg.size, price, side)
            .reduce_only(true)
            .post_only(true)
            .with_correlation_id(correlation_id);

        let result = match gateway.place_limit_order(&self.config.contract, &request).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Exit retry for position {} failed: {}", leg.position_id, e);
                return false;
            }
        };

        match (result.status, result.order_id) {
            (OrderResultStatus::Resting, Some(order_id)) => {
                info!(
                    "Exit resubmitted for position {} (attempt {}/{}): {} {} @ {}",
                    leg.position_id,
                    attempt,
                    MAX_EXIT_RETRIES,
                    side.as_str(),
                    leg.size,
                    price
                );
                if let Some(p) = state.tracked_positions.get_mut(leg.position_id) {
                    p.record_exit_order(order_id.clone(), correlation_id, price);
                }
                state
                    .active_exit_orders
                    .push(ExitOrderRef::new(order_id, price, leg.size, side));
                state.correlation_to_position.insert(correlation_id, leg.position_id);
                true
            }
            (OrderResultStatus::Filled { avg_price, .. }, _) => {
                info!("Position {} closed by exit retry at {}", leg.position_id, avg_price);
                if let Some(closed) = state.tracked_positions.remove(leg.position_id) {
                    state.remove_correlations(closed.correlation_ids().collect::<Vec<_>>());
                }
                true
            }
            (OrderResultStatus::Resting, None) => {
                warn!("Exit retry for position {} returned no order id", leg.position_id);
                false
            }
            (OrderResultStatus::Rejected(reason), _) => {
                warn!(
                    "Exit retry for position {} rejected (attempt {}/{}): {}",
                    leg.position_id, attempt, MAX_EXIT_RETRIES, reason
                );
                false
            }
        }
    }

    fn mark_retry(&self, state: &mut State, position_id: u64, now: DateTime<Utc>) {
        if let Some(p) = state.tracked_positions.get_mut(position_id) {
            p.last_exit_retry_time = Some(now);
        }
    }

    /// Close the net position or one leg with a reduce-only market order
    ///
    /// On success the closed legs' exit orders are cancelled and their
    /// registry entries and correlation ids removed. A rejection returns
    /// `Ok(false)` with the state untouched.
    pub async fn market_close<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut State,
        target: CloseTarget,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> GridResult<bool> {
        let (signed_qty, position_id) = match target {
            CloseTarget::NetPosition(qty) => (qty, state.position_sequence),
            CloseTarget::Leg(id) => {
                let leg = state
                    .tracked_positions
                    .get(id)
                    .ok_or(GridError::PositionNotFound(id))?;
                (leg.signed_size(), id)
            }
        };

        if signed_qty.is_zero() {
            debug!("Nothing to close for {:?}", target);
            return Ok(false);
        }

        let sequence = state.next_close_sequence();
        let correlation_id = self.ids.derive(position_id, OrderCategory::MarketClose(sequence));

        let side = if signed_qty > Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let request = OrderRequest::market(signed_qty.abs(), side)
            .reduce_only(true)
            .with_correlation_id(correlation_id);

        warn!(
            "Market close ({}): {} {} at {}",
            reason,
            side.as_str(),
            signed_qty.abs(),
            now
        );
        let result = gateway.place_market_order(&self.config.contract, &request).await?;
        if let OrderResultStatus::Rejected(msg) = &result.status {
            error!("Market close ({}) rejected: {}", reason, msg);
            return Ok(false);
        }

        match target {
            CloseTarget::NetPosition(_) => {
                for leg in state.tracked_positions.clear() {
                    state.remove_correlations(leg.correlation_ids().collect::<Vec<_>>());
                }
                let resting = std::mem::take(&mut state.active_exit_orders);
                for order in resting {
                    self.cancel_best_effort(gateway, &order.id).await;
                }
                state.last_known_net_position = Decimal::ZERO;
            }
            CloseTarget::Leg(id) => {
                if let Some(leg) = state.tracked_positions.remove(id) {
                    for order_id in &leg.exit_order_ids {
                        self.cancel_best_effort(gateway, order_id).await;
                    }
                    state
                        .active_exit_orders
                        .retain(|o| !leg.exit_order_ids.contains(&o.id));
                    state.remove_correlations(leg.correlation_ids().collect::<Vec<_>>());
                    state.last_known_net_position -= leg.signed_size();
                }
            }
        }

        Ok(true)
    }

    /// Cancel every resting exit order
    ///
    /// The venue listing is merged with the cached view; if the listing
    /// fails only the cached orders are cancelled.
    pub async fn cancel_all_exits<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut State,
    ) -> usize {
        let mut resting = std::mem::take(&mut state.active_exit_orders);
        match gateway.get_active_orders(&self.config.contract).await {
            Ok(listed) => {
                let exit_side = self.config.direction.exit_side();
                let pending = state.pending_entry_order_id.as_deref();
                for order in listed {
                    let is_exit = order.side == exit_side && Some(order.id.as_str()) != pending;
                    if is_exit && !resting.iter().any(|r| r.id == order.id) {
                        resting.push(order);
                    }
                }
            }
            Err(e) => warn!(
                "Failed to list resting orders; cancelling {} cached exits: {}",
                resting.len(),
                e
            ),
        }

        let mut cancelled = 0;
        for order in &resting {
            if self.cancel_best_effort(gateway, &order.id).await {
                cancelled += 1;
            }
        }
        for leg in state.tracked_positions.all().to_vec() {
            if let Some(p) = state.tracked_positions.get_mut(leg.position_id) {
                let released = p.clear_exit_orders();
                state.remove_correlations(released);
            }
        }
        cancelled
    }

    /// Cancel an order, logging instead of failing
    pub async fn cancel_best_effort<G: ExchangeGateway>(
        &self,
        gateway: &G,
        order_id: &str,
    ) -> bool {
        match gateway.cancel_order(&self.config.contract, order_id).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("Order {} was not cancelled", order_id);
                false
            }
            Err(e) => {
                warn!("Failed to cancel order {}: {}", order_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::gateway::mock::MockGateway;
    use crate::grid::types::CycleState;
    use rust_decimal_macros::dec;

    fn config(direction: Direction) -> EngineConfig {
        EngineConfig::new(
            "BTC-PERP",
            direction,
            dec!(0.8),
            dec!(0.2),
            10,
            5.0,
            dec!(1000),
            dec!(10),
        )
        .with_order_quantity(dec!(1))
    }

    fn filled_state(price: Decimal, qty: Decimal) -> State {
        let mut state = State::new();
        let pid = state.allocate_position_id();
        state.record_immediate_fill(pid, 500, price, qty);
        state
    }

    #[test]
    fn test_take_profit_scaling() {
        let long = ExitManager::new(Arc::new(config(Direction::Long)));
        assert_eq!(long.exit_price(dec!(100), Decimal::ONE), dec!(100.8));
        assert_eq!(long.exit_price(dec!(100), dec!(0.1)), dec!(100.08));

        let short = ExitManager::new(Arc::new(config(Direction::Short)));
        assert_eq!(short.exit_price(dec!(100), Decimal::ONE), dec!(99.2));

        let mut wide = config(Direction::Short);
        wide.take_profit_pct = dec!(150);
        let wide = ExitManager::new(Arc::new(wide));
        assert_eq!(wide.exit_price(dec!(100), Decimal::ONE), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_handle_filled_entry_places_exit() {
        let gateway = MockGateway::new(dec!(100), dec!(101));
        let exits = ExitManager::new(Arc::new(config(Direction::Long)));
        let mut state = filled_state(dec!(100), dec!(1));

        let outcome = exits
            .handle_filled_entry(&gateway, &mut state, Utc::now())
            .await
            .unwrap();

        assert!(matches!(outcome, ExitOutcome::ExitPlaced { price, .. } if price == dec!(100.8)));
        assert_eq!(state.cycle_state, CycleState::Ready);
        assert_eq!(state.tracked_positions.len(), 1);
        assert_eq!(state.active_exit_orders.len(), 1);

        let orders = gateway.limit_orders.lock().await;
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert!(orders[0].reduce_only);
        assert_eq!(orders[0].price, Some(dec!(100.8)));
    }

    #[tokio::test]
    async fn test_rejected_exit_is_tracked_for_retry() {
        let gateway = MockGateway::new(dec!(100), dec!(101));
        gateway.set_reject_limit(true).await;
        let exits = ExitManager::new(Arc::new(config(Direction::Long)));
        let mut state = filled_state(dec!(100), dec!(1));

        let outcome = exits
            .handle_filled_entry(&gateway, &mut state, Utc::now())
            .await
            .unwrap();

        assert!(matches!(outcome, ExitOutcome::ExitRejected(_)));
        assert_eq!(state.cycle_state, CycleState::Ready);
        let leg = &state.tracked_positions.all()[0];
        assert!(leg.exit_order_ids.is_empty());
        assert_eq!(leg.exit_price, Some(dec!(100.8)));
    }

    #[tokio::test]
    async fn test_entry_timeout_cancels_pending() {
        let gateway = MockGateway::new(dec!(100), dec!(101));
        let exits = ExitManager::new(Arc::new(config(Direction::Long)));
        let mut state = State::new();
        let now = Utc::now();
        let pid = state.allocate_position_id();
        let placed = now - Duration::seconds(31);
        state.begin_pending_entry("ord-9".into(), dec!(100.99), dec!(1), 77, pid, placed);

        let outcome = exits.handle_filled_entry(&gateway, &mut state, now).await.unwrap();

        assert_eq!(outcome, ExitOutcome::EntryTimedOut);
        assert_eq!(state.cycle_state, CycleState::Ready);
        assert_eq!(*gateway.cancelled.lock().await, vec!["ord-9".to_string()]);
        assert!(state.correlation_to_position.is_empty());
    }

    fn timed_out_entry(now: DateTime<Utc>) -> State {
        let mut state = State::new();
        let pid = state.allocate_position_id();
        let placed = now - Duration::seconds(31);
        state.begin_pending_entry("ord-1".into(), dec!(100.99), dec!(1), 77, pid, placed);
        state
    }

    #[tokio::test]
    async fn test_uncancelled_entry_with_exposure_is_recorded_as_filled() {
        let gateway = MockGateway::new(dec!(100), dec!(101));
        *gateway.cancel_fails.lock().await = true;
        gateway.set_net_position(dec!(1)).await;
        let exits = ExitManager::new(Arc::new(config(Direction::Long)));
        let now = Utc::now();
        let mut state = timed_out_entry(now);

        let outcome = exits.handle_filled_entry(&gateway, &mut state, now).await.unwrap();

        assert_eq!(
            outcome,
            ExitOutcome::EntryFillInferred {
                price: dec!(100.99),
                quantity: dec!(1)
            }
        );
        assert!(state.has_filled_entry());
        assert_eq!(state.filled_entry_correlation_id, Some(77));
        assert!(state.check_cycle_invariant());

        // the next call places the take-profit for the inferred fill
        let outcome = exits.handle_filled_entry(&gateway, &mut state, now).await.unwrap();
        assert!(matches!(outcome, ExitOutcome::ExitPlaced { .. }));
        assert_eq!(state.tracked_positions.len(), 1);
    }

    #[tokio::test]
    async fn test_uncancelled_entry_resting_or_gone() {
        let gateway = MockGateway::new(dec!(100), dec!(101));
        *gateway.cancel_fails.lock().await = true;
        gateway
            .add_active_order(ExitOrderRef::new("ord-1", dec!(100.99), dec!(1), OrderSide::Buy))
            .await;
        let exits = ExitManager::new(Arc::new(config(Direction::Long)));
        let now = Utc::now();
        let mut state = timed_out_entry(now);

        // still resting: keep waiting with a fresh timeout
        let outcome = exits.handle_filled_entry(&gateway, &mut state, now).await.unwrap();
        assert_eq!(outcome, ExitOutcome::AwaitingFill);
        assert!(state.has_pending_entry());
        assert_eq!(state.pending_entry_time, Some(now));

        // gone from the book with no exposure: abort
        gateway.drop_order("ord-1").await;
        let later = now + Duration::seconds(31);
        let outcome = exits.handle_filled_entry(&gateway, &mut state, later).await.unwrap();
        assert_eq!(outcome, ExitOutcome::EntryTimedOut);
        assert_eq!(state.cycle_state, CycleState::Ready);
    }

    #[tokio::test]
    async fn test_cancel_all_exits_uses_venue_listing() {
        let gateway = MockGateway::new(dec!(100), dec!(101));
        gateway
            .add_active_order(ExitOrderRef::new("tp-1", dec!(102), dec!(1), OrderSide::Sell))
            .await;
        gateway
            .add_active_order(ExitOrderRef::new("entry-1", dec!(99), dec!(1), OrderSide::Buy))
            .await;
        let exits = ExitManager::new(Arc::new(config(Direction::Long)));
        let mut state = State::new();
        state
            .active_exit_orders
            .push(ExitOrderRef::new("tp-0", dec!(101.5), dec!(1), OrderSide::Sell));

        assert_eq!(exits.cancel_all_exits(&gateway, &mut state).await, 2);
        let cancelled = gateway.cancelled.lock().await.clone();
        assert_eq!(cancelled, vec!["tp-0".to_string(), "tp-1".to_string()]);
        assert!(state.active_exit_orders.is_empty());

        // listing fails: the cached view is still cancelled
        gateway.set_fail_reads(true).await;
        state
            .active_exit_orders
            .push(ExitOrderRef::new("tp-2", dec!(103), dec!(1), OrderSide::Sell));
        assert_eq!(exits.cancel_all_exits(&gateway, &mut state).await, 1);
    }

    #[tokio::test]
    async fn test_ensure_exit_orders_is_idempotent() {
        let gateway = MockGateway::new(dec!(100), dec!(101));
        let exits = ExitManager::new(Arc::new(config(Direction::Long)));
        let mut state = State::new();
        let now = Utc::now();
        state
            .tracked_positions
            .track(TrackedPosition::new(1, dec!(100), dec!(1), Direction::Long, now, 5));

        let bbo = Bbo::new(dec!(100), dec!(101));
        let first = exits
            .ensure_exit_orders(&gateway, &mut state, dec!(1), bbo, now)
            .await
            .unwrap();
        let second = exits
            .ensure_exit_orders(&gateway, &mut state, dec!(1), bbo, now + Duration::seconds(10))
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(gateway.limit_order_count().await, 1);

        // walked one tick past the ask: max(100.8, 101 + 0.01)
        let orders = gateway.limit_orders.lock().await;
        assert_eq!(orders[0].price, Some(dec!(101.01)));
    }

    #[tokio::test]
    async fn test_exit_retry_backoff_and_ceiling() {
        let gateway = MockGateway::new(dec!(100), dec!(101));
        gateway.set_reject_limit(true).await;
        gateway.set_net_position(dec!(1)).await;
        let exits = ExitManager::new(Arc::new(config(Direction::Long)));
        let mut state = State::new();
        let start = Utc::now();
        state
            .tracked_positions
            .track(TrackedPosition::new(1, dec!(100), dec!(1), Direction::Long, start, 5));
        let bbo = Bbo::new(dec!(100), dec!(101));

        for i in 0..3 {
            let at = start + Duration::seconds(3 * i);
            exits
                .ensure_exit_orders(&gateway, &mut state, dec!(1), bbo, at)
                .await
                .unwrap();
            // within backoff: no resubmission
            exits
                .ensure_exit_orders(&gateway, &mut state, dec!(1), bbo, at + Duration::seconds(1))
                .await
                .unwrap();
        }
        assert_eq!(gateway.limit_order_count().await, 3);
        assert_eq!(state.tracked_positions.get(1).unwrap().exit_retry_count, 3);

        let closed = exits
            .ensure_exit_orders(&gateway, &mut state, dec!(1), bbo, start + Duration::seconds(20))
            .await
            .unwrap();
        assert_eq!(closed, 1);
        assert!(state.tracked_positions.is_empty());

        let market = gateway.market_orders.lock().await;
        assert_eq!(market.len(), 1);
        assert_eq!(market[0].side, OrderSide::Sell);
        assert!(market[0].reduce_only);
    }

    #[tokio::test]
    async fn test_market_close_rejection_leaves_state() {
        let gateway = MockGateway::new(dec!(100), dec!(101));
        gateway.set_reject_market(true).await;
        let exits = ExitManager::new(Arc::new(config(Direction::Short)));
        let mut state = State::new();
        let mut leg = TrackedPosition::new(1, dec!(100), dec!(2), Direction::Short, Utc::now(), 5);
        leg.record_exit_order("ord-1", 6, dec!(99.2));
        state.tracked_positions.track(leg);
        state.correlation_to_position.insert(5, 1);

        let closed = exits
            .market_close(
                &gateway,
                &mut state,
                CloseTarget::Leg(1),
                CloseReason::Recovery,
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(!closed);
        assert_eq!(state.tracked_positions.len(), 1);
        assert_eq!(state.correlation_to_position.len(), 1);
        assert!(gateway.cancelled.lock().await.is_empty());

        gateway.set_reject_market(false).await;
        let closed = exits
            .market_close(
                &gateway,
                &mut state,
                CloseTarget::Leg(1),
                CloseReason::Recovery,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(closed);
        assert!(state.tracked_positions.is_empty());
        assert!(state.correlation_to_position.is_empty());
        assert_eq!(*gateway.cancelled.lock().await, vec!["ord-1".to_string()]);
        assert_eq!(gateway.market_orders.lock().await[1].side, OrderSide::Buy);
    }
}
