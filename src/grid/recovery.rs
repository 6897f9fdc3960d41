//! Stale-leg detection and recovery policies
//!
//! Each tick the scheduler first reconciles the registry against the resting
//! exit orders: a leg whose exits vanished has either been taken out by its
//! take-profit, or the exit was cancelled while exposure remains. The net
//! position decides which. Legs open past the configured timeout then get the
//! configured [`RecoveryMode`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::config::{Direction, EngineConfig, RecoveryMode};
use super::correlation::{CorrelationIds, OrderCategory};
use super::errors::GridResult;
use super::exit::{CloseReason, CloseTarget, ExitManager};
use super::gateway::ExchangeGateway;
use super::state::State;
use super::types::{ExitOrderRef, OrderRequest, OrderResultStatus, TrackedPosition};

/// Minimum spacing between recovery attempts on one leg
const RECOVERY_COOLDOWN_SECS: i64 = 5;

/// Ladder rung offsets from the current price, in percent
const LADDER_STEPS_PCT: [Decimal; 3] = [dec!(1.5), dec!(3.0), dec!(4.5)];

/// What one recovery pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Legs whose exits filled
    pub completed: usize,
    /// Legs whose exits vanished while exposure remained
    pub retracked: usize,
    /// Stale legs a policy acted on
    pub recovered: usize,
    pub failed: usize,
}

/// Applies the configured recovery policy to stale legs
pub struct RecoveryScheduler {
    config: Arc<EngineConfig>,
    ids: CorrelationIds,
}

impl RecoveryScheduler {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let ids = CorrelationIds::new(&config.contract, config.direction);
        Self { config, ids }
    }

    /// Reconcile the registry, then recover stale legs
    pub async fn run<G: ExchangeGateway>(
        &self,
        gateway: &G,
        exits: &ExitManager,
        state: &mut State,
        current_price: Decimal,
        current_position: Decimal,
        now: DateTime<Utc>,
    ) -> GridResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        self.reconcile(gateway, state, current_position, &mut report);

        let cooldown = Duration::seconds(RECOVERY_COOLDOWN_SECS);
        for id in state.tracked_positions.stale(now, self.config.position_timeout()) {
            let Some(leg) = state.tracked_positions.get(id).cloned() else {
                continue;
            };
            if leg.last_recovery_time.is_some_and(|last| now - last < cooldown) {
                continue;
            }

            let result = match self.config.recovery_mode {
                RecoveryMode::None => {
                    warn!(
                        "Position {} open for {} min with no recovery configured",
                        id,
                        leg.age(now).num_minutes()
                    );
                    if let Some(p) = state.tracked_positions.get_mut(id) {
                        p.last_recovery_time = Some(now);
                    }
                    continue;
                }
                RecoveryMode::Aggressive => {
                    self.recover_aggressive(gateway, exits, state, &leg, now).await
                }
                RecoveryMode::Ladder => {
                    if leg.laddered {
                        continue;
                    }
                    self.recover_ladder(gateway, exits, state, &leg, current_price).await
                }
                RecoveryMode::Hedge => self.recover_hedge(gateway, exits, state, &leg).await,
            };

            match result {
                Ok(true) => {
                    report.recovered += 1;
                    if let Some(p) = state.tracked_positions.get_mut(id) {
                        p.last_recovery_time = Some(now);
                    }
                }
                Ok(false) => {
                    report.failed += 1;
                    self.mark_failed(state, id, now);
                }
                Err(e) => {
                    warn!("Recovery of position {} failed: {}", id, e);
                    report.failed += 1;
                    self.mark_failed(state, id, now);
                }
            }
        }

        if report != RecoveryReport::default() {
            debug!("Recovery pass: {:?}", report);
        }
        Ok(report)
    }

    /// Prune legs whose exits vanished, re-tracking those the net position
    /// still carries
    fn reconcile<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut State,
        current_position: Decimal,
        report: &mut RecoveryReport,
    ) {
        let active = state.active_exit_ids();
        let mut pruned = state.tracked_positions.prune_by_active_orders(&active);
        if pruned.is_empty() {
            return;
        }
        pruned.sort_by_key(|p| p.open_time);

        let in_flight = state
            .filled_entry_quantity
            .map(|q| self.config.direction.sign() * q)
            .unwrap_or(Decimal::ZERO);
        let mut explained = state.tracked_positions.signed_exposure() + in_flight;
        let tolerance = gateway.precision().step_size / Decimal::TWO;

        for mut leg in pruned {
            let unexplained = current_position - explained;
            let same_side = Direction::from_signed(unexplained) == Some(leg.side);
            if same_side && unexplained.abs() + tolerance >= leg.size {
                warn!(
                    "Exit for position {} vanished but exposure remains; re-tracking",
                    leg.position_id
                );
                let released = leg.clear_exit_orders();
                state.remove_correlations(released);
                explained += leg.signed_size();
                state.tracked_positions.track(leg);
                report.retracked += 1;
            } else {
                info!(
                    "Position {} completed: {} {} entry {} exit {}",
                    leg.position_id,
                    leg.side.as_str(),
                    leg.size,
                    leg.entry_price,
                    leg.exit_price
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "unknown".into())
                );
                state.remove_correlations(leg.correlation_ids().collect::<Vec<_>>());
                report.completed += 1;
            }
        }
    }

    fn mark_failed(&self, state: &mut State, position_id: u64, now: DateTime<Utc>) {
        if let Some(p) = state.tracked_positions.get_mut(position_id) {
            p.recovery_attempts += 1;
            p.last_recovery_time = Some(now);
        }
    }

    /// Cancel a leg's exits and forget them
    async fn withdraw_exits<G: ExchangeGateway>(
        &self,
        gateway: &G,
        exits: &ExitManager,
        state: &mut State,
        leg: &TrackedPosition,
    ) {
        for order_id in &leg.exit_order_ids {
            exits.cancel_best_effort(gateway, order_id).await;
        }
        state
            .active_exit_orders
            .retain(|o| !leg.exit_order_ids.contains(&o.id));
        if let Some(p) = state.tracked_positions.get_mut(leg.position_id) {
            let released = p.clear_exit_orders();
            state.remove_correlations(released);
        }
    }

    async fn recover_aggressive<G: ExchangeGateway>(
        &self,
        gateway: &G,
        exits: &ExitManager,
        state: &mut State,
        leg: &TrackedPosition,
        now: DateTime<Utc>,
    ) -> GridResult<bool> {
        warn!(
            "Aggressive recovery: closing position {} ({} {}) at market",
            leg.position_id,
            leg.side.as_str(),
            leg.size
        );
        self.withdraw_exits(gateway, exits, state, leg).await;
        exits
            .market_close(
                gateway,
                state,
                CloseTarget::Leg(leg.position_id),
                CloseReason::Recovery,
                now,
            )
            .await
    }

    /// Replace the exit with three reduce-only limits stepped away from the price
    async fn recover_ladder<G: ExchangeGateway>(
        &self,
        gateway: &G,
        exits: &ExitManager,
        state: &mut State,
        leg: &TrackedPosition,
        current_price: Decimal,
    ) -> GridResult<bool> {
        let side = leg.side.exit_side();
        let rungs = ladder_sizes(gateway, leg.size);

        warn!(
            "Ladder recovery for position {} ({} {}) around {} in {} rungs",
            leg.position_id,
            leg.side.as_str(),
            leg.size,
            current_price,
            rungs.len()
        );
        self.withdraw_exits(gateway, exits, state, leg).await;

        let mut placed = 0;
        let mut filled = Decimal::ZERO;

        for (i, (step_pct, size)) in LADDER_STEPS_PCT.iter().zip(rungs).enumerate() {
            let offset = leg.side.sign() * *step_pct / Decimal::ONE_HUNDRED;
            let price = gateway.round_to_tick(current_price * (Decimal::ONE + offset));

            let rung = i as u32 + 1;
            let correlation_id = self.ids.derive(leg.position_id, OrderCategory::Ladder(rung));
            let request = OrderRequest::limit(size, price, side)
                .reduce_only(true)
                .with_correlation_id(correlation_id);

            let result = match gateway.place_limit_order(&self.config.contract, &request).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Ladder rung {} for position {} failed: {}", rung, leg.position_id, e);
                    continue;
                }
            };

            match (result.status, result.order_id) {
                (OrderResultStatus::Resting, Some(order_id)) => {
                    debug!("Ladder rung {}: {} {} @ {}", rung, side.as_str(), size, price);
                    if let Some(p) = state.tracked_positions.get_mut(leg.position_id) {
                        p.record_exit_order(order_id.clone(), correlation_id, price);
                    }
                    state
                        .active_exit_orders
                        .push(ExitOrderRef::new(order_id, price, size, side));
                    state
                        .correlation_to_position
                        .insert(correlation_id, leg.position_id);
                    placed += 1;
                }
                (OrderResultStatus::Filled { filled_size, .. }, _) => {
                    filled += filled_size;
                    placed += 1;
                }
                (OrderResultStatus::Resting, None) => {
                    warn!("Ladder rung {} resting without an order id", rung);
                }
                (OrderResultStatus::Rejected(reason), _) => {
                    warn!(
                        "Ladder rung {} for position {} rejected: {}",
                        rung, leg.position_id, reason
                    );
                }
            }
        }

        if placed == 0 {
            return Ok(false);
        }

        let remaining = leg.size - filled;
        if remaining <= Decimal::ZERO {
            if let Some(closed) = state.tracked_positions.remove(leg.position_id) {
                state.remove_correlations(closed.correlation_ids().collect::<Vec<_>>());
            }
        } else if let Some(p) = state.tracked_positions.get_mut(leg.position_id) {
            p.size = remaining;
            p.laddered = true;
        }
        Ok(true)
    }

    /// Neutralize the leg with an opposite market order
    async fn recover_hedge<G: ExchangeGateway>(
        &self,
        gateway: &G,
        exits: &ExitManager,
        state: &mut State,
        leg: &TrackedPosition,
    ) -> GridResult<bool> {
        warn!(
            "Hedge recovery for position {} ({} {})",
            leg.position_id,
            leg.side.as_str(),
            leg.size
        );
        self.withdraw_exits(gateway, exits, state, leg).await;

        let correlation_id = self.ids.derive(leg.position_id, OrderCategory::Hedge);
        let request = OrderRequest::market(leg.size, leg.side.exit_side())
            .with_correlation_id(correlation_id);
        let result = gateway.place_market_order(&self.config.contract, &request).await?;

        if let OrderResultStatus::Rejected(reason) = &result.status {
            warn!("Hedge for position {} rejected: {}", leg.position_id, reason);
            return Ok(false);
        }

        if let Some(p) = state.tracked_positions.get_mut(leg.position_id) {
            p.hedged = true;
        }
        state
            .correlation_to_position
            .insert(correlation_id, leg.position_id);
        state.last_known_net_position -= leg.signed_size();
        state.last_known_margin_used = Decimal::ZERO;
        state.cached_margin_ratio = None;
        info!("Position {} hedged", leg.position_id);
        Ok(true)
    }
}

/// Rung sizes: equal step-rounded thirds with the remainder on the last
/// rung, or one rung for the whole leg when a third rounds to nothing
fn ladder_sizes<G: ExchangeGateway>(gateway: &G, size: Decimal) -> Vec<Decimal> {
    let count = LADDER_STEPS_PCT.len();
    let rung = gateway.round_to_step(size / Decimal::from(count as u32));
    if rung <= Decimal::ZERO {
        return vec![size];
    }
    let mut sizes = vec![rung; count - 1];
    sizes.push(size - rung * Decimal::from((count - 1) as u32));
    sizes
}
