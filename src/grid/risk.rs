//! Leverage setup, margin snapshot and stop-loss enforcement

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::config::{Direction, EngineConfig};
use super::errors::GridResult;
use super::exit::{CloseReason, CloseTarget, ExitManager};
use super::gateway::ExchangeGateway;
use super::state::State;
use super::types::PositionSnapshot;

/// Minimum spacing between stop-loss unwinds
const STOP_LOSS_COOLDOWN_SECS: i64 = 3;

/// Stop-loss evaluation for one price
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopLossCheck {
    Safe,
    Breached { stop_price: Decimal },
}

/// Risk controller for a leveraged grid
pub struct RiskController {
    config: Arc<EngineConfig>,
}

impl RiskController {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Apply the target leverage and cache 1/leverage as the fallback margin ratio
    pub async fn prepare_leverage<G: ExchangeGateway>(&self, gateway: &G, state: &mut State) {
        let symbol = &self.config.contract;
        let info = match gateway.get_leverage_info(symbol).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Failed to read leverage info for {}: {}", symbol, e);
                return;
            }
        };

        if let Some(target) = self.config.target_leverage {
            let max = info.max_leverage.floor().to_u32().unwrap_or(1).max(1);
            let effective = target.min(max);
            if effective < target {
                warn!(
                    "Target leverage {}x exceeds max {}x for {}; using {}x",
                    target, max, symbol, effective
                );
            }

            match gateway.set_leverage(symbol, effective).await {
                Ok(true) => {
                    info!("Leverage set to {}x for {}", effective, symbol);
                    state.leverage_margin_ratio = Some(Decimal::ONE / Decimal::from(effective));
                    return;
                }
                Ok(false) => warn!("Venue refused leverage {}x for {}", effective, symbol),
                Err(e) => warn!("Failed to set leverage for {}: {}", symbol, e),
            }
        }

        state.leverage_margin_ratio = info.margin_requirement.filter(|r| *r > Decimal::ZERO);
        debug!(
            "Fallback margin ratio for {}: {:?}",
            symbol, state.leverage_margin_ratio
        );
    }

    /// Refresh net position and margin figures into `state`
    ///
    /// Read failures keep the previous values.
    pub async fn refresh_snapshot<G: ExchangeGateway>(
        &self,
        gateway: &G,
        state: &mut State,
        reference_price: Decimal,
    ) -> Option<PositionSnapshot> {
        let contract = &self.config.contract;

        let position = match gateway.get_net_position(contract).await {
            Ok(position) => {
                state.last_known_net_position = position;
                Some(position)
            }
            Err(e) => {
                warn!(
                    "Failed to read net position, keeping {}: {}",
                    state.last_known_net_position, e
                );
                None
            }
        };

        let snapshot = match gateway.get_position_snapshot(contract).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Failed to read position snapshot: {}", e);
                None
            }
        };

        if let Some(position) = position {
            let reserved = snapshot
                .as_ref()
                .and_then(|s| s.margin_reserved)
                .filter(|m| *m > Decimal::ZERO);
            let exposure = snapshot
                .as_ref()
                .and_then(|s| s.exposure_usd)
                .filter(|e| *e > Decimal::ZERO);

            state.last_known_margin_used = if position.is_zero() {
                Decimal::ZERO
            } else {
                reserved
                    .or(exposure)
                    .unwrap_or_else(|| position.abs() * reference_price)
            };

            if let (Some(reserved), Some(exposure)) = (reserved, exposure) {
                state.cached_margin_ratio = Some(reserved / exposure);
            }
        }

        snapshot
    }

    /// Evaluate the stop-loss for a position opened at `entry_price`
    ///
    /// Long stops at entry * (1 - pct/100), short at entry * (1 + pct/100).
    pub fn check_stop_loss(
        &self,
        side: Direction,
        entry_price: Decimal,
        current_price: Decimal,
    ) -> StopLossCheck {
        let pct = self.config.stop_loss_pct / Decimal::ONE_HUNDRED;
        let stop_price = match side {
            Direction::Long => entry_price * (Decimal::ONE - pct),
            Direction::Short => entry_price * (Decimal::ONE + pct),
        };
        let breached = match side {
            Direction::Long => current_price <= stop_price,
            Direction::Short => current_price >= stop_price,
        };
        if breached {
            StopLossCheck::Breached { stop_price }
        } else {
            StopLossCheck::Safe
        }
    }

    /// Market-close the whole position if the stop-loss is breached
    ///
    /// Returns `true` when the tick must be skipped (breached, whether or not
    /// the unwind ran this time).
    #[allow(clippy::too_many_arguments)]
    pub async fn enforce_stop_loss<G: ExchangeGateway>(
        &self,
        gateway: &G,
        closer: &ExitManager,
        state: &mut State,
        snapshot: Option<&PositionSnapshot>,
        current_price: Decimal,
        current_position: Decimal,
        now: DateTime<Utc>,
    ) -> GridResult<bool> {
        if !self.config.stop_loss_enabled || current_position.is_zero() {
            return Ok(false);
        }

        let Some(side) = snapshot
            .and_then(|s| s.side)
            .or_else(|| Direction::from_signed(current_position))
        else {
            return Ok(false);
        };

        let Some(entry_price) = snapshot
            .and_then(|s| s.entry_price)
            .or_else(|| average_entry(state))
        else {
            debug!("No entry price available for stop-loss");
            return Ok(false);
        };

        let check = self.check_stop_loss(side, entry_price, current_price);
        let StopLossCheck::Breached { stop_price } = check else {
            return Ok(false);
        };

        if state
            .last_stop_loss_time
            .is_some_and(|last| now - last < Duration::seconds(STOP_LOSS_COOLDOWN_SECS))
        {
            debug!("Stop-loss breached, unwind rate limited");
            return Ok(true);
        }

        error!(
            "Stop-loss breached: {} entry {} stop {} price {}",
            side.as_str(),
            entry_price,
            stop_price,
            current_price
        );
        state.last_stop_loss_time = Some(now);

        let closed = closer
            .market_close(
                gateway,
                state,
                CloseTarget::NetPosition(current_position),
                CloseReason::StopLoss,
                now,
            )
            .await?;
        if closed {
            info!("Stop-loss unwind complete");
        }
        Ok(true)
    }

    /// Would an order of `quantity` at `reference_price` stay within limits?
    pub fn check_order_limits(
        &self,
        state: &State,
        reference_price: Decimal,
        quantity: Decimal,
    ) -> bool {
        let margin_ratio = state.margin_ratio();
        let projected = state.last_known_margin_used + quantity * reference_price * margin_ratio;
        if projected > self.config.max_margin_usd {
            warn!(
                "Order rejected by margin cap: projected {} > max {}",
                projected, self.config.max_margin_usd
            );
            return false;
        }

        let projected_size = state.last_known_net_position.abs() + quantity;
        if projected_size > self.config.max_position_size {
            warn!(
                "Order rejected by position cap: projected {} > max {}",
                projected_size, self.config.max_position_size
            );
            return false;
        }

        true
    }
}

/// Size-weighted entry price of unhedged legs
fn average_entry(state: &State) -> Option<Decimal> {
    let (notional, size) = state
        .tracked_positions
        .all()
        .iter()
        .filter(|p| !p.hedged)
        .fold((Decimal::ZERO, Decimal::ZERO), |(n, s), p| {
            (n + p.entry_price * p.size, s + p.size)
        });
    if size.is_zero() {
        None
    } else {
        Some(notional / size)
    }
}
