//! Entry order sizing and submission

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rust_decimal::Decimal;

use super::config::{Direction, EngineConfig};
use super::correlation::{CorrelationIds, OrderCategory};
use super::errors::{GridError, GridResult};
use super::gateway::ExchangeGateway;
use super::risk::RiskController;
use super::state::State;
use super::types::{Bbo, OrderRequest, OrderResultStatus};

/// Result of one entry attempt
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// Entry resting; cycle is AWAITING_FILL
    Placed {
        order_id: String,
        price: Decimal,
        quantity: Decimal,
    },
    /// Entry filled on submission
    Filled { price: Decimal, quantity: Decimal },
    /// Margin or position cap would be exceeded
    RejectedByRisk,
    /// Venue refused the order (typically a post-only cross)
    Rejected(String),
}

/// Sizes and submits opening orders
pub struct EntryOperator {
    config: Arc<EngineConfig>,
    ids: CorrelationIds,
}

impl EntryOperator {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let ids = CorrelationIds::new(&config.contract, config.direction);
        Self { config, ids }
    }

    /// Post-only entry price: one tick multiple inside the opposite touch
    pub fn entry_price<G: ExchangeGateway>(&self, gateway: &G, bbo: Bbo) -> Decimal {
        let ticks = Decimal::from(self.config.post_only_tick_multiplier);
        let offset = gateway.precision().tick_size * ticks;
        let raw = match self.config.direction {
            Direction::Long => bbo.ask - offset,
            Direction::Short => bbo.bid + offset,
        };
        gateway.round_to_tick(raw)
    }

    /// Order quantity at `reference_price`, rounded to the step size
    ///
    /// Raised to the venue's minimum notional when it falls short.
    pub fn size_order<G: ExchangeGateway>(
        &self,
        gateway: &G,
        reference_price: Decimal,
    ) -> GridResult<Decimal> {
        let raw = match (self.config.order_quantity, self.config.order_notional_usd) {
            (Some(quantity), _) => quantity,
            (None, Some(notional)) => {
                if reference_price <= Decimal::ZERO {
                    return Err(GridError::OrderSizing(format!(
                        "cannot size notional order at price {reference_price}"
                    )));
                }
                notional / reference_price
            }
            (None, None) => {
                return Err(GridError::OrderSizing("no order size configured".into()));
            }
        };

        let precision = gateway.precision();
        let mut quantity = precision.round_size(raw);

        if let Some(min_notional) = precision.min_notional {
            if reference_price > Decimal::ZERO && quantity * reference_price < min_notional {
                let raised = precision.round_size_up(min_notional / reference_price);
                warn!(
                    "Order size {} below min notional {} at {}; raising to {}",
                    quantity, min_notional, reference_price, raised
                );
                quantity = raised;
            }
        }

        if quantity <= Decimal::ZERO {
            return Err(GridError::OrderSizing(format!(
                "order size {raw} rounds to zero at step {}",
                precision.step_size
            )));
        }
        Ok(quantity)
    }

    /// Submit a post-only entry and move the cycle to AWAITING_FILL
    pub async fn place_entry<G: ExchangeGateway>(
        &self,
        gateway: &G,
        risk: &RiskController,
        state: &mut State,
        bbo: Bbo,
        now: DateTime<Utc>,
    ) -> GridResult<EntryOutcome> {
        let price = self.entry_price(gateway, bbo);
        if price <= Decimal::ZERO {
            return Ok(EntryOutcome::Rejected(format!("non-positive entry price {price}")));
        }

        let quantity = self.size_order(gateway, price)?;
        if !risk.check_order_limits(state, price, quantity) {
            return Ok(EntryOutcome::RejectedByRisk);
        }

        let position_id = state.allocate_position_id();
        let correlation_id = self.ids.derive(position_id, OrderCategory::Entry);
        let side = self.config.direction.entry_side();
        let request = OrderRequest::limit(quantity, price, side)
            .post_only(true)
            .with_correlation_id(correlation_id);

        state.last_entry_time = Some(now);
        debug!(
            "Placing entry for position {}: {} {} @ {}",
            position_id,
            side.as_str(),
            quantity,
            price
        );
        let result = gateway.place_limit_order(&self.config.contract, &request).await?;

        let outcome = match (result.status, result.order_id) {
            (OrderResultStatus::Resting, Some(order_id)) => {
                info!(
                    "Entry resting for position {}: {} {} @ {} ({})",
                    position_id,
                    side.as_str(),
                    quantity,
                    price,
                    order_id
                );
                state.begin_pending_entry(
                    order_id.clone(),
                    price,
                    quantity,
                    correlation_id,
                    position_id,
                    now,
                );
                EntryOutcome::Placed {
                    order_id,
                    price,
                    quantity,
                }
            }
            (OrderResultStatus::Filled { avg_price, filled_size }, _) => {
                info!(
                    "Entry filled immediately for position {}: {} @ {}",
                    position_id, filled_size, avg_price
                );
                state.record_immediate_fill(position_id, correlation_id, avg_price, filled_size);
                EntryOutcome::Filled {
                    price: avg_price,
                    quantity: filled_size,
                }
            }
            (OrderResultStatus::Resting, None) => {
                warn!("Entry for position {} resting without an order id", position_id);
                EntryOutcome::Rejected("missing order id".into())
            }
            (OrderResultStatus::Rejected(reason), _) => {
                info!("Entry for position {} rejected: {}", position_id, reason);
                EntryOutcome::Rejected(reason)
            }
        };

        Ok(outcome)
    }
}
