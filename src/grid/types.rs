//! Core data types for the grid engine

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::config::Direction;

/// Order side on the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl From<&str> for OrderSide {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "b" | "buy" | "bid" => OrderSide::Buy,
            _ => OrderSide::Sell,
        }
    }
}

/// Engine cycle state
///
/// READY means no entry is in flight. AWAITING_FILL means an entry was placed
/// and the engine is waiting for its fill or for the exit leg to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleState {
    #[default]
    Ready,
    AwaitingFill,
}

/// Best bid and offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bbo {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Bbo {
    pub fn new(bid: Decimal, ask: Decimal) -> Self {
        Self { bid, ask }
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Price an order on `side` would cross against
    pub fn touch(&self, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => self.ask,
            OrderSide::Sell => self.bid,
        }
    }
}

/// Mirror of one exchange-resident order, rebuilt every tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOrderRef {
    pub id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub side: OrderSide,
}

impl ExitOrderRef {
    pub fn new(id: impl Into<String>, price: Decimal, size: Decimal, side: OrderSide) -> Self {
        Self {
            id: id.into(),
            price,
            size,
            side,
        }
    }
}

/// Position snapshot reported by the exchange
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionSnapshot {
    pub entry_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    /// Notional exposure in USD
    pub exposure_usd: Option<Decimal>,
    /// Margin reserved for the position
    pub margin_reserved: Option<Decimal>,
    pub side: Option<Direction>,
}

/// Leverage limits for an instrument
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeverageInfo {
    pub max_leverage: Decimal,
    /// Initial margin requirement as a fraction of notional, when reported
    pub margin_requirement: Option<Decimal>,
}

/// Request to place an order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub size: Decimal,
    /// Limit price; market orders carry the reference price they were sized at
    pub price: Option<Decimal>,
    pub side: OrderSide,
    pub reduce_only: bool,
    pub post_only: bool,
    pub correlation_id: u64,
}

impl OrderRequest {
    pub fn limit(size: Decimal, price: Decimal, side: OrderSide) -> Self {
        Self {
            size,
            price: Some(price),
            side,
            reduce_only: false,
            post_only: false,
            correlation_id: 0,
        }
    }

    pub fn market(size: Decimal, side: OrderSide) -> Self {
        Self {
            size,
            price: None,
            side,
            reduce_only: false,
            post_only: false,
            correlation_id: 0,
        }
    }

    /// Set reduce_only flag
    pub fn reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    /// Set post_only flag (maker-only)
    pub fn post_only(mut self, post_only: bool) -> Self {
        self.post_only = post_only;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: u64) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// Order result from the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    /// Exchange order id (absent on rejection)
    pub order_id: Option<String>,
    pub status: OrderResultStatus,
}

impl OrderResult {
    pub fn resting(order_id: impl Into<String>) -> Self {
        Self {
            order_id: Some(order_id.into()),
            status: OrderResultStatus::Resting,
        }
    }

    pub fn filled(order_id: impl Into<String>, avg_price: Decimal, filled_size: Decimal) -> Self {
        Self {
            order_id: Some(order_id.into()),
            status: OrderResultStatus::Filled {
                avg_price,
                filled_size,
            },
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            order_id: None,
            status: OrderResultStatus::Rejected(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.status, OrderResultStatus::Rejected(_))
    }
}

/// Status of order placement
#[derive(Debug, Clone, PartialEq)]
pub enum OrderResultStatus {
    /// Order is resting on the book
    Resting,
    /// Order was immediately filled
    Filled {
        avg_price: Decimal,
        filled_size: Decimal,
    },
    /// Order was rejected (post-only cross, insufficient margin, ...)
    Rejected(String),
}

/// Fill notification from the order-update stream
#[derive(Debug, Clone, PartialEq)]
pub struct FillEvent {
    pub correlation_id: u64,
    pub price: Decimal,
    pub quantity: Decimal,
}

impl FillEvent {
    pub fn new(correlation_id: u64, price: Decimal, quantity: Decimal) -> Self {
        Self {
            correlation_id,
            price,
            quantity,
        }
    }
}

/// One open grid leg awaiting its take-profit exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPosition {
    /// Unique id, never reused (0 = not yet assigned)
    pub position_id: u64,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub side: Direction,
    pub open_time: DateTime<Utc>,
    #[serde(default)]
    pub exit_order_ids: Vec<String>,
    pub entry_correlation_id: u64,
    #[serde(default)]
    pub exit_correlation_ids: Vec<u64>,
    /// Last submitted exit price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<Decimal>,
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default)]
    pub hedged: bool,
    #[serde(default)]
    pub laddered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_recovery_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_retry_time: Option<DateTime<Utc>>,
}

impl TrackedPosition {
    pub fn new(
        position_id: u64,
        entry_price: Decimal,
        size: Decimal,
        side: Direction,
        open_time: DateTime<Utc>,
        entry_correlation_id: u64,
    ) -> Self {
        Self {
            position_id,
            entry_price,
            size,
            side,
            open_time,
            exit_order_ids: Vec::new(),
            entry_correlation_id,
            exit_correlation_ids: Vec::new(),
            exit_price: None,
            recovery_attempts: 0,
            hedged: false,
            laddered: false,
            last_recovery_time: None,
            exit_retry_count: 0,
            last_exit_retry_time: None,
        }
    }

    /// Size signed by side (+ long, - short)
    pub fn signed_size(&self) -> Decimal {
        self.side.sign() * self.size
    }

    /// Record a freshly accepted exit order
    pub fn record_exit_order(
        &mut self,
        order_id: impl Into<String>,
        correlation_id: u64,
        price: Decimal,
    ) {
        self.exit_order_ids.push(order_id.into());
        self.exit_correlation_ids.push(correlation_id);
        self.exit_price = Some(price);
    }

    /// Forget all exit orders, returning their correlation ids
    pub fn clear_exit_orders(&mut self) -> Vec<u64> {
        self.exit_order_ids.clear();
        std::mem::take(&mut self.exit_correlation_ids)
    }

    /// True if any of this leg's exit orders is in the active listing
    pub fn has_active_exit(&self, active_ids: &HashSet<String>) -> bool {
        self.exit_order_ids.iter().any(|id| active_ids.contains(id))
    }

    /// True if an exit was submitted but none of them is resting any more
    pub fn exit_vanished(&self, active_ids: &HashSet<String>) -> bool {
        !self.exit_order_ids.is_empty() && !self.has_active_exit(active_ids)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.open_time
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.age(now) >= timeout
    }

    /// Correlation ids owned by this leg (entry and exits)
    pub fn correlation_ids(&self) -> impl Iterator<Item = u64> + '_ {
        std::iter::once(self.entry_correlation_id).chain(self.exit_correlation_ids.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
        assert_eq!(OrderSide::from("BUY"), OrderSide::Buy);
        assert_eq!(OrderSide::from("ask"), OrderSide::Sell);
    }

    #[test]
    fn test_bbo_touch() {
        let bbo = Bbo::new(dec!(100), dec!(101));
        assert_eq!(bbo.touch(OrderSide::Buy), dec!(101));
        assert_eq!(bbo.touch(OrderSide::Sell), dec!(100));
        assert_eq!(bbo.mid(), dec!(100.5));
    }

    #[test]
    fn test_order_request_builder() {
        let order = OrderRequest::limit(dec!(1), dec!(100), OrderSide::Sell)
            .reduce_only(true)
            .post_only(true)
            .with_correlation_id(42);
        assert!(order.reduce_only);
        assert!(order.post_only);
        assert_eq!(order.correlation_id, 42);
        assert_eq!(order.price, Some(dec!(100)));

        let market = OrderRequest::market(dec!(2), OrderSide::Buy);
        assert!(market.price.is_none());
    }

    #[test]
    fn test_tracked_position_exit_tracking() {
        let now = Utc::now();
        let mut pos = TrackedPosition::new(1, dec!(100), dec!(2), Direction::Short, now, 11);
        assert_eq!(pos.signed_size(), dec!(-2));

        let mut active = HashSet::new();
        assert!(!pos.exit_vanished(&active));

        pos.record_exit_order("a", 12, dec!(99));
        assert!(pos.exit_vanished(&active));

        active.insert("a".to_string());
        assert!(pos.has_active_exit(&active));
        assert_eq!(pos.correlation_ids().collect::<Vec<_>>(), vec![11, 12]);

        assert_eq!(pos.clear_exit_orders(), vec![12]);
        assert!(pos.exit_order_ids.is_empty());
    }

    #[test]
    fn test_tracked_position_staleness() {
        let now = Utc::now();
        let pos = TrackedPosition::new(
            1,
            dec!(100),
            dec!(1),
            Direction::Long,
            now - Duration::minutes(61),
            1,
        );
        assert!(pos.is_stale(now, Duration::minutes(60)));
        assert!(!pos.is_stale(now, Duration::minutes(90)));
    }
}
