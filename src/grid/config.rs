//! Grid engine configuration

use chrono::Duration;
use log::warn;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::types::OrderSide;

/// Trading direction of the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Buy to open, sell to take profit
    Long,
    /// Sell to open, buy to take profit
    Short,
}

impl Direction {
    /// Side of the opening order
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Side of the closing order
    pub fn exit_side(&self) -> OrderSide {
        self.entry_side().opposite()
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Direction implied by a signed position
    pub fn from_signed(quantity: Decimal) -> Option<Self> {
        if quantity > Decimal::ZERO {
            Some(Direction::Long)
        } else if quantity < Decimal::ZERO {
            Some(Direction::Short)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

/// Policy applied to legs that stay open past the position timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    /// Cancel the exit and market-close the leg
    Aggressive,
    /// Replace the exit with three staggered limit orders
    Ladder,
    /// Neutralize exposure with an opposite market order
    Hedge,
    /// Leave the leg flagged, take no action
    #[default]
    None,
}

/// Instrument precision reported by the gateway
///
/// Prices are multiples of `tick_size`, quantities multiples of `step_size`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentPrecision {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    /// Smallest order notional the exchange accepts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_notional: Option<Decimal>,
}

impl InstrumentPrecision {
    pub fn new(tick_size: Decimal, step_size: Decimal) -> Self {
        Self {
            tick_size,
            step_size,
            min_notional: None,
        }
    }

    pub fn with_min_notional(mut self, min_notional: Decimal) -> Self {
        self.min_notional = Some(min_notional);
        self
    }

    /// Round a price to the nearest tick
    pub fn round_price(&self, price: Decimal) -> Decimal {
        Self::round_to(price, self.tick_size, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Round a price to a tick, away from or towards zero
    pub fn round_price_directional(&self, price: Decimal, round_up: bool) -> Decimal {
        let strategy = if round_up {
            RoundingStrategy::ToPositiveInfinity
        } else {
            RoundingStrategy::ToNegativeInfinity
        };
        Self::round_to(price, self.tick_size, strategy)
    }

    /// Round a size down to the step size
    pub fn round_size(&self, size: Decimal) -> Decimal {
        Self::round_to(size, self.step_size, RoundingStrategy::ToZero)
    }

    /// Round a size up to the step size
    pub fn round_size_up(&self, size: Decimal) -> Decimal {
        Self::round_to(size, self.step_size, RoundingStrategy::AwayFromZero)
    }

    fn round_to(value: Decimal, increment: Decimal, strategy: RoundingStrategy) -> Decimal {
        if increment <= Decimal::ZERO {
            return value;
        }
        let units = (value / increment).round_dp_with_strategy(0, strategy);
        (units * increment).normalize()
    }
}

impl Default for InstrumentPrecision {
    fn default() -> Self {
        Self::new(dec!(0.01), dec!(0.001))
    }
}

/// Grid engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Instrument identifier passed to the gateway (e.g. "BTC-PERP")
    pub contract: String,

    /// Take-profit target as a percentage return on margin
    pub take_profit_pct: Decimal,

    /// Minimum spacing between grid levels, in percent
    pub grid_step_pct: Decimal,

    pub direction: Direction,

    /// Maximum number of resting exit orders
    pub max_open_orders: u32,

    /// Base cooldown between entries; scaled by grid density
    pub base_wait_seconds: f64,

    pub max_margin_usd: Decimal,

    /// Maximum absolute net position in base units
    pub max_position_size: Decimal,

    /// Crossing this price disables new entries for the rest of the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,

    /// Crossing this price skips entries for the tick
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_price: Option<Decimal>,

    #[serde(default)]
    pub stop_loss_enabled: bool,

    /// Adverse move from average entry, in percent, that triggers a market close
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,

    #[serde(default = "default_position_timeout_minutes")]
    pub position_timeout_minutes: u32,

    #[serde(default)]
    pub recovery_mode: RecoveryMode,

    /// Use market orders for exits
    #[serde(default)]
    pub boost_mode: bool,

    /// Ticks away from the touch for post-only prices
    #[serde(default = "default_post_only_tick_multiplier")]
    pub post_only_tick_multiplier: u32,

    /// Fixed base-asset quantity per entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_quantity: Option<Decimal>,

    /// USD notional per entry (used when `order_quantity` is absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_notional_usd: Option<Decimal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_leverage: Option<u32>,

    /// A pending entry older than this is cancelled
    #[serde(default = "default_entry_timeout_seconds")]
    pub entry_timeout_seconds: u64,
}

fn default_stop_loss_pct() -> Decimal {
    dec!(2)
}

fn default_position_timeout_minutes() -> u32 {
    60
}

fn default_post_only_tick_multiplier() -> u32 {
    1
}

fn default_entry_timeout_seconds() -> u64 {
    30
}

impl EngineConfig {
    /// Create a configuration with the required parameters
    ///
    /// Optional parameters take their documented defaults; an order size must
    /// still be provided with [`with_order_quantity`](Self::with_order_quantity)
    /// or [`with_order_notional`](Self::with_order_notional).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contract: impl Into<String>,
        direction: Direction,
        take_profit_pct: Decimal,
        grid_step_pct: Decimal,
        max_open_orders: u32,
        base_wait_seconds: f64,
        max_margin_usd: Decimal,
        max_position_size: Decimal,
    ) -> Self {
        Self {
            contract: contract.into(),
            take_profit_pct,
            grid_step_pct,
            direction,
            max_open_orders,
            base_wait_seconds,
            max_margin_usd,
            max_position_size,
            stop_price: None,
            pause_price: None,
            stop_loss_enabled: false,
            stop_loss_pct: default_stop_loss_pct(),
            position_timeout_minutes: default_position_timeout_minutes(),
            recovery_mode: RecoveryMode::default(),
            boost_mode: false,
            post_only_tick_multiplier: default_post_only_tick_multiplier(),
            order_quantity: None,
            order_notional_usd: None,
            target_leverage: None,
            entry_timeout_seconds: default_entry_timeout_seconds(),
        }
    }

    pub fn with_order_quantity(mut self, quantity: Decimal) -> Self {
        self.order_quantity = Some(quantity);
        self
    }

    pub fn with_order_notional(mut self, notional_usd: Decimal) -> Self {
        self.order_notional_usd = Some(notional_usd);
        self
    }

    pub fn with_stop_price(mut self, price: Decimal) -> Self {
        self.stop_price = Some(price);
        self
    }

    pub fn with_pause_price(mut self, price: Decimal) -> Self {
        self.pause_price = Some(price);
        self
    }

    pub fn with_stop_loss(mut self, pct: Decimal) -> Self {
        self.stop_loss_enabled = true;
        self.stop_loss_pct = pct;
        self
    }

    pub fn with_recovery(mut self, mode: RecoveryMode, timeout_minutes: u32) -> Self {
        self.recovery_mode = mode;
        self.position_timeout_minutes = timeout_minutes;
        self
    }

    pub fn with_boost_mode(mut self, boost: bool) -> Self {
        self.boost_mode = boost;
        self
    }

    pub fn with_post_only_tick_multiplier(mut self, multiplier: u32) -> Self {
        self.post_only_tick_multiplier = multiplier;
        self
    }

    pub fn with_target_leverage(mut self, leverage: u32) -> Self {
        self.target_leverage = Some(leverage);
        self
    }

    pub fn with_entry_timeout(mut self, secs: u64) -> Self {
        self.entry_timeout_seconds = secs;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.contract.is_empty() {
            return Err(GridError::InvalidConfig("contract cannot be empty".into()));
        }

        positive("take_profit_pct", self.take_profit_pct)?;
        positive("grid_step_pct", self.grid_step_pct)?;
        positive("max_margin_usd", self.max_margin_usd)?;
        positive("max_position_size", self.max_position_size)?;

        if self.max_open_orders == 0 {
            return Err(GridError::InvalidConfig(
                "max_open_orders must be positive".into(),
            ));
        }

        if !(self.base_wait_seconds.is_finite() && self.base_wait_seconds > 0.0) {
            return Err(GridError::InvalidConfig(
                "base_wait_seconds must be positive".into(),
            ));
        }

        if self.stop_loss_pct < dec!(0.5) || self.stop_loss_pct > dec!(10) {
            return Err(GridError::InvalidConfig(
                "stop_loss_pct must be between 0.5 and 10".into(),
            ));
        }

        if !(5..=1440).contains(&self.position_timeout_minutes) {
            return Err(GridError::InvalidConfig(
                "position_timeout_minutes must be between 5 and 1440".into(),
            ));
        }

        if !(1..=10).contains(&self.post_only_tick_multiplier) {
            return Err(GridError::InvalidConfig(
                "post_only_tick_multiplier must be between 1 and 10".into(),
            ));
        }

        if self.entry_timeout_seconds == 0 {
            return Err(GridError::InvalidConfig(
                "entry_timeout_seconds must be positive".into(),
            ));
        }

        if let Some(price) = self.stop_price {
            positive("stop_price", price)?;
        }
        if let Some(price) = self.pause_price {
            positive("pause_price", price)?;
        }
        if let Some(leverage) = self.target_leverage {
            if leverage == 0 {
                return Err(GridError::InvalidConfig(
                    "target_leverage must be at least 1".into(),
                ));
            }
        }

        match (self.order_quantity, self.order_notional_usd) {
            (None, None) => {
                return Err(GridError::InvalidConfig(
                    "one of order_quantity or order_notional_usd is required".into(),
                ));
            }
            (Some(qty), notional) => {
                positive("order_quantity", qty)?;
                if notional.is_some() {
                    warn!("Both order_quantity and order_notional_usd set; using order_quantity");
                }
            }
            (None, Some(notional)) => positive("order_notional_usd", notional)?,
        }

        Ok(())
    }

    /// Take-profit as a fraction (0.8% -> 0.008)
    pub fn take_profit_fraction(&self) -> Decimal {
        self.take_profit_pct / Decimal::ONE_HUNDRED
    }

    /// Grid step as a fraction
    pub fn grid_step_fraction(&self) -> Decimal {
        self.grid_step_pct / Decimal::ONE_HUNDRED
    }

    pub fn base_wait(&self) -> Duration {
        Duration::milliseconds((self.base_wait_seconds * 1000.0).round() as i64)
    }

    pub fn position_timeout(&self) -> Duration {
        Duration::minutes(i64::from(self.position_timeout_minutes))
    }

    pub fn entry_timeout(&self) -> Duration {
        Duration::seconds(self.entry_timeout_seconds as i64)
    }

    /// Has the hard stop price been crossed?
    ///
    /// Long grids stop when the ask reaches the stop price from below, short
    /// grids when the bid reaches it from above.
    pub fn stop_price_crossed(&self, bid: Decimal, ask: Decimal) -> bool {
        self.stop_price
            .is_some_and(|stop| self.price_crossed(stop, bid, ask))
    }

    /// Has the pause price been crossed?
    pub fn pause_price_crossed(&self, bid: Decimal, ask: Decimal) -> bool {
        self.pause_price
            .is_some_and(|pause| self.price_crossed(pause, bid, ask))
    }

    fn price_crossed(&self, level: Decimal, bid: Decimal, ask: Decimal) -> bool {
        match self.direction {
            Direction::Long => ask >= level,
            Direction::Short => bid <= level,
        }
    }

    /// Load config from a JSON file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GridError::Settings(e.to_string()))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

fn positive(name: &str, value: Decimal) -> GridResult<()> {
    if value <= Decimal::ZERO {
        return Err(GridError::InvalidConfig(format!("{name} must be positive")));
    }
    Ok(())
}
