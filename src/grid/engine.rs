//! Grid engine state machine
//!
//! READY -> AWAITING_FILL -> READY. Each tick in READY runs the admission
//! pipeline (stop/pause prices, risk snapshot, stop-loss, exit reconciliation
//! and recovery, cooldown, grid spacing) before placing an entry; in
//! AWAITING_FILL it converts the fill into an exit order.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use serde::Serialize;

use super::config::{Direction, EngineConfig};
use super::entry::{EntryOperator, EntryOutcome};
use super::errors::GridResult;
use super::exit::{ExitManager, ExitOutcome};
use super::gateway::ExchangeGateway;
use super::recovery::RecoveryScheduler;
use super::risk::RiskController;
use super::state::State;
use super::types::{Bbo, CycleState};

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Stop price crossed; the engine no longer trades
    Halted,
    /// Admission declined a new entry this tick
    Skipped,
    Entry(EntryOutcome),
    Exit(ExitOutcome),
}

/// Engine snapshot for logging
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub contract: String,
    pub direction: Direction,
    pub cycle_state: CycleState,
    pub open_positions: usize,
    pub active_exit_orders: usize,
    pub net_position: Decimal,
    pub margin_used: Decimal,
    pub margin_ratio: Decimal,
    pub halted: bool,
}

/// Leveraged grid engine for one contract
pub struct GridEngine<G: ExchangeGateway> {
    config: Arc<EngineConfig>,
    gateway: Arc<G>,
    state: State,
    risk: RiskController,
    entries: EntryOperator,
    exits: ExitManager,
    recovery: RecoveryScheduler,
    halted: bool,
    last_bbo: Option<Bbo>,
}

impl<G: ExchangeGateway> GridEngine<G> {
    /// Create an engine; fails fast on invalid configuration
    pub fn new(config: EngineConfig, gateway: Arc<G>) -> GridResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            risk: RiskController::new(config.clone()),
            entries: EntryOperator::new(config.clone()),
            exits: ExitManager::new(config.clone()),
            recovery: RecoveryScheduler::new(config.clone()),
            config,
            gateway,
            state: State::new(),
            halted: false,
            last_bbo: None,
        })
    }

    /// Prepare leverage before the first tick
    pub async fn start(&mut self) -> GridResult<()> {
        info!(
            "Starting {} grid on {}: tp={}% step={}% max_orders={}",
            self.config.direction.as_str(),
            self.config.contract,
            self.config.take_profit_pct,
            self.config.grid_step_pct,
            self.config.max_open_orders
        );
        let gateway = Arc::clone(&self.gateway);
        self.risk.prepare_leverage(gateway.as_ref(), &mut self.state).await;
        Ok(())
    }

    /// Run the admission pipeline; true only if a new entry may be placed
    pub async fn should_admit_new_entry(&mut self, now: DateTime<Utc>) -> GridResult<bool> {
        if self.halted {
            return Ok(false);
        }
        let gateway = Arc::clone(&self.gateway);
        let gateway = gateway.as_ref();

        let bbo = gateway.fetch_bbo(&self.config.contract).await?;
        self.last_bbo = Some(bbo);

        if self.config.stop_price_crossed(bbo.bid, bbo.ask) {
            error!(
                "Stop price {:?} crossed (bid {} ask {}); halting",
                self.config.stop_price, bbo.bid, bbo.ask
            );
            let cancelled = self.exits.cancel_all_exits(gateway, &mut self.state).await;
            info!("Cancelled {} exit orders on stop", cancelled);
            self.halted = true;
            return Ok(false);
        }

        if self.config.pause_price_crossed(bbo.bid, bbo.ask) {
            info!(
                "Pause price {:?} crossed (bid {} ask {}); skipping tick",
                self.config.pause_price, bbo.bid, bbo.ask
            );
            return Ok(false);
        }

        let snapshot = self
            .risk
            .refresh_snapshot(gateway, &mut self.state, bbo.mid())
            .await;

        let position = self.state.last_known_net_position;
        let close_price = if position > Decimal::ZERO { bbo.bid } else { bbo.ask };
        if self
            .risk
            .enforce_stop_loss(
                gateway,
                &self.exits,
                &mut self.state,
                snapshot.as_ref(),
                close_price,
                position,
                now,
            )
            .await?
        {
            return Ok(false);
        }

        self.refresh_active_exits().await;
        let position = self.state.last_known_net_position;
        self.recovery
            .run(gateway, &self.exits, &mut self.state, bbo.mid(), position, now)
            .await?;
        let position = self.state.last_known_net_position;
        self.exits
            .ensure_exit_orders(gateway, &mut self.state, position, bbo, now)
            .await?;

        if !self.cooldown_elapsed(now) {
            return Ok(false);
        }

        Ok(self.grid_step_clear(bbo))
    }

    /// Rebuild the exit-order view from the gateway listing
    ///
    /// A failed listing keeps the previous view for this tick.
    async fn refresh_active_exits(&mut self) {
        let orders = match self.gateway.get_active_orders(&self.config.contract).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(
                    "Failed to list active orders, keeping {} cached exits: {}",
                    self.state.active_exit_orders.len(),
                    e
                );
                return;
            }
        };
        let exit_side = self.config.direction.exit_side();
        let pending = self.state.pending_entry_order_id.as_deref();
        self.state.active_exit_orders = orders
            .into_iter()
            .filter(|o| o.side == exit_side && Some(o.id.as_str()) != pending)
            .collect();
    }

    /// Density-based cooldown since the last entry attempt
    fn cooldown_elapsed(&mut self, now: DateTime<Utc>) -> bool {
        let count = self.state.active_exit_count();
        let max = self.config.max_open_orders as usize;
        let previous = self.state.last_exit_order_count;
        self.state.last_exit_order_count = count;

        if count >= max {
            debug!("{} exit orders resting (max {}); no new entries", count, max);
            return false;
        }

        let wait = if count < previous {
            Duration::zero()
        } else {
            let base_ms = self.config.base_wait().num_milliseconds();
            let wait_ms = if 3 * count >= 2 * max {
                base_ms * 2
            } else if 3 * count >= max {
                base_ms
            } else if 6 * count >= max {
                base_ms / 2
            } else {
                base_ms / 4
            };
            Duration::milliseconds(wait_ms)
        };

        match self.state.last_entry_time {
            Some(last) if now - last < wait => {
                debug!("Cooldown: {}ms remaining", (wait - (now - last)).num_milliseconds());
                false
            }
            _ => true,
        }
    }

    /// Is the new entry's exit at least one grid step beyond the nearest exit?
    fn grid_step_clear(&self, bbo: Bbo) -> bool {
        let prices = self.state.active_exit_orders.iter().map(|o| o.price);
        let nearest = match self.config.direction {
            Direction::Long => prices.min(),
            Direction::Short => prices.max(),
        };
        let Some(nearest) = nearest else {
            return true;
        };

        let entry = self.entries.entry_price(self.gateway.as_ref(), bbo);
        let new_exit = self.exits.exit_price(entry, self.state.margin_ratio());
        let step = Decimal::ONE + self.config.grid_step_fraction();

        let clear = match self.config.direction {
            Direction::Long => nearest >= new_exit * step,
            Direction::Short => new_exit >= nearest * step,
        };
        if !clear {
            debug!(
                "Grid step not cleared: new exit {} vs nearest {}",
                new_exit, nearest
            );
        }
        clear
    }

    /// Advance the state machine by one step
    pub async fn tick(&mut self, now: DateTime<Utc>) -> GridResult<TickOutcome> {
        if self.halted {
            return Ok(TickOutcome::Halted);
        }
        let gateway = Arc::clone(&self.gateway);

        let outcome = match self.state.cycle_state {
            CycleState::Ready => {
                if !self.should_admit_new_entry(now).await? {
                    return Ok(if self.halted {
                        TickOutcome::Halted
                    } else {
                        TickOutcome::Skipped
                    });
                }
                let Some(bbo) = self.last_bbo else {
                    return Ok(TickOutcome::Skipped);
                };
                let entry = self
                    .entries
                    .place_entry(gateway.as_ref(), &self.risk, &mut self.state, bbo, now)
                    .await?;
                TickOutcome::Entry(entry)
            }
            CycleState::AwaitingFill => {
                let exit = self
                    .exits
                    .handle_filled_entry(gateway.as_ref(), &mut self.state, now)
                    .await?;
                TickOutcome::Exit(exit)
            }
        };

        self.state.check_cycle_invariant();
        Ok(outcome)
    }

    /// Record a fill notification for the pending entry
    ///
    /// Returns false (and changes nothing) if the id is not the pending entry's.
    pub fn on_entry_filled(
        &mut self,
        correlation_id: u64,
        price: Decimal,
        quantity: Decimal,
    ) -> bool {
        match self.state.pending_entry_correlation_id {
            Some(pending) if pending == correlation_id => {
                info!("Entry filled: {} @ {}", quantity, price);
                self.state.record_entry_fill(price, quantity);
                true
            }
            _ => {
                debug!("Ignoring fill for unknown correlation id {}", correlation_id);
                false
            }
        }
    }

    pub fn summary(&self) -> EngineSummary {
        EngineSummary {
            contract: self.config.contract.clone(),
            direction: self.config.direction,
            cycle_state: self.state.cycle_state,
            open_positions: self.state.tracked_positions.len(),
            active_exit_orders: self.state.active_exit_count(),
            net_position: self.state.last_known_net_position,
            margin_used: self.state.last_known_margin_used,
            margin_ratio: self.state.margin_ratio(),
            halted: self.halted,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::gateway::mock::MockGateway;
    use crate::grid::types::{ExitOrderRef, OrderSide};
    use rust_decimal_macros::dec;

    fn long_config() -> EngineConfig {
        EngineConfig::new(
            "BTC-PERP",
            Direction::Long,
            dec!(0.8),
            dec!(0.2),
            10,
            5.0,
            dec!(1000),
            dec!(10),
        )
        .with_order_quantity(dec!(1))
    }

    fn engine(config: EngineConfig) -> (GridEngine<MockGateway>, Arc<MockGateway>) {
        let gateway = Arc::new(MockGateway::new(dec!(100), dec!(101)));
        let engine = GridEngine::new(config, gateway.clone()).unwrap();
        (engine, gateway)
    }

    /// Entry, fill and exit placement; returns the exit order id
    async fn run_first_cycle(
        engine: &mut GridEngine<MockGateway>,
        gateway: &MockGateway,
        t0: DateTime<Utc>,
    ) -> String {
        let outcome = engine.tick(t0).await.unwrap();
        let TickOutcome::Entry(EntryOutcome::Placed { order_id, .. }) = outcome else {
            panic!("expected a resting entry, got {outcome:?}");
        };
        let correlation_id = gateway.limit_orders.lock().await[0].correlation_id;
        gateway.fill_order(&order_id).await;
        assert!(engine.on_entry_filled(correlation_id, dec!(100), dec!(1)));

        let outcome = engine.tick(t0 + Duration::milliseconds(100)).await.unwrap();
        let TickOutcome::Exit(ExitOutcome::ExitPlaced { order_id, .. }) = outcome else {
            panic!("expected a resting exit, got {outcome:?}");
        };
        order_id
    }

    async fn engine_with_cycle() -> (GridEngine<MockGateway>, Arc<MockGateway>) {
        let (mut engine, gateway) = engine(long_config());
        run_first_cycle(&mut engine, &gateway, Utc::now()).await;
        (engine, gateway)
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let mut config = long_config();
        config.grid_step_pct = Decimal::ZERO;
        let gateway = Arc::new(MockGateway::new(dec!(100), dec!(101)));
        assert!(GridEngine::new(config, gateway).is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_long_cycle() {
        let (mut engine, gateway) = engine(long_config());
        let t0 = Utc::now();

        run_first_cycle(&mut engine, &gateway, t0).await;

        let orders = gateway.limit_orders.lock().await.clone();
        assert_eq!(orders.len(), 2);

        let entry = &orders[0];
        assert_eq!(entry.side, OrderSide::Buy);
        assert_eq!(entry.price, Some(dec!(100.99)));
        assert_eq!(entry.size, dec!(1));
        assert!(entry.post_only);

        let exit = &orders[1];
        assert_eq!(exit.side, OrderSide::Sell);
        assert_eq!(exit.price, Some(dec!(100.8)));
        assert!(exit.reduce_only);

        let summary = engine.summary();
        assert_eq!(summary.cycle_state, CycleState::Ready);
        assert_eq!(summary.open_positions, 1);
        assert_eq!(summary.active_exit_orders, 1);
        assert!(engine.state().check_cycle_invariant());
    }

    #[tokio::test]
    async fn test_cooldown_and_grid_step_gate_entries() {
        let (mut engine, gateway) = engine(long_config());
        let t0 = Utc::now();
        run_first_cycle(&mut engine, &gateway, t0).await;

        // 1 of 10 orders: 0.25 * 5s cooldown
        let outcome = engine.tick(t0 + Duration::seconds(1)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);

        // cooldown over, but the new exit (~101.8) is not a grid step below 100.8
        let outcome = engine.tick(t0 + Duration::seconds(2)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);
        assert_eq!(gateway.limit_order_count().await, 2);

        // price dropped: entry 99.49, exit ~100.29 clears the step
        gateway.set_bbo(dec!(99), dec!(99.5)).await;
        let outcome = engine.tick(t0 + Duration::seconds(3)).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Entry(EntryOutcome::Placed { price, .. }) if price == dec!(99.49)
        ));
    }

    #[tokio::test]
    async fn test_filled_exit_completes_leg() {
        let (mut engine, gateway) = engine(long_config());
        let t0 = Utc::now();
        let exit_id = run_first_cycle(&mut engine, &gateway, t0).await;

        // inside the cooldown; records one resting exit
        let outcome = engine.tick(t0 + Duration::seconds(1)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);

        gateway.fill_order(&exit_id).await;
        assert_eq!(*gateway.net_position.lock().await, Decimal::ZERO);

        // exit count dropped, so the cooldown resets
        let outcome = engine.tick(t0 + Duration::milliseconds(1100)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Entry(EntryOutcome::Placed { .. })));
        assert!(engine.state().tracked_positions.is_empty());
        assert_eq!(engine.state().correlation_to_position.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_price_halts_and_cancels_exits() {
        let (mut engine, gateway) = engine(long_config().with_stop_price(dec!(100.5)));
        // resting on the venue only; the engine has not listed orders yet
        gateway
            .add_active_order(ExitOrderRef::new("tp-1", dec!(102), dec!(1), OrderSide::Sell))
            .await;
        gateway
            .add_active_order(ExitOrderRef::new("bid-1", dec!(95), dec!(1), OrderSide::Buy))
            .await;
        assert!(engine.state().active_exit_orders.is_empty());

        let outcome = engine.tick(Utc::now()).await.unwrap();

        assert_eq!(outcome, TickOutcome::Halted);
        assert!(engine.is_halted());
        assert_eq!(*gateway.cancelled.lock().await, vec!["tp-1".to_string()]);
        let still_active = gateway.active_orders.lock().await.clone();
        assert_eq!(still_active.len(), 1);
        assert_eq!(still_active[0].id, "bid-1");
        assert!(engine.state().active_exit_orders.is_empty());

        // halted for good, even after the price comes back
        gateway.set_bbo(dec!(90), dec!(91)).await;
        assert_eq!(engine.tick(Utc::now()).await.unwrap(), TickOutcome::Halted);
        assert_eq!(gateway.limit_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_order_listing_keeps_cached_exits() {
        let (mut engine, gateway) = engine(long_config());
        gateway.set_fail_order_listing(true).await;

        // nothing cached yet: the tick still runs through to an entry
        let outcome = engine.tick(Utc::now()).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Entry(EntryOutcome::Placed { .. })));

        let (mut engine, gateway) = engine_with_cycle().await;
        let t0 = engine.state().last_entry_time.unwrap();
        gateway.set_fail_order_listing(true).await;

        let outcome = engine.tick(t0 + Duration::seconds(1)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);
        assert_eq!(engine.state().active_exit_count(), 1);
        assert_eq!(engine.state().tracked_positions.len(), 1);
    }

    #[tokio::test]
    async fn test_uncancellable_entry_still_accepts_its_fill() {
        let (mut engine, gateway) = engine(long_config());
        let t0 = Utc::now();
        engine.tick(t0).await.unwrap();
        let correlation_id = gateway.limit_orders.lock().await[0].correlation_id;
        *gateway.cancel_fails.lock().await = true;

        let outcome = engine.tick(t0 + Duration::seconds(31)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Exit(ExitOutcome::AwaitingFill));
        assert!(engine.on_entry_filled(correlation_id, dec!(100.99), dec!(1)));

        let outcome = engine.tick(t0 + Duration::seconds(32)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Exit(ExitOutcome::ExitPlaced { .. })));
        assert_eq!(engine.state().tracked_positions.len(), 1);
    }

    #[tokio::test]
    async fn test_pause_price_skips_tick() {
        let (mut engine, gateway) = engine(long_config().with_pause_price(dec!(101)));

        assert_eq!(engine.tick(Utc::now()).await.unwrap(), TickOutcome::Skipped);
        assert!(!engine.is_halted());

        gateway.set_bbo(dec!(99), dec!(100)).await;
        assert!(matches!(
            engine.tick(Utc::now()).await.unwrap(),
            TickOutcome::Entry(EntryOutcome::Placed { .. })
        ));
    }

    #[tokio::test]
    async fn test_unmatched_fill_is_ignored() {
        let (mut engine, _gateway) = engine(long_config());
        assert!(!engine.on_entry_filled(12345, dec!(100), dec!(1)));

        engine.tick(Utc::now()).await.unwrap();
        assert!(!engine.on_entry_filled(12345, dec!(100), dec!(1)));
        assert_eq!(engine.state().cycle_state, CycleState::AwaitingFill);
        assert!(engine.state().has_pending_entry());
    }

    #[tokio::test]
    async fn test_max_open_orders_blocks_entries() {
        let mut config = long_config();
        config.max_open_orders = 1;
        let (mut engine, gateway) = engine(config);
        gateway
            .add_active_order(ExitOrderRef::new("tp-1", dec!(200), dec!(1), OrderSide::Sell))
            .await;

        assert_eq!(engine.tick(Utc::now()).await.unwrap(), TickOutcome::Skipped);
        assert_eq!(gateway.limit_order_count().await, 0);
    }
}
