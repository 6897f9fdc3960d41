//! Engine runner - main execution loop

use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use super::engine::{GridEngine, TickOutcome};
use super::errors::{GridError, GridResult};
use super::gateway::ExchangeGateway;
use super::types::FillEvent;

/// Runner configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

/// Drives `tick()` on an interval and feeds fill notifications to the engine
///
/// Fills arrive through a single-consumer channel so they are serialized
/// with ticks. The loop ends when the engine halts or after too many
/// consecutive tick errors; a supervisor can also abort the task.
pub struct EngineRunner<G: ExchangeGateway> {
    engine: GridEngine<G>,
    fills: mpsc::UnboundedReceiver<FillEvent>,
    runner_config: RunnerConfig,
}

impl<G: ExchangeGateway> EngineRunner<G> {
    pub fn new(
        engine: GridEngine<G>,
        fills: mpsc::UnboundedReceiver<FillEvent>,
        runner_config: RunnerConfig,
    ) -> Self {
        Self {
            engine,
            fills,
            runner_config,
        }
    }

    pub async fn run(&mut self) -> GridResult<()> {
        info!("Starting engine runner for {}", self.engine.config().contract);
        self.engine.start().await?;

        let period = Duration::from_millis(self.runner_config.tick_interval_ms.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors = 0u32;
        let mut fills_open = true;

        loop {
            tokio::select! {
                biased;

                fill = self.fills.recv(), if fills_open => match fill {
                    Some(fill) => {
                        self.engine
                            .on_entry_filled(fill.correlation_id, fill.price, fill.quantity);
                    }
                    None => {
                        warn!("Fill channel closed; continuing without push fills");
                        fills_open = false;
                    }
                },
                _ = ticker.tick() => match self.engine.tick(Utc::now()).await {
                    Ok(outcome) => {
                        consecutive_errors = 0;
                        if !matches!(outcome, TickOutcome::Skipped) {
                            debug!("Tick: {:?}", outcome);
                        }
                    }
                    Err(e) => {
                        error!("Tick failed: {}", e);
                        consecutive_errors += 1;
                    }
                },
            }

            if self.engine.is_halted() {
                info!("Engine halted: {:?}", self.engine.summary());
                break;
            }
            if consecutive_errors >= self.runner_config.max_consecutive_errors {
                error!("Too many consecutive errors, shutting down");
                return Err(GridError::InvalidState {
                    current_state: format!("{consecutive_errors} consecutive tick errors"),
                });
            }
        }

        Ok(())
    }

    pub fn engine(&self) -> &GridEngine<G> {
        &self.engine
    }

    pub fn into_engine(self) -> GridEngine<G> {
        self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::grid::config::{Direction, EngineConfig};
    use crate::grid::gateway::mock::MockGateway;
    use crate::grid::types::OrderSide;
    use rust_decimal_macros::dec;

    fn config() -> EngineConfig {
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

    fn fast() -> RunnerConfig {
        RunnerConfig {
            tick_interval_ms: 5,
            max_consecutive_errors: 3,
        }
    }

    #[test]
    fn test_runner_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.max_consecutive_errors, 5);
    }

    #[tokio::test]
    async fn test_runner_stops_on_halt() {
        let gateway = Arc::new(MockGateway::new(dec!(100), dec!(101)));
        let engine = GridEngine::new(config().with_stop_price(dec!(100)), gateway).unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut runner = EngineRunner::new(engine, rx, fast());

        runner.run().await.unwrap();
        assert!(runner.engine().is_halted());
    }

    #[tokio::test]
    async fn test_runner_gives_up_after_consecutive_errors() {
        let gateway = Arc::new(MockGateway::new(dec!(100), dec!(101)));
        gateway.set_fail_reads(true).await;
        let engine = GridEngine::new(config(), gateway).unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut runner = EngineRunner::new(engine, rx, fast());

        let result = runner.run().await;
        assert!(matches!(result, Err(GridError::InvalidState { .. })));
        assert!(!runner.engine().is_halted());
    }

    #[tokio::test]
    async fn test_runner_routes_fills_and_survives_closed_channel() {
        let gateway = Arc::new(MockGateway::new(dec!(100), dec!(101)));
        let engine = GridEngine::new(config(), gateway.clone()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut runner = EngineRunner::new(engine, rx, fast());

        let handle = tokio::spawn(async move {
            let _ = runner.run().await;
        });

        // wait for the entry, then deliver its fill and drop the sender
        let correlation_id = loop {
            if let Some(order) = gateway.limit_orders.lock().await.first() {
                break order.correlation_id;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        };
        tx.send(FillEvent::new(correlation_id, dec!(100), dec!(1))).unwrap();
        drop(tx);

        // the exit follows on a later tick even though the channel is closed
        while gateway.limit_order_count().await < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        handle.abort();

        let orders = gateway.limit_orders.lock().await.clone();
        assert_ne!(orders[1].correlation_id, correlation_id);
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert_eq!(orders[1].price, Some(dec!(100.8)));
        assert!(orders[1].reduce_only);
    }
}
