//! Leveraged grid trading engine
//!
//! Cycles single-contract entries into take-profit exits, enforces margin,
//! position and stop-loss limits, and recovers positions whose exits have
//! gone stale.
//!
//! # Architecture
//!
//! - [`config`] - Engine configuration, direction and instrument precision
//! - [`types`] - Core data types (orders, fills, tracked positions)
//! - [`errors`] - Engine error types
//! - [`correlation`] - Deterministic client order ids
//! - [`registry`] - Tracked position registry
//! - [`state`] - Mutable engine state and the entry cycle
//! - [`gateway`] - Exchange abstraction (mockable for testing)
//! - [`risk`] - Leverage, margin caps and stop loss
//! - [`entry`] - Entry sizing and submission
//! - [`exit`] - Take-profit exits, retries and market closes
//! - [`recovery`] - Stale position recovery and reconciliation
//! - [`engine`] - Admission pipeline and tick state machine
//! - [`runner`] - Main execution loop
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use grid_engine::grid::{Direction, EngineConfig, EngineRunner, GridEngine, RunnerConfig};
//! use rust_decimal_macros::dec;
//!
//! let config = EngineConfig::new(
//!     "BTC-PERP",
//!     Direction::Long,
//!     dec!(0.8),  // take profit %
//!     dec!(0.2),  // grid step %
//!     10,         // max resting exits
//!     5.0,        // base wait seconds
//!     dec!(1000), // margin cap USD
//!     dec!(10),   // position cap
//! )
//! .with_order_notional(dec!(50));
//!
//! let engine = GridEngine::new(config, Arc::new(gateway))?;
//! let (fill_tx, fill_rx) = tokio::sync::mpsc::unbounded_channel();
//! let mut runner = EngineRunner::new(engine, fill_rx, RunnerConfig::default());
//! runner.run().await?;
//! ```
//!
//! # Testing
//!
//! [`gateway::mock::MockGateway`] records every order and lets tests drive
//! fills, rejections and read failures without a venue.

pub mod config;
pub mod correlation;
pub mod engine;
pub mod entry;
pub mod errors;
pub mod exit;
pub mod gateway;
pub mod recovery;
pub mod registry;
pub mod risk;
pub mod runner;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use self::config::{Direction, EngineConfig, InstrumentPrecision, RecoveryMode};
pub use correlation::{CorrelationIds, OrderCategory};
pub use engine::{EngineSummary, GridEngine, TickOutcome};
pub use entry::{EntryOperator, EntryOutcome};
pub use errors::{GridError, GridResult};
pub use exit::{CloseReason, CloseTarget, ExitManager, ExitOutcome};
pub use gateway::ExchangeGateway;
pub use recovery::{RecoveryReport, RecoveryScheduler};
pub use registry::PositionRegistry;
pub use risk::{RiskController, StopLossCheck};
pub use runner::{EngineRunner, RunnerConfig};
pub use state::State;
pub use types::{
    Bbo, CycleState, ExitOrderRef, FillEvent, LeverageInfo, OrderRequest, OrderResult,
    OrderResultStatus, OrderSide, PositionSnapshot, TrackedPosition,
};
