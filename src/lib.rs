#![deny(unreachable_pub)]
pub mod config;
pub mod grid;

pub use crate::config::{init_logging, LogConfig, Settings};
pub use grid::{
    Direction, EngineConfig, EngineRunner, ExchangeGateway, GridEngine, GridError, GridResult,
    RunnerConfig,
};
