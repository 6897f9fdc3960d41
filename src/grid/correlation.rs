//! Deterministic correlation ids for orders
//!
//! Every order the engine submits carries an id derived from the position it
//! belongs to and the order's role, so fills and listings can be mapped back
//! to a leg without any exchange-assigned identifier.

use sha2::{Digest, Sha256};

use super::config::Direction;

/// Role of an order within a leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderCategory {
    Entry,
    Exit,
    /// Exit resubmitted after a rejection; carries the attempt number
    ExitRetry(u32),
    /// Ladder rung during recovery
    Ladder(u32),
    Hedge,
    /// Market unwind; carries the engine-wide close sequence
    MarketClose(u64),
}

impl OrderCategory {
    fn label(&self) -> String {
        match self {
            OrderCategory::Entry => "entry".to_string(),
            OrderCategory::Exit => "exit".to_string(),
            OrderCategory::ExitRetry(n) => format!("exit-retry-{n}"),
            OrderCategory::Ladder(n) => format!("ladder-{n}"),
            OrderCategory::Hedge => "hedge".to_string(),
            OrderCategory::MarketClose(n) => format!("close-{n}"),
        }
    }
}

/// Correlation id generator keyed by contract and direction
#[derive(Debug, Clone)]
pub struct CorrelationIds {
    key: String,
}

impl CorrelationIds {
    pub fn new(contract: &str, direction: Direction) -> Self {
        Self {
            key: format!("{}:{}", contract, direction.as_str()),
        }
    }

    /// Derive the id for `(position_id, category)`, a positive 63-bit value
    pub fn derive(&self, position_id: u64, category: OrderCategory) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hasher.update(b":");
        hasher.update(position_id.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(category.label().as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes) & 0x7FFF_FFFF_FFFF_FFFF
    }
}
