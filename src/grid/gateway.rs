//! Exchange gateway abstraction - enables mocking for tests

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::config::InstrumentPrecision;
use super::errors::GridResult;
use super::types::{Bbo, ExitOrderRef, LeverageInfo, OrderRequest, OrderResult, PositionSnapshot};

/// Exchange operations consumed by the engine
///
/// Every async call is a suspension point and may fail; implementations
/// should return `GridError::Gateway` for transport failures and reserve
/// `OrderResultStatus::Rejected` for orders the venue refused.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Best bid and offer
    async fn fetch_bbo(&self, contract: &str) -> GridResult<Bbo>;

    /// Signed net position in base units (+ long, - short)
    async fn get_net_position(&self, contract: &str) -> GridResult<Decimal>;

    async fn get_position_snapshot(&self, symbol: &str) -> GridResult<PositionSnapshot>;

    /// All resting orders for the contract
    async fn get_active_orders(&self, contract: &str) -> GridResult<Vec<ExitOrderRef>>;

    async fn place_limit_order(
        &self,
        contract: &str,
        request: &OrderRequest,
    ) -> GridResult<OrderResult>;

    async fn place_market_order(
        &self,
        contract: &str,
        request: &OrderRequest,
    ) -> GridResult<OrderResult>;

    /// Cancel an order by id; `false` if the venue did not cancel it
    async fn cancel_order(&self, contract: &str, order_id: &str) -> GridResult<bool>;

    async fn get_leverage_info(&self, symbol: &str) -> GridResult<LeverageInfo>;

    /// Apply leverage; `false` if the venue refused
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GridResult<bool>;

    /// Tick/step precision of the traded instrument
    fn precision(&self) -> InstrumentPrecision;

    fn round_to_tick(&self, price: Decimal) -> Decimal {
        self.precision().round_price(price)
    }

    fn round_to_step(&self, quantity: Decimal) -> Decimal {
        self.precision().round_size(quantity)
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// In-memory gateway for exercising the engine without a venue
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use crate::grid::errors::GridError;
    use crate::grid::types::{OrderResultStatus, OrderSide};

    /// Mock gateway recording every order it receives
    ///
    /// Resting limit orders appear in the active listing until cancelled or
    /// filled with [`MockGateway::fill_order`]. Market orders fill at the touch
    /// and move the net position.
    pub struct MockGateway {
        pub bbo: Arc<Mutex<Bbo>>,
        pub net_position: Arc<Mutex<Decimal>>,
        pub snapshot: Arc<Mutex<PositionSnapshot>>,
        pub active_orders: Arc<Mutex<Vec<ExitOrderRef>>>,
        pub limit_orders: Arc<Mutex<Vec<OrderRequest>>>,
        pub market_orders: Arc<Mutex<Vec<OrderRequest>>>,
        pub cancelled: Arc<Mutex<Vec<String>>>,
        pub leverage_info: Arc<Mutex<LeverageInfo>>,
        pub applied_leverage: Arc<Mutex<Option<u32>>>,
        pub reject_limit: Arc<Mutex<bool>>,
        pub reject_market: Arc<Mutex<bool>>,
        /// Limit orders fill on submission at their limit price
        pub fill_limit: Arc<Mutex<bool>>,
        pub cancel_fails: Arc<Mutex<bool>>,
        /// Read calls return a gateway error
        pub fail_reads: Arc<Mutex<bool>>,
        /// Only the active-order listing fails
        pub fail_order_listing: Arc<Mutex<bool>>,
        precision: InstrumentPrecision,
        next_id: AtomicU64,
    }

    impl MockGateway {
        pub fn new(bid: Decimal, ask: Decimal) -> Self {
            Self {
                bbo: Arc::new(Mutex::new(Bbo::new(bid, ask))),
                net_position: Arc::new(Mutex::new(Decimal::ZERO)),
                snapshot: Arc::new(Mutex::new(PositionSnapshot::default())),
                active_orders: Arc::new(Mutex::new(Vec::new())),
                limit_orders: Arc::new(Mutex::new(Vec::new())),
                market_orders: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Mutex::new(Vec::new())),
                leverage_info: Arc::new(Mutex::new(LeverageInfo {
                    max_leverage: Decimal::from(20),
                    margin_requirement: None,
                })),
                applied_leverage: Arc::new(Mutex::new(None)),
                reject_limit: Arc::new(Mutex::new(false)),
                reject_market: Arc::new(Mutex::new(false)),
                fill_limit: Arc::new(Mutex::new(false)),
                cancel_fails: Arc::new(Mutex::new(false)),
                fail_reads: Arc::new(Mutex::new(false)),
                fail_order_listing: Arc::new(Mutex::new(false)),
                precision: InstrumentPrecision::default(),
                next_id: AtomicU64::new(1),
            }
        }

        pub fn with_precision(mut self, precision: InstrumentPrecision) -> Self {
            self.precision = precision;
            self
        }

        pub async fn set_bbo(&self, bid: Decimal, ask: Decimal) {
            *self.bbo.lock().await = Bbo::new(bid, ask);
        }

        pub async fn set_net_position(&self, position: Decimal) {
            *self.net_position.lock().await = position;
        }

        pub async fn set_snapshot(&self, snapshot: PositionSnapshot) {
            *self.snapshot.lock().await = snapshot;
        }

        pub async fn set_reject_limit(&self, reject: bool) {
            *self.reject_limit.lock().await = reject;
        }

        pub async fn set_reject_market(&self, reject: bool) {
            *self.reject_market.lock().await = reject;
        }

        pub async fn set_fill_limit(&self, fill: bool) {
            *self.fill_limit.lock().await = fill;
        }

        pub async fn set_fail_reads(&self, fail: bool) {
            *self.fail_reads.lock().await = fail;
        }

        pub async fn set_fail_order_listing(&self, fail: bool) {
            *self.fail_order_listing.lock().await = fail;
        }

        /// Add a resting order placed outside the engine
        pub async fn add_active_order(&self, order: ExitOrderRef) {
            self.active_orders.lock().await.push(order);
        }

        /// Fill a resting order: drop it from the listing and apply it to the position
        pub async fn fill_order(&self, order_id: &str) -> bool {
            let mut active = self.active_orders.lock().await;
            let Some(idx) = active.iter().position(|o| o.id == order_id) else {
                return false;
            };
            let order = active.remove(idx);
            drop(active);
            self.apply_fill(order.side, order.size).await;
            true
        }

        /// Drop a resting order without a fill (expired, venue-cancelled)
        pub async fn drop_order(&self, order_id: &str) {
            self.active_orders.lock().await.retain(|o| o.id != order_id);
        }

        pub async fn limit_order_count(&self) -> usize {
            self.limit_orders.lock().await.len()
        }

        pub async fn market_order_count(&self) -> usize {
            self.market_orders.lock().await.len()
        }

        fn next_order_id(&self) -> String {
            format!("ord-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn apply_fill(&self, side: OrderSide, size: Decimal) {
            let mut position = self.net_position.lock().await;
            match side {
                OrderSide::Buy => *position += size,
                OrderSide::Sell => *position -= size,
            }
        }

        async fn check_reads(&self) -> GridResult<()> {
            if *self.fail_reads.lock().await {
                return Err(GridError::Gateway("Mock read failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn fetch_bbo(&self, _contract: &str) -> GridResult<Bbo> {
            self.check_reads().await?;
            Ok(*self.bbo.lock().await)
        }

        async fn get_net_position(&self, _contract: &str) -> GridResult<Decimal> {
            self.check_reads().await?;
            Ok(*self.net_position.lock().await)
        }

        async fn get_position_snapshot(&self, _symbol: &str) -> GridResult<PositionSnapshot> {
            self.check_reads().await?;
            Ok(self.snapshot.lock().await.clone())
        }

        async fn get_active_orders(&self, _contract: &str) -> GridResult<Vec<ExitOrderRef>> {
            self.check_reads().await?;
            if *self.fail_order_listing.lock().await {
                return Err(GridError::Gateway("Mock order listing timeout".into()));
            }
            Ok(self.active_orders.lock().await.clone())
        }

        async fn place_limit_order(
            &self,
            _contract: &str,
            request: &OrderRequest,
        ) -> GridResult<OrderResult> {
            self.limit_orders.lock().await.push(request.clone());

            if *self.reject_limit.lock().await {
                return Ok(OrderResult::rejected("Mock post-only rejection"));
            }

            let price = request
                .price
                .ok_or_else(|| GridError::OrderRejected("limit order without price".into()))?;
            let id = self.next_order_id();

            if *self.fill_limit.lock().await {
                self.apply_fill(request.side, request.size).await;
                return Ok(OrderResult::filled(id, price, request.size));
            }

            self.active_orders
                .lock()
                .await
                .push(ExitOrderRef::new(id.clone(), price, request.size, request.side));
            Ok(OrderResult::resting(id))
        }

        async fn place_market_order(
            &self,
            _contract: &str,
            request: &OrderRequest,
        ) -> GridResult<OrderResult> {
            self.market_orders.lock().await.push(request.clone());

            if *self.reject_market.lock().await {
                return Ok(OrderResult::rejected("Mock market rejection"));
            }

            let price = self.bbo.lock().await.touch(request.side);
            self.apply_fill(request.side, request.size).await;
            Ok(OrderResult {
                order_id: Some(self.next_order_id()),
                status: OrderResultStatus::Filled {
                    avg_price: price,
                    filled_size: request.size,
                },
            })
        }

        async fn cancel_order(&self, _contract: &str, order_id: &str) -> GridResult<bool> {
            self.cancelled.lock().await.push(order_id.to_string());
            if *self.cancel_fails.lock().await {
                return Ok(false);
            }
            self.active_orders.lock().await.retain(|o| o.id != order_id);
            Ok(true)
        }

        async fn get_leverage_info(&self, _symbol: &str) -> GridResult<LeverageInfo> {
            self.check_reads().await?;
            Ok(*self.leverage_info.lock().await)
        }

        async fn set_leverage(&self, _symbol: &str, leverage: u32) -> GridResult<bool> {
            *self.applied_leverage.lock().await = Some(leverage);
            Ok(true)
        }

        fn precision(&self) -> InstrumentPrecision {
            self.precision
        }
    }
}
