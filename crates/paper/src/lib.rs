pub mod fill;

pub use fill::{with_slippage, BarFillModel};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{Error, ExchangeClient, Fill, Order, OrderSide, Result};

#[derive(Debug, Clone, Copy)]
struct Quote {
    price: f64,
    at: DateTime<Utc>,
}

/// Simulated exchange client for paper trading.
///
/// Fills are simulated at the latest known price with configurable slippage.
/// Fill timestamps are the time of that price, not the wall clock, so a
/// recorded feed replayed through the live driver fills the same way twice.
pub struct PaperClient {
    /// Simulated cash balance.
    balance: Arc<RwLock<f64>>,
    /// Net signed quantity held per symbol.
    holdings: Arc<RwLock<BTreeMap<String, f64>>>,
    /// Latest known price per symbol, updated via `update_price`.
    prices: Arc<RwLock<HashMap<String, Quote>>>,
    /// Slippage in basis points applied to all fills.
    slippage_bps: f64,
}

impl PaperClient {
    pub fn new(initial_balance: f64, slippage_bps: f64) -> Self {
        info!(
            balance = initial_balance,
            slippage_bps = slippage_bps,
            "PaperClient initialized"
        );
        Self {
            balance: Arc::new(RwLock::new(initial_balance)),
            holdings: Arc::new(RwLock::new(BTreeMap::new())),
            prices: Arc::new(RwLock::new(HashMap::new())),
            slippage_bps,
        }
    }

    /// Update the latest price for a symbol (called by the feed loop).
    pub async fn update_price(&self, symbol: &str, price: f64, at: DateTime<Utc>) {
        self.prices
            .write()
            .await
            .insert(symbol.to_string(), Quote { price, at });
    }

    pub async fn balance(&self) -> f64 {
        *self.balance.read().await
    }

    /// Net quantity per symbol; flat symbols are omitted.
    pub async fn holdings(&self) -> BTreeMap<String, f64> {
        self.holdings.read().await.clone()
    }
}

#[async_trait]
impl ExchangeClient for PaperClient {
    async fn submit_order(&self, order: &Order) -> Result<Fill> {
        if !(order.quantity.is_finite() && order.quantity > 0.0) {
            return Err(Error::Exchange(format!(
                "PaperClient refuses order {} with quantity {}",
                order.id, order.quantity
            )));
        }
        let quote = self.prices.read().await.get(&order.symbol).copied().ok_or_else(|| {
            Error::Exchange(format!(
                "PaperClient has no price for symbol '{}'. Ensure the feed is flowing.",
                order.symbol
            ))
        })?;

        let sign = match order.side {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        };
        let fill_price = with_slippage(quote.price, sign, self.slippage_bps);

        debug!(
            symbol = %order.symbol,
            side = ?order.side,
            mid = quote.price,
            fill = fill_price,
            qty = order.quantity,
            position = %order.position_id,
            "Paper fill simulated"
        );

        *self.balance.write().await -= sign * fill_price * order.quantity;
        let mut holdings = self.holdings.write().await;
        let held = holdings.entry(order.symbol.clone()).or_insert(0.0);
        *held += sign * order.quantity;
        if held.abs() < 1e-12 {
            holdings.remove(&order.symbol);
        }

        Ok(Fill {
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            fill_price,
            quantity: order.quantity,
            timestamp: quote.at,
        })
    }

    async fn on_market_price(&self, symbol: &str, price: f64, at: DateTime<Utc>) -> Result<()> {
        self.update_price(symbol, price, at).await;
        Ok(())
    }

    async fn current_price(&self, symbol: &str) -> Result<f64> {
        self.prices
            .read()
            .await
            .get(symbol)
            .map(|q| q.price)
            .ok_or_else(|| Error::Exchange(format!("No price available for {symbol}")))
    }
}
