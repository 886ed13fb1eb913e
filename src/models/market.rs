use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// Merged per-(exchange,symbol) ticker state.
///
/// Every field is optional: upstream feeds deliver partial updates (Bybit
/// ticker deltas, Hyperliquid allMids carry only a price) and the cache merges
/// them into one record. Rates are fractions, not percentages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid1_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask1_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high24h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low24h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open24h: Option<f64>,
    /// 24 h volume in base units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume24h: Option<f64>,
    /// 24 h turnover in quote units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turnover24h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price24h_pcnt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_funding_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<f64>,
}

impl Ticker {
    /// Merge a partial update into this record. `None` fields keep their
    /// previous value.
    pub fn merge(&mut self, patch: &Ticker) {
        macro_rules! take {
            ($field:ident) => {
                if patch.$field.is_some() {
                    self.$field = patch.$field;
                }
            };
        }
        take!(last_price);
        take!(mark_price);
        take!(index_price);
        take!(bid1_price);
        take!(ask1_price);
        take!(high24h);
        take!(low24h);
        take!(open24h);
        take!(volume24h);
        take!(turnover24h);
        take!(price24h_pcnt);
        take!(funding_rate);
        take!(next_funding_time);
        take!(open_interest);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub price: f64,
    pub size: f64,
    pub side: TradeSide,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
}

impl Trade {
    /// Two trades are the same fill when their IDs match, or (IDs absent)
    /// when price, size, and timestamp all match.
    pub fn same_fill(&self, other: &Trade) -> bool {
        match (&self.trade_id, &other.trade_id) {
            (Some(a), Some(b)) => a == b,
            _ => {
                self.price == other.price
                    && self.size == other.size
                    && self.timestamp == other.timestamp
            }
        }
    }
}

/// Side of the forced counter-trade that closed the liquidated position:
/// `Buy` means a short was liquidated, `Sell` a long. All exchanges are
/// normalized to this one convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Liquidation {
    pub id: String,
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub side: LiquidationSide,
    pub timestamp: i64,
}

/// Static contract descriptors, refreshed wholesale per exchange by the REST
/// poller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_coin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote_coin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lot_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_order_qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_order_qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_leverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_leverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_value: Option<f64>,
    /// Hyperliquid asset index within the meta universe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_index: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Funding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_funding_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_time: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterest {
    pub open_interest: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_interest_value: Option<f64>,
}

/// Current L2 book for one (exchange,symbol).
///
/// Levels are keyed by exact decimal price; the wire form serializes bids
/// descending and asks ascending as `[["price","size"], …]`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBook {
    #[serde(serialize_with = "ser_levels_desc")]
    pub bids: BTreeMap<Decimal, Decimal>,
    #[serde(serialize_with = "ser_levels_asc")]
    pub asks: BTreeMap<Decimal, Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_seq: Option<u64>,
    pub timestamp: i64,
}

impl OrderBook {
    pub fn new(timestamp: i64) -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            update_id: None,
            cross_seq: None,
            timestamp,
        }
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(&p, &s)| (p, s))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(&p, &s)| (p, s))
    }

    /// Apply one side of a delta: size 0 removes the level, anything else
    /// upserts it.
    pub fn apply_side(side: &mut BTreeMap<Decimal, Decimal>, levels: &[(Decimal, Decimal)]) {
        for &(price, size) in levels {
            if size.is_zero() {
                side.remove(&price);
            } else {
                side.insert(price, size);
            }
        }
    }

    pub fn replace(&mut self, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) {
        self.bids.clear();
        self.asks.clear();
        Self::apply_side(&mut self.bids, bids);
        Self::apply_side(&mut self.asks, asks);
    }
}

fn ser_levels_desc<S: Serializer>(
    levels: &BTreeMap<Decimal, Decimal>,
    ser: S,
) -> Result<S::Ok, S::Error> {
    ser.collect_seq(levels.iter().rev().map(|(&p, &s)| (p, s)))
}

fn ser_levels_asc<S: Serializer>(
    levels: &BTreeMap<Decimal, Decimal>,
    ser: S,
) -> Result<S::Ok, S::Error> {
    ser.collect_seq(levels.iter().map(|(&p, &s)| (p, s)))
}
