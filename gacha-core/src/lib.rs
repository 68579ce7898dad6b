use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub type UserId = i64;
pub type GachaId = i64;
pub type ItemId = i64;

/// Rarity percentages keyed by tier name, kept in the order the author
/// configured them. Tier order matters: the tiered draw walks it.
pub type RarityRates = IndexMap<String, f64>;

pub const MIN_TIMES: u32 = 1;
pub const MAX_TIMES: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    pub rarity: String,
    pub img_src: Option<String>,
    pub weight: i64,
}

/// One drawn item, as surfaced to the caller of a roll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrawResult {
    pub item_id: ItemId,
    pub name: String,
    pub rarity: String,
    pub img_src: Option<String>,
    pub gacha_id: GachaId,
}

impl DrawResult {
    pub fn of(item: &Item, gacha_id: GachaId) -> Self {
        Self {
            item_id: item.id,
            name: item.name.clone(),
            rarity: item.rarity.clone(),
            img_src: item.img_src.clone(),
            gacha_id,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("gacha has no items")]
    NoItemsAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Uniform pick over a multiset where each item appears `weight` times.
    FlatWeight,
    /// Pick a rarity tier by its configured rate, then uniformly among
    /// that tier's items.
    TierFirst,
}

/// Flat weighted pool: each item repeated `max(1, weight)` times, in input
/// order, so a uniform index pick selects an item with probability
/// `clamped_weight / sum(clamped_weights)`.
#[derive(Debug)]
pub struct FlatPool<'a> {
    entries: Vec<&'a Item>,
}

impl<'a> FlatPool<'a> {
    pub fn build(items: &'a [Item]) -> Result<Self, PoolError> {
        if items.is_empty() {
            return Err(PoolError::NoItemsAvailable);
        }
        let mut entries = Vec::new();
        for item in items {
            // Weight floor: non-positive weights count as 1, never exclude.
            let copies = item.weight.max(1) as usize;
            for _ in 0..copies {
                entries.push(item);
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn draw<R: Rng>(&self, rng: &mut R) -> &'a Item {
        self.entries[rng.gen_range(0..self.entries.len())]
    }
}

/// Tier-first pool: a draw picks a rarity tier by its rate share, then an
/// item uniformly within the tier. A tier with no items falls back to the
/// whole item set.
#[derive(Debug)]
pub struct TieredPool<'a> {
    rates: &'a RarityRates,
    total: f64,
    by_tier: HashMap<&'a str, Vec<&'a Item>>,
    all: Vec<&'a Item>,
}

impl<'a> TieredPool<'a> {
    pub fn build(rates: &'a RarityRates, items: &'a [Item]) -> Result<Self, PoolError> {
        if items.is_empty() {
            return Err(PoolError::NoItemsAvailable);
        }
        let mut by_tier: HashMap<&str, Vec<&Item>> = HashMap::new();
        for item in items {
            by_tier.entry(item.rarity.as_str()).or_default().push(item);
        }
        Ok(Self {
            rates,
            total: rates.values().sum(),
            by_tier,
            all: items.iter().collect(),
        })
    }

    fn pick_tier<R: Rng>(&self, rng: &mut R) -> Option<&str> {
        if self.total <= 0.0 {
            // Zero or unset rates degenerate to the first configured tier.
            return self.rates.keys().next().map(String::as_str);
        }
        let mut r = rng.gen_range(0.0..self.total);
        for (tier, rate) in self.rates.iter() {
            r -= rate;
            if r <= 0.0 {
                return Some(tier.as_str());
            }
        }
        self.rates.keys().last().map(String::as_str)
    }

    pub fn draw<R: Rng>(&self, rng: &mut R) -> &'a Item {
        let pool = match self.pick_tier(rng).and_then(|tier| self.by_tier.get(tier)) {
            Some(bucket) => bucket.as_slice(),
            // Selected tier owns no items (or no tier is configured):
            // fall back to the union of all tiers.
            None => self.all.as_slice(),
        };
        pool[rng.gen_range(0..pool.len())]
    }
}

/// The two selection modes behind one capability. Callers pick a strategy
/// explicitly; the strategies are statistically different and are never
/// unified.
#[derive(Debug)]
pub enum Pool<'a> {
    Flat(FlatPool<'a>),
    Tiered(TieredPool<'a>),
}

impl<'a> Pool<'a> {
    pub fn build(
        strategy: SelectionStrategy,
        rates: &'a RarityRates,
        items: &'a [Item],
    ) -> Result<Self, PoolError> {
        match strategy {
            SelectionStrategy::FlatWeight => Ok(Pool::Flat(FlatPool::build(items)?)),
            SelectionStrategy::TierFirst => Ok(Pool::Tiered(TieredPool::build(rates, items)?)),
        }
    }

    pub fn draw<R: Rng>(&self, rng: &mut R) -> &'a Item {
        match self {
            Pool::Flat(pool) => pool.draw(rng),
            Pool::Tiered(pool) => pool.draw(rng),
        }
    }
}

/// Normalize a requested draw count into `[1, 100]`. Out-of-range counts
/// are clamped, not rejected.
pub fn clamp_times(times: i64) -> u32 {
    times.clamp(MIN_TIMES as i64, MAX_TIMES as i64) as u32
}
