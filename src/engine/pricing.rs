//! Booking price computation.
//!
//! `base = nightly_rate * nights`, `commission = base * city_rate`,
//! `total = base + commission`. Money is rounded to cents, half away from zero.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::model::PriceBreakdown;

use super::EngineError;

const DECIMAL_PLACES: u32 = 2;

/// 15%.
pub const DEFAULT_COMMISSION_RATE: Decimal = Decimal::from_parts(15, 0, 0, false, 2);

const HIGH_TIER_RATE: Decimal = Decimal::from_parts(25, 0, 0, false, 2);

/// Built-in city table. Keys are lower-case.
const BUILTIN_RATES: &[(&str, Decimal)] = &[
    ("berlin", HIGH_TIER_RATE),
    ("munich", HIGH_TIER_RATE),
    ("frankfurt", HIGH_TIER_RATE),
    ("stuttgart", HIGH_TIER_RATE),
    ("hamburg", Decimal::from_parts(20, 0, 0, false, 2)),
    ("cologne", Decimal::from_parts(18, 0, 0, false, 2)),
    ("leipzig", Decimal::from_parts(15, 0, 0, false, 2)),
];

/// City → commission rate, with one fallback rate for every city not listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionTable {
    rates: HashMap<String, Decimal>,
    default_rate: Decimal,
}

impl Default for CommissionTable {
    fn default() -> Self {
        let mut table = Self::empty(DEFAULT_COMMISSION_RATE);
        for (city, rate) in BUILTIN_RATES {
            table.rates.insert((*city).to_string(), *rate);
        }
        table
    }
}

impl CommissionTable {
    pub fn empty(default_rate: Decimal) -> Self {
        Self {
            rates: HashMap::new(),
            default_rate,
        }
    }

    /// Parse a JSON object such as `{"Berlin": "0.25", "Hamburg": 0.2}`.
    pub fn from_json(json: &str, default_rate: Decimal) -> Result<Self, EngineError> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidPriceInput(format!("commission table: {e}")))?;
        let mut table = Self::empty(default_rate);
        for (city, value) in raw {
            let text = match &value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                other => {
                    return Err(EngineError::InvalidPriceInput(format!(
                        "commission rate for {city} must be a number, got {other}"
                    )));
                }
            };
            let rate: Decimal = text.parse().map_err(|e| {
                EngineError::InvalidPriceInput(format!("commission rate for {city}: {e}"))
            })?;
            table = table.with_rate(&city, rate)?;
        }
        Ok(table)
    }

    pub fn with_rate(mut self, city: &str, rate: Decimal) -> Result<Self, EngineError> {
        if rate.is_sign_negative() || rate >= Decimal::ONE {
            return Err(EngineError::InvalidPriceInput(format!(
                "commission rate for {city} must be in [0, 1), got {rate}"
            )));
        }
        self.rates.insert(normalize_city(city), rate);
        Ok(self)
    }

    pub fn with_default_rate(mut self, rate: Decimal) -> Result<Self, EngineError> {
        if rate.is_sign_negative() || rate >= Decimal::ONE {
            return Err(EngineError::InvalidPriceInput(format!(
                "default commission rate must be in [0, 1), got {rate}"
            )));
        }
        self.default_rate = rate;
        Ok(self)
    }

    pub fn default_rate(&self) -> Decimal {
        self.default_rate
    }

    /// Never fails: unknown cities get the default rate.
    pub fn rate_for(&self, city: &str) -> Decimal {
        self.rates
            .get(&normalize_city(city))
            .copied()
            .unwrap_or(self.default_rate)
    }
}

pub(crate) fn normalize_city(city: &str) -> String {
    city.trim().to_lowercase()
}

fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// Nights charged for a stay. Same-day and inverted ranges are floored at one.
pub fn nights_between(start: NaiveDate, end: NaiveDate) -> i64 {
    (end - start).num_days().max(1)
}

pub fn compute_price(
    table: &CommissionTable,
    nightly_rate: Option<Decimal>,
    start: NaiveDate,
    end: NaiveDate,
    city: &str,
) -> Result<PriceBreakdown, EngineError> {
    let rate = match nightly_rate {
        None => {
            return Err(EngineError::InvalidPriceInput(
                "listing has no nightly rate".into(),
            ));
        }
        Some(r) if r <= Decimal::ZERO => {
            return Err(EngineError::InvalidPriceInput(format!(
                "nightly rate must be greater than 0, got {r}"
            )));
        }
        Some(r) => r,
    };

    let overflow =
        || EngineError::InvalidPriceInput(format!("price of {rate} per night overflows"));
    let nights = Decimal::from(nights_between(start, end));
    let base_price = round_money(rate.checked_mul(nights).ok_or_else(overflow)?);
    let commission_rate = table.rate_for(city);
    let commission_amount =
        round_money(base_price.checked_mul(commission_rate).ok_or_else(overflow)?);
    let total_price = base_price
        .checked_add(commission_amount)
        .ok_or_else(overflow)?;

    Ok(PriceBreakdown {
        base_price,
        commission_rate,
        commission_amount,
        total_price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn quote(
        table: &CommissionTable,
        rate: Decimal,
        start: &str,
        end: &str,
        city: &str,
    ) -> PriceBreakdown {
        compute_price(table, Some(rate), d(start), d(end), city).unwrap()
    }

    #[test]
    fn berlin_four_nights() {
        let table = CommissionTable::default();
        let p = quote(&table, dec!(100), "2025-06-01", "2025-06-05", "Berlin");
        assert_eq!(p.base_price, dec!(400));
        assert_eq!(p.commission_rate, dec!(0.25));
        assert_eq!(p.commission_amount, dec!(100));
        assert_eq!(p.total_price, dec!(500));
    }

    #[test]
    fn unknown_city_uses_default() {
        let table = CommissionTable::default();
        let p = quote(&table, dec!(80), "2025-06-01", "2025-06-03", "Rostock");
        assert_eq!(p.commission_rate, DEFAULT_COMMISSION_RATE);
        assert_eq!(p.commission_amount, dec!(24.00));
        assert_eq!(p.total_price, dec!(184.00));
    }

    #[test]
    fn city_lookup_is_case_insensitive() {
        let table = CommissionTable::default();
        assert_eq!(table.rate_for("  HAMBURG "), dec!(0.20));
        assert_eq!(table.rate_for("cologne"), dec!(0.18));
        assert_eq!(table.rate_for(""), DEFAULT_COMMISSION_RATE);
    }

    #[test]
    fn commission_rounds_half_up() {
        // 10.30 * 0.15 = 1.545 -> 1.55 (banker's rounding would give 1.54)
        let table = CommissionTable::empty(dec!(0.15));
        let p = quote(&table, dec!(10.30), "2025-06-01", "2025-06-02", "x");
        assert_eq!(p.base_price, dec!(10.30));
        assert_eq!(p.commission_amount, dec!(1.55));
        assert_eq!(p.total_price, dec!(11.85));
    }

    #[test]
    fn base_price_rounds_to_cents() {
        let table = CommissionTable::empty(dec!(0.10));
        let p = quote(&table, dec!(10.005), "2025-06-01", "2025-06-02", "x");
        assert_eq!(p.base_price, dec!(10.01));
    }

    #[test]
    fn same_day_range_charges_one_night() {
        let table = CommissionTable::default();
        let p = quote(&table, dec!(50), "2025-06-01", "2025-06-01", "Leipzig");
        assert_eq!(p.base_price, dec!(50));
        let inverted = quote(&table, dec!(50), "2025-06-05", "2025-06-01", "Leipzig");
        assert_eq!(inverted.base_price, dec!(50));
    }

    #[test]
    fn rejects_missing_zero_and_negative_rates() {
        let table = CommissionTable::default();
        let (s, e) = (d("2025-06-01"), d("2025-06-02"));
        for rate in [None, Some(dec!(0)), Some(dec!(-10))] {
            let result = compute_price(&table, rate, s, e, "Berlin");
            assert!(matches!(result, Err(EngineError::InvalidPriceInput(_))));
        }
    }

    #[test]
    fn overflowing_rate_is_invalid_input() {
        let table = CommissionTable::default();
        let (s, e) = (d("2030-06-01"), d("2030-06-03"));
        let result = compute_price(&table, Some(Decimal::MAX), s, e, "Berlin");
        assert!(matches!(result, Err(EngineError::InvalidPriceInput(_))));
    }

    #[test]
    fn total_is_base_plus_commission() {
        let table = CommissionTable::default();
        let start = d("2025-01-01");
        for (rate, nights, city) in [
            (dec!(19.99), 3, "Berlin"),
            (dec!(123.45), 7, "Hamburg"),
            (dec!(0.01), 1, "Cologne"),
            (dec!(999.99), 30, "Nowhere"),
        ] {
            let end = start + chrono::Duration::days(nights);
            let p = compute_price(&table, Some(rate), start, end, city).unwrap();
            assert_eq!(p.total_price, p.base_price + p.commission_amount);
            assert_eq!(p.base_price, (rate * Decimal::from(nights)).round_dp(2));
        }
    }

    #[test]
    fn table_from_json() {
        let json = r#"{"Berlin": "0.30", "Rostock": 0.12}"#;
        let table = CommissionTable::from_json(json, dec!(0.2)).unwrap();
        assert_eq!(table.rate_for("berlin"), dec!(0.30));
        assert_eq!(table.rate_for("ROSTOCK"), dec!(0.12));
        assert_eq!(table.rate_for("Munich"), dec!(0.2));
        assert_eq!(table.default_rate(), dec!(0.2));
    }

    #[test]
    fn table_from_json_rejects_bad_rates() {
        assert!(CommissionTable::from_json(r#"{"Berlin": "1.5"}"#, dec!(0.2)).is_err());
        assert!(CommissionTable::from_json(r#"{"Berlin": true}"#, dec!(0.2)).is_err());
        assert!(CommissionTable::from_json("not json", dec!(0.2)).is_err());
    }

    #[test]
    fn default_rate_override_keeps_city_rates() {
        let table = CommissionTable::default().with_default_rate(dec!(0.10)).unwrap();
        assert_eq!(table.rate_for("Rostock"), dec!(0.10));
        assert_eq!(table.rate_for("Berlin"), dec!(0.25));
        assert!(CommissionTable::default().with_default_rate(dec!(1)).is_err());
        assert!(CommissionTable::default().with_default_rate(dec!(-0.1)).is_err());
    }
}
