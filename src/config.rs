/// Configuration Module
///
/// Business policy for the warehouse: tax rate, customer segment thresholds,
/// product price bands and the sale statuses the fact loader understands.
/// Defaults match the retail warehouse; each value can be overridden from the environment.
use crate::error::{EtlError, Result};
use bigdecimal::BigDecimal;
use std::str::FromStr;

pub const TAX_RATE_VAR: &str = "WAREHOUSE_TAX_RATE";
pub const SEGMENT_THRESHOLDS_VAR: &str = "WAREHOUSE_SEGMENT_THRESHOLDS";
pub const PRICE_BANDS_VAR: &str = "WAREHOUSE_PRICE_BANDS";
pub const COMPLETED_STATUS_VAR: &str = "WAREHOUSE_COMPLETED_STATUS";
pub const DISCARDED_STATUSES_VAR: &str = "WAREHOUSE_DISCARDED_STATUSES";

/// Three descending lower bounds splitting a value into four buckets
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub high: BigDecimal,
    pub mid: BigDecimal,
    pub low: BigDecimal,
}

impl Thresholds {
    pub fn new(high: i64, mid: i64, low: i64) -> Self {
        Self { high: BigDecimal::from(high), mid: BigDecimal::from(mid), low: BigDecimal::from(low) }
    }

    /// Parse "high,mid,low"
    pub fn parse(raw: &str) -> Result<Self> {
        let values = raw
            .split(',')
            .map(|part| {
                BigDecimal::from_str(part.trim())
                    .map_err(|e| EtlError::Config(format!("invalid threshold '{}': {}", part.trim(), e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let [high, mid, low]: [BigDecimal; 3] = values
            .try_into()
            .map_err(|v: Vec<BigDecimal>| EtlError::Config(format!("expected 3 thresholds, got {}", v.len())))?;

        if !(high >= mid && mid >= low) {
            return Err(EtlError::Config(format!("thresholds must be descending: {},{},{}", high, mid, low)));
        }

        Ok(Self { high, mid, low })
    }

    /// Index of the bucket `value` falls into: 0 for >= high through 3 for below low
    pub fn bucket(&self, value: &BigDecimal) -> usize {
        if value >= &self.high {
            0
        } else if value >= &self.mid {
            1
        } else if value >= &self.low {
            2
        } else {
            3
        }
    }
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub tax_rate: BigDecimal,
    /// Lifetime spend bounds for VIP, Premium and Regular customers
    pub segment_thresholds: Thresholds,
    /// Unit price bounds for Luxury, Premium and Mid-Range products
    pub price_bands: Thresholds,
    /// The only status whose sales lines become facts
    pub completed_status: String,
    /// Terminal statuses that will never become facts
    pub discarded_statuses: Vec<String>,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            tax_rate: BigDecimal::new(18.into(), 2),
            segment_thresholds: Thresholds::new(100_000, 50_000, 10_000),
            price_bands: Thresholds::new(10_000, 5_000, 1_000),
            completed_status: "completed".to_string(),
            discarded_statuses: vec!["cancelled".to_string(), "refunded".to_string()],
        }
    }
}

impl WarehouseConfig {
    /// Build from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup, falling back to defaults for unset keys
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(TAX_RATE_VAR) {
            let rate = BigDecimal::from_str(raw.trim())
                .map_err(|e| EtlError::Config(format!("{} '{}': {}", TAX_RATE_VAR, raw, e)))?;
            if rate < BigDecimal::from(0) || rate > BigDecimal::from(1) {
                return Err(EtlError::Config(format!("{} must be between 0 and 1, got {}", TAX_RATE_VAR, rate)));
            }
            config.tax_rate = rate;
        }

        if let Some(raw) = lookup(SEGMENT_THRESHOLDS_VAR) {
            config.segment_thresholds = Thresholds::parse(&raw)?;
        }

        if let Some(raw) = lookup(PRICE_BANDS_VAR) {
            config.price_bands = Thresholds::parse(&raw)?;
        }

        if let Some(raw) = lookup(COMPLETED_STATUS_VAR) {
            let status = raw.trim();
            if status.is_empty() {
                return Err(EtlError::Config(format!("{} must not be empty", COMPLETED_STATUS_VAR)));
            }
            config.completed_status = status.to_string();
        }

        if let Some(raw) = lookup(DISCARDED_STATUSES_VAR) {
            config.discarded_statuses =
                raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }

        if config.is_discarded(&config.completed_status) {
            return Err(EtlError::Config(format!(
                "status '{}' cannot be both completed and discarded",
                config.completed_status
            )));
        }

        Ok(config)
    }

    pub fn is_discarded(&self, status: &str) -> bool {
        self.discarded_statuses.iter().any(|s| s.eq_ignore_ascii_case(status))
    }

    pub fn is_completed(&self, status: &str) -> bool {
        self.completed_status.eq_ignore_ascii_case(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = WarehouseConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.tax_rate, BigDecimal::from_str("0.18").unwrap());
        assert_eq!(config.segment_thresholds, Thresholds::new(100_000, 50_000, 10_000));
        assert!(config.is_completed("Completed"));
        assert!(config.is_discarded("cancelled"));
        assert!(!config.is_discarded("pending"));
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = WarehouseConfig::from_lookup(lookup(&[
            (TAX_RATE_VAR, "0.05"),
            (PRICE_BANDS_VAR, "500, 200, 50"),
        ]))
        .unwrap();

        assert_eq!(config.tax_rate, BigDecimal::from_str("0.05").unwrap());
        assert_eq!(config.price_bands, Thresholds::new(500, 200, 50));
    }

    #[test]
    fn test_status_overrides_from_environment() {
        let config = WarehouseConfig::from_lookup(lookup(&[
            (COMPLETED_STATUS_VAR, " delivered "),
            (DISCARDED_STATUSES_VAR, "cancelled, refunded,returned,,"),
        ]))
        .unwrap();

        assert!(config.is_completed("Delivered"));
        assert!(!config.is_completed("completed"));
        assert!(config.is_discarded("RETURNED"));
        assert_eq!(config.discarded_statuses.len(), 3);
    }

    #[test]
    fn test_rejects_conflicting_statuses() {
        assert!(WarehouseConfig::from_lookup(lookup(&[(DISCARDED_STATUSES_VAR, "cancelled,completed")])).is_err());
        assert!(WarehouseConfig::from_lookup(lookup(&[(COMPLETED_STATUS_VAR, "  ")])).is_err());
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        assert!(Thresholds::parse("10,20,30").is_err());
        assert!(Thresholds::parse("10,5").is_err());
        assert!(Thresholds::parse("ten,5,1").is_err());
        assert!(WarehouseConfig::from_lookup(lookup(&[(TAX_RATE_VAR, "1.5")])).is_err());
    }

    #[test]
    fn test_bucket_boundaries_are_inclusive() {
        let t = Thresholds::new(100, 50, 10);
        assert_eq!(t.bucket(&BigDecimal::from(100)), 0);
        assert_eq!(t.bucket(&BigDecimal::from(99)), 1);
        assert_eq!(t.bucket(&BigDecimal::from(10)), 2);
        assert_eq!(t.bucket(&BigDecimal::from(0)), 3);
    }
}
