/// Data Models Module
///
/// This module defines the core data structures used throughout the application:
/// operational source rows, versioned dimension records, fact rows and the
/// bookkeeping records (checkpoints, job runs) that make loads incremental.
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::str::FromStr;

pub type SurrogateKey = i64;
pub type NaturalKey = i64;

/// Expiry date carried by every current dimension version
pub fn open_ended_expiry() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX)
}

// ========== Operational sources ==========

/// Customer row from the operational `customers` table, joined with its tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceCustomer {
    pub customer_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub city: Option<String>,
    pub tier_name: Option<String>,
    pub total_spend: BigDecimal,
    pub updated_at: DateTime<Utc>,
}

/// Product row from the operational `products` table, joined with its category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceProduct {
    pub product_id: i64,
    pub product_name: String,
    pub category_name: Option<String>,
    pub unit_price: BigDecimal,
    pub cost_price: BigDecimal,
    pub updated_at: DateTime<Utc>,
}

/// One sales line (`sales_details`) joined with its `sales` header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceTransaction {
    pub detail_id: i64,
    pub sale_id: i64,
    pub customer_id: i64,
    pub product_id: i64,
    pub sale_date: NaiveDate,
    pub status: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub discount_pct: BigDecimal,
    pub line_total: BigDecimal,
}

// ========== Dimensions ==========

/// Customer attribute snapshot stored on each `dim_customer` version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerAttributes {
    pub full_name: String,
    pub email: String,
    pub city: Option<String>,
    pub tier: Option<String>,
    pub segment: String,
}

/// Product attribute snapshot stored on each `dim_product` version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductAttributes {
    pub product_name: String,
    pub category: Option<String>,
    pub unit_price: BigDecimal,
    pub cost_price: BigDecimal,
    pub price_range: String,
}

/// One version of a slowly changing (type 2) dimension member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionRecord<A> {
    pub surrogate_key: SurrogateKey,
    pub natural_key: NaturalKey,
    pub attributes: A,
    pub effective_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub is_current: bool,
}

/// Calendar attributes for one `dim_date` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateDimension {
    pub date_key: i32,
    pub full_date: NaiveDate,
    pub year: i32,
    pub quarter: i32,
    pub month: i32,
    pub day: i32,
    pub weekday: String,
    pub is_weekend: bool,
}

// ========== Facts ==========

/// One `fact_sales` row. The degenerate key is the source sales line id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SalesFact {
    pub degenerate_key: i64,
    pub sale_id: i64,
    pub customer_key: SurrogateKey,
    pub product_key: SurrogateKey,
    pub date_key: i32,
    pub sale_date: NaiveDate,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub discount_amount: BigDecimal,
    pub line_total: BigDecimal,
    pub tax_amount: BigDecimal,
    pub cost_amount: BigDecimal,
    pub profit_amount: BigDecimal,
}

/// Per-day aggregate rebuilt from `fact_sales`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySalesSummary {
    pub sale_date: NaiveDate,
    pub transactions: i64,
    pub units_sold: i64,
    pub gross_revenue: BigDecimal,
    pub discount_total: BigDecimal,
    pub tax_total: BigDecimal,
    pub cost_total: BigDecimal,
    pub profit_total: BigDecimal,
}

// ========== Bookkeeping ==========

/// Extraction cursor for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Checkpoint {
    pub source_name: String,
    pub last_extracted_id: Option<i64>,
    pub last_extracted_timestamp: DateTime<Utc>,
    pub last_run_time: DateTime<Utc>,
}

/// A pending checkpoint advance, applied by the store in the same transaction as the stage writes
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointUpdate {
    pub source_name: String,
    pub last_id: Option<i64>,
    pub last_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row counters accumulated by a run and recorded on its job log entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl AddAssign for RowCounts {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }
}

/// One entry of the job log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: i64,
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub counts: RowCounts,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trips_through_text() {
        for status in [JobStatus::Running, JobStatus::Completed, JobStatus::Failed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_row_counts_accumulate() {
        let mut total = RowCounts { processed: 3, inserted: 2, updated: 1, deleted: 0 };
        total += RowCounts { processed: 5, inserted: 4, updated: 0, deleted: 2 };
        assert_eq!(total, RowCounts { processed: 8, inserted: 6, updated: 1, deleted: 2 });
    }

    #[test]
    fn test_open_ended_expiry_is_far_future() {
        assert_eq!(open_ended_expiry(), NaiveDate::from_ymd_opt(9999, 12, 31).unwrap());
    }
}
