/// Transform Module
///
/// Handles derivation of warehouse values from operational rows:
/// classification buckets for dimensions, fact measures and calendar attributes.
use crate::config::{Thresholds, WarehouseConfig};
use crate::models::{
    CustomerAttributes, DailySalesSummary, DateDimension, ProductAttributes, SalesFact, SourceCustomer,
    SourceProduct, SourceTransaction,
};
use bigdecimal::{BigDecimal, RoundingMode, Zero};
use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::BTreeMap;

const SEGMENT_LABELS: [&str; 4] = ["VIP", "Premium", "Regular", "New"];
const PRICE_RANGE_LABELS: [&str; 4] = ["Luxury", "Premium", "Mid-Range", "Budget"];

/// Money values are stored with two decimal places
const MONEY_SCALE: i64 = 2;

/// Round to cents, halves away from zero (0.125 -> 0.13)
fn round_money(amount: BigDecimal) -> BigDecimal {
    amount.with_scale_round(MONEY_SCALE, RoundingMode::HalfUp)
}

/// Bucket a customer's lifetime spend into a segment
pub fn customer_segment(total_spend: &BigDecimal, thresholds: &Thresholds) -> &'static str {
    SEGMENT_LABELS[thresholds.bucket(total_spend)]
}

/// Bucket a product's unit price into a price range
pub fn price_range(unit_price: &BigDecimal, bands: &Thresholds) -> &'static str {
    PRICE_RANGE_LABELS[bands.bucket(unit_price)]
}

pub fn customer_attributes(customer: &SourceCustomer, config: &WarehouseConfig) -> CustomerAttributes {
    let full_name = format!("{} {}", customer.first_name.trim(), customer.last_name.trim()).trim().to_string();

    CustomerAttributes {
        full_name,
        email: customer.email.trim().to_lowercase(),
        city: customer.city.clone(),
        tier: customer.tier_name.clone(),
        segment: customer_segment(&customer.total_spend, &config.segment_thresholds).to_string(),
    }
}

pub fn product_attributes(product: &SourceProduct, config: &WarehouseConfig) -> ProductAttributes {
    ProductAttributes {
        product_name: product.product_name.trim().to_string(),
        category: product.category_name.clone(),
        unit_price: product.unit_price.clone(),
        cost_price: product.cost_price.clone(),
        price_range: price_range(&product.unit_price, &config.price_bands).to_string(),
    }
}

/// Measures derived for one sales line
#[derive(Debug, Clone, PartialEq)]
pub struct Measures {
    pub discount_amount: BigDecimal,
    pub tax_amount: BigDecimal,
    pub cost_amount: BigDecimal,
    pub profit_amount: BigDecimal,
}

/// Compute discount, tax, cost and profit for a sales line.
///
/// `cost_price` comes from the product version current at load time.
pub fn compute_measures(transaction: &SourceTransaction, cost_price: &BigDecimal, tax_rate: &BigDecimal) -> Measures {
    let quantity = BigDecimal::from(transaction.quantity);
    let hundred = BigDecimal::from(100);

    let discount_amount = round_money(&transaction.discount_pct * &transaction.unit_price * &quantity / hundred);
    let tax_amount = round_money(&transaction.line_total * tax_rate);
    let cost_amount = round_money(cost_price * &quantity);
    let profit_amount = round_money(&transaction.line_total - &cost_amount);

    Measures { discount_amount, tax_amount, cost_amount, profit_amount }
}

/// Integer key for a calendar date, e.g. 2024-03-09 -> 20240309
pub fn date_key(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

pub fn date_dimension(date: NaiveDate) -> DateDimension {
    let weekday = date.weekday();
    let weekday_name = match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    };

    DateDimension {
        date_key: date_key(date),
        full_date: date,
        year: date.year(),
        quarter: (date.month0() / 3 + 1) as i32,
        month: date.month() as i32,
        day: date.day() as i32,
        weekday: weekday_name.to_string(),
        is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
    }
}

/// Aggregate facts into one summary row per sale date, ordered by date
pub fn summarize_daily(facts: &[SalesFact]) -> Vec<DailySalesSummary> {
    let mut by_date: BTreeMap<NaiveDate, DailySalesSummary> = BTreeMap::new();

    for fact in facts {
        let entry = by_date.entry(fact.sale_date).or_insert_with(|| DailySalesSummary {
            sale_date: fact.sale_date,
            transactions: 0,
            units_sold: 0,
            gross_revenue: BigDecimal::zero(),
            discount_total: BigDecimal::zero(),
            tax_total: BigDecimal::zero(),
            cost_total: BigDecimal::zero(),
            profit_total: BigDecimal::zero(),
        });

        entry.transactions += 1;
        entry.units_sold += i64::from(fact.quantity);
        entry.gross_revenue += &fact.line_total;
        entry.discount_total += &fact.discount_amount;
        entry.tax_total += &fact.tax_amount;
        entry.cost_total += &fact.cost_amount;
        entry.profit_total += &fact.profit_amount;
    }

    by_date.into_values().collect()
}
