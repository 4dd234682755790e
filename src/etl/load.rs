/// Load Module
///
/// Plans warehouse writes. Dimension loads follow slowly changing dimension
/// type 2 rules: a changed member has its current version expired and a new
/// version inserted, so history is never overwritten. Fact loads append one
/// row per eligible sales line, keyed to the dimension versions current at load time.
///
/// Everything here is a pure function over explicit inputs. Applying a plan is
/// the store's job (see `crate::store::WarehouseStore`).
use crate::config::WarehouseConfig;
use crate::error::{EtlError, Result};
use crate::etl::extract::DimensionSource;
use crate::etl::transform;
use crate::models::{
    open_ended_expiry, CustomerAttributes, DateDimension, DimensionRecord, NaturalKey, ProductAttributes, SalesFact,
    SourceTransaction, SurrogateKey,
};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};

// ========== Current version index ==========

/// Natural key -> current dimension version
#[derive(Debug, Clone)]
pub struct CurrentIndex<A> {
    records: HashMap<NaturalKey, DimensionRecord<A>>,
}

impl<A> CurrentIndex<A> {
    /// Index the current versions of a dimension.
    ///
    /// Expired records are ignored. Two current records for one natural key is an integrity violation.
    pub fn build(entity: &'static str, records: Vec<DimensionRecord<A>>) -> Result<Self> {
        let mut index = HashMap::with_capacity(records.len());

        for record in records.into_iter().filter(|r| r.is_current) {
            let natural_key = record.natural_key;
            if let Some(existing) = index.insert(natural_key, record) {
                return Err(EtlError::IntegrityViolation {
                    entity,
                    natural_key,
                    detail: format!("multiple current versions (surrogate key {} among them)", existing.surrogate_key),
                });
            }
        }

        Ok(Self { records: index })
    }

    pub fn get(&self, natural_key: NaturalKey) -> Option<&DimensionRecord<A>> {
        self.records.get(&natural_key)
    }

    pub fn contains(&self, natural_key: NaturalKey) -> bool {
        self.records.contains_key(&natural_key)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &DimensionRecord<A>> {
        self.records.values()
    }
}

// ========== Dimension plans ==========

/// Attributes whose changes open a new dimension version
pub trait TrackedAttributes {
    fn has_changed(&self, incoming: &Self) -> bool;
}

impl TrackedAttributes for CustomerAttributes {
    fn has_changed(&self, incoming: &Self) -> bool {
        self.full_name != incoming.full_name
            || self.email != incoming.email
            || self.city != incoming.city
            || self.tier != incoming.tier
            || self.segment != incoming.segment
    }
}

impl TrackedAttributes for ProductAttributes {
    fn has_changed(&self, incoming: &Self) -> bool {
        self.product_name != incoming.product_name
            || self.category != incoming.category
            || self.unit_price != incoming.unit_price
            || self.cost_price != incoming.cost_price
    }
}

/// Close the current version `surrogate_key` as of `expiry_date`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiration {
    pub surrogate_key: SurrogateKey,
    pub natural_key: NaturalKey,
    pub expiry_date: NaiveDate,
}

/// A version to insert as current. The store assigns its surrogate key.
#[derive(Debug, Clone, PartialEq)]
pub struct NewVersion<A> {
    pub natural_key: NaturalKey,
    pub attributes: A,
    pub effective_date: NaiveDate,
    pub expiry_date: NaiveDate,
}

/// Writes for one dimension, applied in order: every expiration before any insert
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionPlan<A> {
    pub expire: Vec<Expiration>,
    pub insert: Vec<NewVersion<A>>,
}

impl<A> DimensionPlan<A> {
    pub fn is_empty(&self) -> bool {
        self.expire.is_empty() && self.insert.is_empty()
    }
}

/// Day before `today`, but never before the version became effective
fn expiry_date_for<A>(record: &DimensionRecord<A>, today: NaiveDate) -> NaiveDate {
    today.pred_opt().unwrap_or(today).max(record.effective_date)
}

/// Expire every current version whose tracked attributes differ from the incoming row
pub fn expire_changed<A>(
    current: &CurrentIndex<A>,
    incoming: &[(NaturalKey, A)],
    change_predicate: impl Fn(&A, &A) -> bool,
    today: NaiveDate,
) -> Vec<Expiration> {
    let mut seen = HashSet::new();

    incoming
        .iter()
        .filter(|(natural_key, _)| seen.insert(*natural_key))
        .filter_map(|(natural_key, attributes)| {
            let record = current.get(*natural_key)?;
            change_predicate(&record.attributes, attributes).then(|| Expiration {
                surrogate_key: record.surrogate_key,
                natural_key: *natural_key,
                expiry_date: expiry_date_for(record, today),
            })
        })
        .collect()
}

/// New current versions for incoming rows that have no current record once `expiring` is applied
pub fn insert_new_versions<A: Clone>(
    current: &CurrentIndex<A>,
    expiring: &[Expiration],
    incoming: &[(NaturalKey, A)],
    today: NaiveDate,
) -> Vec<NewVersion<A>> {
    let expiring: HashSet<NaturalKey> = expiring.iter().map(|e| e.natural_key).collect();
    let mut seen = HashSet::new();

    incoming
        .iter()
        .filter(|(natural_key, _)| !current.contains(*natural_key) || expiring.contains(natural_key))
        .filter(|(natural_key, _)| seen.insert(*natural_key))
        .map(|(natural_key, attributes)| NewVersion {
            natural_key: *natural_key,
            attributes: attributes.clone(),
            effective_date: today,
            expiry_date: open_ended_expiry(),
        })
        .collect()
}

/// Plan an incremental load of the changed rows `delta`
pub fn plan_incremental<S>(
    current: &CurrentIndex<S::Attributes>,
    delta: &[&S],
    config: &WarehouseConfig,
    today: NaiveDate,
) -> DimensionPlan<S::Attributes>
where
    S: DimensionSource,
    S::Attributes: TrackedAttributes,
{
    let incoming: Vec<(NaturalKey, S::Attributes)> =
        delta.iter().map(|row| (row.natural_key(), row.attributes(config))).collect();

    let expire = expire_changed(current, &incoming, <S::Attributes as TrackedAttributes>::has_changed, today);
    let insert = insert_new_versions(current, &expire, &incoming, today);

    DimensionPlan { expire, insert }
}

/// Plan a rebuild: expire every current version, then insert every source row as a fresh version.
///
/// Expiry dates of the replaced versions collapse to the rebuild date.
pub fn full_refresh<S: DimensionSource>(
    current: &CurrentIndex<S::Attributes>,
    source: &[S],
    config: &WarehouseConfig,
    today: NaiveDate,
) -> DimensionPlan<S::Attributes> {
    let mut expire: Vec<Expiration> = current
        .records()
        .map(|record| Expiration {
            surrogate_key: record.surrogate_key,
            natural_key: record.natural_key,
            expiry_date: expiry_date_for(record, today),
        })
        .collect();
    expire.sort_by_key(|e| e.natural_key);

    let mut seen = HashSet::new();
    let insert = source
        .iter()
        .filter(|row| seen.insert(row.natural_key()))
        .map(|row| NewVersion {
            natural_key: row.natural_key(),
            attributes: row.attributes(config),
            effective_date: today,
            expiry_date: open_ended_expiry(),
        })
        .collect();

    DimensionPlan { expire, insert }
}

// ========== Fact plans ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingCustomer(NaturalKey),
    MissingProduct(NaturalKey),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingCustomer(id) => write!(f, "customer {} has no current dimension row", id),
            SkipReason::MissingProduct(id) => write!(f, "product {} has no current dimension row", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTransaction {
    pub degenerate_key: i64,
    pub reason: SkipReason,
}

/// Facts to append for one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactPlan {
    pub facts: Vec<SalesFact>,
    /// Calendar rows for every sale date in `facts`
    pub dates: Vec<DateDimension>,
    pub skipped: Vec<SkippedTransaction>,
    /// Lines not yet in a terminal status
    pub pending: usize,
    /// Lines in a terminal status other than completed
    pub discarded: usize,
    /// Lines found in the fact table already
    pub already_loaded: usize,
    pub considered: usize,
    /// Highest degenerate key below which every line is settled
    pub watermark: i64,
    /// First unsettled line, the one keeping `watermark` where it is
    pub held_by: Option<HeldLine>,
}

/// The sales line a fact watermark is waiting on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLine {
    pub degenerate_key: i64,
    pub status: String,
}

/// Plan facts for sales lines above `last_loaded_degenerate_key`.
///
/// Lines whose customer or product has no current version are skipped for
/// this run. The returned watermark stops just before the first skipped or
/// pending line so the next run sees it again; lines above that point that do
/// get loaded now are recognised next time through `already_loaded`.
pub fn load_new_facts(
    last_loaded_degenerate_key: i64,
    transactions: &[SourceTransaction],
    already_loaded: &HashSet<i64>,
    customers: &CurrentIndex<CustomerAttributes>,
    products: &CurrentIndex<ProductAttributes>,
    config: &WarehouseConfig,
) -> FactPlan {
    let mut candidates: Vec<&SourceTransaction> =
        transactions.iter().filter(|t| t.detail_id > last_loaded_degenerate_key).collect();
    candidates.sort_by_key(|t| t.detail_id);
    candidates.dedup_by_key(|t| t.detail_id);

    let mut plan = FactPlan { watermark: last_loaded_degenerate_key, ..FactPlan::default() };
    let mut dates = BTreeMap::new();

    for transaction in candidates {
        plan.considered += 1;
        let key = transaction.detail_id;

        let settled = if already_loaded.contains(&key) {
            plan.already_loaded += 1;
            true
        } else if config.is_discarded(&transaction.status) {
            plan.discarded += 1;
            true
        } else if !config.is_completed(&transaction.status) {
            plan.pending += 1;
            false
        } else {
            match (customers.get(transaction.customer_id), products.get(transaction.product_id)) {
                (Some(customer), Some(product)) => {
                    let fact = build_fact(transaction, customer.surrogate_key, product, config);
                    dates.entry(fact.date_key).or_insert_with(|| transform::date_dimension(fact.sale_date));
                    plan.facts.push(fact);
                    true
                }
                (None, _) => {
                    plan.skipped.push(SkippedTransaction {
                        degenerate_key: key,
                        reason: SkipReason::MissingCustomer(transaction.customer_id),
                    });
                    false
                }
                (_, None) => {
                    plan.skipped.push(SkippedTransaction {
                        degenerate_key: key,
                        reason: SkipReason::MissingProduct(transaction.product_id),
                    });
                    false
                }
            }
        };

        if plan.held_by.is_none() {
            if settled {
                plan.watermark = key;
            } else {
                plan.held_by = Some(HeldLine { degenerate_key: key, status: transaction.status.clone() });
            }
        }
    }

    plan.dates = dates.into_values().collect();
    plan
}

fn build_fact(
    transaction: &SourceTransaction,
    customer_key: SurrogateKey,
    product: &DimensionRecord<ProductAttributes>,
    config: &WarehouseConfig,
) -> SalesFact {
    let measures = transform::compute_measures(transaction, &product.attributes.cost_price, &config.tax_rate);

    SalesFact {
        degenerate_key: transaction.detail_id,
        sale_id: transaction.sale_id,
        customer_key,
        product_key: product.surrogate_key,
        date_key: transform::date_key(transaction.sale_date),
        sale_date: transaction.sale_date,
        quantity: transaction.quantity,
        unit_price: transaction.unit_price.clone(),
        discount_amount: measures.discount_amount,
        line_total: transaction.line_total.clone(),
        tax_amount: measures.tax_amount,
        cost_amount: measures.cost_amount,
        profit_amount: measures.profit_amount,
    }
}
