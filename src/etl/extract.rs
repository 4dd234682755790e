/// Extract Module
///
/// Change detection over operational source rows. Extraction itself is a
/// store read; this module decides which of the fetched rows form the delta.
use crate::config::WarehouseConfig;
use crate::etl::load::CurrentIndex;
use crate::etl::transform;
use crate::models::{CustomerAttributes, NaturalKey, ProductAttributes, SourceCustomer, SourceProduct};
use chrono::{DateTime, Utc};

/// An operational row that feeds a versioned dimension
pub trait DimensionSource {
    type Attributes: Clone + PartialEq;

    /// Entity name used in logs and integrity errors
    const ENTITY: &'static str;
    /// Checkpoint key for this source
    const SOURCE_NAME: &'static str;

    fn natural_key(&self) -> NaturalKey;
    fn modified_at(&self) -> DateTime<Utc>;
    fn attributes(&self, config: &WarehouseConfig) -> Self::Attributes;
}

impl DimensionSource for SourceCustomer {
    type Attributes = CustomerAttributes;

    const ENTITY: &'static str = "customer";
    const SOURCE_NAME: &'static str = "customers";

    fn natural_key(&self) -> NaturalKey {
        self.customer_id
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn attributes(&self, config: &WarehouseConfig) -> CustomerAttributes {
        transform::customer_attributes(self, config)
    }
}

impl DimensionSource for SourceProduct {
    type Attributes = ProductAttributes;

    const ENTITY: &'static str = "product";
    const SOURCE_NAME: &'static str = "products";

    fn natural_key(&self) -> NaturalKey {
        self.product_id
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn attributes(&self, config: &WarehouseConfig) -> ProductAttributes {
        transform::product_attributes(self, config)
    }
}

/// Rows modified after `since`, plus rows whose natural key has no current dimension version.
///
/// The second clause catches rows that predate the checkpoint, e.g. after a
/// dimension reset or a backdated insert. It says nothing about whether an
/// earlier version ever existed.
///
/// Stores apply the same predicate when reading the source, so this mostly
/// confirms a delta that is already narrowed.
pub fn find_changed<'a, S: DimensionSource>(
    rows: &'a [S],
    since: DateTime<Utc>,
    current: &'a CurrentIndex<S::Attributes>,
) -> impl Iterator<Item = &'a S> + 'a {
    rows.iter().filter(move |row| row.modified_at() > since || !current.contains(row.natural_key()))
}

/// Latest modification timestamp among `rows`
pub fn max_modified<'a, S: DimensionSource + 'a>(rows: impl IntoIterator<Item = &'a S>) -> Option<DateTime<Utc>> {
    rows.into_iter().map(DimensionSource::modified_at).max()
}
