//! Chunked, timed application of changed rows to the store.

use std::collections::BTreeMap;
use std::time::Instant;

use secmap_warehouse::{ApplyCounts, IdentityRow, Provenance, SectorRow};

use crate::metrics::RunMetrics;
use crate::store::{EnrichmentStore, StoreError};

/// Applies rows in fixed-size batches, one store call at a time.
///
/// Rows are de-duplicated by key before chunking (last one wins), so a key
/// never appears twice in the same run of batches. The first failing batch
/// aborts the rest.
pub struct BatchPersister<'a, S: EnrichmentStore + ?Sized = dyn EnrichmentStore> {
    store: &'a S,
    metrics: &'a RunMetrics,
    batch_size: usize,
}

impl<'a, S: EnrichmentStore + ?Sized> BatchPersister<'a, S> {
    pub fn new(store: &'a S, metrics: &'a RunMetrics, batch_size: usize) -> Self {
        Self {
            store,
            metrics,
            batch_size: batch_size.max(1),
        }
    }

    pub fn apply_identities(
        &self,
        rows: Vec<IdentityRow>,
        provenance: &Provenance,
    ) -> Result<ApplyCounts, StoreError> {
        let rows = dedupe_by_key(rows, |row| row.cusip.clone());
        self.apply_chunks("identity", &rows, |chunk| {
            self.store.apply_identity_batch(chunk, provenance)
        })
    }

    pub fn apply_sectors(
        &self,
        rows: Vec<SectorRow>,
        provenance: &Provenance,
    ) -> Result<ApplyCounts, StoreError> {
        let rows = dedupe_by_key(rows, |row| row.ticker.clone());
        self.apply_chunks("sector", &rows, |chunk| {
            self.store.apply_sector_batch(chunk, provenance)
        })
    }

    fn apply_chunks<T>(
        &self,
        kind: &'static str,
        rows: &[T],
        mut apply: impl FnMut(&[T]) -> Result<ApplyCounts, StoreError>,
    ) -> Result<ApplyCounts, StoreError> {
        let mut totals = ApplyCounts::default();

        for (index, chunk) in rows.chunks(self.batch_size).enumerate() {
            let started = Instant::now();
            let result = apply(chunk);
            let elapsed = started.elapsed();
            self.metrics.record_db_write(elapsed);

            let counts = result.inspect_err(|error| {
                tracing::error!(kind, batch = index, rows = chunk.len(), %error, "batch apply failed");
            })?;
            tracing::info!(
                kind,
                batch = index,
                rows = chunk.len(),
                deactivated = counts.deactivated,
                inserted = counts.inserted,
                elapsed_ms = elapsed.as_millis() as u64,
                "batch applied"
            );
            totals += counts;
        }

        Ok(totals)
    }
}

fn dedupe_by_key<T, K: Ord>(rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut by_key = BTreeMap::new();
    for row in rows {
        by_key.insert(key(&row), row);
    }
    by_key.into_values().collect()
}
