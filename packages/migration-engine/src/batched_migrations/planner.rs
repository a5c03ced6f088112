//! Batch planner.
//!
//! Splits a migration's key range into contiguous, non-overlapping job
//! ranges. Materializing the ranges happens once per migration, guarded by
//! the `pending → running` transition and the `(batched_migration_id,
//! min_value)` unique constraint.

use serde::Serialize;

use super::model::BatchedMigrationRecord;
use super::BatchedMigrationParameters;
use crate::common::{MigrationError, Result};

/// Inclusive key range handled by one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchRange {
    pub start: i64,
    pub end: i64,
}

/// Result of asking a migration to start.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// Jobs were created and the migration is now running
    Planned {
        migration: BatchedMigrationRecord,
        job_count: usize,
    },
    /// The range was empty; the migration succeeded with no jobs
    Empty(BatchedMigrationRecord),
    /// Someone else already started it; nothing was written
    AlreadyStarted(BatchedMigrationRecord),
}

impl StartOutcome {
    pub fn migration(&self) -> &BatchedMigrationRecord {
        match self {
            StartOutcome::Planned { migration, .. }
            | StartOutcome::Empty(migration)
            | StartOutcome::AlreadyStarted(migration) => migration,
        }
    }
}

/// Lazily yields the job ranges of a plan, so a huge key range never has to
/// be held in memory at once.
#[derive(Debug, Clone)]
pub struct BatchRanges {
    next: Option<i64>,
    max: i64,
    batch_size: i64,
}

impl Iterator for BatchRanges {
    type Item = BatchRange;

    fn next(&mut self) -> Option<BatchRange> {
        let start = self.next.filter(|start| *start <= self.max)?;
        let end = start
            .checked_add(self.batch_size - 1)
            .map_or(self.max, |end| end.min(self.max));
        self.next = end.checked_add(1);
        Some(BatchRange { start, end })
    }
}

/// Split `[min, max]` into ranges of at most `batch_size` keys.
///
/// Emits `[start, min(start + batch_size - 1, max)]` from `min` until
/// `start > max`. An empty range (`min > max`) yields no batches.
pub fn batch_ranges(params: &BatchedMigrationParameters) -> Result<BatchRanges> {
    if params.batch_size < 1 {
        return Err(MigrationError::InvalidParameters(format!(
            "batch_size must be at least 1 (got {})",
            params.batch_size
        )));
    }

    Ok(BatchRanges {
        next: Some(params.min),
        max: params.max,
        batch_size: params.batch_size,
    })
}

/// [`batch_ranges`], collected.
pub fn plan_batches(params: &BatchedMigrationParameters) -> Result<Vec<BatchRange>> {
    Ok(batch_ranges(params)?.collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(min: i64, max: i64, batch_size: i64) -> Vec<(i64, i64)> {
        plan_batches(&BatchedMigrationParameters::new(min, max, batch_size))
            .unwrap()
            .into_iter()
            .map(|b| (b.start, b.end))
            .collect()
    }

    #[test]
    fn splits_range_with_short_last_batch() {
        assert_eq!(
            plan(1, 2500, 1000),
            vec![(1, 1000), (1001, 2000), (2001, 2500)]
        );
    }

    #[test]
    fn exact_multiple_has_no_short_batch() {
        assert_eq!(plan(1, 2000, 1000), vec![(1, 1000), (1001, 2000)]);
    }

    #[test]
    fn single_key_range_is_one_batch() {
        assert_eq!(plan(42, 42, 1000), vec![(42, 42)]);
    }

    #[test]
    fn empty_range_has_no_batches() {
        assert!(plan(10, 9, 1000).is_empty());
        assert!(plan(1, 0, 1).is_empty());
    }

    #[test]
    fn batch_size_one_gives_one_batch_per_key() {
        assert_eq!(plan(-1, 1, 1), vec![(-1, -1), (0, 0), (1, 1)]);
    }

    #[test]
    fn rejects_non_positive_batch_size() {
        for batch_size in [0, -5] {
            let result = plan_batches(&BatchedMigrationParameters::new(1, 10, batch_size));
            assert!(matches!(result, Err(MigrationError::InvalidParameters(_))));
        }
    }

    #[test]
    fn does_not_overflow_at_i64_max() {
        let batches = plan(i64::MAX - 4, i64::MAX, 3);
        assert_eq!(
            batches,
            vec![(i64::MAX - 4, i64::MAX - 2), (i64::MAX - 1, i64::MAX)]
        );

        assert_eq!(plan(i64::MAX - 1, i64::MAX, i64::MAX), vec![(i64::MAX - 1, i64::MAX)]);
    }

    #[test]
    fn huge_ranges_are_generated_lazily() {
        let params = BatchedMigrationParameters::new(1, i64::MAX, 1);
        let first: Vec<_> = batch_ranges(&params).unwrap().take(3).collect();
        assert_eq!(
            first,
            vec![
                BatchRange { start: 1, end: 1 },
                BatchRange { start: 2, end: 2 },
                BatchRange { start: 3, end: 3 },
            ]
        );
    }

    #[test]
    fn rejects_bad_batch_size_before_iterating() {
        let params = BatchedMigrationParameters::new(1, i64::MAX, 0);
        assert!(matches!(
            batch_ranges(&params),
            Err(MigrationError::InvalidParameters(_))
        ));
    }

    #[test]
    fn batches_are_contiguous_bounded_and_cover_the_range() {
        for min in [-7, 0, 1, 13] {
            for len in 0..40 {
                let max = min + len - 1;
                for batch_size in 1..12 {
                    let batches = plan(min, max, batch_size);

                    if len == 0 {
                        assert!(batches.is_empty());
                        continue;
                    }

                    assert_eq!(batches.first().unwrap().0, min);
                    assert_eq!(batches.last().unwrap().1, max);
                    for (start, end) in &batches {
                        assert!(start <= end);
                        assert!(end - start + 1 <= batch_size);
                    }
                    for pair in batches.windows(2) {
                        assert_eq!(pair[0].1 + 1, pair[1].0, "gap or overlap in {:?}", batches);
                    }
                    // Only the last batch may be short
                    for (start, end) in &batches[..batches.len() - 1] {
                        assert_eq!(end - start + 1, batch_size);
                    }
                }
            }
        }
    }
}
