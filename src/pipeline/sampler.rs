//! Time-stratified sampling of a zone's posts.
//!
//! The range is cut into equal-width buckets, every bucket receives a quota
//! proportional to its share of the time range (largest-remainder rounding),
//! and any quota a bucket cannot fill is redistributed to buckets with spare
//! posts.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::{SeedableRng, rngs::StdRng, seq::IndexedRandom};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::store::{PostStore, models::PostStamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketWidth {
    Hour,
    Day,
    Week,
}

impl BucketWidth {
    /// Hourly up to three days, daily up to ~four months, weekly beyond.
    #[must_use]
    pub fn for_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let span = end - start;
        if span <= Duration::hours(72) {
            Self::Hour
        } else if span <= Duration::days(120) {
            Self::Day
        } else {
            Self::Week
        }
    }

    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
            Self::Week => Duration::weeks(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Chosen ids ordered by post time.
    pub post_ids: Vec<Uuid>,
    pub total_available: usize,
    pub bucket_width: BucketWidth,
    pub bucket_counts: Vec<usize>,
    pub bucket_quotas: Vec<usize>,
}

#[derive(Clone)]
pub struct Sampler {
    posts: Arc<dyn PostStore>,
}

impl Sampler {
    pub fn new(posts: Arc<dyn PostStore>) -> Self {
        Self { posts }
    }

    /// Reads the zone's posts in `[start, end)` and draws a stratified sample.
    ///
    /// # Errors
    /// Propagates post-store failures.
    pub async fn sample(
        &self,
        zone_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        target: usize,
        seed: u64,
    ) -> Result<Sample> {
        let stamps = self.posts.post_stamps(zone_id, start, end).await?;
        let sample = stratified_sample(&stamps, start, end, target, seed);
        debug!(
            %zone_id,
            total_available = sample.total_available,
            sampled = sample.post_ids.len(),
            buckets = sample.bucket_counts.len(),
            bucket_width = ?sample.bucket_width,
            "stratified sample drawn"
        );
        Ok(sample)
    }
}

/// Pure sampling core. Returns exactly `min(target, stamps.len())` ids when
/// every stamp falls inside the range.
#[must_use]
pub fn stratified_sample(
    stamps: &[PostStamp],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    target: usize,
    seed: u64,
) -> Sample {
    let width = BucketWidth::for_range(start, end);
    let mut buckets = bucketize(stamps, start, end, width);
    let counts: Vec<usize> = buckets.iter().map(Vec::len).collect();
    let total: usize = counts.iter().sum();
    let spans = bucket_spans(start, end, width, buckets.len());
    let quotas = allocate_quotas(&counts, &spans, target.min(total));

    let mut rng = StdRng::seed_from_u64(seed);
    let mut chosen: Vec<PostStamp> = Vec::with_capacity(quotas.iter().sum());
    for (bucket, &quota) in buckets.iter_mut().zip(&quotas) {
        if quota >= bucket.len() {
            chosen.append(bucket);
        } else {
            chosen.extend(bucket.choose_multiple(&mut rng, quota).copied());
        }
    }
    chosen.sort_by_key(|s| (s.posted_at, s.id));

    Sample {
        post_ids: chosen.into_iter().map(|s| s.id).collect(),
        total_available: total,
        bucket_width: width,
        bucket_counts: counts,
        bucket_quotas: quotas,
    }
}

fn bucketize(
    stamps: &[PostStamp],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    width: BucketWidth,
) -> Vec<Vec<PostStamp>> {
    let width_secs = width.duration().num_seconds().max(1);
    let span_secs = (end - start).num_seconds().max(1);
    let bucket_count = usize::try_from((span_secs + width_secs - 1) / width_secs)
        .unwrap_or(1)
        .max(1);

    let mut buckets = vec![Vec::new(); bucket_count];
    for stamp in stamps {
        if stamp.posted_at < start || stamp.posted_at >= end {
            continue;
        }
        let offset = (stamp.posted_at - start).num_seconds() / width_secs;
        let index = usize::try_from(offset).unwrap_or(0).min(bucket_count - 1);
        buckets[index].push(*stamp);
    }
    buckets
}

/// Seconds covered by each bucket; only the last one may be partial.
#[allow(clippy::cast_precision_loss)]
fn bucket_spans(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    width: BucketWidth,
    bucket_count: usize,
) -> Vec<f64> {
    let width_secs = width.duration().num_seconds().max(1);
    let mut remaining = (end - start).num_seconds().max(1);
    (0..bucket_count)
        .map(|_| {
            let span = remaining.clamp(1, width_secs);
            remaining -= span;
            span as f64
        })
        .collect()
}

/// Quotas summing to `min(target, total)`.
///
/// Each bucket first gets the share of `target` matching its share of the
/// time range (`weights`), by largest remainder. A bucket holding fewer
/// posts than that share keeps all of them and the shortfall is handed to
/// buckets with surplus in proportion to their spare posts.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn allocate_quotas(counts: &[usize], weights: &[f64], target: usize) -> Vec<usize> {
    debug_assert_eq!(counts.len(), weights.len());
    let total: usize = counts.iter().sum();
    if total == 0 || target == 0 {
        return vec![0; counts.len()];
    }
    let target = target.min(total);

    let weight_total: f64 = weights.iter().sum();
    let exact: Vec<f64> = if weight_total > 0.0 {
        weights
            .iter()
            .map(|&w| w * target as f64 / weight_total)
            .collect()
    } else {
        vec![target as f64 / counts.len() as f64; counts.len()]
    };
    let mut quotas: Vec<usize> = exact.iter().map(|share| share.floor() as usize).collect();
    let mut order: Vec<usize> = (0..counts.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    let remaining = target.saturating_sub(quotas.iter().sum());
    for &i in order.iter().cycle().take(remaining) {
        quotas[i] += 1;
    }

    for (quota, &count) in quotas.iter_mut().zip(counts) {
        *quota = (*quota).min(count);
    }

    // Redistribute any shortfall to buckets with surplus.
    let mut shortfall = target.saturating_sub(quotas.iter().sum());
    while shortfall > 0 {
        let surplus: Vec<(usize, usize)> = quotas
            .iter()
            .zip(counts)
            .enumerate()
            .filter(|(_, (q, c))| c > q)
            .map(|(i, (q, c))| (i, c - q))
            .collect();
        let surplus_total: usize = surplus.iter().map(|(_, s)| s).sum();
        if surplus_total == 0 {
            break;
        }
        let mut granted = 0;
        for &(i, spare) in &surplus {
            let share = (shortfall * spare / surplus_total).min(spare);
            quotas[i] += share;
            granted += share;
        }
        if granted == 0 {
            // Integer shares all rounded down; hand out one at a time.
            for &(i, _) in surplus.iter().take(shortfall) {
                quotas[i] += 1;
                granted += 1;
            }
        }
        shortfall -= granted.min(shortfall);
    }

    quotas
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use rstest::rstest;

    fn at(hours: i64) -> DateTime<Utc> {
        "2026-03-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap() + Duration::hours(hours)
    }

    fn stamps_per_day(per_day: &[usize]) -> Vec<PostStamp> {
        let mut stamps = Vec::new();
        for (day, &count) in per_day.iter().enumerate() {
            for k in 0..count {
                let minutes = (k * 1440 / count.max(1)) as i64;
                stamps.push(PostStamp {
                    id: Uuid::new_v4(),
                    posted_at: at(day as i64 * 24) + Duration::minutes(minutes),
                });
            }
        }
        stamps
    }

    #[rstest]
    #[case(Duration::hours(24), BucketWidth::Hour)]
    #[case(Duration::hours(72), BucketWidth::Hour)]
    #[case(Duration::days(7), BucketWidth::Day)]
    #[case(Duration::days(120), BucketWidth::Day)]
    #[case(Duration::days(365), BucketWidth::Week)]
    fn bucket_width_follows_range(#[case] span: Duration, #[case] expected: BucketWidth) {
        assert_eq!(BucketWidth::for_range(at(0), at(0) + span), expected);
    }

    #[rstest]
    #[case(vec![10, 10, 10], 15)]
    #[case(vec![1, 50, 2, 0, 7], 30)]
    #[case(vec![3, 3, 3], 100)]
    #[case(vec![0, 0], 5)]
    #[case(vec![100, 1, 1, 1], 4)]
    #[case(vec![0, 0, 0, 9, 0, 0], 7)]
    fn quotas_sum_to_min_of_target_and_total(#[case] counts: Vec<usize>, #[case] target: usize) {
        let quotas = allocate_quotas(&counts, &vec![1.0; counts.len()], target);
        let total: usize = counts.iter().sum();

        assert_eq!(quotas.iter().sum::<usize>(), target.min(total));
        for (quota, count) in quotas.iter().zip(&counts) {
            assert!(quota <= count);
        }
    }

    #[test]
    fn shortfall_moves_to_buckets_with_surplus() {
        // 均等な時間配分なら各10件だが、先頭は2件しか無い
        let quotas = allocate_quotas(&[2, 40, 40], &[1.0, 1.0, 1.0], 30);

        assert_eq!(quotas, vec![2, 14, 14]);
    }

    #[test]
    fn partial_last_bucket_gets_a_smaller_share() {
        let quotas = allocate_quotas(&[50, 50, 50], &[3600.0, 3600.0, 1800.0], 50);

        assert_eq!(quotas, vec![20, 20, 10]);
    }

    #[test]
    fn quiet_days_push_their_quota_to_busy_days() {
        let stamps = stamps_per_day(&[2, 40, 40]);

        let sample = stratified_sample(&stamps, at(0), at(24 * 3), 30, 3);

        assert_eq!(sample.bucket_width, BucketWidth::Hour);
        assert_eq!(sample.post_ids.len(), 30);
        for (quota, count) in sample.bucket_quotas.iter().zip(&sample.bucket_counts) {
            assert!(quota <= count);
        }
        let first_day: usize = sample.bucket_quotas[..24].iter().sum();
        assert_eq!(first_day, 2);
    }

    #[test]
    fn even_week_is_sampled_proportionally() {
        let stamps = stamps_per_day(&[72, 71, 72, 71, 72, 71, 71]);
        let total = stamps.len();

        let sample = stratified_sample(&stamps, at(0), at(24 * 7), 200, 42);

        assert_eq!(total, 500);
        assert_eq!(sample.post_ids.len(), 200);
        assert_eq!(sample.total_available, 500);
        assert_eq!(sample.bucket_width, BucketWidth::Day);
        for quota in &sample.bucket_quotas {
            assert!((28..=29).contains(quota), "quota {quota}");
        }
        let unique: HashSet<_> = sample.post_ids.iter().collect();
        assert_eq!(unique.len(), 200);
    }

    #[test]
    fn returns_everything_when_target_exceeds_total() {
        let stamps = stamps_per_day(&[3, 0, 4]);

        let sample = stratified_sample(&stamps, at(0), at(24 * 3) + Duration::hours(1), 50, 1);

        assert_eq!(sample.post_ids.len(), 7);
    }

    #[test]
    fn ignores_stamps_outside_range() {
        let mut stamps = stamps_per_day(&[5]);
        stamps.push(PostStamp {
            id: Uuid::new_v4(),
            posted_at: at(-1),
        });

        let sample = stratified_sample(&stamps, at(0), at(24), 100, 1);

        assert_eq!(sample.total_available, 5);
        assert_eq!(sample.post_ids.len(), 5);
    }

    #[test]
    fn same_seed_same_sample() {
        let stamps = stamps_per_day(&[40, 40, 40]);

        let a = stratified_sample(&stamps, at(0), at(72), 30, 9);
        let b = stratified_sample(&stamps, at(0), at(72), 30, 9);

        assert_eq!(a.post_ids, b.post_ids);
    }

    #[test]
    fn output_is_time_ordered() {
        let stamps = stamps_per_day(&[20, 20, 20]);

        let sample = stratified_sample(&stamps, at(0), at(72), 25, 5);
        let position: std::collections::HashMap<Uuid, DateTime<Utc>> =
            stamps.iter().map(|s| (s.id, s.posted_at)).collect();

        assert!(sample
            .post_ids
            .windows(2)
            .all(|w| position[&w[0]] <= position[&w[1]]));
    }
}
