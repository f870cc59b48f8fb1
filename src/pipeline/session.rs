//! Session lifecycle vocabulary: the immutable run configuration, the phase
//! table with its progress bands, and completion-time estimates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::models::{PhaseUpdate, SessionStatus};

pub const SESSION_CONFIG_VERSION: u32 = 1;

/// Versioned, immutable record of what a session was asked to do and what
/// the sampler resolved. Stored as JSONB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum SessionConfig {
    #[serde(rename = "1")]
    V1(SessionConfigV1),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfigV1 {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub requested_sample_size: usize,
    pub sampled_post_ids: Vec<Uuid>,
    pub actual_sample_size: usize,
    pub total_available: usize,
    pub cache_hit_rate: f64,
    pub estimated_time_seconds: f64,
    pub seed: u64,
}

impl SessionConfig {
    #[must_use]
    pub fn v1(&self) -> &SessionConfigV1 {
        match self {
            Self::V1(config) => config,
        }
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        match self {
            Self::V1(_) => SESSION_CONFIG_VERSION,
        }
    }
}

/// Worker phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Vectorizing,
    Reducing,
    Clustering,
    Labeling,
}

impl Phase {
    pub const ORDER: [Phase; 4] = [
        Phase::Vectorizing,
        Phase::Reducing,
        Phase::Clustering,
        Phase::Labeling,
    ];

    #[must_use]
    pub fn status(self) -> SessionStatus {
        match self {
            Self::Vectorizing => SessionStatus::Vectorizing,
            Self::Reducing => SessionStatus::Reducing,
            Self::Clustering => SessionStatus::Clustering,
            Self::Labeling => SessionStatus::Labeling,
        }
    }

    /// Progress band `(on entry, on exit)`.
    #[must_use]
    pub fn progress_band(self) -> (u8, u8) {
        match self {
            Self::Vectorizing => (5, 40),
            Self::Reducing => (45, 60),
            Self::Clustering => (65, 75),
            Self::Labeling => (80, 95),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.status().as_str()
    }

    #[must_use]
    pub fn entry_update(self) -> PhaseUpdate {
        let message = match self {
            Self::Vectorizing => "computing embeddings",
            Self::Reducing => "projecting embeddings",
            Self::Clustering => "grouping opinions",
            Self::Labeling => "labelling clusters",
        };
        PhaseUpdate {
            status: self.status(),
            progress: self.progress_band().0,
            message: message.to_string(),
        }
    }

    /// Interpolates within the band for `done` of `total` units of work.
    #[must_use]
    pub fn progress_at(self, done: usize, total: usize) -> u8 {
        let (start, end) = self.progress_band();
        if total == 0 {
            return end;
        }
        let span = usize::from(end - start);
        let step = span * done.min(total) / total;
        start + u8::try_from(step).unwrap_or(end - start)
    }
}

/// Rough wall time for a fresh run, in seconds.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn estimate_seconds(needs_embedding: usize, batch_size: usize, sample_size: usize) -> f64 {
    let batches = needs_embedding.div_ceil(batch_size.max(1));
    8.0 + 1.2 * batches as f64 + 0.01 * sample_size as f64
}

/// Remaining share of an estimate given persisted progress.
#[must_use]
pub fn remaining_seconds(estimate: f64, progress: u8) -> f64 {
    let remaining = f64::from(100 - progress.min(100)) / 100.0;
    (estimate * remaining * 10.0).round() / 10.0
}

/// Deterministic per-session seed derived from the session id.
#[must_use]
pub fn session_seed(session_id: Uuid) -> u64 {
    let (high, low) = session_id.as_u64_pair();
    high ^ low
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> SessionConfig {
        SessionConfig::V1(SessionConfigV1 {
            start: "2026-03-01T00:00:00Z".parse().unwrap(),
            end: "2026-03-08T00:00:00Z".parse().unwrap(),
            requested_sample_size: 200,
            sampled_post_ids: vec![Uuid::nil()],
            actual_sample_size: 1,
            total_available: 1,
            cache_hit_rate: 0.0,
            estimated_time_seconds: 9.2,
            seed: 3,
        })
    }

    #[test]
    fn config_round_trips_with_version_tag() {
        let config = sample_config();
        let value = serde_json::to_value(&config).expect("serialize");

        assert_eq!(value["version"], "1");
        assert_eq!(value["requested_sample_size"], 200);
        let back: SessionConfig = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, config);
        assert_eq!(back.version(), 1);
    }

    #[test]
    fn unknown_config_version_is_rejected() {
        let mut value = serde_json::to_value(sample_config()).expect("serialize");
        value["version"] = serde_json::json!("2");

        assert!(serde_json::from_value::<SessionConfig>(value).is_err());
    }

    #[test]
    fn progress_bands_are_strictly_increasing() {
        let mut last = 0;
        for phase in Phase::ORDER {
            let (start, end) = phase.progress_band();
            assert!(start > last && end > start);
            last = end;
        }
        assert!(last < 100);
    }

    #[test]
    fn progress_interpolates_within_band() {
        assert_eq!(Phase::Vectorizing.progress_at(0, 4), 5);
        assert_eq!(Phase::Vectorizing.progress_at(2, 4), 22);
        assert_eq!(Phase::Vectorizing.progress_at(4, 4), 40);
        assert_eq!(Phase::Labeling.progress_at(0, 0), 95);
    }

    #[test]
    fn estimate_counts_batches() {
        assert!((estimate_seconds(0, 100, 200) - 10.0).abs() < 1e-9);
        assert!((estimate_seconds(150, 100, 200) - 12.4).abs() < 1e-9);
        assert!((remaining_seconds(12.4, 50) - 6.2).abs() < 1e-9);
        assert!(remaining_seconds(12.4, 100).abs() < 1e-9);
    }
}
