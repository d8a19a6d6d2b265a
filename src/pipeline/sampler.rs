//! ReservoirSampler: uniform Algorithm-R sample over the stream of
//! non-critical process identities.
//!
//! The reservoir holds identities, not datapoints: a datapoint survives
//! when its identity is currently resident, and is stamped with the
//! effective sample rate so consumers can re-weight. Critical datapoints
//! bypass sampling entirely.

use super::{is_critical, BatchContext, MetricsStage, StageObserver};
use crate::core::config::ReservoirSamplerConfig;
use crate::core::Result;
use crate::metrics::{count_points, AttrMap, MetricBatch};
use crate::monitoring::{counter, gauge, MetricsReporter};
use ahash::AHashSet;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

struct SamplerState {
    /// Identities currently resident in the sample.
    reservoir: AHashSet<String>,
    /// Eligible stream positions consumed so far.
    stream_count: u64,
    rng: SmallRng,
}

/// The identity reservoir sampling stage.
pub struct ReservoirSampler {
    config: ReservoirSamplerConfig,
    observer: StageObserver,
    state: Mutex<SamplerState>,
}

impl ReservoirSampler {
    /// Builds the stage, validating the configuration.
    pub fn new(config: ReservoirSamplerConfig, reporter: Arc<dyn MetricsReporter>) -> Result<Self> {
        Self::with_rng(config, reporter, SmallRng::from_entropy())
    }

    /// Builds the stage with an explicit RNG. Deterministic tests seed it.
    pub fn with_rng(
        config: ReservoirSamplerConfig,
        reporter: Arc<dyn MetricsReporter>,
        rng: SmallRng,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            observer: StageObserver::new("reservoirsampler", reporter),
            state: Mutex::new(SamplerState {
                reservoir: AHashSet::new(),
                stream_count: 0,
                rng,
            }),
        })
    }

    /// SHA-256 hex over the sorted `key=value` identity pairs joined by `;`.
    /// Returns None when any configured identity attribute is missing.
    fn identity_of(&self, attrs: &AttrMap) -> Option<String> {
        let mut parts = Vec::with_capacity(self.config.identity_attributes.len());
        for key in &self.config.identity_attributes {
            let value = attrs.get(key)?;
            parts.push(format!("{key}={}", value.as_string()));
        }
        parts.sort();
        let mut hasher = Sha256::new();
        hasher.update(parts.join(";").as_bytes());
        Some(hex_encode(&hasher.finalize()))
    }

    fn is_critical_attrs(&self, attrs: &AttrMap) -> bool {
        is_critical(
            attrs,
            &self.config.priority_attribute_name,
            &self.config.critical_attribute_value,
        )
    }

    /// Runs the Algorithm-R admission decision for one non-resident
    /// identity.
    ///
    /// `stream_count` advances only here: identities already resident never
    /// reach this function, so re-sighting them does not re-roll.
    fn offer(&self, state: &mut SamplerState, identity: String) {
        state.stream_count += 1;
        self.observer
            .reporter()
            .add_counter(counter::ELIGIBLE_IDENTITIES_SEEN, 1);

        if state.reservoir.len() < self.config.reservoir_size {
            state.reservoir.insert(identity);
            self.observer.reporter().add_counter(counter::IDENTITIES_ADDED, 1);
            return;
        }

        let j = state.rng.gen_range(0..state.stream_count);
        if j < self.config.reservoir_size as u64 {
            // Victim is uniform over the current residents.
            let victim_idx = state.rng.gen_range(0..state.reservoir.len());
            let victim = state
                .reservoir
                .iter()
                .nth(victim_idx)
                .cloned()
                .expect("victim index within reservoir bounds");
            state.reservoir.remove(&victim);
            state.reservoir.insert(identity);
            self.observer.reporter().add_counter(counter::IDENTITIES_ADDED, 1);
        }
    }
}

impl MetricsStage for ReservoirSampler {
    fn name(&self) -> &'static str {
        "reservoirsampler"
    }

    fn consume_metrics(&self, _ctx: &BatchContext, mut batch: MetricBatch) -> Result<MetricBatch> {
        let mut state = self.state.lock();
        let original_points = count_points(&batch);

        // First pass: the unique eligible identity set of this batch, in
        // first-seen order so the sampling decisions are reproducible.
        let mut eligible: Vec<String> = Vec::new();
        let mut eligible_set: AHashSet<String> = AHashSet::new();
        crate::metrics::for_each_number_point(&batch, |_, dp| {
            if self.is_critical_attrs(&dp.attributes) {
                return;
            }
            if let Some(identity) = self.identity_of(&dp.attributes) {
                if eligible_set.insert(identity.clone()) {
                    eligible.push(identity);
                }
            }
        });

        for identity in eligible {
            if !state.reservoir.contains(&identity) {
                self.offer(&mut state, identity);
            }
        }

        let resident = state.reservoir.len();
        self.observer
            .reporter()
            .set_gauge(gauge::SELECTED_IDENTITIES, resident as f64);
        self.observer.reporter().set_gauge(
            gauge::RESERVOIR_FILL_RATIO,
            resident as f64 / self.config.reservoir_size as f64,
        );

        let sample_rate = if state.stream_count > 0 {
            resident as f64 / state.stream_count as f64
        } else {
            0.0
        };

        // Second pass: keep critical and resident datapoints, stamp the
        // resident ones, drop the rest.
        let reservoir = &state.reservoir;
        for resource in &mut batch.resources {
            for scope in &mut resource.scopes {
                for metric in &mut scope.metrics {
                    let Some(points) = metric.number_points_mut() else {
                        continue;
                    };
                    points.retain_mut(|dp| {
                        if self.is_critical_attrs(&dp.attributes) {
                            return true;
                        }
                        let Some(identity) = self.identity_of(&dp.attributes) else {
                            return false;
                        };
                        if reservoir.contains(&identity) {
                            dp.attributes.put(
                                self.config.sampled_attribute_name.clone(),
                                self.config.sampled_attribute_value.clone(),
                            );
                            dp.attributes
                                .put(self.config.sample_rate_attribute_name.clone(), sample_rate);
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        }
        batch.prune_empty();
        drop(state);

        let processed = count_points(&batch);
        self.observer
            .end_op(processed, original_points.saturating_sub(processed));
        if batch.is_empty() {
            debug!("all datapoints dropped by reservoir sampler");
        }
        Ok(batch)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
