use std::collections::BTreeMap;

use log::warn;

use crate::events::{MetricUpdate, ModelTokenUpdate};
use crate::ring::RingBuffer;
use crate::types::{
    CumulativeAggregate, DataPoint, MetricKind, MetricSummary, ModelTokenBreakdown,
    SeriesFilter, TokenTypeTotals, UNKNOWN_MODEL,
};

/// Series, cumulative aggregates and the model token tally.
///
/// Each [`AggregationStore::record_metric`] call updates all three before
/// returning, and the store is only ever reached through `&mut self`, so no
/// reader can see a total without its matching count and average.
#[derive(Debug, Clone)]
pub struct AggregationStore {
    series: BTreeMap<MetricKind, RingBuffer<DataPoint>>,
    cumulative: BTreeMap<MetricKind, CumulativeAggregate>,
    tokens_by_model: BTreeMap<String, f64>,
}

/// By-value copy of the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub metrics: BTreeMap<String, Vec<DataPoint>>,
    pub cumulative: BTreeMap<String, CumulativeAggregate>,
    pub tokens_by_model: BTreeMap<String, f64>,
}

impl AggregationStore {
    pub fn new(series_capacity: usize) -> Self {
        Self {
            series: MetricKind::ALL
                .into_iter()
                .map(|kind| (kind, RingBuffer::new(series_capacity)))
                .collect(),
            cumulative: MetricKind::ALL
                .into_iter()
                .filter(|kind| kind.has_cumulative())
                .map(|kind| (kind, CumulativeAggregate::for_metric(kind)))
                .collect(),
            tokens_by_model: BTreeMap::new(),
        }
    }

    /// Apply one data point. Unknown metric names are logged and ignored.
    pub fn record_metric(&mut self, name: &str, data_point: DataPoint) -> Option<MetricUpdate> {
        let Some(kind) = MetricKind::from_name(name) else {
            warn!("Unknown metric: {}", name);
            return None;
        };

        let cumulative = self.cumulative.get_mut(&kind).map(|aggregate| {
            aggregate.record(data_point.value, data_point.kind.as_deref());
            aggregate.clone()
        });

        let model_tokens = (kind == MetricKind::TokenUsage).then(|| {
            let model = data_point
                .model
                .clone()
                .unwrap_or_else(|| UNKNOWN_MODEL.to_string());
            let total = self.tokens_by_model.entry(model.clone()).or_insert(0.0);
            *total += data_point.value;
            ModelTokenUpdate {
                model,
                total: *total,
            }
        });

        if let Some(series) = self.series.get_mut(&kind) {
            series.push(data_point.clone());
        }

        Some(MetricUpdate {
            name: kind.as_str().to_string(),
            data_point,
            cumulative,
            model_tokens,
        })
    }

    /// Fold pre-aggregated history into the cumulative totals.
    ///
    /// Returns false for metrics that keep no cumulative aggregate.
    pub fn seed_cumulative(
        &mut self,
        name: &str,
        total: f64,
        count: u64,
        sub_type: Option<&str>,
    ) -> bool {
        let Some(aggregate) = MetricKind::from_name(name).and_then(|kind| self.cumulative.get_mut(&kind))
        else {
            return false;
        };
        aggregate.absorb(total, count, sub_type);
        true
    }

    /// Full copy of series, running totals and the model tally, keyed by wire name.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            metrics: self
                .series
                .iter()
                .map(|(kind, series)| (kind.as_str().to_string(), series.to_vec()))
                .collect(),
            cumulative: self
                .cumulative
                .iter()
                .map(|(kind, aggregate)| (kind.as_str().to_string(), aggregate.clone()))
                .collect(),
            tokens_by_model: self.tokens_by_model.clone(),
        }
    }

    pub fn cumulative(&self, kind: MetricKind) -> Option<&CumulativeAggregate> {
        self.cumulative.get(&kind)
    }

    pub fn series_len(&self, kind: MetricKind) -> usize {
        self.series.get(&kind).map_or(0, RingBuffer::len)
    }

    /// Live series, optionally narrowed to one metric and a time window.
    ///
    /// A metric name the store does not know selects every series.
    pub fn series(&self, filter: &SeriesFilter) -> BTreeMap<String, Vec<DataPoint>> {
        let selected = filter.metric.as_deref().and_then(MetricKind::from_name);

        self.series
            .iter()
            .filter(|(kind, _)| selected.map_or(true, |wanted| wanted == **kind))
            .map(|(kind, series)| {
                let points = series
                    .iter()
                    .filter(|point| filter.contains(point.timestamp))
                    .cloned()
                    .collect();
                (kind.as_str().to_string(), points)
            })
            .collect()
    }

    /// Window stats per metric plus the running totals where tracked.
    pub fn summary(&self) -> BTreeMap<String, MetricSummary> {
        self.series
            .iter()
            .map(|(kind, series)| {
                let cumulative = self.cumulative.get(kind).cloned();
                let summary = match series.newest() {
                    None => MetricSummary {
                        count: 0,
                        latest: None,
                        average: None,
                        timestamp: None,
                        cumulative,
                    },
                    Some(latest) => {
                        let sum: f64 = series.iter().map(|point| point.value).sum();
                        MetricSummary {
                            count: series.len(),
                            latest: Some(latest.value),
                            average: Some(format!("{:.2}", sum / series.len() as f64)),
                            timestamp: Some(latest.timestamp),
                            cumulative,
                        }
                    }
                };
                (kind.as_str().to_string(), summary)
            })
            .collect()
    }

    /// Token totals per model since startup, largest first.
    pub fn model_tokens(&self) -> ModelTokenBreakdown {
        ModelTokenBreakdown::from_tally(&self.tokens_by_model)
    }

    /// Token totals by `type` over the live token series.
    pub fn token_types(&self) -> TokenTypeTotals {
        let mut totals = TokenTypeTotals::default();
        if let Some(series) = self.series.get(&MetricKind::TokenUsage) {
            for point in series {
                if let Some(token_type) = point.kind.as_deref() {
                    totals.add(token_type, point.value);
                }
            }
        }
        totals
    }
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new(crate::types::SERIES_CAPACITY)
    }
}
