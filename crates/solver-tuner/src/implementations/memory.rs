//! Process-local performance store.

use crate::{AttemptOutcome, PerformanceKey, PerformanceRecord, PerformanceStore, TunerError};
use async_trait::async_trait;
use dashmap::DashMap;

/// Records held in a concurrent map. The map's entry lock makes each
/// `update` a single writer for its key.
#[derive(Default)]
pub struct MemoryPerformanceStore {
	records: DashMap<PerformanceKey, PerformanceRecord>,
}

impl MemoryPerformanceStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seeds the store, replacing any record already present for a key.
	pub fn insert(&self, key: PerformanceKey, record: PerformanceRecord) {
		self.records.insert(key, record);
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	pub(crate) fn apply(
		&self,
		key: &PerformanceKey,
		outcome: &AttemptOutcome,
		alpha: f64,
	) -> PerformanceRecord {
		let mut entry = self.records.entry(key.clone()).or_default();
		entry.apply(outcome, alpha);
		entry.clone()
	}
}

#[async_trait]
impl PerformanceStore for MemoryPerformanceStore {
	async fn get(&self, key: &PerformanceKey) -> Result<Option<PerformanceRecord>, TunerError> {
		Ok(self.records.get(key).map(|r| r.clone()))
	}

	async fn update(
		&self,
		key: &PerformanceKey,
		outcome: &AttemptOutcome,
		alpha: f64,
	) -> Result<PerformanceRecord, TunerError> {
		Ok(self.apply(key, outcome, alpha))
	}

	async fn snapshot(&self) -> Result<Vec<(PerformanceKey, PerformanceRecord)>, TunerError> {
		let mut records: Vec<_> = self
			.records
			.iter()
			.map(|e| (e.key().clone(), e.value().clone()))
			.collect();
		records.sort_by(|a, b| {
			(a.0.signature, &a.0.solver).cmp(&(b.0.signature, &b.0.solver))
		});
		Ok(records)
	}
}
