//! Performance store that survives restarts.
//!
//! Reads are served from memory. Every update is written through to the
//! storage service while a per-key lock is held, so the persisted copy of a
//! record never goes backwards.

use super::memory::MemoryPerformanceStore;
use crate::{AttemptOutcome, PerformanceKey, PerformanceRecord, PerformanceStore, TunerError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use solver_storage::StorageService;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

const NAMESPACE: &str = "performance";

#[derive(Serialize, Deserialize)]
struct StoredRecord {
	key: PerformanceKey,
	record: PerformanceRecord,
}

pub struct PersistentPerformanceStore {
	memory: MemoryPerformanceStore,
	storage: Arc<StorageService>,
	locks: DashMap<PerformanceKey, Arc<Mutex<()>>>,
}

impl PersistentPerformanceStore {
	/// Opens the store, loading every record already persisted.
	///
	/// Records that no longer decode are logged and left out of the history.
	pub async fn load(storage: Arc<StorageService>) -> Result<Self, TunerError> {
		let memory = MemoryPerformanceStore::new();
		for (_, stored) in storage.retrieve_all::<StoredRecord>(NAMESPACE).await? {
			memory.insert(stored.key, stored.record);
		}
		info!(records = memory.len(), "Loaded performance history");
		Ok(Self {
			memory,
			storage,
			locks: DashMap::new(),
		})
	}

	fn lock_for(&self, key: &PerformanceKey) -> Arc<Mutex<()>> {
		self.locks.entry(key.clone()).or_default().clone()
	}
}

#[async_trait]
impl PerformanceStore for PersistentPerformanceStore {
	async fn get(&self, key: &PerformanceKey) -> Result<Option<PerformanceRecord>, TunerError> {
		self.memory.get(key).await
	}

	async fn update(
		&self,
		key: &PerformanceKey,
		outcome: &AttemptOutcome,
		alpha: f64,
	) -> Result<PerformanceRecord, TunerError> {
		let lock = self.lock_for(key);
		let _guard = lock.lock().await;

		let record = self.memory.apply(key, outcome, alpha);
		let stored = StoredRecord {
			key: key.clone(),
			record: record.clone(),
		};
		self.storage
			.store(NAMESPACE, &key.to_string(), &stored)
			.await?;
		Ok(record)
	}

	async fn snapshot(&self) -> Result<Vec<(PerformanceKey, PerformanceRecord)>, TunerError> {
		self.memory.snapshot().await
	}
}
