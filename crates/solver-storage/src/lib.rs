//! Storage module for the solver orchestration engine.
//!
//! This module provides a namespaced key-value abstraction used to persist
//! data across requests (most notably the solver performance history),
//! with a file-based backend implementation.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::warn;

/// Re-export implementations
pub mod implementations {
	pub mod file;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// Error that occurs when a requested item is not found.
	#[error("Not found")]
	NotFound,
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
}

/// Trait defining the low-level interface for storage backends.
///
/// Basic key-value operations plus prefix listing so that callers can reload
/// a whole namespace at startup.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Retrieves raw bytes for the given key.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores raw bytes, replacing any previous value.
	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

	/// Lists every key starting with `prefix`, sorted.
	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// High-level storage service that provides typed operations.
///
/// Values are serialized to JSON and stored under `namespace:id`.
pub struct StorageService {
	/// The underlying storage backend implementation.
	backend: Box<dyn StorageInterface>,
}

fn storage_key(namespace: &str, id: &str) -> String {
	format!("{}:{}", namespace, id)
}

impl StorageService {
	/// Creates a new StorageService with the specified backend.
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	/// Stores a serializable value.
	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend
			.set_bytes(&storage_key(namespace, id), bytes)
			.await
	}

	/// Retrieves and deserializes a value from storage.
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&storage_key(namespace, id)).await?;
		serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	/// Lists the ids stored in `namespace`.
	pub async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let prefix = storage_key(namespace, "");
		let keys = self.backend.list_keys(&prefix).await?;
		Ok(keys
			.into_iter()
			.filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
			.collect())
	}

	/// Loads every readable value in `namespace`.
	///
	/// Entries that disappear between listing and reading are skipped, and so
	/// are entries that fail to deserialize. Backend failures are errors.
	pub async fn retrieve_all<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<(String, T)>, StorageError> {
		let mut values = Vec::new();
		for id in self.list(namespace).await? {
			match self.retrieve(namespace, &id).await {
				Ok(value) => values.push((id, value)),
				Err(StorageError::NotFound) => continue,
				Err(StorageError::Serialization(e)) => {
					warn!(namespace, id = %id, error = %e, "Skipping unreadable entry");
				}
				Err(e) => return Err(e),
			}
		}
		Ok(values)
	}
}

#[cfg(test)]
mod tests {
	use super::implementations::file::FileStorage;
	use super::*;
	use serde::Deserialize;

	#[derive(Debug, PartialEq, Serialize, Deserialize)]
	struct Entry {
		samples: u64,
	}

	#[tokio::test]
	async fn test_namespaces_are_isolated() {
		let dir = tempfile::tempdir().unwrap();
		let service = StorageService::new(Box::new(FileStorage::new(dir.path().to_path_buf())));
		service
			.store("performance", "a", &Entry { samples: 1 })
			.await
			.unwrap();
		service
			.store("performance", "b", &Entry { samples: 2 })
			.await
			.unwrap();
		service
			.store("other", "c", &Entry { samples: 3 })
			.await
			.unwrap();

		assert_eq!(service.list("performance").await.unwrap(), vec!["a", "b"]);
		let all: Vec<(String, Entry)> = service.retrieve_all("performance").await.unwrap();
		assert_eq!(all.len(), 2);
		assert_eq!(all[1], ("b".to_string(), Entry { samples: 2 }));
		assert!(matches!(
			service.retrieve::<Entry>("performance", "missing").await,
			Err(StorageError::NotFound)
		));
	}

	#[tokio::test]
	async fn test_retrieve_all_skips_unreadable_entries() {
		let dir = tempfile::tempdir().unwrap();
		let service = StorageService::new(Box::new(FileStorage::new(dir.path().to_path_buf())));
		service
			.store("performance", "good", &Entry { samples: 4 })
			.await
			.unwrap();
		service
			.store("performance", "stale", &"not an entry")
			.await
			.unwrap();

		let all: Vec<(String, Entry)> = service.retrieve_all("performance").await.unwrap();
		assert_eq!(all, vec![("good".to_string(), Entry { samples: 4 })]);
	}
}
