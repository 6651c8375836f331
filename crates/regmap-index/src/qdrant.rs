//! Qdrant-backed vector store.
//!
//! Stores one point per chunk with its chunk, document and section ids in
//! the payload. Point ids are random UUIDs; the chunk id in the payload is
//! what retrieval uses.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PointStruct, QuantizationType, ScalarQuantizationBuilder,
    SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::vector::{VectorHit, VectorRecord, VectorStore};

/// Default collection name.
pub const DEFAULT_COLLECTION: &str = "policy_sections";

/// Configuration for connecting to Qdrant.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    /// Qdrant server URL
    pub url: String,
    /// API key (optional)
    pub api_key: Option<String>,
    pub collection_name: String,
    /// Vector dimensions
    pub dimensions: usize,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            collection_name: DEFAULT_COLLECTION.to_string(),
            dimensions: crate::embeddings::DEFAULT_DIMENSIONS,
        }
    }
}

/// Vector store backed by a Qdrant collection.
pub struct QdrantStore {
    client: Qdrant,
    collection_name: String,
    dimensions: usize,
}

impl QdrantStore {
    /// Create a new store from configuration.
    pub async fn from_config(config: &QdrantConfig) -> Result<Self> {
        let mut builder = Qdrant::from_url(&config.url).skip_compatibility_check();

        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }

        let client = builder.build().context("Failed to connect to Qdrant")?;

        info!("Connected to Qdrant at {}", config.url);

        Ok(Self {
            client,
            collection_name: config.collection_name.clone(),
            dimensions: config.dimensions,
        })
    }

    /// Create collection if it doesn't exist (with scalar quantization).
    pub async fn ensure_collection(&self) -> Result<()> {
        let collections = self.client.list_collections().await?;
        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection_name);

        if exists {
            debug!("Collection {} already exists", self.collection_name);
            return Ok(());
        }

        info!(
            "Creating collection: {} with {} dimensions",
            self.collection_name, self.dimensions
        );

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection_name)
                    .vectors_config(VectorParamsBuilder::new(
                        self.dimensions as u64,
                        Distance::Cosine,
                    ))
                    .quantization_config(
                        ScalarQuantizationBuilder::default()
                            .r#type(QuantizationType::Int8.into())
                            .quantile(0.99)
                            .always_ram(true),
                    ),
            )
            .await
            .context("Failed to create collection")?;

        Ok(())
    }

    /// Drop and recreate the collection.
    pub async fn reset_collection(&self) -> Result<()> {
        let collections = self.client.list_collections().await?;
        if collections
            .collections
            .iter()
            .any(|c| c.name == self.collection_name)
        {
            info!("Deleting collection: {}", self.collection_name);
            self.client
                .delete_collection(&self.collection_name)
                .await
                .context("Failed to delete collection")?;
        }
        self.ensure_collection().await
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            debug!("No points to upsert");
            return Ok(());
        }

        debug!("Upserting {} points", records.len());

        let points: Vec<PointStruct> = records
            .into_iter()
            .map(|record| {
                let payload = record_payload(&record);
                PointStruct::new(Uuid::new_v4().to_string(), record.vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points))
            .await
            .context("Failed to upsert points")?;

        Ok(())
    }

    async fn search(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        let results = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, embedding.to_vec(), limit as u64)
                    .with_payload(true),
            )
            .await
            .context("Failed to search points")?;

        let hits: Vec<VectorHit> = results
            .result
            .into_iter()
            .filter_map(|p| {
                extract_string(p.payload.get("chunk_id")).map(|chunk_id| VectorHit {
                    chunk_id,
                    score: p.score,
                })
            })
            .collect();

        debug!("Found {} search hits", hits.len());
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        let info = self
            .client
            .collection_info(&self.collection_name)
            .await
            .context("Failed to get collection info")?;

        Ok(info
            .result
            .map(|r| r.points_count.unwrap_or(0) as usize)
            .unwrap_or(0))
    }

    fn name(&self) -> &str {
        "qdrant"
    }
}

fn record_payload(record: &VectorRecord) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    map.insert("chunk_id".to_string(), Value::from(record.chunk_id.clone()));
    map.insert(
        "document_id".to_string(),
        Value::from(record.document_id.clone()),
    );
    map.insert(
        "section_id".to_string(),
        Value::from(record.section_id.clone()),
    );
    map
}

fn extract_string(value: Option<&Value>) -> Option<String> {
    value.and_then(|v| match &v.kind {
        Some(qdrant_client::qdrant::value::Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    })
}
