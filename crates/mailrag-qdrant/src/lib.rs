//! Qdrant service for vector storage.
//!
//! Provides collection management, upsert, search, lookup and count
//! operations for email and attachment-chunk embeddings.

use std::collections::HashMap;
use std::sync::Arc;

use qdrant_client::qdrant::{
    condition::ConditionOneOf, point_id::PointIdOptions, r#match::MatchValue, value::Kind,
    vectors_config, Condition, CountPointsBuilder, CreateCollectionBuilder,
    Distance, FieldCondition, Filter, GetPointsBuilder, GetResponse, Match, PointId, PointStruct,
    RepeatedStrings, ScoredPoint, SearchPointsBuilder, Struct,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use tracing::{debug, info};

/// Error types for the Qdrant service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Vector store error: {0}")]
    VectorStore(String),
}

/// Result type for the Qdrant service.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for the Qdrant service.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection_prefix: String,
}

impl QdrantConfig {
    /// Create a new Qdrant configuration.
    pub fn new(url: impl Into<String>, collection_prefix: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            collection_prefix: collection_prefix.into(),
        }
    }
}

/// Service for vector storage using Qdrant.
///
/// Collections are named `{prefix}{collection}`.
#[derive(Clone)]
pub struct QdrantService {
    inner: Arc<QdrantServiceInner>,
}

struct QdrantServiceInner {
    client: Qdrant,
    prefix: String,
}

/// A point returned by search or lookup.
#[derive(Debug, Clone)]
pub struct VectorSearchResult {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, Value>,
}

/// A point to upsert.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, Value>,
}

impl QdrantService {
    /// Connect and verify the server answers.
    pub async fn new(config: &QdrantConfig) -> Result<Self> {
        let service = Self::connect_lazy(config)?;

        service
            .inner
            .client
            .list_collections()
            .await
            .map_err(|e| Error::VectorStore(format!("Qdrant connection test failed: {}", e)))?;

        info!(url = %config.url, prefix = %config.collection_prefix, "Qdrant service connected");

        Ok(service)
    }

    /// Build a client without contacting the server.
    pub fn connect_lazy(config: &QdrantConfig) -> Result<Self> {
        let client = Qdrant::from_url(&config.url)
            .build()
            .map_err(|e| Error::VectorStore(format!("Failed to connect to Qdrant: {}", e)))?;

        Ok(Self {
            inner: Arc::new(QdrantServiceInner {
                client,
                prefix: config.collection_prefix.clone(),
            }),
        })
    }

    /// Full collection name for a logical collection.
    pub fn collection_name(&self, collection: &str) -> String {
        format!("{}{}", self.inner.prefix, collection)
    }

    /// Create a collection if it doesn't exist.
    /// If the collection exists with a different dimension, it is
    /// deleted and recreated.
    pub async fn create_collection(&self, collection: &str, dimension: usize) -> Result<()> {
        let collection_name = self.collection_name(collection);

        let exists = self
            .inner
            .client
            .collection_exists(&collection_name)
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to check collection: {}", e)))?;

        if exists {
            let existing_dim = self.collection_dimension(&collection_name).await?;

            if existing_dim == dimension {
                debug!(collection = %collection_name, dimension, "Collection already exists with correct dimension");
                return Ok(());
            }

            info!(
                collection = %collection_name,
                existing_dim,
                new_dim = dimension,
                "Collection dimension mismatch - recreating"
            );

            self.inner
                .client
                .delete_collection(&collection_name)
                .await
                .map_err(|e| {
                    Error::VectorStore(format!("Failed to delete mismatched collection: {}", e))
                })?;
        }

        self.inner
            .client
            .create_collection(
                CreateCollectionBuilder::new(&collection_name)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to create collection: {}", e)))?;

        info!(collection = %collection_name, dimension, "Created Qdrant collection");

        Ok(())
    }

    async fn collection_dimension(&self, collection_name: &str) -> Result<usize> {
        let info = self
            .inner
            .client
            .collection_info(collection_name)
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to get collection info: {}", e)))?;

        Ok(info
            .result
            .as_ref()
            .and_then(|r| r.config.as_ref())
            .and_then(|c| c.params.as_ref())
            .and_then(|p| p.vectors_config.as_ref())
            .and_then(|vc| match vc.config.as_ref() {
                Some(vectors_config::Config::Params(params)) => Some(params.size as usize),
                _ => None,
            })
            .unwrap_or(0))
    }

    /// Upsert multiple points in a batch.
    pub async fn upsert_batch(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let collection_name = self.collection_name(collection);

        let qdrant_points: Vec<PointStruct> = points
            .into_iter()
            .map(|point| PointStruct::new(point.id, point.vector, to_qdrant_payload(point.payload)))
            .collect();

        let count = qdrant_points.len();

        self.inner
            .client
            .upsert_points(UpsertPointsBuilder::new(&collection_name, qdrant_points).wait(true))
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to upsert points: {}", e)))?;

        debug!(collection = %collection_name, count, "Upserted points");

        Ok(())
    }

    /// Search for similar vectors.
    pub async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<SearchFilter>,
    ) -> Result<Vec<VectorSearchResult>> {
        let collection_name = self.collection_name(collection);

        let mut builder =
            SearchPointsBuilder::new(&collection_name, vector, limit as u64).with_payload(true);

        if let Some(f) = filter {
            builder = builder.filter(f.to_qdrant_filter());
        }

        let response = self
            .inner
            .client
            .search_points(builder)
            .await
            .map_err(|e| Error::VectorStore(format!("Search failed: {}", e)))?;

        Ok(response
            .result
            .into_iter()
            .map(scored_point_to_result)
            .collect())
    }

    /// Fetch points by id. Missing ids are absent from the result.
    pub async fn get_points(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> Result<Vec<VectorSearchResult>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let collection_name = self.collection_name(collection);
        let point_ids: Vec<PointId> = ids.into_iter().map(PointId::from).collect();

        let response: GetResponse = self
            .inner
            .client
            .get_points(GetPointsBuilder::new(&collection_name, point_ids).with_payload(true))
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to get points: {}", e)))?;

        Ok(response
            .result
            .into_iter()
            .map(|point| VectorSearchResult {
                id: point_id_to_string(point.id),
                score: 1.0,
                payload: from_qdrant_payload(point.payload),
            })
            .collect())
    }

    /// Exact number of points in a collection.
    pub async fn count(&self, collection: &str) -> Result<u64> {
        let collection_name = self.collection_name(collection);

        let response = self
            .inner
            .client
            .count(CountPointsBuilder::new(&collection_name).exact(true))
            .await
            .map_err(|e| Error::VectorStore(format!("Count failed: {}", e)))?;

        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }
}

/// Payload filter; all conditions must hold.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    keywords: Vec<(String, String)>,
    any_of: Vec<(String, Vec<String>)>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`.
    pub fn with_keyword(mut self, key: &str, value: &str) -> Self {
        self.keywords.push((key.to_string(), value.to_string()));
        self
    }

    /// Require `key` to equal one of `values`.
    pub fn with_any(mut self, key: &str, values: Vec<String>) -> Self {
        self.any_of.push((key.to_string(), values));
        self
    }

    fn to_qdrant_filter(&self) -> Filter {
        let mut conditions: Vec<Condition> = self
            .keywords
            .iter()
            .map(|(k, v)| make_match_condition(k, MatchValue::Keyword(v.clone())))
            .collect();

        conditions.extend(self.any_of.iter().map(|(k, values)| {
            make_match_condition(
                k,
                MatchValue::Keywords(RepeatedStrings {
                    strings: values.clone(),
                }),
            )
        }));

        Filter {
            must: conditions,
            ..Default::default()
        }
    }
}

fn make_match_condition(key: &str, value: MatchValue) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: key.to_string(),
            r#match: Some(Match {
                match_value: Some(value),
            }),
            ..Default::default()
        })),
    }
}

fn point_id_to_string(id: Option<PointId>) -> String {
    match id.and_then(|id| id.point_id_options) {
        Some(PointIdOptions::Uuid(uuid)) => uuid,
        Some(PointIdOptions::Num(num)) => num.to_string(),
        None => String::new(),
    }
}

fn to_qdrant_payload(payload: HashMap<String, Value>) -> HashMap<String, QdrantValue> {
    payload
        .into_iter()
        .filter_map(|(k, v)| json_to_qdrant_value(v).map(|qv| (k, qv)))
        .collect()
}

fn from_qdrant_payload(payload: HashMap<String, QdrantValue>) -> HashMap<String, Value> {
    payload
        .into_iter()
        .filter_map(|(k, v)| qdrant_value_to_json(v).map(|jv| (k, jv)))
        .collect()
}

/// Convert JSON value to Qdrant value. Objects become nested structs.
fn json_to_qdrant_value(value: Value) -> Option<QdrantValue> {
    match value {
        Value::Null => Some(QdrantValue {
            kind: Some(Kind::NullValue(0)),
        }),
        Value::Bool(b) => Some(QdrantValue::from(b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(QdrantValue::from(i))
            } else {
                n.as_f64().map(QdrantValue::from)
            }
        }
        Value::String(s) => Some(QdrantValue::from(s)),
        Value::Array(arr) => {
            let values: Vec<QdrantValue> =
                arr.into_iter().filter_map(json_to_qdrant_value).collect();
            Some(QdrantValue::from(values))
        }
        Value::Object(map) => {
            let fields = map
                .into_iter()
                .filter_map(|(k, v)| json_to_qdrant_value(v).map(|qv| (k, qv)))
                .collect();
            Some(QdrantValue {
                kind: Some(Kind::StructValue(Struct { fields })),
            })
        }
    }
}

/// Convert Qdrant value to JSON value
fn qdrant_value_to_json(value: QdrantValue) -> Option<Value> {
    match value.kind {
        Some(Kind::NullValue(_)) => Some(Value::Null),
        Some(Kind::BoolValue(b)) => Some(Value::Bool(b)),
        Some(Kind::IntegerValue(i)) => Some(Value::Number(i.into())),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d).map(Value::Number),
        Some(Kind::StringValue(s)) => Some(Value::String(s)),
        Some(Kind::ListValue(list)) => Some(Value::Array(
            list.values
                .into_iter()
                .filter_map(qdrant_value_to_json)
                .collect(),
        )),
        Some(Kind::StructValue(obj)) => Some(Value::Object(
            obj.fields
                .into_iter()
                .filter_map(|(k, v)| qdrant_value_to_json(v).map(|jv| (k, jv)))
                .collect(),
        )),
        None => None,
    }
}

fn scored_point_to_result(point: ScoredPoint) -> VectorSearchResult {
    VectorSearchResult {
        id: point_id_to_string(point.id),
        score: point.score,
        payload: from_qdrant_payload(point.payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_payload_survives_conversion() {
        let original = json!({
            "email_id": "<abc@example.com>",
            "metadata": {
                "Subject": "Budget",
                "ConversationIndex": 2,
                "InternetMessageId": null,
                "analysis": {"key_points": ["a", "b"], "sentiment": "neutral"}
            }
        });

        let converted = json_to_qdrant_value(original.clone()).unwrap();
        assert!(matches!(converted.kind, Some(Kind::StructValue(_))));
        assert_eq!(qdrant_value_to_json(converted).unwrap(), original);
    }

    #[test]
    fn test_filter_builds_conditions() {
        let filter = SearchFilter::new()
            .with_keyword("parent_type", "attachment")
            .with_any("email_id", vec!["a".into(), "b".into()])
            .to_qdrant_filter();

        assert_eq!(filter.must.len(), 2);
        match &filter.must[1].condition_one_of {
            Some(ConditionOneOf::Field(field)) => {
                assert_eq!(field.key, "email_id");
                assert!(matches!(
                    field.r#match.as_ref().and_then(|m| m.match_value.as_ref()),
                    Some(MatchValue::Keywords(RepeatedStrings { strings })) if strings.len() == 2
                ));
            }
            other => panic!("unexpected condition: {:?}", other),
        }
    }

    #[test]
    fn test_collection_names_are_prefixed() {
        let config = QdrantConfig::new("http://localhost:6334", "mailrag_");
        let service = QdrantService::connect_lazy(&config).unwrap();
        assert_eq!(service.collection_name("emails"), "mailrag_emails");
    }

    #[test]
    fn test_point_id_to_string() {
        let uuid = "8d4c7b8e-2f1a-5b7c-9a3d-1e2f3a4b5c6d".to_string();
        assert_eq!(point_id_to_string(Some(PointId::from(uuid.clone()))), uuid);
        assert_eq!(point_id_to_string(Some(PointId::from(7u64))), "7");
        assert_eq!(point_id_to_string(None), "");
    }
}
