//! An in-memory similarity index with JSON persistence.
//!
//! The index is a brute-force scan, which is all the few-shot example
//! sets need. [`VectorStore`] pairs it with an embedding provider.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use model_io_model::EmbeddingProvider;
use serde::{Deserialize, Serialize};

use crate::model_client::ModelError;

/// String metadata attached to an entry.
pub type Metadata = BTreeMap<String, String>;

const DEFAULT_COLLECTION: &str = "default";

/// An error from the similarity index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Input slices of a batch have different lengths.
    #[error("length mismatch: {texts} texts, {vectors} vectors, {metadatas} metadatas")]
    LengthMismatch {
        /// Number of texts.
        texts: usize,
        /// Number of vectors.
        vectors: usize,
        /// Number of metadata maps.
        metadatas: usize,
    },
    /// A vector does not have the index dimensionality.
    #[error("expected {expected} dimensions, got {actual}")]
    DimensionMismatch {
        /// Dimensionality of the index.
        expected: usize,
        /// Dimensionality of the offending vector.
        actual: usize,
    },
    /// A persisted index was built with another metric or dimensionality.
    #[error("index built with {found_metric:?}/{found_dimensions}, opened as {metric:?}/{dimensions}")]
    IndexIncompatible {
        /// Requested metric.
        metric: DistanceMetric,
        /// Requested dimensionality.
        dimensions: usize,
        /// Persisted metric.
        found_metric: DistanceMetric,
        /// Persisted dimensionality.
        found_dimensions: usize,
    },
    /// Embedding the texts failed.
    #[error("embedding failed: {0}")]
    Embedding(#[from] ModelError),
    /// Reading or writing the index file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The index file is not a valid index document.
    #[error("invalid index file: {0}")]
    Format(#[from] serde_json::Error),
}

/// How distance between two vectors is measured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// One minus the cosine similarity.
    Cosine,
    /// Euclidean distance.
    L2,
}

impl DistanceMetric {
    fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }

    fn similarity(self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::L2 => 1.0 / (1.0 + distance),
        }
    }
}

/// Compute cosine similarity between two vectors.
///
/// Zero vectors have no direction and are similar to nothing.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// A stored text with its vector and metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// The embedded text.
    pub text: String,
    /// Its embedding.
    pub vector: Vec<f32>,
    /// Caller-defined metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// An entry returned by a query.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    /// The embedded text.
    pub text: String,
    /// Caller-defined metadata.
    pub metadata: Metadata,
    /// Distance to the query under the index metric.
    pub distance: f32,
    /// Similarity derived from the distance, higher is closer.
    pub similarity: f32,
}

#[derive(Serialize, Deserialize)]
struct IndexDocument {
    metric: DistanceMetric,
    dimensions: usize,
    collection: String,
    entries: Vec<IndexEntry>,
}

/// An append-only store of vectors ranked by distance.
#[derive(Clone, Debug, PartialEq)]
pub struct SimilarityIndex {
    metric: DistanceMetric,
    dimensions: usize,
    collection: String,
    entries: Vec<IndexEntry>,
}

impl SimilarityIndex {
    /// Creates an empty index.
    #[inline]
    pub fn new(metric: DistanceMetric, dimensions: usize) -> Self {
        Self {
            metric,
            dimensions,
            collection: DEFAULT_COLLECTION.to_owned(),
            entries: vec![],
        }
    }

    /// Sets the collection name stored alongside the entries.
    #[inline]
    pub fn with_collection<S: Into<String>>(mut self, collection: S) -> Self {
        self.collection = collection.into();
        self
    }

    /// Returns the distance metric.
    #[inline]
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Returns the vector dimensionality.
    #[inline]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Returns the collection name.
    #[inline]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the index holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entries in insertion order.
    #[inline]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Appends a batch of entries.
    ///
    /// The batch is rejected as a whole if the slices differ in length or
    /// any vector has the wrong dimensionality.
    pub fn add(
        &mut self,
        texts: Vec<String>,
        vectors: Vec<Vec<f32>>,
        metadatas: Vec<Metadata>,
    ) -> Result<(), IndexError> {
        if texts.len() != vectors.len() || texts.len() != metadatas.len() {
            return Err(IndexError::LengthMismatch {
                texts: texts.len(),
                vectors: vectors.len(),
                metadatas: metadatas.len(),
            });
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.len(),
            });
        }
        self.entries.extend(
            texts
                .into_iter()
                .zip(vectors)
                .zip(metadatas)
                .map(|((text, vector), metadata)| IndexEntry {
                    text,
                    vector,
                    metadata,
                }),
        );
        Ok(())
    }

    /// Returns up to `k` entries closest to `vector`.
    ///
    /// Ties keep insertion order. Asking for more entries than stored
    /// returns all of them.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (idx, self.metric.distance(vector, &entry.vector)))
            .collect();
        // Stable, so equal distances stay in insertion order.
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(idx, distance)| {
                let entry = &self.entries[idx];
                SearchResult {
                    text: entry.text.clone(),
                    metadata: entry.metadata.clone(),
                    distance,
                    similarity: self.metric.similarity(distance),
                }
            })
            .collect())
    }

    /// Writes the index to `path` as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        let doc = IndexDocument {
            metric: self.metric,
            dimensions: self.dimensions,
            collection: self.collection.clone(),
            entries: self.entries.clone(),
        };
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(&mut writer, &doc)?;
        writer.flush()?;
        debug!(
            "saved {} entries to {}",
            self.entries.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Reads an index saved by [`Self::save`].
    ///
    /// The index must have been built with the same `metric` and
    /// `dimensions`.
    pub fn open(
        path: impl AsRef<Path>,
        metric: DistanceMetric,
        dimensions: usize,
    ) -> Result<Self, IndexError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let doc: IndexDocument = serde_json::from_reader(reader)?;
        if doc.metric != metric || doc.dimensions != dimensions {
            return Err(IndexError::IndexIncompatible {
                metric,
                dimensions,
                found_metric: doc.metric,
                found_dimensions: doc.dimensions,
            });
        }
        if let Some(bad) = doc.entries.iter().find(|e| e.vector.len() != dimensions)
        {
            return Err(IndexError::DimensionMismatch {
                expected: dimensions,
                actual: bad.vector.len(),
            });
        }
        Ok(Self {
            metric,
            dimensions,
            collection: doc.collection,
            entries: doc.entries,
        })
    }
}

/// A similarity index fed by an embedding provider.
///
/// Writes take `&mut self`, callers sharing a store serialize them.
pub struct VectorStore<E> {
    embedder: E,
    index: SimilarityIndex,
    // Set while neither the embedder nor any vector has told the
    // dimensionality yet.
    unsized_index: bool,
}

impl<E: EmbeddingProvider> VectorStore<E> {
    /// Creates a store over an existing index.
    #[inline]
    pub fn new(embedder: E, index: SimilarityIndex) -> Self {
        Self {
            embedder,
            index,
            unsized_index: false,
        }
    }

    /// Embeds `texts` and builds a new store from them.
    ///
    /// The dimensionality comes from the embedder when it declares one,
    /// otherwise from the first vector, which may arrive in a later
    /// [`Self::add_texts`] call when `texts` is empty.
    pub async fn from_texts(
        embedder: E,
        metric: DistanceMetric,
        texts: Vec<String>,
        metadatas: Option<Vec<Metadata>>,
    ) -> Result<Self, IndexError> {
        let vectors = embedder
            .embed(&texts)
            .await
            .map_err(ModelError::from_provider)?;
        let dimensions = embedder
            .dimensions()
            .or_else(|| vectors.first().map(Vec::len));
        let mut index = SimilarityIndex::new(metric, dimensions.unwrap_or_default());
        let metadatas = metadatas.unwrap_or_else(|| vec![Metadata::new(); texts.len()]);
        index.add(texts, vectors, metadatas)?;
        Ok(Self {
            embedder,
            index,
            unsized_index: dimensions.is_none(),
        })
    }

    /// Returns the underlying index.
    #[inline]
    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    /// Embeds and stores `texts`. Missing metadata defaults to empty maps.
    pub async fn add_texts(
        &mut self,
        texts: Vec<String>,
        metadatas: Option<Vec<Metadata>>,
    ) -> Result<(), IndexError> {
        if texts.is_empty() {
            return Ok(());
        }
        let vectors = self
            .embedder
            .embed(&texts)
            .await
            .map_err(ModelError::from_provider)?;
        let metadatas = metadatas.unwrap_or_else(|| vec![Metadata::new(); texts.len()]);
        if self.unsized_index {
            if let Some(first) = vectors.first() {
                self.index.dimensions = first.len();
            }
        }
        self.index.add(texts, vectors, metadatas)?;
        self.unsized_index = false;
        Ok(())
    }

    /// Returns the `k` stored texts closest to `query`.
    pub async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if self.index.is_empty() {
            return Ok(vec![]);
        }
        let mut vectors = self
            .embedder
            .embed(&[query.to_owned()])
            .await
            .map_err(ModelError::from_provider)?;
        let Some(vector) = vectors.pop() else {
            return Err(IndexError::LengthMismatch {
                texts: 1,
                vectors: 0,
                metadatas: 1,
            });
        };
        self.index.query(&vector, k)
    }
}

#[cfg(test)]
mod tests {
    use model_io_test_model::TestEmbeddingProvider;

    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample_index() -> SimilarityIndex {
        let mut index = SimilarityIndex::new(DistanceMetric::Cosine, 2);
        index
            .add(
                vec!["东".into(), "北".into(), "东北".into(), "又一个东".into()],
                vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0], vec![2.0, 0.0]],
                vec![
                    meta(&[("city", "上海")]),
                    meta(&[("city", "北京")]),
                    meta(&[]),
                    meta(&[]),
                ],
            )
            .unwrap();
        index
    }

    #[test]
    fn test_query_ranking() {
        let index = sample_index();
        let results = index.query(&[1.0, 0.1], 10).unwrap();
        // k larger than the index returns everything.
        assert_eq!(results.len(), 4);
        assert!(
            results
                .windows(2)
                .all(|w| w[0].similarity >= w[1].similarity)
        );
        assert_eq!(results.last().unwrap().text, "北");

        let top = index.query(&[1.0, 0.0], 2).unwrap();
        // Same direction, equal distance, insertion order wins.
        assert_eq!(top[0].text, "东");
        assert_eq!(top[1].text, "又一个东");
        assert_eq!(top[0].metadata["city"], "上海");
        assert!((top[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_metric() {
        let mut index = SimilarityIndex::new(DistanceMetric::L2, 2);
        index
            .add(
                vec!["near".into(), "far".into()],
                vec![vec![1.0, 1.0], vec![4.0, 5.0]],
                vec![Metadata::new(), Metadata::new()],
            )
            .unwrap();
        let results = index.query(&[1.0, 1.0], 2).unwrap();
        assert_eq!(results[0].text, "near");
        assert_eq!(results[0].distance, 0.0);
        assert_eq!(results[0].similarity, 1.0);
        assert!((results[1].distance - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_add_rejects_bad_batches() {
        let mut index = SimilarityIndex::new(DistanceMetric::Cosine, 2);
        let err = index
            .add(vec!["a".into()], vec![], vec![Metadata::new()])
            .unwrap_err();
        assert!(matches!(err, IndexError::LengthMismatch { vectors: 0, .. }));

        let err = index
            .add(
                vec!["a".into(), "b".into()],
                vec![vec![1.0, 0.0], vec![1.0]],
                vec![Metadata::new(), Metadata::new()],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
        // Rejected batches leave the index untouched.
        assert!(index.is_empty());
        assert!(index.query(&[1.0], 1).is_err());
    }

    #[test]
    fn test_save_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("examples.json");
        let index = sample_index().with_collection("patients");
        index.save(&path).unwrap();

        let reopened =
            SimilarityIndex::open(&path, DistanceMetric::Cosine, 2).unwrap();
        assert_eq!(reopened, index);
        assert_eq!(reopened.collection(), "patients");

        let err = SimilarityIndex::open(&path, DistanceMetric::L2, 2).unwrap_err();
        assert!(matches!(err, IndexError::IndexIncompatible { .. }));
        let err =
            SimilarityIndex::open(&path, DistanceMetric::Cosine, 3).unwrap_err();
        assert!(matches!(err, IndexError::IndexIncompatible { .. }));
    }

    #[tokio::test]
    async fn test_vector_store_search() {
        let mut embedder = TestEmbeddingProvider::new(3);
        embedder.set_vector("北京", vec![1.0, 0.0, 0.0]);
        embedder.set_vector("北京是中国的首都", vec![0.9, 0.1, 0.0]);
        embedder.set_vector("上海是金融中心", vec![0.0, 1.0, 0.0]);
        embedder.set_vector("深圳靠近香港", vec![0.1, 0.2, 1.0]);

        let mut store = VectorStore::from_texts(
            embedder,
            DistanceMetric::Cosine,
            vec!["北京是中国的首都".into(), "上海是金融中心".into()],
            None,
        )
        .await
        .unwrap();
        store
            .add_texts(
                vec!["深圳靠近香港".into()],
                Some(vec![meta(&[("source", "wiki")])]),
            )
            .await
            .unwrap();
        assert_eq!(store.index().len(), 3);

        let results = store.similarity_search("北京", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "北京是中国的首都");
        assert!(results[0].similarity >= results[1].similarity);
    }

    #[tokio::test]
    async fn test_vector_store_sized_by_first_insert() {
        let mut embedder = TestEmbeddingProvider::new(3);
        embedder.set_declares_dimensions(false);
        embedder.set_vector("北京", vec![1.0, 0.0, 0.0]);
        embedder.set_vector("北京是中国的首都", vec![0.9, 0.1, 0.0]);
        embedder.set_vector("上海", vec![0.0, 1.0, 0.0]);
        let mut store =
            VectorStore::from_texts(embedder, DistanceMetric::Cosine, vec![], None)
                .await
                .unwrap();
        assert!(store.similarity_search("北京", 1).await.unwrap().is_empty());

        store
            .add_texts(vec!["北京是中国的首都".into(), "上海".into()], None)
            .await
            .unwrap();
        assert_eq!(store.index().dimensions(), 3);
        let results = store.similarity_search("北京", 1).await.unwrap();
        assert_eq!(results[0].text, "北京是中国的首都");

        // Later batches must match the learned dimensionality.
        store.embedder.set_vector("孤立", vec![1.0]);
        let err = store.add_texts(vec!["孤立".into()], None).await.unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 3,
                actual: 1
            }
        ));
    }
}
