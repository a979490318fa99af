use std::collections::HashMap;
use std::future::ready;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use model_io_model::{EmbeddingProvider, ErrorKind};

use crate::Error;

/// A deterministic embedder for testing purpose.
///
/// Each character adds one to the component selected by its code point,
/// so texts sharing characters end up close to each other. Exact vectors
/// can be pinned for specific texts with [`Self::set_vector`].
#[derive(Clone, Debug)]
pub struct TestEmbeddingProvider {
    dimensions: usize,
    presets: HashMap<String, Vec<f32>>,
    failure: Option<ErrorKind>,
    declares_dimensions: bool,
    calls: Arc<AtomicUsize>,
}

impl TestEmbeddingProvider {
    #[inline]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            presets: HashMap::new(),
            failure: None,
            declares_dimensions: true,
            calls: Default::default(),
        }
    }

    /// Pins the vector returned for `text`.
    #[inline]
    pub fn set_vector<S: Into<String>>(&mut self, text: S, vector: Vec<f32>) {
        self.presets.insert(text.into(), vector);
    }

    /// Makes every call fail with `kind`.
    #[inline]
    pub fn set_failure(&mut self, kind: ErrorKind) {
        self.failure = Some(kind);
    }

    /// Controls whether [`EmbeddingProvider::dimensions`] reports the
    /// dimensionality. Vectors keep it either way.
    #[inline]
    pub fn set_declares_dimensions(&mut self, declares: bool) {
        self.declares_dimensions = declares;
    }

    /// Returns how many times `embed` was called.
    #[inline]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        if let Some(vector) = self.presets.get(text) {
            return vector.clone();
        }
        let mut vector = vec![0.0; self.dimensions];
        for c in text.chars() {
            vector[c as usize % self.dimensions] += 1.0;
        }
        vector
    }
}

impl EmbeddingProvider for TestEmbeddingProvider {
    type Error = Error;

    #[inline]
    fn dimensions(&self) -> Option<usize> {
        self.declares_dimensions.then_some(self.dimensions)
    }

    fn embed(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, Self::Error>> + Send + 'static
    {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let result = match self.failure {
            Some(kind) => Err(Error::new("preset failure", kind)),
            None => Ok(texts.iter().map(|t| self.embed_one(t)).collect()),
        };
        ready(result)
    }
}
