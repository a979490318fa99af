use async_trait::async_trait;
use model_io_model::EmbeddingProvider;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{PromptError, Variables};
use crate::index::{DistanceMetric, Metadata, VectorStore};

/// Default number of examples selected by similarity.
pub const DEFAULT_SELECTED_EXAMPLES: usize = 1;

/// A worked input/output pair used for few-shot grounding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Example {
    /// The example input text.
    pub input: String,
    /// The expected output.
    pub output: Value,
}

impl Example {
    /// Creates an example.
    #[inline]
    pub fn new<S: Into<String>>(input: S, output: Value) -> Self {
        Self {
            input: input.into(),
            output,
        }
    }

    /// Returns the output as prompt text. Strings are used verbatim,
    /// other values as compact JSON.
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }

    /// Returns the `input` and `output` variables for an example prompt.
    pub fn to_variables(&self) -> Variables {
        Variables::from([
            ("input".to_owned(), self.input.clone()),
            ("output".to_owned(), self.output_text()),
        ])
    }
}

/// A source of examples for a few-shot prompt.
#[async_trait]
pub trait ExampleSelector: Send + Sync {
    /// Returns the examples to render for `vars`, each as the variables
    /// of the example prompt.
    async fn select_examples(&self, vars: &Variables) -> Result<Vec<Variables>, PromptError>;
}

/// Always selects the same examples.
#[derive(Clone, Debug, Default)]
pub struct StaticExampleSelector {
    examples: Vec<Example>,
}

impl StaticExampleSelector {
    /// Creates a selector over a fixed list.
    #[inline]
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }
}

#[async_trait]
impl ExampleSelector for StaticExampleSelector {
    async fn select_examples(&self, _vars: &Variables) -> Result<Vec<Variables>, PromptError> {
        Ok(self.examples.iter().map(Example::to_variables).collect())
    }
}

/// Selects the examples whose text is closest to the prompt input.
///
/// Each example is stored as its values joined by a space, with the
/// example variables kept as metadata.
pub struct SemanticSimilarityExampleSelector<E> {
    store: RwLock<VectorStore<E>>,
    k: usize,
    input_keys: Option<Vec<String>>,
    example_keys: Option<Vec<String>>,
}

impl<E: EmbeddingProvider> SemanticSimilarityExampleSelector<E> {
    /// Creates a selector over an existing store.
    #[inline]
    pub fn new(store: VectorStore<E>) -> Self {
        Self {
            store: RwLock::new(store),
            k: DEFAULT_SELECTED_EXAMPLES,
            input_keys: None,
            example_keys: None,
        }
    }

    /// Embeds `examples` into a new store and selects from it.
    pub async fn from_examples(
        embedder: E,
        metric: DistanceMetric,
        examples: &[Example],
    ) -> Result<Self, PromptError> {
        let (texts, metadatas): (Vec<String>, Vec<Metadata>) =
            examples.iter().map(document).unzip();
        let store =
            VectorStore::from_texts(embedder, metric, texts, Some(metadatas)).await?;
        Ok(Self::new(store))
    }

    /// Sets how many examples are selected.
    #[inline]
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Restricts the variables used to build the query text.
    ///
    /// Without input keys every variable is used, in key order.
    #[inline]
    pub fn with_input_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts the metadata keys returned for each example.
    #[inline]
    pub fn with_example_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.example_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Embeds and stores another example.
    pub async fn add_example(&self, example: &Example) -> Result<(), PromptError> {
        let (text, metadata) = document(example);
        let mut store = self.store.write().await;
        store.add_texts(vec![text], Some(vec![metadata])).await?;
        Ok(())
    }

    fn query_text(&self, vars: &Variables) -> String {
        let values: Vec<&str> = match &self.input_keys {
            Some(keys) => keys
                .iter()
                .filter_map(|key| vars.get(key).map(String::as_str))
                .collect(),
            None => vars.values().map(String::as_str).collect(),
        };
        values.join(" ")
    }

    fn pick_keys(&self, metadata: Metadata) -> Variables {
        match &self.example_keys {
            Some(keys) => metadata
                .into_iter()
                .filter(|(key, _)| keys.contains(key))
                .collect(),
            None => metadata,
        }
    }
}

#[async_trait]
impl<E: EmbeddingProvider> ExampleSelector for SemanticSimilarityExampleSelector<E> {
    async fn select_examples(&self, vars: &Variables) -> Result<Vec<Variables>, PromptError> {
        let query = self.query_text(vars);
        let store = self.store.read().await;
        let results = store.similarity_search(&query, self.k).await?;
        debug!("selected {} examples for query: {query}", results.len());
        Ok(results
            .into_iter()
            .map(|result| self.pick_keys(result.metadata))
            .collect())
    }
}

fn document(example: &Example) -> (String, Metadata) {
    let output = example.output_text();
    (format!("{} {output}", example.input), example.to_variables())
}

#[cfg(test)]
mod tests {
    use model_io_test_model::TestEmbeddingProvider;
    use serde_json::json;

    use super::*;
    use crate::prompt::variables;

    fn patient_examples() -> Vec<Example> {
        vec![
            Example::new(
                "张三，男，四十五岁，主诉胸痛，诊断为心绞痛。",
                json!({ "name": "张三", "age": 45, "symptoms": ["胸痛"], "diagnosis": "心绞痛", "is_urgent": true }),
            ),
            Example::new(
                "李四，女，二十岁，咳嗽发烧，诊断为感冒。",
                json!({ "name": "李四", "age": 20, "symptoms": ["咳嗽", "发烧"], "diagnosis": "感冒", "is_urgent": false }),
            ),
        ]
    }

    #[tokio::test]
    async fn test_static_selector() {
        let selector = StaticExampleSelector::new(patient_examples());
        let selected = selector.select_examples(&Variables::new()).await.unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[1]["input"], "李四，女，二十岁，咳嗽发烧，诊断为感冒。");
        assert!(selected[1]["output"].contains(r#""age":20"#));
    }

    #[tokio::test]
    async fn test_semantic_selector() {
        let examples = patient_examples();
        let mut embedder = TestEmbeddingProvider::new(2);
        let (first, _) = document(&examples[0]);
        let (second, _) = document(&examples[1]);
        embedder.set_vector(first, vec![1.0, 0.0]);
        embedder.set_vector(second, vec![0.0, 1.0]);
        embedder.set_vector("王五 胸口疼", vec![0.9, 0.1]);
        embedder.set_vector("赵敏 发烧", vec![0.2, 0.8]);
        embedder.set_vector("孙七 头痛", vec![0.7, 0.7]);
        embedder.set_vector("孙七 头痛 偏头痛", vec![0.7, 0.7]);

        let selector = SemanticSimilarityExampleSelector::from_examples(
            embedder,
            DistanceMetric::Cosine,
            &examples,
        )
        .await
        .unwrap()
        .with_input_keys(["medical_text", "name"])
        .with_example_keys(["input"]);

        let vars = variables([("name", "胸口疼"), ("medical_text", "王五"), ("unused", "x")]);
        let selected = selector.select_examples(&vars).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0]["input"], examples[0].input);
        assert!(!selected[0].contains_key("output"));

        let selected = selector
            .select_examples(&variables([("medical_text", "赵敏 发烧")]))
            .await
            .unwrap();
        assert_eq!(selected[0]["input"], examples[1].input);

        selector
            .add_example(&Example::new("孙七 头痛", json!("偏头痛")))
            .await
            .unwrap();
        let selected = selector
            .select_examples(&variables([("medical_text", "孙七 头痛")]))
            .await
            .unwrap();
        assert_eq!(selected[0]["input"], "孙七 头痛");
    }
}
