use std::sync::Arc;

use model_io_model::ModelMessage;

use super::{ExampleSelector, PromptError, PromptTemplate, Variables};

/// Separator placed between the prefix, each example and the suffix.
pub const DEFAULT_EXAMPLE_SEPARATOR: &str = "\n\n";

/// A prompt made of a prefix, selected examples and a suffix.
///
/// The prefix and suffix keep their own template syntax, so a jinja2
/// prefix can be combined with an f-string example prompt. Partials set
/// on this template are shared by the prefix and the suffix.
#[derive(Clone)]
pub struct FewShotPromptTemplate {
    prefix: Option<PromptTemplate>,
    example_prompt: PromptTemplate,
    selector: Arc<dyn ExampleSelector>,
    suffix: Option<PromptTemplate>,
    separator: String,
    partials: Variables,
}

impl FewShotPromptTemplate {
    /// Creates a template that renders each selected example with
    /// `example_prompt`.
    pub fn new<S>(example_prompt: PromptTemplate, selector: S) -> Self
    where
        S: ExampleSelector + 'static,
    {
        Self::with_shared_selector(example_prompt, Arc::new(selector))
    }

    /// Like [`Self::new`], with a selector shared with other templates.
    #[inline]
    pub fn with_shared_selector(
        example_prompt: PromptTemplate,
        selector: Arc<dyn ExampleSelector>,
    ) -> Self {
        Self {
            prefix: None,
            example_prompt,
            selector,
            suffix: None,
            separator: DEFAULT_EXAMPLE_SEPARATOR.to_owned(),
            partials: Variables::new(),
        }
    }

    /// Sets the text rendered before the examples.
    #[inline]
    pub fn with_prefix(mut self, prefix: PromptTemplate) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Sets the text rendered after the examples.
    #[inline]
    pub fn with_suffix(mut self, suffix: PromptTemplate) -> Self {
        self.suffix = Some(suffix);
        self
    }

    /// Sets the separator between parts.
    #[inline]
    pub fn with_separator<S: Into<String>>(mut self, separator: S) -> Self {
        self.separator = separator.into();
        self
    }

    /// Pre-fills a variable of the prefix and the suffix.
    #[inline]
    pub fn partial<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.partials.insert(name.into(), value.into());
        self
    }

    /// Returns the variables of the prefix and suffix still to be
    /// provided.
    pub fn input_variables(&self) -> Vec<&str> {
        let mut variables: Vec<&str> = vec![];
        for template in self.prefix.iter().chain(&self.suffix) {
            for name in template.input_variables() {
                if !self.partials.contains_key(name) && !variables.contains(&name) {
                    variables.push(name);
                }
            }
        }
        variables
    }

    /// Selects examples for `vars` and renders the whole prompt.
    ///
    /// Empty parts are skipped, so a missing prefix leaves no leading
    /// separator.
    pub async fn format(&self, vars: &Variables) -> Result<String, PromptError> {
        let examples = self.selector.select_examples(vars).await?;
        trace!("rendering {} examples", examples.len());

        let mut shared = self.partials.clone();
        shared.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut parts = Vec::with_capacity(examples.len() + 2);
        if let Some(prefix) = &self.prefix {
            parts.push(prefix.format(&shared)?);
        }
        for example in &examples {
            parts.push(self.example_prompt.format(example)?);
        }
        if let Some(suffix) = &self.suffix {
            parts.push(suffix.format(&shared)?);
        }
        parts.retain(|part| !part.is_empty());
        Ok(parts.join(&self.separator))
    }

    /// Renders the prompt as a single user message.
    pub async fn format_messages(
        &self,
        vars: &Variables,
    ) -> Result<Vec<ModelMessage>, PromptError> {
        Ok(vec![ModelMessage::user(self.format(vars).await?)])
    }
}
