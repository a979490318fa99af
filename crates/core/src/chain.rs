//! Few-shot extraction: prompt, complete, parse.

use model_io_model::{ModelMessage, ModelOptions, ModelRequest};

use crate::Error;
use crate::model_client::ModelClient;
use crate::parser::{StructuredParser, StructuredRecord};
use crate::prompt::{FewShotPromptTemplate, Variables};

/// Runs a few-shot prompt through the model and parses the answer.
///
/// When the answer is rejected and re-prompts remain, the rejected answer
/// and the error are sent back to the model so it can correct itself.
#[derive(Clone)]
pub struct ExtractionChain {
    prompt: FewShotPromptTemplate,
    client: ModelClient,
    parser: StructuredParser,
    max_reprompts: usize,
    options: ModelOptions,
}

impl ExtractionChain {
    /// Creates a chain that accepts the first answer or fails.
    #[inline]
    pub fn new(
        prompt: FewShotPromptTemplate,
        client: ModelClient,
        parser: StructuredParser,
    ) -> Self {
        Self {
            prompt,
            client,
            parser,
            max_reprompts: 0,
            options: ModelOptions::default(),
        }
    }

    /// Sets how many times a rejected answer is sent back for correction.
    #[inline]
    pub fn with_max_reprompts(mut self, max_reprompts: usize) -> Self {
        self.max_reprompts = max_reprompts;
        self
    }

    /// Sets the sampling options of every request.
    #[inline]
    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the parser.
    #[inline]
    pub fn parser(&self) -> &StructuredParser {
        &self.parser
    }

    /// Extracts a record from the prompt rendered with `vars`.
    ///
    /// The last parse error is returned once re-prompts are exhausted.
    pub async fn run(&self, vars: &Variables) -> Result<StructuredRecord, Error> {
        let prompt = self.prompt.format(vars).await?;
        let mut messages = vec![ModelMessage::user(prompt)];
        let mut reprompts = 0;

        loop {
            let req = ModelRequest {
                messages: messages.clone(),
                tools: vec![],
                options: self.options,
            };
            let completion = self.client.invoke(req).await?;
            match self.parser.parse(&completion.content) {
                Ok(record) => return Ok(record),
                Err(err) if reprompts < self.max_reprompts => {
                    reprompts += 1;
                    warn!("answer rejected ({err}), re-prompting {reprompts}/{}", self.max_reprompts);
                    messages.push(ModelMessage::assistant(completion.content));
                    messages.push(ModelMessage::user(correction_message(&err)));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn correction_message(err: &dyn std::error::Error) -> String {
    format!(
        "Your previous answer was rejected: {err}.\n\
         Answer again with only the corrected JSON object."
    )
}
