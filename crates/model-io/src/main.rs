//! A command line tour of `model-io`: plain invocations, prompt templates,
//! few-shot extraction and the tool loop.

#[macro_use]
extern crate tracing;

use std::io::Write as _;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use model_io::Settings;
use model_io::config::ConfigError;
use model_io::patient::{
    MEDICAL_TEXT_VAR, PatientRecord, patient_examples, patient_parser, patient_prompt,
};
use model_io::tools::{StockPriceTool, WeatherTool};
use model_io_core::chain::ExtractionChain;
use model_io_core::index::DistanceMetric;
use model_io_core::prompt::{
    ChatPromptTemplate, MessagesPlaceholder, PromptError, PromptTemplate, Role,
    SemanticSimilarityExampleSelector, variables,
};
use model_io_core::tool::Error as ToolError;
use model_io_core::tool_loop::DEFAULT_MAX_ITERATIONS;
use model_io_core::{
    Answer, Completion, Conversation, ModelClient, ModelError, ToolErrorPolicy,
    ToolLoop, ToolRegistry,
};
use model_io_model::{
    ModelMessage, ModelOptions, ModelRequest, ModelResponseEvent, TokenUsage,
};
use model_io_openai_model::{OpenAIEmbeddingProvider, OpenAIProvider};
use owo_colors::OwoColorize;

const BAR_CHAR: &str = "▎";

const AGENT_SYSTEM_PROMPT: &str = "你是一个人工智能助手，你的名字是小明。\
请输出与用户输入有关的答案，禁止输出其他无关信息";

const PLAIN_CHAT_TEMPLATE: &str = "[system] 你是一个有帮助的AI机器人，你的名字是{name}。
[human] 你好，最近怎么样？
[ai] 我很好，谢谢！
[human] {user_input}";

const DEFAULT_MEDICAL_TEXTS: [&str; 2] = [
    "赵敏，女，三十岁，主诉头晕和恶心，诊断为低血压。",
    "无名氏，年龄未知，主诉腹痛，诊断为急性肠胃炎",
];

#[derive(Parser)]
#[command(name = "model-io", about = "Talk to DashScope models in various ways")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one message and block until the answer arrives.
    Invoke {
        /// The user message.
        text: String,
    },
    /// Send one message and print the answer while it is generated.
    Stream {
        /// The user message.
        text: String,
    },
    /// Send several messages concurrently.
    Batch {
        /// The user messages.
        #[arg(required = true)]
        texts: Vec<String>,
        /// Requests in flight at once.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Fill a chat template and send it.
    Chat {
        /// Name of the assistant.
        #[arg(long, default_value = "小张")]
        name: String,
        /// The user message.
        #[arg(long, default_value = "你叫什么名字？")]
        input: String,
        /// Render the conversation into a single text prompt instead.
        #[arg(long)]
        plain: bool,
    },
    /// Extract patient records from medical text.
    Extract {
        /// Medical texts. Two samples are used when omitted.
        texts: Vec<String>,
        /// Times a rejected answer is sent back for correction.
        #[arg(long, default_value_t = 0)]
        reprompts: usize,
    },
    /// Answer a question with the weather and stock tools.
    Agent {
        /// The question.
        question: String,
        /// Bound of completion calls.
        #[arg(long, default_value_t = DEFAULT_MAX_ITERATIONS)]
        max_iterations: usize,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Core(#[from] model_io_core::Error),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("failed to start the runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", "error:".bright_red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), CliError> {
    let settings = Settings::from_env()?;
    debug!("resolved settings: {settings:?}");

    match command {
        Command::Invoke { text } => invoke(&settings, &text),
        Command::Stream { text } => block_on(stream(&settings, &text)),
        Command::Batch { texts, concurrency } => {
            block_on(batch(&settings, texts, concurrency))
        }
        Command::Chat { name, input, plain } => {
            block_on(chat(&settings, name, input, plain))
        }
        Command::Extract { texts, reprompts } => {
            block_on(extract(&settings, texts, reprompts))
        }
        Command::Agent {
            question,
            max_iterations,
        } => block_on(agent(&settings, question, max_iterations)),
    }
}

fn block_on<F>(fut: F) -> Result<(), CliError>
where
    F: Future<Output = Result<(), CliError>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(fut)
}

// The blocking call drives its own runtime, so it runs outside `block_on`.
fn invoke(settings: &Settings, text: &str) -> Result<(), CliError> {
    let client = ModelClient::new(OpenAIProvider::new(settings.openai_config(false)));
    let spinner = spinner();
    let result = client.invoke_blocking(user_request(text));
    spinner.finish_and_clear();
    print_completion(&result?);
    Ok(())
}

async fn stream(settings: &Settings, text: &str) -> Result<(), CliError> {
    let client = ModelClient::new(OpenAIProvider::new(settings.openai_config(true)));
    let mut events = wait(client.stream(user_request(text))).await?;

    print!("{}🤖 ", BAR_CHAR.bright_cyan());
    let mut usage = None;
    while let Some(event) = events.next().await {
        match event? {
            ModelResponseEvent::MessageDelta(delta) => {
                print!("{}", delta.bright_white());
                std::io::stdout().flush().ok();
            }
            ModelResponseEvent::Usage(reported) => usage = Some(reported),
            _ => {}
        }
    }
    println!();
    if let Some(usage) = usage {
        print_usage(&usage);
    }
    Ok(())
}

async fn batch(
    settings: &Settings,
    texts: Vec<String>,
    concurrency: Option<usize>,
) -> Result<(), CliError> {
    let client = ModelClient::new(OpenAIProvider::new(settings.openai_config(false)));
    let reqs = texts.iter().map(|text| user_request(text)).collect();
    let results = wait(client.batch(reqs, concurrency)).await;

    for (text, result) in texts.iter().zip(results) {
        println!("{}{}", BAR_CHAR.bright_yellow(), text.bold());
        match result {
            Ok(completion) => print_completion(&completion),
            Err(err) => println!("{}{}", BAR_CHAR.bright_red(), err.red()),
        }
    }
    Ok(())
}

async fn chat(
    settings: &Settings,
    name: String,
    input: String,
    plain: bool,
) -> Result<(), CliError> {
    let vars = variables([("name", name), ("user_input", input)]);
    let messages = if plain {
        PromptTemplate::new(PLAIN_CHAT_TEMPLATE)?.format_messages(&vars)?
    } else {
        ChatPromptTemplate::from_messages([
            ("system", "你是一个有帮助的AI机器人，你的名字是{name}。"),
            ("human", "你好，最近怎么样？"),
            ("ai", "我很好，谢谢！"),
            ("human", "{user_input}"),
        ])?
        .format_messages(&vars)?
    };

    let client = ModelClient::new(OpenAIProvider::new(settings.openai_config(false)));
    let completion = wait(client.invoke(ModelRequest::with_messages(messages))).await?;
    print_completion(&completion);
    Ok(())
}

async fn extract(
    settings: &Settings,
    texts: Vec<String>,
    reprompts: usize,
) -> Result<(), CliError> {
    let texts = if texts.is_empty() {
        DEFAULT_MEDICAL_TEXTS.map(str::to_owned).to_vec()
    } else {
        texts
    };

    let config = settings.openai_config(true);
    let selector = wait(SemanticSimilarityExampleSelector::from_examples(
        OpenAIEmbeddingProvider::new(config.clone()),
        DistanceMetric::Cosine,
        &patient_examples(),
    ))
    .await?
    .with_input_keys([MEDICAL_TEXT_VAR]);

    let parser = patient_parser();
    let prompt = patient_prompt(selector, &parser)?;
    let chain = ExtractionChain::new(prompt, ModelClient::new(OpenAIProvider::new(config)), parser)
        .with_max_reprompts(reprompts)
        .with_options(ModelOptions {
            top_p: Some(0.9),
            ..Default::default()
        });

    for text in texts {
        println!("{}{}", BAR_CHAR.bright_yellow(), text.bold());
        let vars = variables([(MEDICAL_TEXT_VAR, text)]);
        match wait(chain.run(&vars)).await {
            Ok(record) => match PatientRecord::try_from(&record) {
                Ok(patient) => println!("{}{patient:?}", BAR_CHAR.bright_cyan()),
                Err(err) => println!("{}{}", BAR_CHAR.bright_red(), err.red()),
            },
            Err(err) => println!("{}{}", BAR_CHAR.bright_red(), err.red()),
        }
    }
    Ok(())
}

async fn agent(
    settings: &Settings,
    question: String,
    max_iterations: usize,
) -> Result<(), CliError> {
    let registry = ToolRegistry::new()
        .with_tool(WeatherTool::new(settings.weather_app_code()?)?)?
        .with_tool(StockPriceTool::new()?)?;

    let prompt = ChatPromptTemplate::new()
        .with_message(Role::System, PromptTemplate::new(AGENT_SYSTEM_PROMPT)?)
        .with_message(Role::User, PromptTemplate::new("用户问题：{input}")?)
        .with_placeholder(MessagesPlaceholder::new("agent_scratchpad").optional());
    let messages = prompt.format_messages(&variables([("input", question)]))?;

    let client = ModelClient::new(OpenAIProvider::new(settings.openai_config(false)));
    let tool_loop = ToolLoop::new(client, registry)
        .with_max_iterations(max_iterations)
        .with_error_policy(ToolErrorPolicy::ReportToModel);
    let outcome = wait(tool_loop.run(Conversation::from(messages))).await?;

    for result in outcome.conversation.tool_results() {
        println!(
            "{}🔧 {} {}",
            BAR_CHAR.bright_yellow(),
            result.name.bold(),
            result.content.dimmed()
        );
    }
    match &outcome.answer {
        Answer::Final(text) => {
            println!("{}🤖 {}", BAR_CHAR.bright_cyan(), text.bright_white());
        }
        Answer::MaxIterationsReached { last_message } => {
            println!("{}⚠️  {}", BAR_CHAR.bright_yellow(), last_message.yellow());
        }
    }
    debug!("finished after {} completion calls", outcome.iterations);
    Ok(())
}

fn user_request(text: &str) -> ModelRequest {
    ModelRequest::with_messages(vec![ModelMessage::user(text)])
}

fn spinner() -> ProgressBar {
    let style = ProgressStyle::with_template("{spinner} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(style);
    spinner.set_message("🤔 Thinking...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

// Keeps a spinner running until `fut` resolves.
async fn wait<F: Future>(fut: F) -> F::Output {
    let spinner = spinner();
    let output = fut.await;
    spinner.finish_and_clear();
    output
}

fn print_completion(completion: &Completion) {
    println!(
        "{}🤖 {}",
        BAR_CHAR.bright_cyan(),
        completion.content.bright_white()
    );
    if let Some(usage) = &completion.usage {
        print_usage(usage);
    }
}

fn print_usage(usage: &TokenUsage) {
    let line = format!(
        "tokens: prompt {}, completion {}, total {}",
        usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
    );
    println!("{}{}", BAR_CHAR.bright_black(), line.dimmed());
}
