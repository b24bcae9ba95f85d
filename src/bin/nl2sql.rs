#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use nl2sql_harness::config::ModelClientConfig;
use nl2sql_harness::gateway::{NoopUsageSink, StderrUsageSink, UsageSink};
use nl2sql_harness::inputs::{read_input_file, DEFAULT_QUESTION_PATH, DEFAULT_SCHEMA_PATH};
use nl2sql_harness::logging::init_tracing;
use nl2sql_harness::model::GatewayModelClient;
use nl2sql_harness::pipeline::controller::{RetryPolicy, MAX_RETRIES};
use nl2sql_harness::pipeline::hooks::ConsoleObserver;
use nl2sql_harness::pipeline::trace::{JsonlTraceSink, TraceSink};
use nl2sql_harness::pipeline::Pipeline;
use nl2sql_harness::prompts::PROMPTS;
use nl2sql_harness::store::{
    MemorySessionStore, SessionStore, SqliteSessionStore, DEFAULT_SESSION_ID,
};

#[derive(Parser)]
#[command(name = "nl2sql", version, about = "Natural-language to SQL with self-grading")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) a session and print the final query
    Run {
        #[arg(long, default_value = DEFAULT_SCHEMA_PATH)]
        schema: PathBuf,
        #[arg(long, default_value = DEFAULT_QUESTION_PATH)]
        question: PathBuf,
        #[arg(long, default_value = DEFAULT_SESSION_ID)]
        session: String,
        /// SQLite session store; in-memory when omitted
        #[arg(long)]
        store: Option<PathBuf>,
        /// Continue the stored session instead of starting over
        #[arg(long, requires = "store")]
        resume: bool,
        /// Write one JSON line per stage call
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Print provider usage records to stderr
        #[arg(long)]
        usage: bool,
        #[arg(long, default_value_t = MAX_RETRIES)]
        max_retries: u32,
        #[arg(long)]
        default_model: Option<String>,
        #[arg(long)]
        fallback_model: Option<String>,
        #[arg(long)]
        transport_retries: Option<u32>,
    },
    /// Inspect persisted sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Print the stage prompt templates
    Prompts,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List stored sessions, most recent first
    List {
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Print one session record as JSON
    Show {
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_SESSION_ID)]
        session: String,
    },
    /// Export all sessions to JSONL
    Export {
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            schema,
            question,
            session,
            store,
            resume,
            trace,
            usage,
            max_retries,
            default_model,
            fallback_model,
            transport_retries,
        } => {
            let schema_text = read_input_file(&schema)?;
            let question_text = if resume {
                None
            } else {
                Some(read_input_file(&question)?)
            };

            let mut config = ModelClientConfig::from_env()?;
            if let Some(model) = default_model {
                config.default_model_name = model;
            }
            if let Some(model) = fallback_model {
                config.fallback_model_name = model;
            }
            if let Some(retries) = transport_retries {
                config.transport_retries = retries;
            }

            let usage_sink: Arc<dyn UsageSink> = if usage {
                Arc::new(StderrUsageSink)
            } else {
                Arc::new(NoopUsageSink)
            };
            let client = GatewayModelClient::from_config(&config, usage_sink)?;

            let store: Arc<dyn SessionStore> = match store {
                Some(path) => Arc::new(SqliteSessionStore::new(path)?),
                None => Arc::new(MemorySessionStore::new()),
            };

            let mut pipeline = Pipeline::new(Arc::new(client), store, schema_text)
                .with_policy(RetryPolicy::new(max_retries))
                .with_observer(Arc::new(ConsoleObserver));

            let mut trace_worker = None;
            if let Some(path) = trace {
                let (sink, worker) = JsonlTraceSink::new(&path)?;
                let sink: Arc<dyn TraceSink> = Arc::new(sink);
                pipeline = pipeline.with_trace(sink);
                trace_worker = Some((worker, path));
            }

            let result = match question_text {
                Some(question_text) => pipeline.run(&session, &question_text).await,
                None => pipeline.resume(&session).await,
            };

            // The worker only drains once every sink handle is gone.
            drop(pipeline);
            if let Some((worker, path)) = trace_worker {
                worker.join()?;
                eprintln!("[pipeline] trace written to {}", path.display());
            }

            let outcome = result?;
            println!("{}", outcome.sql_query);
        }
        Commands::Sessions { command } => match command {
            SessionCommands::List { store } => {
                let store = open_store(store)?;
                for record in store.list().await? {
                    println!(
                        "{}\t{}\tattempts={}\tescalated={}\t{}",
                        record.session_id,
                        record.phase.as_str(),
                        record.state.retry_count,
                        record.state.escalate,
                        record.updated_at.to_rfc3339(),
                    );
                }
            }
            SessionCommands::Show { store, session } => {
                let store = open_store(store)?;
                let record = store
                    .get(&session)
                    .await?
                    .ok_or_else(|| format!("session `{session}` not found"))?;
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            SessionCommands::Export { store, out } => {
                let store = open_store(store)?;
                let count = store.export_jsonl(&out).await?;
                eprintln!("[sessions] exported {count} record(s) to {}", out.display());
            }
        },
        Commands::Prompts => {
            for template in PROMPTS {
                println!("=== {} ({}) ===", template.slug, template.stage);
                println!("--- system ---\n{}", template.system);
                println!("--- user ---\n{}\n", template.user);
            }
        }
    }

    Ok(())
}

fn open_store(path: Option<PathBuf>) -> Result<SqliteSessionStore, Box<dyn std::error::Error>> {
    let path = path.unwrap_or_else(SqliteSessionStore::default_path);
    Ok(SqliteSessionStore::new(path)?)
}
