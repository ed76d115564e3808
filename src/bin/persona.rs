#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use persona_harness::condition::Condition;
use persona_harness::config::{ApiCredentials, ExperimentConfig};
use persona_harness::gateway::{NoopUsageSink, ProviderGateway, StderrUsageSink, ChatGateway};
use persona_harness::parser::ExtractedAnswer;
use persona_harness::runner::{run_full_experiment, run_quick_test, RunnerOptions};

#[derive(Parser)]
#[command(name = "persona", version, about = "Persona evaluation harness CLI")]
struct Cli {
    /// Log provider usage records to stderr as JSON lines
    #[arg(long, global = true)]
    log_usage: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full experiment: sampling, scoring, metrics
    Run {
        /// Path to the experiment YAML config
        #[arg(long, default_value = "config/default.yaml")]
        config: PathBuf,

        /// Comma-separated model ids to run (default: all)
        #[arg(long, value_delimiter = ',')]
        models: Option<Vec<String>>,

        /// Comma-separated condition ids to run (default: all)
        #[arg(long, value_delimiter = ',')]
        conditions: Option<Vec<Condition>>,

        /// Skip the sampling phase (use existing raw files)
        #[arg(long)]
        skip_sampling: bool,

        /// Skip the scoring phase (use existing scored files)
        #[arg(long)]
        skip_scoring: bool,

        /// Re-issue samples even when the store already has them
        #[arg(long)]
        no_skip_existing: bool,
    },
    /// Recompute metrics from existing scored files
    Metrics {
        #[arg(long, default_value = "config/default.yaml")]
        config: PathBuf,
    },
    /// Quick smoke test: a few questions, immediate accuracy readout
    Test {
        #[arg(long, default_value = "config/default.yaml")]
        config: PathBuf,

        /// Model id to test
        #[arg(long)]
        model: String,

        /// Condition id to test
        #[arg(long)]
        condition: Condition,

        #[arg(long, default_value_t = 5)]
        num_questions: usize,

        #[arg(long, default_value_t = 1)]
        num_samples: usize,
    },
}

fn build_gateway(log_usage: bool) -> Result<Arc<dyn ChatGateway>, Box<dyn std::error::Error>> {
    let credentials = ApiCredentials::from_env();
    if log_usage {
        Ok(Arc::new(ProviderGateway::from_credentials(
            &credentials,
            Arc::new(StderrUsageSink),
        )?))
    } else {
        Ok(Arc::new(ProviderGateway::from_credentials(
            &credentials,
            Arc::new(NoopUsageSink),
        )?))
    }
}

/// Flip the cancel flag on the first ctrl-c; in-flight samples finish their
/// current attempt and the run winds down cleanly.
fn install_cancel_handler() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[run] interrupt received, finishing in-flight samples...");
            handler_flag.store(true, Ordering::Relaxed);
        }
    });
    flag
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let gateway = build_gateway(cli.log_usage)?;

    match cli.command {
        Commands::Run {
            config,
            models,
            conditions,
            skip_sampling,
            skip_scoring,
            no_skip_existing,
        } => {
            let cfg = ExperimentConfig::load(&config)?;
            let opts = RunnerOptions {
                models_filter: models,
                conditions_filter: conditions,
                skip_sampling,
                skip_scoring,
                skip_existing: !no_skip_existing,
            };

            let cancel = install_cancel_handler();
            let report =
                run_full_experiment(gateway.as_ref(), &cfg, &opts, Some(&cancel)).await?;

            if report.cancelled {
                eprintln!("[run] cancelled; partial results are on disk and resumable");
            } else {
                eprintln!(
                    "[run] complete: {} questions, {} summary rows (run {})",
                    report.questions_loaded,
                    report.summaries.len(),
                    report.run_id
                );
            }
        }
        Commands::Metrics { config } => {
            let cfg = ExperimentConfig::load(&config)?;
            let opts = RunnerOptions {
                skip_sampling: true,
                skip_scoring: true,
                ..Default::default()
            };
            run_full_experiment(gateway.as_ref(), &cfg, &opts, None).await?;
        }
        Commands::Test {
            config,
            model,
            condition,
            num_questions,
            num_samples,
        } => {
            let cfg = ExperimentConfig::load(&config)?;
            eprintln!(
                "[test] model={model} condition={condition} questions={num_questions} samples={num_samples}"
            );

            let report = run_quick_test(
                gateway.as_ref(),
                &cfg,
                &model,
                condition,
                num_questions,
                num_samples,
            )
            .await?;

            println!("accuracy: {:.2}%", report.accuracy * 100.0);
            for row in &report.rows {
                let predicted = match &row.extracted {
                    ExtractedAnswer::Letter(l) => l.to_string(),
                    ExtractedAnswer::Text(t) => t.clone(),
                    ExtractedAnswer::Refusal => "<refusal>".to_string(),
                };
                let verdict = match row.is_correct {
                    Some(true) => "CORRECT",
                    Some(false) => "WRONG",
                    None => "UNGRADED",
                };
                println!(
                    "  {}: predicted={} gold={} {}",
                    row.question_id,
                    predicted,
                    row.correct_letter.map(String::from).unwrap_or_else(|| "-".into()),
                    verdict
                );
                if !row.completion_snippet.is_empty() {
                    println!("    response: {}...", row.completion_snippet);
                }
            }
        }
    }

    Ok(())
}
