//! CLI command definitions for redis-pipeline.
//!
//! Each subcommand maps onto one admin operation, except `consume`, which runs
//! a consumer with a demo handler until Ctrl-C, and `demo`, which seeds a
//! pipeline and then consumes it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::lock::LockSettings;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::config::DEFAULT_REDIS_URL;
use crate::pipeline::{
    AdminSettings, ConsumerSettings, PipelineAdmin, PipelineFactory, PipelineHandler,
    PipelineStatus,
};

/// Default resource name.
const DEFAULT_RESOURCE: &str = "my-messages";

/// Messages pushed by `demo`.
const DEMO_MESSAGE_COUNT: usize = 10;

/// Redis-backed single-queue message pipeline.
#[derive(Parser)]
#[command(name = "redis-pipeline")]
#[command(about = "Operate a lock-guarded message pipeline stored in Redis")]
#[command(version)]
#[command(
    long_about = "redis-pipeline pushes, consumes and administers a single-queue message pipeline stored in Redis.\n\nA failing message is retried at the head of the queue; after --max-retries consecutive failures the pipeline stops until resumed.\n\nExample usage:\n  redis-pipeline --resource orders push order-1 order-2\n  redis-pipeline --resource orders consume --max-retries 3\n  redis-pipeline --resource orders resume --skip 1"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Redis node URL. Repeat for multi-node locking; the first node holds pipeline data.
    #[arg(
        long = "redis-url",
        env = "REDIS_PIPELINE_URLS",
        value_delimiter = ',',
        default_value = DEFAULT_REDIS_URL,
        global = true
    )]
    pub redis_urls: Vec<String>,

    /// Pipeline resource name.
    #[arg(short, long, env = "REDIS_PIPELINE_RESOURCE", default_value = DEFAULT_RESOURCE, global = true)]
    pub resource: String,

    /// Lock timing shared by every command.
    #[command(flatten)]
    pub lock: LockArgs,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Lock timing flags.
#[derive(clap::Args, Debug, Clone)]
pub struct LockArgs {
    /// Lock expiry in milliseconds. Must exceed the slowest handler run.
    #[arg(long, default_value = "10000", global = true)]
    pub lock_expiry_ms: u64,

    /// How long to keep trying for the lock, in milliseconds.
    #[arg(long, default_value = "500", global = true)]
    pub lock_wait_ms: u64,

    /// Pause between lock attempts, in milliseconds.
    #[arg(long, default_value = "100", global = true)]
    pub lock_retry_ms: u64,
}

impl LockArgs {
    fn settings(&self) -> LockSettings {
        LockSettings::default()
            .with_expiry_time(Duration::from_millis(self.lock_expiry_ms))
            .with_wait_time(Duration::from_millis(self.lock_wait_ms))
            .with_retry_time(Duration::from_millis(self.lock_retry_ms))
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Append messages to the tail of the queue.
    Push(PushArgs),

    /// Stop the pipeline. Pushing still works; consuming pauses.
    Stop,

    /// Resume a stopped pipeline, optionally discarding messages at the head.
    Resume(ResumeArgs),

    /// Delete the queue, state and failure record.
    Clean,

    /// Show state, queue length and the last failure.
    Status(StatusArgs),

    /// Consume messages with a demo handler until Ctrl-C.
    Consume(ConsumeArgs),

    /// Stop, push sample messages, resume skipping one, then consume.
    Demo(ConsumeArgs),
}

/// Arguments for `redis-pipeline push`.
#[derive(Parser, Debug)]
pub struct PushArgs {
    /// Message payloads, pushed in order.
    #[arg(required = true)]
    pub messages: Vec<String>,
}

/// Arguments for `redis-pipeline resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Messages to discard from the head before resuming.
    #[arg(short, long, default_value = "0")]
    pub skip: usize,
}

/// Arguments for `redis-pipeline status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `redis-pipeline consume`.
#[derive(Parser, Debug, Clone)]
pub struct ConsumeArgs {
    /// Consecutive failures before the pipeline stops (unbounded when omitted).
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Pause after an idle poll, in milliseconds.
    #[arg(long, default_value = "500")]
    pub pull_interval_ms: u64,

    /// Fail every message containing this text.
    #[arg(long)]
    pub fail_on: Option<String>,

    /// Simulated work per message, in milliseconds.
    #[arg(long, default_value = "300")]
    pub delay_ms: u64,

    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub metrics: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let factory = PipelineFactory::connect(&cli.redis_urls).await?;
    let lock = cli.lock.settings();
    let admin = factory.create_admin(AdminSettings::new(&cli.resource).with_lock(lock))?;

    match cli.command {
        Commands::Push(args) => run_push_command(&admin, args).await,
        Commands::Stop => {
            admin.stop().await?;
            println!("Pipeline '{}' stopped", cli.resource);
            Ok(())
        }
        Commands::Resume(args) => run_resume_command(&admin, args).await,
        Commands::Clean => {
            admin.clean(&CancellationToken::new()).await?;
            println!("Pipeline '{}' cleaned", cli.resource);
            Ok(())
        }
        Commands::Status(args) => run_status_command(&admin, args).await,
        Commands::Consume(args) => {
            let settings = consumer_settings(&cli.resource, lock, &args);
            run_consume_command(&factory, settings, args).await
        }
        Commands::Demo(args) => {
            seed_demo(&admin).await?;
            let settings = consumer_settings(&cli.resource, lock, &args);
            run_consume_command(&factory, settings, args).await
        }
    }
}

fn consumer_settings(resource: &str, lock: LockSettings, args: &ConsumeArgs) -> ConsumerSettings {
    let mut settings = ConsumerSettings::new(resource)
        .with_pull_interval(Duration::from_millis(args.pull_interval_ms))
        .with_lock(lock);
    if let Some(max_retries) = args.max_retries {
        settings = settings.with_max_retries(max_retries);
    }
    settings
}

// ============================================================================
// Admin Commands
// ============================================================================

async fn run_push_command(admin: &PipelineAdmin, args: PushArgs) -> anyhow::Result<()> {
    let mut pending = 0;
    for message in &args.messages {
        pending = admin.push(message).await?;
    }
    println!(
        "Pushed {} message(s) to '{}' ({} pending)",
        args.messages.len(),
        admin.resource(),
        pending
    );
    Ok(())
}

async fn run_resume_command(admin: &PipelineAdmin, args: ResumeArgs) -> anyhow::Result<()> {
    let skipped = admin.resume(args.skip, &CancellationToken::new()).await?;
    println!("Pipeline '{}' resumed", admin.resource());
    for message in &skipped {
        println!("  skipped: {}", message);
    }
    Ok(())
}

async fn run_status_command(admin: &PipelineAdmin, args: StatusArgs) -> anyhow::Result<()> {
    let status = admin.status().await?;

    if args.json {
        let json_output = serde_json::to_string_pretty(&status)
            .map_err(|e| anyhow::anyhow!("Failed to serialize status JSON: {}", e))?;
        println!("{}", json_output);
    } else {
        print!("{}", format_status(&status));
    }
    Ok(())
}

fn format_status(status: &PipelineStatus) -> String {
    let state = match (&status.state, &status.raw_state) {
        (Some(state), _) => state.to_string(),
        (None, Some(raw)) => format!("unreadable ({:?})", raw),
        (None, None) => "unknown".to_string(),
    };

    let mut out = format!(
        "Pipeline: {}\nState:    {}\nPending:  {}\n",
        status.resource, state, status.pending
    );
    if let Some(next) = &status.next_message {
        out.push_str(&format!("Next:     {}\n", next));
    }
    if let Some(failure) = &status.last_failure {
        let at = failure
            .occurred_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| failure.timestamp.to_string());
        out.push_str(&format!(
            "Last failure at {}\n  message:   {}\n  exception: {}\n",
            at, failure.message, failure.exception
        ));
    } else if let Some(raw) = &status.raw_failure {
        out.push_str(&format!("Last failure: unreadable ({:?})\n", raw));
    }
    out
}

async fn seed_demo(admin: &PipelineAdmin) -> anyhow::Result<()> {
    admin.stop().await?;
    for i in 0..DEMO_MESSAGE_COUNT {
        admin.push(&format!("message:{}", i)).await?;
    }
    let skipped = admin.resume(1, &CancellationToken::new()).await?;
    info!(
        resource = %admin.resource(),
        pushed = DEMO_MESSAGE_COUNT,
        skipped = skipped.len(),
        "Seeded demo pipeline"
    );
    Ok(())
}

// ============================================================================
// Consumer Command
// ============================================================================

/// Handler that logs each message after a simulated delay.
struct DemoHandler {
    fail_on: Option<String>,
    delay: Duration,
}

#[async_trait]
impl PipelineHandler for DemoHandler {
    async fn handle(&self, message: &str, cancel: &CancellationToken) -> anyhow::Result<bool> {
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled while processing '{}'", message),
            _ = tokio::time::sleep(self.delay) => {}
        }

        let success = !self
            .fail_on
            .as_deref()
            .is_some_and(|needle| message.contains(needle));
        info!(message = %message, success = success, "Processed message");
        Ok(success)
    }
}

async fn run_consume_command(
    factory: &PipelineFactory,
    settings: ConsumerSettings,
    args: ConsumeArgs,
) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics()?;
    }

    let handler = Arc::new(DemoHandler {
        fail_on: args.fail_on.clone(),
        delay: Duration::from_millis(args.delay_ms),
    });
    let consumer = factory.create_consumer(settings, handler)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    consumer.run(&cancel).await;

    if args.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineFailure, PipelineState};
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_push_command() {
        let cli = Cli::try_parse_from(["redis-pipeline", "-r", "orders", "push", "a", "b"])
            .expect("should parse");

        assert_eq!(cli.resource, "orders");
        match cli.command {
            Commands::Push(args) => assert_eq!(args.messages, vec!["a", "b"]),
            _ => panic!("Expected Push command"),
        }
    }

    #[test]
    fn test_push_requires_message() {
        assert!(Cli::try_parse_from(["redis-pipeline", "push"]).is_err());
    }

    #[test]
    fn test_resume_skip() {
        let cli = Cli::try_parse_from(["redis-pipeline", "resume", "--skip", "2"])
            .expect("should parse");
        match cli.command {
            Commands::Resume(args) => assert_eq!(args.skip, 2),
            _ => panic!("Expected Resume command"),
        }

        let cli = Cli::try_parse_from(["redis-pipeline", "resume"]).expect("should parse");
        match cli.command {
            Commands::Resume(args) => assert_eq!(args.skip, 0),
            _ => panic!("Expected Resume command"),
        }
    }

    #[test]
    fn test_multiple_redis_urls() {
        let cli = Cli::try_parse_from([
            "redis-pipeline",
            "--redis-url",
            "redis://a:6379,redis://b:6379",
            "--redis-url",
            "redis://c:6379",
            "stop",
        ])
        .expect("should parse");

        assert_eq!(
            cli.redis_urls,
            vec!["redis://a:6379", "redis://b:6379", "redis://c:6379"]
        );
    }

    #[test]
    fn test_consume_defaults() {
        let cli = Cli::try_parse_from(["redis-pipeline", "consume"]).expect("should parse");
        match cli.command {
            Commands::Consume(args) => {
                assert!(args.max_retries.is_none());
                assert_eq!(args.pull_interval_ms, 500);
                assert_eq!(args.delay_ms, 300);
                assert!(args.fail_on.is_none());
                assert!(!args.metrics);
            }
            _ => panic!("Expected Consume command"),
        }
        assert_eq!(cli.lock.settings(), LockSettings::default());
    }

    #[test]
    fn test_consumer_settings_from_args() {
        let cli = Cli::try_parse_from([
            "redis-pipeline",
            "consume",
            "--max-retries",
            "3",
            "--pull-interval-ms",
            "50",
            "--lock-wait-ms",
            "1000",
        ])
        .expect("should parse");

        let Commands::Consume(args) = &cli.command else {
            panic!("Expected Consume command");
        };
        let settings = consumer_settings("orders", cli.lock.settings(), args);

        assert_eq!(settings.resource, "orders");
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.pull_interval, Duration::from_millis(50));
        assert_eq!(settings.lock.wait_time, Duration::from_millis(1000));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_format_status() {
        let status = PipelineStatus {
            resource: "orders".to_string(),
            state: Some(PipelineState::Stopped),
            raw_state: Some("STOPPED".to_string()),
            pending: 2,
            next_message: Some("order-1".to_string()),
            last_failure: Some(PipelineFailure::new("timeout", "order-1")),
            raw_failure: None,
        };

        let text = format_status(&status);
        assert!(text.contains("Pipeline: orders"));
        assert!(text.contains("State:    Stopped"));
        assert!(text.contains("Pending:  2"));
        assert!(text.contains("Next:     order-1"));
        assert!(text.contains("exception: timeout"));
    }

    #[test]
    fn test_format_status_unreadable_state() {
        let status = PipelineStatus {
            resource: "orders".to_string(),
            state: None,
            raw_state: Some("bogus".to_string()),
            pending: 0,
            next_message: None,
            last_failure: None,
            raw_failure: Some("not json".to_string()),
        };

        let text = format_status(&status);
        assert!(text.contains("unreadable (\"bogus\")"));
        assert!(text.contains("Last failure: unreadable (\"not json\")"));
    }

    #[tokio::test]
    async fn test_demo_handler_fail_on() {
        let handler = DemoHandler {
            fail_on: Some("bad".to_string()),
            delay: Duration::from_millis(1),
        };
        let cancel = CancellationToken::new();

        assert!(handler.handle("good message", &cancel).await.unwrap());
        assert!(!handler.handle("a bad message", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_demo_handler_cancelled() {
        let handler = DemoHandler {
            fail_on: None,
            delay: Duration::from_secs(10),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(handler.handle("message:0", &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_seed_demo() {
        let factory = PipelineFactory::in_memory();
        let admin = factory.create_admin(AdminSettings::new("demo")).unwrap();

        seed_demo(&admin).await.unwrap();

        let status = admin.status().await.unwrap();
        assert_eq!(status.state, Some(PipelineState::Active(0)));
        assert_eq!(status.pending, DEMO_MESSAGE_COUNT - 1);
        assert_eq!(status.next_message.as_deref(), Some("message:1"));
    }
}
