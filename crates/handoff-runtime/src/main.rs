//! Handoff coordination runtime
//!
//! # Usage
//!
//! ```bash
//! # Evaluate one transcript and apply the tag swap if approved
//! handoff-runtime evaluate transcript.json --conversation contact-42 --source lead
//!
//! # Replay a JSONL script on a simulated clock
//! handoff-runtime simulate traffic.jsonl
//!
//! # Print the effective configuration
//! HANDOFF_HOURLY_CAP=5 handoff-runtime config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use handoff_coordination::clock::ManualClock;
use handoff_coordination::{
    AgentType, ConversationKey, CoordinationConfig, Decision, HandoffCoordinator, Message,
};
use handoff_runtime::{
    build_coordinator, parse_script, AgentTags, CrmTagTransfer, MemoryContactStore, Simulation,
    TagAction,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file (defaults to HANDOFF_* environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// RocksDB directory for the ledger, rate limits and checkpoints
    #[cfg(feature = "heavy-state")]
    #[arg(long, global = true)]
    state_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[cfg(feature = "heavy-state")]
    fn state_path(&self) -> Option<PathBuf> {
        self.state_path.clone()
    }

    #[cfg(not(feature = "heavy-state"))]
    fn state_path(&self) -> Option<PathBuf> {
        None
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a JSON transcript, evaluate the handoff and execute it if approved
    Evaluate {
        /// JSON array of messages ({"role", "content", "sent_at"})
        transcript: PathBuf,

        /// Conversation key, also used as the CRM contact id
        #[arg(long, default_value = "cli-contact")]
        conversation: String,

        /// Agent currently owning the conversation
        #[arg(long, default_value = "lead")]
        source: AgentType,

        /// Target agent (defaults to the one the transcript favors)
        #[arg(long)]
        target: Option<AgentType>,

        /// Evaluate only; release the approval without applying tags
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Replay a JSONL script of messages, samples and outcomes
    Simulate {
        script: PathBuf,
    },

    /// Print the effective configuration
    Config {
        #[arg(long, value_enum, default_value_t = ConfigFormat::Toml)]
        format: ConfigFormat,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ConfigFormat {
    Toml,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let state_path = cli.state_path();

    match cli.command {
        Command::Evaluate {
            transcript,
            conversation,
            source,
            target,
            dry_run,
        } => {
            let coordinator =
                build_coordinator(state_path.as_deref(), HandoffCoordinator::builder(config))?;
            evaluate(&coordinator, &transcript, conversation, source, target, dry_run).await
        }
        Command::Simulate { script } => {
            let clock = Arc::new(ManualClock::starting_now());
            let coordinator = build_coordinator(
                state_path.as_deref(),
                HandoffCoordinator::builder(config).clock(clock.clone()),
            )?;
            simulate(coordinator, clock, &script).await
        }
        Command::Config { format } => {
            let rendered = match format {
                ConfigFormat::Toml => config.to_toml_string()?,
                ConfigFormat::Json => serde_json::to_string_pretty(&config)?,
            };
            println!("{rendered}");
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<CoordinationConfig> {
    let config = match path {
        Some(path) => CoordinationConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CoordinationConfig::from_env(),
    };
    config.validate().context("Invalid coordination config")?;
    Ok(config)
}

async fn evaluate(
    coordinator: &HandoffCoordinator,
    transcript: &Path,
    conversation: String,
    source: AgentType,
    target: Option<AgentType>,
    dry_run: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(transcript)
        .with_context(|| format!("Failed to read transcript {}", transcript.display()))?;
    let history: Vec<Message> =
        serde_json::from_str(&raw).context("Transcript must be a JSON array of messages")?;
    let key = ConversationKey::new(conversation);

    let profile = coordinator.analyze(&history)?;
    let target = match target.or_else(|| {
        profile
            .best_target(source)
            .filter(|(_, c)| *c > 0.0)
            .map(|(agent, _)| agent)
    }) {
        Some(target) => target,
        None => {
            info!(key = %key, "No handoff signal in transcript");
            println!("{}", json!({ "conversation": key, "source": source, "profile": profile }));
            return Ok(());
        }
    };

    let decision = coordinator.evaluate(&key, source, &profile, target)?;
    let summary = decision.summary();

    let store = Arc::new(MemoryContactStore::new());
    let tags = AgentTags::default();
    let (actions, record): (Vec<TagAction>, _) = match decision {
        Decision::Approved(approved) if !dry_run => {
            let transfer = Arc::new(CrmTagTransfer::new(store.clone()).with_tags(tags.clone()));
            let record = coordinator.execute(approved, transfer).await?;
            (store.applied().into_iter().map(|(_, a)| a).collect(), Some(record))
        }
        Decision::Approved(approved) => {
            let actions = tags.actions_for(approved.record.transition());
            let record = approved.lease.fail("dry_run")?;
            (actions, Some(record))
        }
        _ => (Vec::new(), None),
    };

    let output = json!({
        "conversation": key,
        "source": source,
        "target": target,
        "profile": profile,
        "decision": summary,
        "tag_actions": actions,
        "record": record,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn simulate(
    coordinator: HandoffCoordinator,
    clock: Arc<ManualClock>,
    script: &Path,
) -> Result<()> {
    let raw = std::fs::read_to_string(script)
        .with_context(|| format!("Failed to read script {}", script.display()))?;
    let steps = parse_script(&raw)?;
    let step_count = steps.len();
    info!(steps = step_count, script = %script.display(), "Replaying script");

    let transfer = Arc::new(CrmTagTransfer::new(Arc::new(MemoryContactStore::new())));
    let mut simulation = Simulation::new(coordinator, clock, transfer);
    for report in simulation.run(steps).await? {
        println!("{}", serde_json::to_string(&report)?);
    }
    println!(
        "{}",
        serde_json::to_string(&simulation.summary(step_count))?
    );
    Ok(())
}
