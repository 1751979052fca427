use agentsync::config::Config;
use agentsync::remote::types::NewMemoryNode;
use agentsync::{ResultExt, SyncContext, WriteOutcome};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "agentsync")]
#[command(about = "Offline-first sync for agent, chat and memory data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/agentsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity and queued writes
  Status,
  /// Replay queued writes once
  Sync,
  /// Keep replaying queued writes until interrupted
  Daemon,
  /// List agents
  Agents {
    /// Fetch from the service even if the cache is fresh
    #[arg(long)]
    refresh: bool,
  },
  /// Apply a care action to an agent
  Care { agent: String, action: String },
  /// Show an agent's chat history
  Chat {
    agent: String,
    #[arg(long)]
    refresh: bool,
  },
  /// Send a chat message to an agent
  Send { agent: String, text: String },
  /// Key/value memories
  #[command(subcommand)]
  Memory(MemoryCommand),
  /// Semantic memory nodes
  #[command(subcommand)]
  Notes(NotesCommand),
  /// Drop cached data, queued writes and the credential
  Unpair,
}

#[derive(Subcommand, Debug)]
enum MemoryCommand {
  List {
    agent: String,
    #[arg(long)]
    refresh: bool,
  },
  Set {
    agent: String,
    key: String,
    value: String,
  },
  Rm { agent: String, key: String },
}

#[derive(Subcommand, Debug)]
enum NotesCommand {
  List {
    agent: String,
    #[arg(long)]
    refresh: bool,
  },
  Add {
    agent: String,
    content: String,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    importance: Option<f32>,
  },
  Rm { agent: String, id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let context = SyncContext::open(&config, Config::get_token()).await?;

  match args.command {
    Command::Status => status(&context)?,
    Command::Sync => {
      if !context.connectivity.is_online() {
        println!("Offline; {} write(s) queued", context.sync.pending_count()?);
        return Ok(());
      }
      let report = context.sync.process_queue().await?;
      println!(
        "Sent {}, failed {}, dropped {}, {} remaining",
        report.succeeded, report.failed, report.pruned, report.remaining
      );
    }
    Command::Daemon => {
      let scheduler = context.spawn_scheduler();
      tracing::info!("Sync daemon started");
      tokio::signal::ctrl_c().await?;
      scheduler.shutdown().await;
      tracing::info!("Sync daemon stopped");
    }
    Command::Agents { refresh } => {
      let snapshot = context.agents.list()?;
      if refresh || (snapshot.is_stale && context.connectivity.is_online()) {
        context.agents.refresh().await.ignore_transient()?;
      }
      for agent in context.agents.list()?.data {
        println!(
          "{}\t{}\t{}",
          agent.id,
          agent.name,
          agent.mood.as_deref().unwrap_or("-")
        );
      }
    }
    Command::Care { agent, action } => {
      let outcome = context.agents.care(&agent, &action).await?;
      println!("{}", describe(&outcome));
    }
    Command::Chat { agent, refresh } => {
      let snapshot = context.chat.history(&agent)?;
      if refresh || (snapshot.is_stale && context.connectivity.is_online()) {
        context.chat.refresh(&agent).await.ignore_transient()?;
      }
      for message in context.chat.history(&agent)?.data {
        println!("[{}] {}", message.role, message.content);
      }
    }
    Command::Send { agent, text } => {
      let outcome = context.chat.send(&agent, &text).await?;
      println!("{}", describe(&outcome));
    }
    Command::Memory(command) => memory(&context, command).await?,
    Command::Notes(command) => notes(&context, command).await?,
    Command::Unpair => {
      let dropped = context.unpair()?;
      println!("Unpaired; discarded {} queued write(s)", dropped);
    }
  }

  Ok(())
}

fn status(context: &SyncContext) -> Result<()> {
  println!(
    "Connectivity: {}",
    if context.connectivity.is_online() {
      "online"
    } else {
      "offline"
    }
  );

  let pending = context.queue.drain()?;
  println!("Queued writes: {}", pending.len());
  for queued in pending {
    println!(
      "  #{} {} (created {}, {} failed attempt(s){})",
      queued.id,
      queued.action_type,
      queued.created_at.format("%Y-%m-%d %H:%M:%S"),
      queued.retry_count,
      queued
        .last_error
        .map(|e| format!(", last error: {}", e))
        .unwrap_or_default()
    );
  }
  Ok(())
}

async fn memory(context: &SyncContext, command: MemoryCommand) -> Result<()> {
  match command {
    MemoryCommand::List { agent, refresh } => {
      let snapshot = context.memories.list(&agent)?;
      if refresh || (snapshot.is_stale && context.connectivity.is_online()) {
        context.memories.refresh(&agent).await.ignore_transient()?;
      }
      for memory in context.memories.list(&agent)?.data {
        println!("{} = {}", memory.key, memory.value);
      }
    }
    MemoryCommand::Set { agent, key, value } => {
      let outcome = context.memories.set(&agent, &key, &value).await?;
      println!("{}", describe(&outcome));
    }
    MemoryCommand::Rm { agent, key } => {
      let outcome = context.memories.delete(&agent, &key).await?;
      println!("{}", describe(&outcome));
    }
  }
  Ok(())
}

async fn notes(context: &SyncContext, command: NotesCommand) -> Result<()> {
  match command {
    NotesCommand::List { agent, refresh } => {
      let snapshot = context.notes.list(&agent)?;
      if refresh || (snapshot.is_stale && context.connectivity.is_online()) {
        context.notes.refresh(&agent).await.ignore_transient()?;
      }
      for node in context.notes.list(&agent)?.data {
        println!(
          "{}\t[{}]\t{}",
          node.id,
          node.category.as_deref().unwrap_or("-"),
          node.content
        );
      }
    }
    NotesCommand::Add {
      agent,
      content,
      category,
      importance,
    } => {
      let node = NewMemoryNode {
        content,
        category,
        importance,
      };
      let outcome = context.notes.add(&agent, node).await?;
      println!("{}", describe(&outcome));
    }
    NotesCommand::Rm { agent, id } => {
      let outcome = context.notes.delete(&agent, &id).await?;
      println!("{}", describe(&outcome));
    }
  }
  Ok(())
}

fn describe<T>(outcome: &WriteOutcome<T>) -> String {
  match outcome {
    WriteOutcome::Sent(_) => "Saved".to_string(),
    WriteOutcome::Queued {
      action_id,
      cause: None,
    } => format!("Offline; queued as #{}", action_id),
    WriteOutcome::Queued {
      action_id,
      cause: Some(e),
    } => format!("Queued as #{} ({})", action_id, e),
  }
}

/// Log to a daily file in the data directory, and to stderr with --verbose.
fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("agentsync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = RollingFileAppender::builder()
    .rotation(Rotation::DAILY)
    .filename_prefix("agentsync")
    .filename_suffix("log")
    .build(&log_dir)
    .map_err(|e| eyre!("Failed to open log file in {}: {}", log_dir.display(), e))?;
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentsync=info"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .init();

  Ok(guard)
}
