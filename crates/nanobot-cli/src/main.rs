mod gateway;
mod onboard;
mod webui;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use nanobot_config::{config_path, load_config, Config};
use nanobot_core::cron::{CronService, Payload, Schedule};
use nanobot_core::tools::web::WebFetchOptions;
use nanobot_core::{AgentConfig, AgentLoop, MessageBus, OpenAiProvider};

#[derive(Parser)]
#[command(name = "nanobot", about = "Personal AI assistant gateway", version)]
struct Cli {
    /// Path to config file (default: ~/.nanobot/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config file and workspace templates
    Onboard,
    /// Run interactive CLI chat
    Agent {
        /// Single message mode (non-interactive)
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Start the gateway with all enabled channels
    Gateway {
        /// Gateway port override
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Show configuration and channel status
    Status,
    /// Manage scheduled jobs
    Cron {
        #[command(subcommand)]
        command: CronCommands,
    },
}

#[derive(Subcommand)]
enum CronCommands {
    /// Add a new scheduled job
    Add {
        /// Job name
        #[arg(short, long)]
        name: String,
        /// Message to send to the agent
        #[arg(short, long)]
        message: String,
        /// Schedule type: every, cron, once
        #[arg(short = 't', long, default_value = "every")]
        schedule_type: String,
        /// Interval in milliseconds (for type=every)
        #[arg(short, long, default_value_t = 3_600_000)]
        every: i64,
        /// Cron expression (for type=cron)
        #[arg(short, long)]
        schedule: Option<String>,
        /// Execute at time, RFC 3339 (for type=once)
        #[arg(short, long)]
        at: Option<String>,
        /// Output channel
        #[arg(short, long)]
        channel: Option<String>,
        /// Receiver chat id
        #[arg(long)]
        to: Option<String>,
        /// Deliver the result to the channel
        #[arg(short, long, default_value_t = false)]
        deliver: bool,
    },
    /// List all scheduled jobs
    List,
    /// Remove a scheduled job
    Remove { job_id: String },
    /// Enable a scheduled job
    Enable { job_id: String },
    /// Disable a scheduled job
    Disable { job_id: String },
    /// Show scheduler status
    Status,
    /// Run the scheduler daemon in the foreground
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_file = cli.config.unwrap_or_else(config_path);
    let config = load_config(&config_file)?;

    match cli.command {
        Commands::Onboard => onboard::run(&config_file, &config),
        Commands::Agent { message } => run_agent(&config, message).await,
        Commands::Gateway { port } => gateway::run(&config, port).await,
        Commands::Status => run_status(&config_file, &config).await,
        Commands::Cron { command } => run_cron(&config, command).await,
    }
}

/// Build the single-process agent loop used by `agent` and the cron daemon.
fn build_agent(config: &Config, cron_service: Option<Arc<CronService>>) -> Result<Arc<AgentLoop>> {
    let model = &config.agents.defaults.model;
    let api_key = config.api_key_for(model);
    if api_key.is_empty() {
        anyhow::bail!("no API key configured. Set one in ~/.nanobot/config.json");
    }
    let api_base = config.api_base_for(model);
    let provider = Arc::new(OpenAiProvider::new(&api_key, &api_base, model)?);

    let workspace = PathBuf::from(&config.agents.defaults.workspace);
    std::fs::create_dir_all(&workspace)?;

    let bus = Arc::new(MessageBus::new(100));
    Ok(Arc::new(AgentLoop::new(
        bus,
        provider,
        AgentConfig {
            workspace,
            model: model.clone(),
            max_iterations: config.agents.defaults.max_tool_iterations as usize,
            brave_api_key: config.tools.web.search.api_key.clone(),
            web_fetch: web_fetch_options(config),
            exec_timeout_secs: config.tools.exec.timeout,
            restrict_to_workspace: config.tools.restrict_to_workspace,
        },
        cron_service,
    )))
}

pub(crate) fn web_fetch_options(config: &Config) -> WebFetchOptions {
    WebFetchOptions {
        mode: config.tools.web.fetch.mode.clone(),
        node_path: config.tools.web.fetch.node_path.clone(),
        script_path: config.tools.web.fetch.script_path.clone(),
        timeout_secs: config.tools.web.fetch.timeout,
        user_agent: config.tools.web.fetch.user_agent.clone(),
        wait_until: config.tools.web.fetch.wait_until.clone(),
    }
}

pub(crate) fn cron_store_path(config: &Config) -> PathBuf {
    PathBuf::from(&config.agents.defaults.workspace)
        .join(".cron")
        .join("jobs.json")
}

async fn run_agent(config: &Config, message: Option<String>) -> Result<()> {
    let agent = build_agent(config, None)?;

    if let Some(message) = message {
        let reply = agent
            .process_direct(&message, "cli:direct", "cli", "direct")
            .await?;
        if !reply.is_empty() {
            println!("{reply}");
        }
        return Ok(());
    }

    run_interactive(agent).await
}

async fn run_interactive(agent: Arc<AgentLoop>) -> Result<()> {
    let history_path = nanobot_config::config_dir().join("cli_history.txt");
    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    println!("nanobot interactive mode (type /help for commands, Ctrl-D to quit)");
    println!();

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                match input {
                    "/help" => {
                        println!("Commands:");
                        println!("  /new   - Start a new conversation");
                        println!("  /help  - Show this help");
                        println!("  /quit  - Exit");
                        println!();
                        continue;
                    }
                    "/quit" | "/exit" => break,
                    "/new" => {
                        let _ = agent.sessions().clear("cli:interactive");
                        println!("New session started.");
                        println!();
                        continue;
                    }
                    _ => {}
                }

                // CLI streams tokens inline; errors replace the reply.
                match agent
                    .process_direct(input, "cli:interactive", "cli", "interactive")
                    .await
                {
                    Ok(_) => println!(),
                    Err(e) => {
                        eprintln!("Error: {e}");
                        println!();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Error: {e}");
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

async fn run_status(config_file: &std::path::Path, config: &Config) -> Result<()> {
    println!("Config: {}", config_file.display());
    println!("Workspace: {}", config.agents.defaults.workspace);
    println!("Model: {}", config.agents.defaults.model);
    println!(
        "Restrict to workspace: {}",
        config.tools.restrict_to_workspace
    );

    let mut providers = Vec::new();
    for (name, p) in [
        ("openrouter", &config.providers.openrouter),
        ("deepseek", &config.providers.deepseek),
        ("anthropic", &config.providers.anthropic),
        ("openai", &config.providers.openai),
        ("gemini", &config.providers.gemini),
        ("moonshot", &config.providers.moonshot),
        ("vllm", &config.providers.vllm),
        ("groq", &config.providers.groq),
    ] {
        if !p.api_key.is_empty() {
            providers.push(name);
        }
    }
    println!(
        "Providers: {}",
        if providers.is_empty() {
            "none configured".to_string()
        } else {
            providers.join(", ")
        }
    );

    let mut channels = Vec::new();
    if config.channels.telegram.enabled {
        channels.push("telegram");
    }
    if config.channels.discord.enabled {
        channels.push("discord");
    }
    if config.channels.whatsapp.enabled {
        channels.push("whatsapp");
    }
    if config.channels.websocket.enabled {
        channels.push("websocket");
    }
    println!(
        "Channels: {}",
        if channels.is_empty() {
            "none enabled".to_string()
        } else {
            channels.join(", ")
        }
    );

    let service = CronService::new(cron_store_path(config));
    let status = service.status().await;
    println!(
        "Cron jobs: {} total, {} enabled ({})",
        status.total_jobs, status.enabled_jobs, status.store_path
    );

    Ok(())
}

async fn run_cron(config: &Config, command: CronCommands) -> Result<()> {
    let service = CronService::new(cron_store_path(config));

    match command {
        CronCommands::Add {
            name,
            message,
            schedule_type,
            every,
            schedule,
            at,
            channel,
            to,
            deliver,
        } => {
            let schedule = match schedule_type.as_str() {
                "every" => Schedule::Every { every_ms: every },
                "cron" => {
                    let expr =
                        schedule.ok_or_else(|| anyhow::anyhow!("--schedule is required for type=cron"))?;
                    Schedule::Cron { expr }
                }
                "once" => {
                    let at = at.ok_or_else(|| anyhow::anyhow!("--at is required for type=once"))?;
                    let dt = chrono::DateTime::parse_from_rfc3339(&at)
                        .map_err(|e| anyhow::anyhow!("invalid time '{at}': {e}"))?;
                    Schedule::Once {
                        at_ms: dt.timestamp_millis(),
                    }
                }
                other => anyhow::bail!("invalid type: {other}, use: every, cron, or once"),
            };

            let job = service
                .add_job(
                    &name,
                    schedule,
                    Payload {
                        message,
                        channel,
                        to,
                        deliver,
                    },
                )
                .await?;
            println!("Job added: {} ({})", job.name, job.id);
        }
        CronCommands::List => {
            let jobs = service.list_jobs().await;
            if jobs.is_empty() {
                println!("No scheduled jobs");
                return Ok(());
            }
            println!("{:<24} {:<20} {:<10} {:<10}", "ID", "NAME", "TYPE", "STATUS");
            for job in jobs {
                let kind = match job.schedule {
                    Schedule::Every { .. } => "every",
                    Schedule::Cron { .. } => "cron",
                    Schedule::Once { .. } => "once",
                };
                let status = if job.enabled { "enabled" } else { "disabled" };
                println!("{:<24} {:<20} {:<10} {:<10}", job.id, job.name, kind, status);
            }
        }
        CronCommands::Remove { job_id } => {
            if !service.remove_job(&job_id).await {
                anyhow::bail!("job not found: {job_id}");
            }
            println!("Job removed: {job_id}");
        }
        CronCommands::Enable { job_id } => {
            if service.enable_job(&job_id, true).await.is_none() {
                anyhow::bail!("job not found: {job_id}");
            }
            println!("Job enabled: {job_id}");
        }
        CronCommands::Disable { job_id } => {
            if service.enable_job(&job_id, false).await.is_none() {
                anyhow::bail!("job not found: {job_id}");
            }
            println!("Job disabled: {job_id}");
        }
        CronCommands::Status => {
            let status = service.status().await;
            println!("Cron Service Status:");
            println!("  Running: {}", status.running);
            println!("  Total Jobs: {}", status.total_jobs);
            println!("  Enabled Jobs: {}", status.enabled_jobs);
            println!("  Store Path: {}", status.store_path);
        }
        CronCommands::Run => {
            let handler = gateway::cron_job_handler(config.clone());
            service.set_handler(handler).await;
            service.start().await?;

            let status = service.status().await;
            println!("Cron scheduler started");
            println!("  Store: {}", status.store_path);
            println!("  Jobs: {} enabled", status.enabled_jobs);
            println!("\nPress Ctrl+C to stop");

            tokio::signal::ctrl_c().await?;
            println!("\nShutting down cron service...");
            service.stop().await;
        }
    }

    Ok(())
}
