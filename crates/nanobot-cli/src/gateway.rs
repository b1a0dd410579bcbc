use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nanobot_channels::{
    bus_inbound_handler, run_outbound_pump, ChannelRegistry, DiscordChannel, TelegramChannel,
    WebSocketChannel, WhatsAppChannel,
};
use nanobot_config::Config;
use nanobot_core::cron::{CronService, Job, JobHandler};
use nanobot_core::{AgentConfig, AgentLoop, InboundMessage, MessageBus, OpenAiProvider, OutboundMessage};

use crate::webui;
use crate::{cron_store_path, web_fetch_options};

const CRON_JOB_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Start the full gateway: channels, scheduler, Web UI, outbound pump and
/// the agent loop, all under one cancellation token.
pub async fn run(config: &Config, port_override: Option<u16>) -> Result<()> {
    let model = config.agents.defaults.model.clone();
    let api_key = config.api_key_for(&model);
    if api_key.is_empty() {
        anyhow::bail!("no API key configured. Set one in ~/.nanobot/config.json");
    }
    let api_base = config.api_base_for(&model);
    let provider = Arc::new(OpenAiProvider::new(&api_key, &api_base, &model)?);

    let workspace = PathBuf::from(&config.agents.defaults.workspace);
    std::fs::create_dir_all(&workspace)?;

    let port = port_override.unwrap_or(config.gateway.port);
    info!(
        "gateway starting port={port} model={model} workspace={}",
        workspace.display()
    );

    let bus = Arc::new(MessageBus::new(100));
    let cancel = CancellationToken::new();

    // Scheduler, with the default single-shot agent handler.
    let cron_service = CronService::new(cron_store_path(config));
    cron_service
        .set_handler(cron_handler(config.clone(), Some(bus.clone())))
        .await;

    let agent = Arc::new(AgentLoop::new(
        bus.clone(),
        provider,
        AgentConfig {
            workspace: workspace.clone(),
            model,
            max_iterations: config.agents.defaults.max_tool_iterations as usize,
            brave_api_key: config.tools.web.search.api_key.clone(),
            web_fetch: web_fetch_options(config),
            exec_timeout_secs: config.tools.exec.timeout,
            restrict_to_workspace: config.tools.restrict_to_workspace,
        },
        Some(cron_service.clone()),
    ));

    // Channel adapters.
    let registry = Arc::new(ChannelRegistry::new());
    let mut telegram: Option<Arc<TelegramChannel>> = None;
    let mut whatsapp: Option<Arc<WhatsAppChannel>> = None;

    if config.channels.telegram.enabled {
        match TelegramChannel::new(config.channels.telegram.clone()) {
            Ok(channel) => {
                let channel = Arc::new(channel);
                telegram = Some(channel.clone());
                registry.register(channel).await;
            }
            Err(e) => warn!("Failed to construct telegram channel: {e}"),
        }
    }
    if config.channels.discord.enabled {
        registry
            .register(Arc::new(DiscordChannel::new(config.channels.discord.clone())))
            .await;
    }
    if config.channels.whatsapp.enabled {
        let channel = Arc::new(WhatsAppChannel::new(config.channels.whatsapp.clone()));
        whatsapp = Some(channel.clone());
        registry.register(channel).await;
    }
    if config.channels.websocket.enabled {
        registry
            .register(Arc::new(WebSocketChannel::new(
                config.channels.websocket.clone(),
            )))
            .await;
    }

    let enabled = registry.enabled_names().await;
    if enabled.is_empty() {
        warn!("No channels enabled");
    } else {
        info!("Channels enabled: {enabled:?}");
    }

    let cron_status = cron_service.status().await;
    info!(
        "Cron jobs: {} total, {} enabled",
        cron_status.total_jobs, cron_status.enabled_jobs
    );

    // Web UI / API server.
    let webui_state = webui::GatewayState {
        config: config.clone(),
        agent: agent.clone(),
        cron: cron_service.clone(),
        registry: registry.clone(),
        telegram,
        whatsapp,
    };
    let host = config.gateway.host.clone();
    let webui_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = webui::serve(webui_state, &host, port, webui_cancel).await {
            error!("Web UI server error: {e}");
        }
    });

    // Wire each adapter's inbound handler to the bus, then start it; a
    // failed start is logged and skipped.
    for channel in registry.enabled().await {
        channel.set_inbound_handler(bus_inbound_handler(bus.clone()));
        let name = channel.name().to_string();
        tokio::spawn(async move {
            if let Err(e) = channel.start().await {
                error!("Channel {name} failed: {e}");
            }
        });
    }

    if let Err(e) = cron_service.start().await {
        warn!("Failed to start cron service: {e}");
    }

    // Outbound pump.
    tokio::spawn(run_outbound_pump(
        bus.clone(),
        registry.clone(),
        cancel.clone(),
    ));

    info!("Gateway ready");

    // Ctrl+C flips the root token.
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown_cancel.cancel();
        }
    });

    agent.run(cancel.clone()).await;

    cron_service.stop().await;
    for channel in registry.all().await {
        if let Err(e) = channel.stop().await {
            warn!("Error stopping channel {}: {e}", channel.name());
        }
    }
    bus.close();
    info!("Gateway shutdown");

    Ok(())
}

/// Job handler for the standalone `cron run` daemon (no channel delivery).
pub fn cron_job_handler(config: Config) -> JobHandler {
    cron_handler(config, None)
}

/// Build the scheduler's job handler: a dedicated single-shot agent pass
/// with its own deadline. The synthesized user message carries the source
/// channel and job name; when `payload.deliver` is set the result goes out
/// through the shared bus.
fn cron_handler(config: Config, delivery_bus: Option<Arc<MessageBus>>) -> JobHandler {
    Arc::new(move |job: Job| {
        let config = config.clone();
        let delivery_bus = delivery_bus.clone();
        Box::pin(async move {
            let result = tokio::time::timeout(CRON_JOB_DEADLINE, run_cron_job(&config, &job))
                .await
                .map_err(|_| anyhow::anyhow!("cron job timed out"))??;

            if job.payload.deliver {
                if let (Some(bus), Some(channel), Some(to)) = (
                    delivery_bus.as_ref(),
                    job.payload.channel.as_deref(),
                    job.payload.to.as_deref(),
                ) {
                    let out = OutboundMessage::new(channel, to, &result);
                    if let Err(e) = bus.publish_outbound(out) {
                        warn!("Dropping cron delivery for job {}: {e}", job.id);
                    }
                }
            }

            Ok(result)
        })
    })
}

async fn run_cron_job(config: &Config, job: &Job) -> Result<String> {
    let model = config.agents.defaults.model.clone();
    let api_key = config.api_key_for(&model);
    if api_key.is_empty() {
        anyhow::bail!("no API key configured");
    }
    let provider = Arc::new(OpenAiProvider::new(
        &api_key,
        &config.api_base_for(&model),
        &model,
    )?);

    // Fresh bus and loop: the pass must not interleave with live traffic.
    let bus = Arc::new(MessageBus::new(100));
    let agent = AgentLoop::new(
        bus,
        provider,
        AgentConfig {
            workspace: PathBuf::from(&config.agents.defaults.workspace),
            model,
            max_iterations: config.agents.defaults.max_tool_iterations as usize,
            brave_api_key: config.tools.web.search.api_key.clone(),
            web_fetch: web_fetch_options(config),
            exec_timeout_secs: config.tools.exec.timeout,
            restrict_to_workspace: config.tools.restrict_to_workspace,
        },
        None,
    );

    let channel = job.payload.channel.clone().unwrap_or_default();
    let channel_prefix = if channel.is_empty() {
        String::new()
    } else {
        format!("[{channel}] ")
    };
    let user_message = format!("{channel_prefix}[Cron Job: {}] {}", job.name, job.payload.message);

    let msg = InboundMessage::new(&channel, "cron", "", &user_message);
    let response = agent.process_message(&msg).await?;
    Ok(response.content)
}
