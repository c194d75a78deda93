#![allow(missing_docs)]

//! Armitage — outbound notification dispatch service.
//!
//! Single Rust binary that enqueues messages, dispatches them through the
//! provider bridge on periodic schedules, reconciles webhook delivery
//! callbacks, and synchronises template approval state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use armitage::config::Config;
use armitage::dispatch::retry::RetryPolicy;
use armitage::dispatch::{self, DispatcherDeps};
use armitage::message::Channel;
use armitage::provider::http::ProviderBridge;
use armitage::provider::{Notifier, Sender, TemplateProvider};
use armitage::service::{NewMessage, RetryOutcome, Service};
use armitage::store::Store;
use armitage::template::sync::{self, SyncDeps};
use armitage::webhook;
use armitage::webhook::reconciler::Reconciler;

#[derive(Parser)]
#[command(name = "armitage", version, about = "Outbound notification dispatch service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch service: scheduler loops, webhook ingress, and
    /// template sync.
    Start,
    /// Enqueue an outbound message.
    Send {
        /// Transport channel: sms or chat.
        #[arg(long)]
        channel: String,
        /// Destination address.
        #[arg(long)]
        to: String,
        /// Free-text body (omit for template sends).
        #[arg(long)]
        body: Option<String>,
        /// Template id for a template send.
        #[arg(long)]
        template: Option<Uuid>,
        /// Template placeholder values as key=value pairs.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        /// RFC 3339 send time (defaults to now).
        #[arg(long)]
        at: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Retry a failed message through the retry policy.
    Retry {
        /// Message id.
        id: Uuid,
    },
    /// Show a message with its event log, or queue counts without an id.
    Status {
        /// Message id.
        id: Option<Uuid>,
    },
    /// Template approval workflow.
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Create a template in draft.
    Create {
        /// Unique template name.
        name: String,
        /// Body text with {{placeholder}} markers.
        body: String,
    },
    /// Submit a template for review.
    Submit {
        /// Template id.
        id: Uuid,
        /// Who is requesting the review.
        #[arg(long, default_value = "operator")]
        by: String,
    },
    /// Resolve the newest pending review request.
    Review {
        /// Template id.
        id: Uuid,
        /// Reviewer name.
        #[arg(long)]
        reviewer: String,
        /// Accept (forwards to the provider) instead of decline.
        #[arg(long, conflicts_with = "decline")]
        accept: bool,
        /// Decline the request.
        #[arg(long)]
        decline: bool,
        /// Reviewer comments (the rejection reason on decline).
        #[arg(long)]
        comments: Option<String>,
    },
    /// Archive an approved template.
    Archive {
        /// Template id.
        id: Uuid,
    },
    /// Delete a draft or rejected template.
    Delete {
        /// Template id.
        id: Uuid,
    },
    /// Show a template.
    Show {
        /// Template id.
        id: Uuid,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("invalid key=value pair: {s:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start().await,
        command => run_oneshot(command).await,
    }
}

/// Run the long-lived service.
async fn run_start() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let paths = config.runtime_paths();
    let _logging_guard = armitage::logging::init_production(&paths.logs_dir, &config.logging.level)
        .context("failed to initialise logging")?;

    info!(version = env!("CARGO_PKG_VERSION"), "armitage starting");

    if let Some(parent) = paths.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    let store = Store::open(&paths.db_path)
        .await
        .context("failed to open store")?;

    // One bridge client backs all three capabilities.
    let bridge = Arc::new(ProviderBridge::new(
        config.provider.base_url.clone(),
        config.provider.token.clone(),
    ));
    let sender: Arc<dyn Sender> = Arc::clone(&bridge) as Arc<dyn Sender>;
    let template_provider: Arc<dyn TemplateProvider> =
        Arc::clone(&bridge) as Arc<dyn TemplateProvider>;
    let notifier: Arc<dyn Notifier> = Arc::clone(&bridge) as Arc<dyn Notifier>;
    info!(bridge = bridge.base_url(), "provider bridge configured");

    let policy = RetryPolicy::new(
        config.dispatch.max_retry_attempts,
        Duration::from_secs(config.dispatch.retry_base_interval_secs),
    );

    // Shutdown signal shared by every loop: flipped once on ctrl-c, after
    // which no new ticks are scheduled; in-flight sends complete.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();

    // Dispatch loops, one per configured queue, sharing one concurrency
    // gate so the cap on simultaneous provider calls is global.
    let dispatcher_deps = Arc::new(DispatcherDeps {
        store: store.clone(),
        sender,
        notifier: Arc::clone(&notifier),
        policy,
        limiter: Arc::new(Semaphore::new(config.dispatch.concurrency)),
        claim_lease: Duration::from_secs(config.dispatch.claim_lease_secs),
    });
    for queue in config.dispatch.queues.clone() {
        tasks.push(tokio::spawn(dispatch::run_dispatcher(
            queue,
            Arc::clone(&dispatcher_deps),
            shutdown_rx.clone(),
        )));
    }

    // Template sync loop.
    if config.sync.enabled {
        let sync_deps = Arc::new(SyncDeps {
            store: store.clone(),
            provider: Arc::clone(&template_provider),
            notifier: Arc::clone(&notifier),
        });
        tasks.push(tokio::spawn(sync::run_template_sync(
            config.sync.interval_secs,
            sync_deps,
            shutdown_rx.clone(),
        )));
    } else {
        warn!("template sync disabled by configuration");
    }

    // Webhook ingress.
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        Arc::clone(&notifier),
        Duration::from_secs(config.webhook.dedup_window_secs),
    ));
    let webhook_host = config.webhook.host.clone();
    let webhook_port = config.webhook.port;
    let webhook_rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = webhook::serve(&webhook_host, webhook_port, reconciler, webhook_rx).await {
            error!(error = %e, "webhook ingress failed");
        }
    }));

    info!("armitage ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal, initiating graceful shutdown");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }

    store.close().await;
    info!("armitage stopped");
    Ok(())
}

/// Run a one-shot CLI command against the shared store.
async fn run_oneshot(command: Commands) -> Result<()> {
    armitage::logging::init_cli();
    let config = Config::load().context("failed to load configuration")?;
    let paths = config.runtime_paths();

    if let Some(parent) = paths.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    let store = Store::open(&paths.db_path)
        .await
        .context("failed to open store")?;

    let bridge = Arc::new(ProviderBridge::new(
        config.provider.base_url.clone(),
        config.provider.token.clone(),
    ));
    let policy = RetryPolicy::new(
        config.dispatch.max_retry_attempts,
        Duration::from_secs(config.dispatch.retry_base_interval_secs),
    );
    let service = Service::new(
        store.clone(),
        Arc::clone(&bridge) as Arc<dyn TemplateProvider>,
        Arc::clone(&bridge) as Arc<dyn Notifier>,
        policy,
    );

    match command {
        Commands::Start => unreachable!("handled by run_start"),
        Commands::Send {
            channel,
            to,
            body,
            template,
            params,
            at,
        } => {
            let channel = Channel::parse(&channel)
                .map_err(|e| anyhow::anyhow!("{e} (expected sms or chat)"))?;
            let message = service
                .enqueue(NewMessage {
                    channel,
                    destination: to,
                    body,
                    scheduled_at: at,
                    template_id: template,
                    params: params.into_iter().collect::<BTreeMap<_, _>>(),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        Commands::Retry { id } => match service.retry(id).await? {
            RetryOutcome::Rescheduled { due } => println!("rescheduled for {due}"),
            RetryOutcome::Declined { reason } => println!("declined: {reason}"),
        },
        Commands::Status { id: Some(id) } => {
            let message = service.message(id).await?;
            let events = service.events(id).await?;
            println!("{}", serde_json::to_string_pretty(&message)?);
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Commands::Status { id: None } => {
            let stats = service.queue_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Template { command } => match command {
            TemplateCommands::Create { name, body } => {
                let template = service.create_template(&name, &body).await?;
                println!("{}", serde_json::to_string_pretty(&template)?);
            }
            TemplateCommands::Submit { id, by } => {
                let template = service.submit_template(id, &by).await?;
                println!("{}", serde_json::to_string_pretty(&template)?);
            }
            TemplateCommands::Review {
                id,
                reviewer,
                accept,
                decline,
                comments,
            } => {
                if accept == decline {
                    anyhow::bail!("pass exactly one of --accept or --decline");
                }
                let template = service
                    .review_template(id, &reviewer, accept, comments.as_deref())
                    .await?;
                println!("{}", serde_json::to_string_pretty(&template)?);
            }
            TemplateCommands::Archive { id } => {
                let template = service.archive_template(id).await?;
                println!("{}", serde_json::to_string_pretty(&template)?);
            }
            TemplateCommands::Delete { id } => {
                service.delete_template(id).await?;
                println!("deleted {id}");
            }
            TemplateCommands::Show { id } => {
                let template = service.template(id).await?;
                println!("{}", serde_json::to_string_pretty(&template)?);
            }
        },
    }

    store.close().await;
    Ok(())
}
