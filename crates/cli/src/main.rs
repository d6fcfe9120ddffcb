//! `sqs-bindings` entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: load the TOML file, resolve `%NAME%` settings,
//!    and validate every trigger and route before anything starts.
//! 2. **Wire observability**: JSON logs, plus OTLP export when
//!    `OTEL_EXPORTER_OTLP_ENDPOINT` is set (see [`observability`]).
//! 3. **Construct infrastructure**: one [`SqsClient`] per queue, one shared
//!    HTTP client, the webhook registry, and the health registry.
//! 4. **Run until signalled**: on Ctrl-C or SIGTERM, stop accepting webhook
//!    deliveries, cancel every loop, and wait for in-flight handlers up to the
//!    drain timeout.
//!
//! ## Commands
//!
//! | Command | Purpose |
//! |---------|---------|
//! | `run --config <path>` | Start every queue trigger and webhook route |
//! | `send --queue-url <url> --body <text>` | Send one message (output binding) |
//! | `check-config --config <path>` | Validate a configuration file and exit |

mod config;
mod forward;
mod observability;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use binding::{resolve_setting, OutputOptions, QueueOutput};
use clap::{Parser, Subcommand};
use listener::webhook::{router, serve};
use listener::{
    ConfirmationPolicy, HealthRegistry, HmacSignatureValidator, HttpConfirmer, PollLoop,
    SharedSecretValidator, ShutdownCoordinator, WebhookRegistration, WebhookRegistry,
};
use sqs::{Credentials, SqsClient, SqsClientBuilder};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::{AwsConfig, Config, ValidatorConfig};

const DEFAULT_CONFIG: &str = "sqs-bindings.toml";

#[derive(Parser)]
#[command(name = "sqs-bindings")]
#[command(version, about = "Queue triggers and webhook dispatch for function hosts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every configured queue trigger and webhook route until signalled
    Run {
        /// Path to the configuration file
        #[arg(long, short, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Send one message to a queue
    Send {
        /// Queue URL, or a %NAME% environment reference
        #[arg(long)]
        queue_url: String,

        /// Message body, sent verbatim
        #[arg(long)]
        body: String,

        /// Signing region (default: from the queue URL or environment)
        #[arg(long)]
        region: Option<String>,

        /// Endpoint override, e.g. a local emulator
        #[arg(long)]
        endpoint: Option<String>,

        /// Delivery delay in seconds (0-900)
        #[arg(long, default_value_t = 0)]
        delay_seconds: u32,

        /// Message group id (FIFO queues)
        #[arg(long)]
        message_group_id: Option<String>,

        /// Let a FIFO queue deduplicate on content instead of a generated id
        #[arg(long)]
        content_based_deduplication: bool,
    },

    /// Validate a configuration file and exit
    CheckConfig {
        /// Path to the configuration file
        #[arg(long, short, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = observability::init()?;

    let result = match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Send {
            queue_url,
            body,
            region,
            endpoint,
            delay_seconds,
            message_group_id,
            content_based_deduplication,
        } => {
            let options = OutputOptions {
                delay_seconds,
                message_group_id,
                use_content_based_deduplication: content_based_deduplication,
            };
            send(&queue_url, &body, region, endpoint, options).await
        }
        Command::CheckConfig { config } => check_config(&config),
    };

    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "exiting with error");
    }
    telemetry.shutdown();
    result
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn run(path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    let http = reqwest::Client::new();
    let coordinator = ShutdownCoordinator::new(config.drain_timeout());
    let health = HealthRegistry::new();
    let credentials = explicit_credentials(&config.aws);

    for queue in &config.queues {
        let name = queue.trigger_name()?;
        let client = client_builder(&queue.trigger.source, &config.aws, credentials.clone())
            .http_client(http.clone())
            .build()
            .with_context(|| format!("queue {name}"))?;
        let handler = forward::build_handler(&queue.handler, &http)
            .with_context(|| format!("queue {name}"))?;

        let poll = PollLoop::new(name.clone(), queue.trigger.clone(), Arc::new(client), handler)?;
        health.insert(poll.monitor());
        coordinator.spawn(poll.run(coordinator.signal()));
        info!(trigger = %name, queue = %queue.trigger.source, "queue trigger started");
    }

    let confirmer = HttpConfirmer::new(http.clone(), ConfirmationPolicy::default());
    let registry = Arc::new(WebhookRegistry::with_confirmer(Arc::new(confirmer)));
    for webhook in &config.webhooks {
        let route = webhook.route_name()?;
        let handler = forward::build_handler(&webhook.handler, &http)
            .with_context(|| format!("webhook {route}"))?;
        let mut registration = WebhookRegistration::new(handler)
            .with_projection(webhook.projection)
            .with_timeout(webhook.timeout());
        registration = match &webhook.validator {
            ValidatorConfig::None => registration,
            ValidatorConfig::SharedSecret { header, secret } => registration
                .with_validator(Arc::new(SharedSecretValidator::new(header, secret.as_str())?)),
            ValidatorConfig::HmacSha256 { header, secret } => registration
                .with_validator(Arc::new(HmacSignatureValidator::new(header, secret.as_str())?)),
        };
        registry.register(route.clone(), registration)?;
        info!(%route, "webhook route registered");
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    let mut server = coordinator.spawn(serve(
        listener,
        router(Arc::clone(&registry), health),
        coordinator.signal(),
    ));

    tokio::select! {
        signalled = shutdown_requested() => signalled?,
        joined = &mut server => match joined {
            Ok(Ok(())) => warn!("webhook server stopped unexpectedly"),
            Ok(Err(err)) => error!(error = %err, "webhook server failed"),
            Err(err) => error!(error = %err, "webhook server task panicked"),
        },
    }

    registry.close();
    if !coordinator.shutdown().await {
        warn!("some handlers were abandoned; their messages will be redelivered");
    }
    Ok(())
}

async fn shutdown_requested() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
        tokio::select! {
            ctrl_c = tokio::signal::ctrl_c() => ctrl_c.context("failed while waiting for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed while waiting for ctrl-c")?;

    info!("shutdown signal received");
    Ok(())
}

// ---------------------------------------------------------------------------
// send
// ---------------------------------------------------------------------------

async fn send(
    queue_url: &str,
    body: &str,
    region: Option<String>,
    endpoint: Option<String>,
    options: OutputOptions,
) -> Result<()> {
    let queue_url = resolve_setting("queue_url", queue_url)?;
    let aws = AwsConfig {
        region,
        endpoint,
        ..AwsConfig::default()
    };
    let client = client_builder(&queue_url, &aws, None).build()?;
    let output = QueueOutput::new(Arc::new(client), options)?;

    match output.send(body).await? {
        Some(id) => println!("{id}"),
        None => info!("nothing sent"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// check-config
// ---------------------------------------------------------------------------

fn check_config(path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    for queue in &config.queues {
        println!("queue    {:<24} {}", queue.name, queue.trigger.source);
    }
    for webhook in &config.webhooks {
        println!("webhook  {:<24} POST /webhooks/{}", webhook.route, webhook.route);
    }
    println!(
        "ok: {} queue trigger(s), {} webhook route(s), listening on {}",
        config.queues.len(),
        config.webhooks.len(),
        config.server.bind
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn explicit_credentials(aws: &AwsConfig) -> Option<Credentials> {
    let (Some(id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) else {
        return None;
    };
    let credentials = Credentials::new(id, secret);
    Some(match &aws.session_token {
        Some(token) => credentials.with_session_token(token),
        None => credentials,
    })
}

fn client_builder(
    queue_url: &str,
    aws: &AwsConfig,
    credentials: Option<Credentials>,
) -> SqsClientBuilder {
    let mut builder = SqsClient::builder(queue_url);
    if let Some(region) = &aws.region {
        builder = builder.region(region);
    }
    if let Some(endpoint) = &aws.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(credentials) = credentials {
        builder = builder.credentials(credentials);
    }
    builder
}
