//! # jetlink CLI
//!
//! Command-line front end for the jetlink integration layer. This is the
//! composition root: it loads configuration, builds the shared breaker
//! registry, cache registry and logger once, and wires them into the
//! orchestrator and monitor.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jetlink_runtime::{
    ApolloClient, AvinodeClient, CircuitBreakerManager, IntegrationConfig, IntegrationLogger,
    IntegrationRequest, MultiTierCacheManager, N8nWebhook, ResilientOrchestrator, ServiceMonitor,
    StreamChunk,
};

#[derive(Parser, Debug)]
#[command(name = "jetlink")]
#[command(about = "Resilient integration layer for the JetVision agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Answer a query through the fallback tiers
    Ask {
        query: String,

        /// Session to continue
        #[arg(short, long)]
        session: Option<String>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream an answer fragment by fragment
    Stream {
        query: String,

        #[arg(short, long)]
        session: Option<String>,
    },

    /// Probe every tier and print a health report
    Status,

    /// Run the service monitor
    Monitor {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Print the effective configuration
    Config,
}

/// Long-lived components shared by every subcommand.
struct Runtime {
    config: IntegrationConfig,
    breakers: Arc<CircuitBreakerManager>,
    caches: Arc<MultiTierCacheManager>,
    logger: Arc<IntegrationLogger>,
}

impl Runtime {
    fn new(config: IntegrationConfig) -> Self {
        let breakers = Arc::new(CircuitBreakerManager::with_overrides(
            config.circuit_breakers.clone(),
        ));
        let caches = Arc::new(MultiTierCacheManager::with_policies(config.cache.policies()));
        caches.start_sweeper(config.cache.sweep_interval);
        let logger = Arc::new(match config.log_capacity {
            Some(capacity) => IntegrationLogger::new(capacity),
            None => IntegrationLogger::default(),
        });

        Self {
            config,
            breakers,
            caches,
            logger,
        }
    }

    fn orchestrator(&self) -> Result<Arc<ResilientOrchestrator>> {
        let webhook = N8nWebhook::new(&self.config.webhook).context("building webhook client")?;
        let apollo = ApolloClient::new(&self.config.apollo, &self.breakers, &self.caches)
            .context("building Apollo client")?;
        let avinode = AvinodeClient::new(&self.config.avinode, &self.breakers, &self.caches)
            .context("building Avinode client")?;

        let orchestrator = ResilientOrchestrator::builder()
            .primary(Arc::new(webhook))
            .direct(Arc::new(apollo))
            .direct(Arc::new(avinode))
            .breakers(Arc::clone(&self.breakers))
            .caches(Arc::clone(&self.caches))
            .logger(Arc::clone(&self.logger))
            .config(self.config.orchestrator.clone())
            .build()?;
        Ok(Arc::new(orchestrator))
    }

    fn monitor(&self) -> Arc<ServiceMonitor> {
        Arc::new(ServiceMonitor::new(
            Arc::clone(&self.breakers),
            Arc::clone(&self.logger),
            self.config.monitor.clone(),
        ))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.caches.stop_sweeper();
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<IntegrationConfig> {
    let config = match path {
        Some(path) => IntegrationConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IntegrationConfig::default(),
    };
    Ok(config.apply_env()?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Config => {
            let mut shown = config;
            for partner in [&mut shown.apollo, &mut shown.avinode] {
                if partner.api_key.is_some() {
                    partner.api_key = Some("[REDACTED]".to_string());
                }
            }
            print!("{}", serde_yaml::to_string(&shown)?);
        }

        Commands::Ask {
            query,
            session,
            json,
        } => {
            let runtime = Runtime::new(config);
            let orchestrator = runtime.orchestrator()?;

            let mut request = IntegrationRequest::new(query);
            if let Some(session) = session {
                request = request.with_session(session);
            }
            let response = orchestrator.generate(request).await;

            if json {
                print_json(&response)?;
            } else {
                println!("{}", response.content);
                eprintln!(
                    "[{}{}] {}ms",
                    response.source,
                    if response.stale { ", stale" } else { "" },
                    response.response_time_ms
                );
            }
            orchestrator.destroy();
        }

        Commands::Stream { query, session } => {
            let runtime = Runtime::new(config);
            let orchestrator = runtime.orchestrator()?;

            let mut request = IntegrationRequest::new(query);
            if let Some(session) = session {
                request = request.with_session(session);
            }

            let mut chunks = orchestrator.stream(request);
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    StreamChunk::Text(text) => print!("{}", text),
                    StreamChunk::Done(summary) => {
                        println!();
                        eprintln!("[{}] {}ms", summary.source, summary.response_time_ms);
                    }
                }
            }
            orchestrator.destroy();
        }

        Commands::Status => {
            let runtime = Runtime::new(config);
            let orchestrator = runtime.orchestrator()?;
            orchestrator.check_health().await;
            print_json(&orchestrator.health_report().await)?;
            orchestrator.destroy();
        }

        Commands::Monitor { once } => {
            let runtime = Runtime::new(config);
            let orchestrator = runtime.orchestrator()?;
            let monitor = runtime.monitor();

            if once {
                orchestrator.check_health().await;
                monitor.check_now();
                print_json(&monitor.health_report())?;
                orchestrator.destroy();
                return Ok(());
            }

            orchestrator.start_health_checks();
            monitor.start();
            tracing::info!("Monitoring; press Ctrl-C to stop");

            let mut ticker = tokio::time::interval(
                runtime.config.monitor.check_interval.max(Duration::from_secs(1)),
            );
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        let report = monitor.health_report();
                        tracing::info!(
                            system_health = %report.system_health,
                            active_alerts = report.active_alerts.len(),
                            open_circuits = ?report.open_circuits,
                            "Monitor status"
                        );
                    }
                }
            }

            monitor.stop();
            orchestrator.destroy();
        }
    }

    Ok(())
}
