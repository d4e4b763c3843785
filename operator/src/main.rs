//! Controller is a long lived process that converges cluster state toward
//! declared LoadTest resources.
#![deny(missing_docs)]
use std::{sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use kangal_common::telemetry;
use kangal_operator::{
    backends::{ghz::GhzBackend, Registry},
    config::{parse_key_value_pairs, parse_tolerations, Config},
    controller::Controller,
    loadtest::ImageDetails,
    metrics::MetricsReporter,
    utils::build_client_config,
};
use kube::Client;
use opentelemetry::global::{shutdown_meter_provider, shutdown_tracer_provider};
use opentelemetry::metrics::MeterProvider as _;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "KANGAL_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    #[arg(long, env = "KANGAL_PROM_BIND", default_value = "0.0.0.0:9464")]
    prom_bind: String,

    /// Per-reconcile deadline.
    #[arg(long, env = "SYNC_HANDLER_TIMEOUT", default_value = "2m", value_parser = humantime::parse_duration)]
    sync_handler_timeout: Duration,

    /// Age after which finished or errored loadtests are deleted; 0 disables.
    #[arg(long, env = "CLEANUP_THRESHOLD", default_value = "1h", value_parser = humantime::parse_duration)]
    cleanup_threshold: Duration,

    /// Base URL of the kangal proxy, used to build report links.
    #[arg(long, env = "KANGAL_PROXY_URL", default_value = "")]
    kangal_proxy_url: String,

    /// (optional) Absolute path to the kubeConfig file. Only required if out-of-cluster.
    #[arg(long, default_value = "")]
    kubeconfig: String,

    /// The address of the Kubernetes API server. Overrides any value in
    /// kubeConfig. Only required if out-of-cluster.
    #[arg(long, default_value = "")]
    master_url: String,

    /// Request timeout for the Kubernetes client.
    #[arg(long, env = "KUBE_CLIENT_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    kube_client_timeout: Duration,

    /// label will be attached to the loadtest namespace (key:value, repeatable)
    #[arg(long = "namespace-label")]
    namespace_labels: Vec<String>,

    /// annotation will be attached to the loadtest namespace (key:value, repeatable)
    #[arg(long = "namespace-annotation")]
    namespace_annotations: Vec<String>,

    /// annotation will be attached to the loadtest pods (key:value, repeatable)
    #[arg(long = "pod-annotation")]
    pod_annotations: Vec<String>,

    /// nodeSelector rules will be attached to the loadtest pods (key:value, repeatable)
    #[arg(long = "node-selector")]
    node_selectors: Vec<String>,

    /// toleration rules to be applied to the loadtest pods
    /// (key:operator:value:effect, repeatable)
    #[arg(long = "tolerations")]
    tolerations: Vec<String>,

    /// Default image repository for ghz jobs, used when a loadtest does not
    /// declare a masterConfig.
    #[arg(long, env = "GHZ_IMAGE", default_value = "hellofresh/kangal-ghz")]
    ghz_image: String,

    /// Default image tag for ghz jobs.
    #[arg(long, env = "GHZ_IMAGE_TAG", default_value = "latest")]
    ghz_image_tag: String,

    /// Number of concurrent reconcile workers.
    #[arg(long, env = "KANGAL_WORKERS", default_value = "5")]
    workers: usize,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the controller against the k8s infrastructure
    #[command(alias = "c")]
    Controller,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_log::LogTracer::init()?;

    let args = Cli::parse();
    telemetry::init_tracing(args.otlp_endpoint.clone()).await?;
    let (metrics_provider, metrics_server_shutdown, metrics_server_join) =
        telemetry::init_metrics_prom(&args.prom_bind.parse()?).await?;

    match args.command {
        Command::Controller => {
            let cfg = build_config(&args)?;
            let kube_cfg = build_client_config(
                &cfg.master_url,
                &cfg.kube_config,
                cfg.kube_client_timeout,
            )
            .await
            .context("error building kubeConfig")?;
            let client = Client::try_from(kube_cfg).context("error building kubernetes client")?;

            let mut registry = Registry::new();
            registry.register(Arc::new(GhzBackend::new(client.clone(), &cfg).with_image(
                ImageDetails::new(args.ghz_image.clone(), args.ghz_image_tag.clone()),
            )));

            let metrics = MetricsReporter::new(metrics_provider.meter("controller"));
            let controller = Controller::new(cfg, client, registry, metrics);
            controller
                .run(args.workers, async {
                    tokio::signal::ctrl_c().await.ok();
                    info!("received interrupt, shutting down");
                })
                .await?;
        }
    };

    // Shutdown the metrics server
    let _ = metrics_server_shutdown.send(());
    metrics_server_join.await??;

    // Flush traces and metrics before shutdown
    shutdown_tracer_provider();
    metrics_provider.force_flush()?;
    drop(metrics_provider);
    shutdown_meter_provider();

    Ok(())
}

fn build_config(args: &Cli) -> Result<Config> {
    Ok(Config {
        sync_handler_timeout: args.sync_handler_timeout,
        clean_up_threshold: args.cleanup_threshold,
        kangal_proxy_url: args.kangal_proxy_url.clone(),
        namespace_labels: parse_key_value_pairs(&args.namespace_labels)
            .context("failed to convert namespace labels")?,
        namespace_annotations: parse_key_value_pairs(&args.namespace_annotations)
            .context("failed to convert namespace annotations")?,
        pod_annotations: parse_key_value_pairs(&args.pod_annotations)
            .context("failed to convert pod annotations")?,
        node_selectors: parse_key_value_pairs(&args.node_selectors)
            .context("failed to convert node selectors")?,
        tolerations: parse_tolerations(&args.tolerations)
            .context("failed to convert tolerations")?,
        master_url: args.master_url.clone(),
        kube_config: args.kubeconfig.clone(),
        kube_client_timeout: args.kube_client_timeout,
    })
}
