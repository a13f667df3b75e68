use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use berth_apply::{PruneOnFailure, Reconciler, UpdateOptions};
use berth_kubehub::KubeCluster;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "berthctl", version, about = "Apply, update and wait on Kubernetes manifest bundles")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for objects that do not name one
    #[arg(long = "ns", global = true, env = "BERTH_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Prune { Skip, Continue }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create every object of a manifest
    Create {
        /// Manifest file, `-` for stdin
        file: String,
        /// Wait until the objects are ready
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        /// Wait timeout in seconds
        #[arg(long = "timeout", default_value_t = 300)]
        timeout: u64,
    },
    /// Move the cluster from the original manifest to the target manifest
    Update {
        original: String,
        target: String,
        /// Delete and recreate objects whose patch is rejected
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
        /// Restart the pods of patched controllers
        #[arg(long = "recreate-pods", action = ArgAction::SetTrue)]
        recreate_pods: bool,
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        #[arg(long = "timeout", default_value_t = 300)]
        timeout: u64,
        /// Whether dropped objects are still deleted when a patch failed
        #[arg(long = "prune-on-failure", value_enum, default_value_t = Prune::Skip)]
        prune_on_failure: Prune,
    },
    /// Delete every object of a manifest
    Delete { file: String },
    /// Watch each object until its milestone (Jobs: completion)
    Watch {
        file: String,
        /// Seconds; 0 waits forever
        #[arg(long = "timeout", default_value_t = 0)]
        timeout: u64,
    },
    /// Poll the objects of a manifest until they are ready
    Wait {
        file: String,
        #[arg(long = "timeout", default_value_t = 300)]
        timeout: u64,
    },
    /// Wait for a hook pod to finish and print its phase
    PodPhase {
        file: String,
        #[arg(long = "timeout", default_value_t = 0)]
        timeout: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("BERTH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BERTH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid BERTH_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_manifest(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("reading manifest from stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("reading manifest {}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_str();

    let cluster = KubeCluster::try_default().await?;
    let reconciler = Reconciler::new(Arc::new(cluster));

    match cli.command {
        Commands::Create { file, wait, timeout } => {
            info!(file = %file, ns = %ns, "create invoked");
            let manifest = read_manifest(&file)?;
            let wait = wait.then(|| Duration::from_secs(timeout));
            reconciler.create(ns, &manifest, wait).await?;
        }
        Commands::Update { original, target, force, recreate_pods, wait, timeout, prune_on_failure } => {
            info!(original = %original, target = %target, ns = %ns, "update invoked");
            let original = read_manifest(&original)?;
            let target = read_manifest(&target)?;
            let opts = UpdateOptions {
                force,
                recreate_pods,
                wait,
                timeout: Duration::from_secs(timeout),
                prune_on_failure: match prune_on_failure {
                    Prune::Skip => PruneOnFailure::Skip,
                    Prune::Continue => PruneOnFailure::Continue,
                },
            };
            reconciler.update(ns, &original, &target, &opts).await?;
        }
        Commands::Delete { file } => {
            info!(file = %file, ns = %ns, "delete invoked");
            reconciler.delete(ns, &read_manifest(&file)?).await?;
        }
        Commands::Watch { file, timeout } => {
            reconciler.watch_until_ready(ns, &read_manifest(&file)?, Duration::from_secs(timeout)).await?;
        }
        Commands::Wait { file, timeout } => {
            reconciler.wait(ns, &read_manifest(&file)?, Duration::from_secs(timeout)).await?;
        }
        Commands::PodPhase { file, timeout } => {
            let phase = reconciler
                .wait_and_get_completed_pod_phase(ns, &read_manifest(&file)?, Duration::from_secs(timeout))
                .await?;
            match cli.output {
                Output::Human => println!("{}", phase),
                Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "phase": phase }))?),
            }
        }
    }
    Ok(())
}
