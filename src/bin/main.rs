use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use eks_orchestrator::{
    ClusterConfig, ClusterDescriptor, ClusterName, CommandContext, CommandOutcome, InMemoryCloud,
    LeafOutcome, Orchestrator, Region, ResourceDescriptor, ResourceKind, ResourceName, Settings,
    resolve_config_path,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eko")]
#[command(about = "Create and reconcile managed Kubernetes clusters")]
struct Cli {
    /// Simulated cloud state, loaded before and saved after every command
    #[arg(long, global = true, env = "EKO_STATE", default_value = ".eko-state.json")]
    state: PathBuf,
    /// Region used by commands that take no config file
    #[arg(long, global = true, env = "EKO_REGION", default_value = "us-west-2")]
    region: String,
    /// Override the poll interval of every wait
    #[arg(long, global = true)]
    poll_interval_secs: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge a cluster's resources on a config file
    Apply {
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Print the plan and task tree without changing anything
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Create the network, control plane and resources of a new cluster
    CreateCluster {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Delete a cluster and everything in it
    DeleteCluster {
        #[arg(long)]
        name: String,
    },
    DeleteNodegroup {
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        name: String,
    },
    /// List clusters or the resources of one cluster
    Get {
        #[arg(value_enum)]
        kind: GetKind,
        #[arg(long)]
        cluster: Option<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum GetKind {
    Clusters,
    Nodegroups,
    Fargateprofiles,
    Addons,
    Iamserviceaccounts,
}

impl GetKind {
    fn resource_kind(self) -> Option<ResourceKind> {
        match self {
            Self::Clusters => None,
            Self::Nodegroups => Some(ResourceKind::NodeGroup),
            Self::Fargateprofiles => Some(ResourceKind::FargateProfile),
            Self::Addons => Some(ResourceKind::Addon),
            Self::Iamserviceaccounts => Some(ResourceKind::ServiceAccount),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("eks_orchestrator=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling in-flight work");
                cancel.cancel();
            }
        });
    }

    let mut settings = Settings::default();
    if let Some(secs) = cli.poll_interval_secs {
        settings.poll_interval = Duration::from_secs(secs);
    }

    let cloud = Arc::new(InMemoryCloud::load(&cli.state).await?);
    let runner = Runner {
        cloud: cloud.clone(),
        region: Region::new(cli.region),
        settings,
        cancel,
    };
    let result = runner.run(cli.command).await;

    cloud.save(&cli.state).await?;
    info!("state saved to {}", cli.state.display());
    result
}

struct Runner {
    cloud: Arc<InMemoryCloud>,
    region: Region,
    settings: Settings,
    cancel: CancellationToken,
}

impl Runner {
    fn orchestrator(&self, cluster: ClusterName, region: Region) -> Orchestrator {
        let ctx = CommandContext::new(cluster, region, self.cloud.clone(), self.cloud.clone())
            .with_settings(self.settings.clone())
            .with_cancel(self.cancel.clone());
        Orchestrator::new(ctx)
    }

    async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Apply { file, dry_run } => {
                let config = load_config(file)?;
                let orchestrator =
                    self.orchestrator(config.metadata.name.clone(), config.metadata.region.clone());
                let outcome = orchestrator.apply(&config, dry_run).await?;
                if dry_run {
                    println!("{}", outcome.plan);
                    println!("\n{}", outcome.tree);
                    return Ok(());
                }
                finish(outcome)
            }
            Commands::CreateCluster { file } => {
                let config = load_config(file)?;
                let orchestrator =
                    self.orchestrator(config.metadata.name.clone(), config.metadata.region.clone());
                finish(orchestrator.create_cluster(&config).await?)
            }
            Commands::DeleteCluster { name } => {
                let orchestrator = self.orchestrator(ClusterName::new(name), self.region.clone());
                finish(orchestrator.delete_cluster().await?)
            }
            Commands::DeleteNodegroup { cluster, name } => {
                let orchestrator = self.orchestrator(ClusterName::new(cluster), self.region.clone());
                finish(orchestrator.delete_nodegroup(&ResourceName::new(name)).await?)
            }
            Commands::Get {
                kind,
                cluster,
                output,
            } => self.get(kind, cluster, output).await,
        }
    }

    async fn get(&self, kind: GetKind, cluster: Option<String>, output: OutputFormat) -> Result<()> {
        let Some(resource_kind) = kind.resource_kind() else {
            let orchestrator =
                self.orchestrator(ClusterName::new(cluster.unwrap_or_default()), self.region.clone());
            let clusters = orchestrator.get_clusters().await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&clusters)?),
                OutputFormat::Table => print_clusters(&clusters),
            }
            return Ok(());
        };

        let cluster = cluster
            .ok_or_else(|| anyhow::anyhow!("--cluster is required to list cluster resources"))?;
        let orchestrator = self.orchestrator(ClusterName::new(cluster), self.region.clone());
        let resources = orchestrator.get(resource_kind).await?;
        match output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            OutputFormat::Table => print_resources(&resources),
        }
        Ok(())
    }
}

fn load_config(file: Option<PathBuf>) -> Result<ClusterConfig> {
    let path = resolve_config_path(file)?;
    info!("using config {}", path.display());
    ClusterConfig::load(&path)
}

/// Print the plan and per-leaf outcomes, then surface the run's error.
fn finish(outcome: CommandOutcome) -> Result<()> {
    println!("{}", outcome.plan);
    if let Some(report) = &outcome.report {
        for record in &report.records {
            let label = match &record.outcome {
                LeafOutcome::Succeeded => "done",
                LeafOutcome::Failed(_) => "failed",
                LeafOutcome::Skipped(_) => "skipped",
                LeafOutcome::Unresolved => "unresolved",
            };
            println!("[{:>10}] {}", label, record.description);
        }
    }
    outcome.into_result()?;
    Ok(())
}

fn print_clusters(clusters: &[ClusterDescriptor]) {
    println!("{:<32} {:<14} {:<8} STACK", "NAME", "STATUS", "VERSION");
    for c in clusters {
        let owner = c.owner.as_ref().map(|s| s.as_str()).unwrap_or("-");
        println!(
            "{:<32} {:<14} {:<8} {}",
            c.name.as_str(),
            c.status.to_string(),
            c.version,
            owner
        );
    }
}

fn print_resources(resources: &[ResourceDescriptor]) {
    println!("{:<40} {:<14} {:<48} DETAILS", "NAME", "STATUS", "STACK");
    for r in resources {
        let owner = r.owner.as_ref().map(|s| s.as_str()).unwrap_or("-");
        println!(
            "{:<40} {:<14} {:<48} {}",
            r.name.as_str(),
            r.status.to_string(),
            owner,
            r.summary
        );
    }
}
