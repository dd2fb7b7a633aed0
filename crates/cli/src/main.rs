use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use korda_api::{definition_gvk, preview_report, read_definition, start_definition_controller, Engine, Limits};
use korda_core::{meta, Definition, ObjectKey};
use korda_kubehub::{KubeRegistrar, KubeStore};
use korda_runtime::RuntimeConfig;
use korda_store::ResourceStore;
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kordactl", version, about = "Korda: composite resource graphs for Kubernetes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Reject definition files larger than this
    #[arg(long = "max-yaml-bytes", env = "KORDA_MAX_YAML_BYTES", global = true, default_value_t = 1024 * 1024)]
    max_yaml_bytes: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update an object in the cluster
    Create {
        #[command(subcommand)]
        what: CreateWhat,
    },
    /// Compile a definition file and print its graph and derived CRD
    Build { file: PathBuf },
    /// Offline preview between two versions of a definition file
    Preview { old: PathBuf, new: PathBuf },
    /// Run the operator against the current kube context
    Run(RunArgs),
}

#[derive(Subcommand, Debug)]
enum CreateWhat {
    /// ResourceGraphDefinition from a YAML or JSON file
    Rgd {
        file: PathBuf,
        /// Print what would change without writing
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Workers per controller
    #[arg(long, env = "KORDA_WORKERS")]
    workers: Option<usize>,
    /// Seconds to wait for in-flight passes when a controller stops
    #[arg(long = "drain-timeout-secs", env = "KORDA_DRAIN_TIMEOUT_SECS")]
    drain_timeout_secs: Option<u64>,
    /// Periodic resync interval in seconds (0 disables)
    #[arg(long = "resync-secs", env = "KORDA_RESYNC_SECS")]
    resync_secs: Option<u64>,
    /// Delete derived CRDs when their definition is deleted
    #[arg(long = "allow-crd-deletion", env = "KORDA_ALLOW_CRD_DELETION", action = ArgAction::SetTrue)]
    allow_crd_deletion: bool,
}

impl RunArgs {
    fn config(&self) -> RuntimeConfig {
        let mut cfg = RuntimeConfig::from_env();
        if let Some(w) = self.workers { cfg.workers = w.max(1); }
        if let Some(s) = self.drain_timeout_secs { cfg.drain_timeout = Duration::from_secs(s); }
        if let Some(s) = self.resync_secs { cfg.resync = Duration::from_secs(s); }
        cfg.allow_crd_deletion |= self.allow_crd_deletion;
        cfg
    }
}

fn init_tracing() {
    let env = std::env::var("KORDA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KORDA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KORDA_METRICS_ADDR; expected host:port");
        }
    }
}

async fn create_rgd(file: &Path, dry_run: bool, limits: Limits) -> Result<()> {
    let def = read_definition(file, limits)?;
    let store = KubeStore::try_default().await?;
    let gvk = definition_gvk();
    let key = ObjectKey::new(None, def.name.clone());
    let existing = store.get(&gvk, &key).await.with_context(|| format!("fetching ResourceGraphDefinition {}", def.name))?;

    if dry_run {
        let existing = existing.map(Definition::from_value).transpose().context("parsing stored definition")?;
        println!("{}", preview_report(&def, existing.as_ref())?);
        return Ok(());
    }

    let mut body = def.raw.clone();
    body["apiVersion"] = json!(gvk.api_version());
    match existing {
        Some(current) => {
            let rv = meta::resource_version(&current).unwrap_or_default().to_string();
            if let Some(m) = meta::metadata_mut(&mut body) {
                m.insert("resourceVersion".into(), json!(rv));
            }
            store.update(&gvk, &body, &rv).await.with_context(|| format!("updating ResourceGraphDefinition {}", def.name))?;
            println!("Updated ResourceGraphDefinition: {}", def.name);
        }
        None => {
            store.create(&gvk, &body).await.with_context(|| format!("creating ResourceGraphDefinition {}", def.name))?;
            println!("Created ResourceGraphDefinition: {}", def.name);
        }
    }
    Ok(())
}

fn build(file: &Path, output: Output, limits: Limits) -> Result<()> {
    let def = read_definition(file, limits)?;
    let graph = korda_graph::build(&def)?;
    let deps: BTreeMap<&str, Vec<&str>> =
        graph.forward().map(|n| (n.id.as_str(), n.dependencies.iter().map(String::as_str).collect())).collect();
    let crd = graph.schema.crd()?;
    match output {
        Output::Human => {
            println!("definition: {}", graph.name);
            println!("serves: {}", graph.gvk);
            println!("order: {}", graph.order().join(" -> "));
            println!("dependencies:");
            for (id, d) in &deps {
                let d = if d.is_empty() { "(none)".to_string() } else { d.join(", ") };
                println!("  {}: {}", id, d);
            }
            println!("---");
            print!("{}", serde_yaml::to_string(&crd)?);
        }
        Output::Json => {
            let doc = json!({
                "name": graph.name,
                "gvk": graph.gvk.to_string(),
                "order": graph.order(),
                "dependencies": deps,
                "crd": crd,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

fn preview(old: &Path, new: &Path, limits: Limits) -> Result<()> {
    let old = read_definition(old, limits)?;
    let new = read_definition(new, limits)?;
    let diffs = korda_graph::preview(&new, Some(&old))?;
    print!("{}", korda_delta::render_report(&diffs));
    Ok(())
}

async fn run(args: &RunArgs) -> Result<()> {
    let cfg = args.config();
    let store = Arc::new(KubeStore::try_default().await?);
    let registrar = Arc::new(KubeRegistrar::new(store.client()));
    let engine = Arc::new(Engine::new(store, registrar, cfg.clone()));
    engine.install_definition_type().await.context("installing the ResourceGraphDefinition CRD")?;

    let controller = start_definition_controller(Arc::clone(&engine), &cfg);
    if !controller.running().await {
        warn!("definition controller stopped before its first listing");
    }
    info!(workers = cfg.workers, resync_secs = cfg.resync.as_secs(), "korda running");

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    if let Err(e) = controller.stop(cfg.drain_timeout).await {
        warn!(error = %e, "definition controller drain");
    }
    engine.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let limits = Limits { max_bytes: cli.max_yaml_bytes, ..Limits::from_env() };

    let res = match &cli.command {
        Commands::Create { what: CreateWhat::Rgd { file, dry_run } } => create_rgd(file, *dry_run, limits).await,
        Commands::Build { file } => build(file, cli.output, limits),
        Commands::Preview { old, new } => preview(old, new, limits),
        Commands::Run(args) => run(args).await,
    };
    if let Err(e) = &res {
        error!(error = ?e, "command failed");
    }
    res
}
