#![warn(missing_docs)]

//! sqltee-check: validates a tee topology file and prints filter diagnostics

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use sqltee::{
    spawn_reclaimer, ClientInfo, Deployment, DiscardRouter, Downstream, OrphanRegistry, Packet,
    Router, SessionContext, TopologyConfig, Upstream,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sqltee-check")]
#[command(about = "Checks a tee filter topology", long_about = None)]
struct Cli {
    /// Topology file
    #[arg(env = "SQLTEE_TOPOLOGY", default_value = "/etc/sqltee/topology.toml")]
    topology: PathBuf,

    /// Print diagnostics as JSON
    #[arg(long)]
    json: bool,

    /// Open one session per pipeline and route this statement through it
    #[arg(long)]
    sample: Option<String>,

    /// Orphan reclaim period in milliseconds
    #[arg(long, default_value = "100")]
    reclaim_ms: u64,
}

struct Discard;

impl Downstream for Discard {
    fn route_query(&self, _packet: Packet) -> sqltee::Result<()> {
        Ok(())
    }
}

impl Upstream for Discard {
    fn client_reply(&self, _reply: Packet) -> sqltee::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::info!("checking topology {}", cli.topology.display());

    let config = TopologyConfig::load(&cli.topology)?;
    let orphans = OrphanRegistry::shared();
    let reclaimer = spawn_reclaimer(Arc::clone(&orphans), Duration::from_millis(cli.reclaim_ms));
    let deployment = Deployment::build(&config, Arc::clone(&orphans), |_| {
        Arc::new(DiscardRouter::new()) as Arc<dyn Router>
    })?;

    let looping = deployment.looping_services();
    for service in &looping {
        tracing::error!("{}: Recursive use of tee filter in service.", service);
    }

    if let Some(sql) = &cli.sample {
        route_sample(&deployment, sql);
    }

    for (name, binding) in deployment.tees() {
        let report = binding.filter.diagnostics(None);
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{}:", name);
            print!("{}", report);
        }
    }

    orphans.reclaim();
    reclaimer.abort();

    if !looping.is_empty() {
        bail!("duplication loop in {} service(s)", looping.len());
    }
    Ok(())
}

fn route_sample(deployment: &Deployment, sql: &str) {
    for (name, binding) in deployment.tees() {
        for pipeline in &binding.pipelines {
            let ctx = SessionContext {
                pipeline: Arc::clone(pipeline),
                client: ClientInfo::default(),
                downstream: Arc::new(Discard),
                upstream: Arc::new(Discard),
            };
            match binding.filter.new_session(ctx) {
                Ok(session) => {
                    match session.route_query(Packet::query(sql)) {
                        Ok(outcome) => tracing::info!(
                            filter = name,
                            pipeline = pipeline.name(),
                            ?outcome,
                            "sample routed"
                        ),
                        Err(e) => tracing::warn!(filter = name, error = %e, "sample failed"),
                    }
                    session.close();
                }
                Err(e) => tracing::warn!(
                    filter = name,
                    pipeline = pipeline.name(),
                    error = %e,
                    "sample session refused"
                ),
            }
        }
    }
}
