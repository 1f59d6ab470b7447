//! rangesim - local cluster simulator for rangekeep
//!
//! Spins up nodes and stores in one process, seeds ranges on the first
//! store, and runs scan cycles until every range reaches its replication
//! factor.

use anyhow::Result;
use clap::Parser;
use rangekeep_id::StoreId;
use rangekeep_storage::ReplicationConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cluster;
mod output;
mod store;

use cluster::{Cluster, ClusterSpec};
use output::OutputFormat;

/// Simulate replica placement across an in-process cluster.
#[derive(Debug, Parser)]
#[command(name = "rangesim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of nodes.
    #[arg(long, env = "RANGESIM_NODES", default_value_t = 5)]
    nodes: u32,

    /// Stores on each node.
    #[arg(long, env = "RANGESIM_STORES_PER_NODE", default_value_t = 1)]
    stores_per_node: u32,

    /// Number of ranges to create.
    #[arg(long, env = "RANGESIM_RANGES", default_value_t = 100)]
    ranges: u32,

    /// Replicas per range in the default zone.
    #[arg(long, env = "RANGESIM_REPLICATION_FACTOR", default_value_t = 3)]
    replication_factor: usize,

    /// Store to mark dead during the run.
    #[arg(long, env = "RANGESIM_KILL_STORE")]
    kill_store: Option<i32>,

    /// Cycles to run before killing `--kill-store`.
    #[arg(long, env = "RANGESIM_KILL_AFTER", default_value_t = 3)]
    kill_after: u32,

    /// Give up after this many scan cycles.
    #[arg(long, env = "RANGESIM_MAX_CYCLES", default_value_t = 100)]
    max_cycles: u32,

    /// Pick randomly between the two best placement candidates.
    #[arg(long)]
    random_placement: bool,

    /// Output format (table or json).
    #[arg(long, default_value = "table")]
    format: String,

    /// Log level when RUST_LOG is unset.
    #[arg(long, env = "RANGEKEEP_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn spec(&self) -> ClusterSpec {
        ClusterSpec {
            nodes: self.nodes,
            stores_per_node: self.stores_per_node,
            ranges: self.ranges,
            replication_factor: self.replication_factor,
            kill_store: self.kill_store.map(StoreId::new),
            kill_after: self.kill_after,
            max_cycles: self.max_cycles,
        }
    }

    fn replication_config(&self) -> Result<ReplicationConfig> {
        let mut config = ReplicationConfig::from_env()?;
        config.rebalancing.deterministic = !self.random_placement;
        config.log_level = self.log_level.clone();
        Ok(config)
    }
}

fn init_tracing(log_level: &str, json: bool) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.replication_config()?;
    init_tracing(&config.log_level, cli.log_json);

    let format = OutputFormat::parse(&cli.format);
    let cluster = Cluster::start(cli.spec(), config).await?;
    let report = cluster.run().await;
    cluster.shutdown().await;

    info!(
        converged = report.converged,
        cycles = report.cycles,
        changes = report.changes,
        "Simulation finished"
    );
    output::print_report(&report, format);

    if !report.converged {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["rangesim"]).unwrap();
        let spec = cli.spec();
        assert_eq!(spec.nodes, 5);
        assert_eq!(spec.replication_factor, 3);
        assert_eq!(spec.kill_store, None);
        assert!(!cli.random_placement);
    }

    #[rstest]
    #[case(&["rangesim", "--kill-store", "2"], Some(2))]
    #[case(&["rangesim", "--nodes", "7"], None)]
    fn test_kill_store_flag(#[case] args: &[&str], #[case] expected: Option<i32>) {
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.spec().kill_store.map(|s| s.value()), expected);
    }

    #[test]
    fn test_rejects_non_numeric_nodes() {
        assert!(Cli::try_parse_from(["rangesim", "--nodes", "many"]).is_err());
    }
}
