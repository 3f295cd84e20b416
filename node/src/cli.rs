//! # CLI Interface
//!
//! Defines the command-line argument structure for `p2pmesh-node` using
//! `clap` derive. Supports two subcommands: `simulate` and `version`.

use clap::{Parser, Subcommand};

use p2pmesh_protocol::config;

use crate::logging::LogFormat;
use crate::topology::Topology;

/// p2pmesh node.
///
/// Runs flood-broadcast meshes of in-process nodes wired through a loopback
/// signaling hub, and reports whether every message reached every node
/// exactly once.
#[derive(Parser, Debug)]
#[command(
    name = "p2pmesh-node",
    about = "p2pmesh flood-broadcast node and simulator",
    version,
    propagate_version = true
)]
pub struct MeshNodeCli {
    /// Log output format.
    #[arg(long, global = true, value_enum, env = "P2PMESH_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(
        long,
        global = true,
        env = "P2PMESH_LOG",
        default_value = "p2pmesh_node=info,p2pmesh_protocol=warn"
    )]
    pub log_level: String,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an in-process mesh, flood messages through it, and report
    /// delivery.
    Simulate(SimulateArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `simulate` subcommand.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Number of nodes in the mesh.
    #[arg(long, short = 'n', env = "P2PMESH_NODES", default_value_t = config::DEFAULT_SIMULATION_NODES)]
    pub nodes: usize,

    /// How nodes are linked.
    #[arg(long, short = 't', value_enum, default_value_t = Topology::Ring)]
    pub topology: Topology,

    /// Extra random links added on top of the spanning tree (random topology only).
    #[arg(long, default_value_t = 3)]
    pub extra_links: usize,

    /// Number of messages to publish, each from a randomly chosen node.
    #[arg(long, short = 'm', env = "P2PMESH_MESSAGES", default_value_t = config::DEFAULT_SIMULATION_MESSAGES)]
    pub messages: usize,

    /// Seed for topology and publisher selection. Random when omitted.
    #[arg(long, env = "P2PMESH_SEED")]
    pub seed: Option<u64>,

    /// Seen-message retention in milliseconds.
    #[arg(long, env = "P2PMESH_CACHE_RETENTION_MS", default_value_t = config::DEFAULT_CACHE_RETENTION.as_millis() as u64)]
    pub cache_retention_ms: u64,

    /// Signaling host every node subscribes to. The mesh namespace is appended.
    #[arg(long, env = "P2PMESH_SIGNALING_HOST", default_value = "loopback://hub")]
    pub host: String,

    /// How long to wait for the flood to settle, in milliseconds.
    #[arg(long, default_value_t = config::DEFAULT_SIMULATION_SETTLE.as_millis() as u64)]
    pub settle_ms: u64,

    /// Print the report as JSON on stdout.
    #[arg(long)]
    pub json: bool,

    /// Keep the mesh up after reporting until Ctrl+C.
    #[arg(long)]
    pub hold: bool,
}
