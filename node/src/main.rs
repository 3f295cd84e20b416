// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # p2pmesh Node
//!
//! Entry point for the `p2pmesh-node` binary. Parses CLI arguments,
//! initializes logging, and runs the requested subcommand.
//!
//! - `simulate` — build an in-process mesh over the loopback fabric, flood
//!   messages through it, and report per-node delivery
//! - `version`  — print build version information

mod cli;
mod logging;
mod topology;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use tokio::signal;

use p2pmesh_protocol::mesh::{LoopbackFabric, LoopbackHub, MeshConfig, MeshNode, MeshStats};

use cli::{Commands, MeshNodeCli, SimulateArgs};
use topology::Topology;

/// Event name every simulated message is published under.
const SIMULATION_EVENT: &str = "sim";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = MeshNodeCli::parse();

    match cli.command {
        Commands::Simulate(args) => {
            logging::init_logging(&cli.log_level, cli.log_format);
            simulate(args).await
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct NodeReport {
    name: String,
    links: usize,
    delivered: u64,
    stats: MeshStats,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    nodes: usize,
    topology: Topology,
    links: usize,
    messages: usize,
    expected_deliveries: u64,
    deliveries: u64,
    frames: u64,
    duplicates: u64,
    elapsed_ms: u64,
    complete: bool,
    per_node: Vec<NodeReport>,
}

/// Builds the mesh, floods `args.messages` messages through it and waits for
/// every node to receive every message it did not publish.
async fn simulate(args: SimulateArgs) -> Result<()> {
    anyhow::ensure!(args.nodes >= 2, "a mesh needs at least two nodes");

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let config = MeshConfig {
        cache_retention_ms: args.cache_retention_ms,
        ..MeshConfig::default()
    };

    tracing::info!(
        nodes = args.nodes,
        topology = ?args.topology,
        messages = args.messages,
        seed = ?args.seed,
        "starting simulation"
    );

    // --- Nodes ---
    let fabric = Arc::new(LoopbackFabric::new());
    let hub = LoopbackHub::new();
    let names: Vec<String> = (0..args.nodes).map(|i| format!("node-{i}")).collect();
    let mut nodes = Vec::with_capacity(args.nodes);
    let mut counters = Vec::with_capacity(args.nodes);
    let mut runners = Vec::with_capacity(args.nodes);

    for name in &names {
        let node = Arc::new(MeshNode::with_config(
            name.clone(),
            config.clone(),
            fabric.clone(),
        ));

        let counter = Arc::new(AtomicU64::new(0));
        let hits = Arc::clone(&counter);
        let label = name.clone();
        node.subscribe(SIMULATION_EVENT, move |payload| {
            hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(node = %label, %payload, "delivered");
        });

        let runner = node
            .connect(&hub.client(name.as_str()), &args.host)
            .await
            .with_context(|| format!("failed to connect {name} to signaling"))?;

        nodes.push(node);
        counters.push(counter);
        runners.push(runner);
    }

    // --- Links ---
    let edges = args.topology.edges(args.nodes, args.extra_links, &mut rng);
    let links = edges
        .iter()
        .map(|&(a, b)| hub.link(&names[a], &names[b]));
    futures::future::try_join_all(links)
        .await
        .context("failed to build mesh")?;

    let degrees = topology::degrees(args.nodes, &edges);
    let settle = Duration::from_millis(args.settle_ms);
    let all_linked = wait_until(settle, || {
        nodes
            .iter()
            .zip(&degrees)
            .all(|(node, &degree)| node.ready_connections().len() == degree)
    })
    .await;
    anyhow::ensure!(all_linked, "links did not become ready within {settle:?}");
    tracing::info!(links = edges.len(), "mesh linked");

    // --- Flood ---
    let started = Instant::now();
    for seq in 0..args.messages {
        let origin = rng.gen_range(0..args.nodes);
        nodes[origin]
            .publish(SIMULATION_EVENT, json!({ "seq": seq, "origin": names[origin] }))
            .with_context(|| format!("{} failed to publish", names[origin]))?;
    }

    let expected = (args.messages * (args.nodes - 1)) as u64;
    let total = || counters.iter().map(|c| c.load(Ordering::Relaxed)).sum::<u64>();
    let complete = wait_until(settle, || total() >= expected).await;
    // Let trailing duplicates drain so the counters are final.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let elapsed = started.elapsed();

    // --- Report ---
    let per_node: Vec<NodeReport> = nodes
        .iter()
        .zip(&counters)
        .zip(&names)
        .map(|((node, counter), name)| NodeReport {
            name: name.clone(),
            links: node.ready_connections().len(),
            delivered: counter.load(Ordering::Relaxed),
            stats: node.stats(),
        })
        .collect();

    let report = SimulationReport {
        nodes: args.nodes,
        topology: args.topology,
        links: edges.len(),
        messages: args.messages,
        expected_deliveries: expected,
        deliveries: total(),
        frames: fabric.frames_delivered(),
        duplicates: per_node.iter().map(|n| n.stats.duplicates).sum(),
        elapsed_ms: elapsed.as_millis() as u64,
        complete: complete && total() == expected,
        per_node,
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode report")?
        );
    } else {
        print_report(&report);
    }

    if args.hold {
        tracing::info!("mesh is up; press Ctrl+C to stop");
        shutdown_signal().await;
    }

    // --- Shutdown ---
    for node in &nodes {
        node.shutdown();
    }
    for runner in runners {
        if let Err(e) = runner.await {
            tracing::warn!(error = %e, "run loop did not stop cleanly");
        }
    }
    tracing::info!("simulation finished");

    anyhow::ensure!(
        report.complete,
        "delivered {} of {} expected messages",
        report.deliveries,
        report.expected_deliveries
    );
    Ok(())
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses.
async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn print_report(report: &SimulationReport) {
    println!(
        "Simulated {} nodes ({:?}, {} links), {} messages in {} ms",
        report.nodes, report.topology, report.links, report.messages, report.elapsed_ms
    );
    println!(
        "  Deliveries : {} / {} expected",
        report.deliveries, report.expected_deliveries
    );
    println!("  Frames     : {}", report.frames);
    println!("  Duplicates : {}", report.duplicates);
    println!();
    println!(
        "  {:<10} {:>5} {:>9} {:>9} {:>10}",
        "node", "links", "delivered", "relayed", "duplicates"
    );
    for node in &report.per_node {
        println!(
            "  {:<10} {:>5} {:>9} {:>9} {:>10}",
            node.name, node.links, node.delivered, node.stats.relayed_frames, node.stats.duplicates
        );
    }
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

/// Prints version information to stdout.
fn print_version() {
    println!("p2pmesh-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", p2pmesh_protocol::config::PROTOCOL_VERSION);
    println!(
        "wire format  v{}",
        p2pmesh_protocol::config::WIRE_PROTOCOL_VERSION
    );
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
