//! Mesh Addressing Command-Line Interface
//!
//! This CLI exercises the addressing layer without hardware:
//! - Simulating a master plus N joining nodes over the in-process medium
//! - Inspecting octal tree addresses (depth, parent chain, child slots)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rfmesh_core::sim::{SimClock, SimConfig, SimMedium, SimNetwork, SimRadio};
use rfmesh_core::{Addr, Mesh, MeshConfig, NodeId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

type SimMesh = Mesh<SimClock, SimRadio, SimNetwork>;

#[derive(Parser)]
#[command(name = "rfmesh")]
#[command(author, version, about = "Mesh addressing layer CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join N simulated nodes against a simulated master and dump the
    /// resulting binding table
    Simulate {
        /// Number of joining nodes (ids are assigned 1..=N)
        #[arg(short, long, default_value = "3")]
        nodes: u8,

        /// Per-node renewal budget in milliseconds
        #[arg(long, default_value = "4000")]
        timeout: u32,

        /// Print the binding table as JSON
        #[arg(long)]
        json: bool,
    },

    /// Explain an octal tree address
    Inspect {
        /// The address, in octal (e.g. 15 for 015)
        addr: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            timeout,
            json,
        } => simulate(nodes, timeout, json),
        Commands::Inspect { addr } => inspect(&addr),
    }
}

/// Drive a node's `update()`/`dhcp()` until the shared stop flag is set
fn spawn_pump(mut mesh: SimMesh, stop: Arc<AtomicBool>) -> thread::JoinHandle<SimMesh> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            mesh.update();
            mesh.dhcp();
            thread::sleep(Duration::from_micros(200));
        }
        mesh
    })
}

fn simulate(nodes: u8, timeout: u32, json: bool) -> Result<()> {
    if nodes == 0 {
        bail!("need at least one joining node");
    }

    let medium = SimMedium::new(SimConfig::default());
    let stop = Arc::new(AtomicBool::new(false));

    let (clock, radio, network) = medium.attach();
    let mut master = Mesh::new(clock, radio, network, MeshConfig::default());
    master
        .begin()
        .map_err(|err| anyhow::anyhow!("master begin failed: {err}"))?;
    info!("master up at address {}", master.mesh_address());
    let pump = spawn_pump(master, Arc::clone(&stop));

    // Joined nodes keep pumping so later arrivals can attach below them
    // once the master's own child slots fill up
    let mut node_pumps = Vec::new();
    let mut joined = 0u8;
    for id in 1..=nodes {
        let (clock, radio, network) = medium.attach();
        let config = MeshConfig::default()
            .with_node_id(NodeId::new(id))
            .with_renewal_timeout(timeout);
        let mut node = Mesh::new(clock, radio, network, config);
        match node.begin() {
            Ok(()) => {
                joined += 1;
                info!("node {} joined as {}", id, node.mesh_address());
                node_pumps.push(spawn_pump(node, Arc::clone(&stop)));
            }
            Err(err) => warn!("node {} failed to join: {}", id, err),
        }
    }

    // Let the last confirmation drain before reading the table
    thread::sleep(Duration::from_millis(25));
    stop.store(true, Ordering::Relaxed);
    for pump in node_pumps {
        let _ = pump.join();
    }
    let master = match pump.join() {
        Ok(master) => master,
        Err(_) => bail!("master pump thread panicked"),
    };

    if json {
        let table = serde_json::to_string_pretty(master.binding_table().entries())
            .context("serializing binding table")?;
        println!("{table}");
    } else {
        println!("binding table ({} joined of {}):", joined, nodes);
        for binding in master.binding_table().entries() {
            println!("  id {:3}  ->  {}", binding.id, binding.addr);
        }
        let stats = master.stats();
        println!(
            "served {} requests, sent {} offers, committed {} bindings",
            stats.addr_requests_served, stats.offers_sent, stats.bindings_committed
        );
    }

    Ok(())
}

fn inspect(addr: &str) -> Result<()> {
    let raw = u16::from_str_radix(addr.trim_start_matches("0o"), 8)
        .with_context(|| format!("'{addr}' is not an octal address"))?;
    let addr = Addr::from_raw(raw);

    println!("address {}", addr);
    println!("  depth: {}", addr.depth());
    println!("  well-formed (4 children): {}", addr.is_valid_for(4));

    if addr != Addr::MASTER {
        let mut chain = Vec::new();
        let mut cursor = addr;
        while cursor != Addr::MASTER {
            cursor = cursor.parent();
            chain.push(cursor);
        }
        let path: Vec<String> = chain.iter().rev().map(|hop| hop.to_string()).collect();
        println!("  path from master: {} -> {}", path.join(" -> "), addr);
    }

    let children: Vec<String> = (1..=4u8).map(|slot| addr.child(slot).to_string()).collect();
    println!("  child slots: {}", children.join(", "));

    Ok(())
}
