//! Replicated counter on a three-node Raft group
//!
//! Every node applies committed entries from its own log to a local counter,
//! so all three counters end up equal once the entries are replicated.
//!
//! Run with: cargo run --example replicated_counter

use flowline_consensus::{
    EntryPayload, InMemoryNetwork, LogIndex, Member, NodeId, RaftConfig, RaftNode,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
enum Command {
    Add(i64),
    Reset,
}

/// Apply every committed entry of `node` to a counter
fn apply_committed(node: &RaftNode, counter: &mut i64) -> anyhow::Result<()> {
    let mut reader = node.log().reader(LogIndex(1));
    while let Some(entry) = reader.next_entry(node.commit_index())? {
        if let EntryPayload::Application(data) = entry.payload {
            match bincode::deserialize::<Command>(&data)? {
                Command::Add(delta) => *counter += delta,
                Command::Reset => *counter = 0,
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== Flowline replicated counter ===\n");

    let network = InMemoryNetwork::new();
    let members: Vec<Member> = (1..=3).map(|id| Member::active(NodeId(id))).collect();
    let config = RaftConfig {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(50),
        ..Default::default()
    };

    let mut nodes = Vec::new();
    for member in &members {
        let node = RaftNode::builder(member.id)
            .config(config.clone())
            .members(members.clone())
            .transport(network.transport(member.id))
            .start()
            .await?;
        network.register(node.clone());
        println!("  started {}", member.id);
        nodes.push(node);
    }

    println!("\nWaiting for a leader...");
    let leader = loop {
        if let Some(node) = nodes.iter().find(|n| n.status().is_ready_leader()) {
            break node.clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    println!("  {} leads term {}\n", leader.id(), leader.status().term);

    for command in [Command::Add(5), Command::Add(10), Command::Reset, Command::Add(7)] {
        let index = leader.propose(bincode::serialize(&command)?.into()).await?;
        println!("  {:?} committed at {}", command, index);
    }

    // Followers learn the commit index with the next heartbeat
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!();
    for node in &nodes {
        let mut counter = 0;
        apply_committed(node, &mut counter)?;
        println!("  {} counter = {}", node.id(), counter);
    }

    for node in &nodes {
        node.shutdown().await;
    }
    println!("\nAll nodes stopped");
    Ok(())
}
