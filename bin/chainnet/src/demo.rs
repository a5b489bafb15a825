//! In-process replication demo on a shared [`MemoryDht`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chainnet_net_discovery::MemoryDht;
use chainnet_networker::{
    Encoding, ExtensionDefinition, ExtensionHandle, ExtensionMessage, Networker,
    NetworkerConfig, Peer, TopicOptions,
};
use chainnet_test_utils::{TestNode, wait_until};
use eyre::{Result, WrapErr, bail};
use futures::future::try_join_all;
use tracing::{debug, info, warn};

use crate::cli::DemoArgs;

const GREETING: &str = "chainnet/greeting";

pub(crate) async fn run(args: DemoArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => NetworkerConfig::load(path)
            .wrap_err_with(|| format!("loading {}", path.display()))?,
        None => NetworkerConfig::default(),
    };

    let dht = MemoryDht::new();
    let greetings = Arc::new(AtomicUsize::new(0));
    let mut nodes = Vec::with_capacity(usize::from(args.nodes));
    let mut handles = Vec::with_capacity(usize::from(args.nodes));
    for index in 0..args.nodes {
        let mut config = config.clone();
        if index > 0 {
            config.secret_key = None;
        }
        let node = TestNode::spawn_with(&dht, Networker::builder().config(config))?;
        handles.push(register_greeting(&node.networker, Arc::clone(&greetings)));
        info!(node = index, public_key = %node.networker.public_key().short(), "node started");
        nodes.push(node);
    }

    let Some((writer, readers)) = nodes.split_first() else {
        bail!("no nodes started");
    };

    let chain = writer.store.create();
    chain.append(Bytes::from(args.message.clone()));
    writer.replicate(&chain).await?;
    info!(chain = %chain.key().short(), topic = %chain.discovery_key().short(), "writer announced");

    let started = Instant::now();
    let timeout = Duration::from_secs(args.timeout);
    let received = try_join_all(readers.iter().map(|reader| {
        let replica = reader.store.get(chain.key());
        async move {
            reader
                .replicate_with(&replica, TopicOptions::default().flush(true))
                .await?;
            debug!(public_key = %reader.networker.public_key().short(), "flushed");
            let entry = tokio::time::timeout(timeout, replica.get(0))
                .await
                .wrap_err("timed out waiting for the entry")?;
            entry.ok_or_else(|| eyre::eyre!("chain closed before the entry arrived"))
        }
    }))
    .await?;

    let mut sent = 0;
    for (node, greeting) in nodes.iter().zip(&handles) {
        for peer in node.networker.peers() {
            greeting.send(format!("hello from {}", node.networker.public_key().short()), &peer)?;
            sent += 1;
        }
    }
    if !wait_until(|| greetings.load(Ordering::Relaxed) >= sent).await {
        warn!(sent, received = greetings.load(Ordering::Relaxed), "greetings missing");
    }

    for (index, node) in nodes.iter().enumerate() {
        let entry = match index.checked_sub(1).and_then(|i| received.get(i)) {
            Some(entry) => String::from_utf8_lossy(entry).into_owned(),
            None => args.message.clone(),
        };
        println!(
            "node {index} {} peers={} entry={entry:?}",
            node.networker.public_key().short(),
            node.networker.peer_count(),
        );
    }
    println!(
        "replicated to {} readers in {:?}, {} greetings exchanged",
        readers.len(),
        started.elapsed(),
        greetings.load(Ordering::Relaxed),
    );

    for node in &nodes {
        node.close().await?;
    }
    Ok(())
}

/// A greeting extension with one handler instance per peer.
fn register_greeting(networker: &Networker, greetings: Arc<AtomicUsize>) -> ExtensionHandle {
    networker.register_extension_with(GREETING, move |peer: &Peer| {
        let greetings = Arc::clone(&greetings);
        let definition = ExtensionDefinition::new(
            Encoding::Utf8,
            move |message: ExtensionMessage, peer: &Peer| {
                greetings.fetch_add(1, Ordering::Relaxed);
                debug!(
                    from = %peer.remote_public_key().short(),
                    text = message.as_text().unwrap_or_default(),
                    "greeting"
                );
            },
        );
        debug!(peer = %peer.remote_public_key().short(), "greeting extension bound");
        definition
    })
}
