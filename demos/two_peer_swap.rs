//! Two nodes on loopback: one shares a folder, the other finds the
//! files and pulls them down.
//!
//! Run with: cargo run --example two_peer_swap

use shoal::{CatalogKind, Node, NodeConfig, NodeEvent};
use std::path::Path;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let work = tempfile::tempdir()?;
    let shared = work.path().join("shared");
    let downloads = work.path().join("downloads");
    std::fs::create_dir_all(&shared)?;
    std::fs::create_dir_all(&downloads)?;
    std::fs::write(shared.join("hello.txt"), b"hello from the overlay\n")?;
    std::fs::write(
        shared.join("big.bin"),
        (0..1_000_000u32).map(|i| (i % 256) as u8).collect::<Vec<u8>>(),
    )?;

    let seeder = Node::new(node_config(work.path(), "seeder"))?;
    seeder.connect().await?;
    seeder.set_shared_root(&shared).await?;

    let leecher = Node::new(node_config(work.path(), "leecher"))?;
    leecher.connect().await?;
    leecher.set_destination_folder(downloads.clone());
    let mut events = leecher.subscribe();

    // loopback broadcast is unreliable on some hosts, introduce directly
    leecher
        .bootstrap_to(seeder.local_addr().expect("seeder not connected"))
        .await?;

    // wait for the catalog replay to arrive
    tokio::time::sleep(Duration::from_millis(500)).await;
    let known = leecher.catalog(CatalogKind::Known);
    println!("leecher knows {} files:", known.len());
    for record in &known {
        println!("  {} ({} bytes, {} chunks)", record.name, record.size, record.chunk_count);
    }

    for record in known {
        let path = leecher.download_file(&record.hash).await?;
        println!("downloaded {} -> {}", record.name, path.display());
    }

    while let Ok(event) = events.try_recv() {
        if let NodeEvent::DownloadCompleted { hash, path } = event {
            println!("completed {}: {}", hash, path.display());
        }
    }

    seeder.disconnect();
    leecher.disconnect();
    Ok(())
}

fn node_config(base: &Path, name: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.scratch_dir = base.join(name).join("scratch");
    config
}
