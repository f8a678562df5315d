use std::env;

use anyhow::{Context, Result};
use event_schema::decode_event;
use events_service::broker::{self, JetStreamPublisher};
use events_service::config::BrokerConfig;
use events_service::{EventPublisher, PipelineMetrics};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Publish Event JSON documents (one per line) from a file or stdin.
#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        eprintln!("Usage:");
        eprintln!("  publish-event [events.jsonl]   (reads stdin when no file is given)");
        std::process::exit(1);
    }

    dotenvy::dotenv().ok();
    let config = BrokerConfig::from_env().context("Failed to load broker configuration")?;

    let client = broker::connect(&config.url, "publish-event")
        .await
        .context("Failed to connect to NATS")?;
    let context = async_nats::jetstream::new(client.clone());

    let publisher = EventPublisher::new(
        Arc::new(JetStreamPublisher::new(context)),
        config.subject_prefix.clone(),
        PipelineMetrics::new(prometheus::default_registry()),
    );

    let input: Box<dyn AsyncRead + Unpin> = match args.get(1) {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let mut lines = BufReader::new(input).lines();
    let mut line_no = 0usize;
    let mut published = 0usize;
    let mut failed = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event = match decode_event(line.as_bytes()) {
            Ok(event) => event,
            Err(e) => {
                eprintln!("line {}: rejected: {}", line_no, e);
                failed += 1;
                continue;
            }
        };

        match publisher.publish(&event).await {
            Ok(()) => {
                println!(
                    "line {}: published {} to {}",
                    line_no,
                    event.event_id,
                    publisher.subject_for(&event)
                );
                published += 1;
            }
            Err(e) => {
                eprintln!("line {}: publish failed for {}: {}", line_no, event.event_id, e);
                failed += 1;
            }
        }
    }

    client.flush().await.context("Failed to flush NATS connection")?;
    println!("Published {} events, {} failed", published, failed);

    if failed > 0 {
        std::process::exit(2);
    }
    Ok(())
}
