//! Example: Stream events over a WebSocket

use futures::StreamExt;
use sailhouse::Sailhouse;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> sailhouse::Result<()> {
    let client = Sailhouse::from_env()?;
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    println!("Streaming orders/audit... (Ctrl+C to exit)");
    let mut stream = client.stream_events("orders", "audit", cancel).await?;

    while let Some(result) = stream.next().await {
        match result {
            Ok(event) => {
                println!("\nReceived event:");
                println!("  ID: {}", event.id);
                println!("  Data: {}", event.data);
                if let Some(metadata) = &event.metadata {
                    println!("  Metadata: {:?}", metadata);
                }

                event.ack().await?;
                println!("  ✓ Acknowledged");
            }
            Err(e) => {
                eprintln!("Error: {}", e);
            }
        }
    }

    Ok(())
}
