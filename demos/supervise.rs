use std::time::Duration;

use tracing_subscriber::EnvFilter;
use worker_supervisor::SupervisorBuilder;

// Usage: cargo run --example supervise -- <executable> [port]
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(executable) = args.next() else {
        eprintln!("usage: supervise <executable> [port]");
        return;
    };
    let port = args.next().and_then(|p| p.parse().ok()).unwrap_or(8000);

    let handle = SupervisorBuilder::new()
        .with_executable(executable)
        .with_port(port)
        .build()
        .run();

    handle.events().on_status_change(|change| {
        println!("🔄 {} -> {}", change.from, change.to);
        Ok(())
    });
    handle.events().on_error(|fault| {
        println!("💥 {}", fault.kind());
        Ok(())
    });

    if !handle.start().await.unwrap_or(false) {
        println!("Worker did not start, the supervisor keeps retrying...");
    }
    if handle.wait_for_healthy(Duration::from_secs(30)).await {
        println!("✅ Worker ready at {}", handle.base_url());
    }

    let _ = tokio::signal::ctrl_c().await;
    println!("Shutting down 🫡");
    let _ = handle.shutdown().await;
}
