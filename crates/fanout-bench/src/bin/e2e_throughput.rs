//! End-to-end throughput benchmark for Fanout.
//!
//! Connects WebSocket clients to a running gateway, subscribes them all to
//! one channel and publishes into Redis as fast as possible, counting the
//! deliveries that come back.
//!
//! ```bash
//! fanout-bench/e2e_throughput [clients] [ws-url] [redis-host:port]
//! ```

use bytes::Bytes;
use fanout_core::{RedisBus, RedisConfig, UpstreamBus};
use fanout_protocol::ControlFrame;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const REDIS_ADDR: &str = "127.0.0.1:6379";
const CHANNEL: &str = "bench:e2e";
const SETTLE_MS: u64 = 500;
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| SERVER_URL.to_string());
    let redis = args.get(3).cloned().unwrap_or_else(|| REDIS_ADDR.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Fanout End-to-End Throughput Benchmark               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Needs a running gateway and the Redis it subscribes to      ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    if let Err(e) = run_fanout_benchmark(num_clients, &url, &redis).await {
        eprintln!("Benchmark failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_fanout_benchmark(num_clients: usize, url: &str, redis: &str) -> Result<(), BoxError> {
    println!("📊 Fan-out Benchmark: {} clients on {}", num_clients, CHANNEL);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let (host, port) = redis.rsplit_once(':').ok_or("redis address must be host:port")?;
    let publisher = RedisBus::connect(RedisConfig {
        host: host.to_string(),
        port: port.parse()?,
        ..RedisConfig::default()
    })
    .await?;

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    // Spawn client tasks
    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);
        let url = url.to_string();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(&url, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to subscribe
    barrier.wait().await;
    tokio::time::sleep(Duration::from_millis(SETTLE_MS)).await;
    println!("✓ All {} clients subscribed", num_clients);

    let published = Arc::new(AtomicU64::new(0));
    let publish_task = {
        let published = Arc::clone(&published);
        tokio::spawn(async move {
            let payload = Bytes::from(vec![b'x'; 64]);
            while publisher.publish(CHANNEL, payload.clone()).await.is_ok() {
                published.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    // Warmup phase
    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    // Reset counters and start measurement
    message_count.store(0, Ordering::SeqCst);
    published.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);
    let total_published = published.load(Ordering::SeqCst);

    // Calculate throughput
    let pubs_per_sec = total_published as f64 / elapsed.as_secs_f64();
    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients.max(1) as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Published:            {:>10.0} msg/s                    ║",
        pubs_per_sec
    );
    println!(
        "║  Delivered:            {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} msg/s                    ║",
        msgs_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    publish_task.abort();
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn run_client(
    url: &str,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    let subscribe = serde_json::to_string(&ControlFrame::subscribe(CHANNEL))?;
    sender.send(Message::Text(subscribe)).await?;

    // Wait for all clients to be ready
    barrier.wait().await;

    while let Some(result) = receiver.next().await {
        match result? {
            Message::Text(_) => {
                message_count.fetch_add(1, Ordering::Relaxed);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
