//! Echo backend
//!
//! A stand-in game service for local runs: answers batch dispatches by echoing
//! every item body back to its sender, and plain calls with their own payload.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use gamegate_core::types::{RpcRequest, RpcResponse};
use gamegate_pool::{BatchReply, BatchRequest};
use gamegate_rpc::{serve, RpcService};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Echo backend for GameGate", long_about = None)]
struct Args {
    /// Address to accept gateway channels on
    #[arg(short, long, default_value = "127.0.0.1:7001")]
    bind: String,

    /// Batch method name the gateway dispatches with
    #[arg(long, default_value = "HandleBatch")]
    batch_method: String,

    /// Artificial processing delay per call, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

struct EchoService {
    batch_method: String,
    delay: Duration,
    calls: AtomicU64,
}

#[async_trait]
impl RpcService for EchoService {
    async fn call(&self, request: RpcRequest) -> RpcResponse {
        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if request.method_name != self.batch_method {
            return RpcResponse::ok(request.payload);
        }

        let batch: BatchRequest = match serde_json::from_slice(&request.payload) {
            Ok(batch) => batch,
            Err(e) => return RpcResponse::error(400, format!("malformed batch: {e}")),
        };
        debug!(
            service = %request.service_name,
            items = batch.items.len(),
            calls,
            "Echoing batch"
        );

        let reply = BatchReply {
            results: batch
                .items
                .into_iter()
                .map(|item| RpcResponse::ok(item.body))
                .collect(),
        };
        match serde_json::to_vec(&reply) {
            Ok(payload) => RpcResponse::ok(payload),
            Err(e) => RpcResponse::error(500, e.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;

    let service = Arc::new(EchoService {
        batch_method: args.batch_method,
        delay: Duration::from_millis(args.delay_ms),
        calls: AtomicU64::new(0),
    });

    let cancel = CancellationToken::new();
    let server = tokio::spawn(serve(listener, Arc::clone(&service), cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!(
        calls = service.calls.load(Ordering::Relaxed),
        "Shutting down echo backend"
    );
    cancel.cancel();
    server.await??;
    Ok(())
}
