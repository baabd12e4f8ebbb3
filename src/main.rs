use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use switchyard::config::Config;
use switchyard::http::request::Method;
use switchyard::http::response::Response;
use switchyard::{Counter, Listener, RequestContext, ResponseHandle, Router, Service};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = match std::env::var("SWITCHYARD_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load(),
    };

    let counter = Counter::new();
    let service = Service::new(demo_router(Arc::clone(&counter)))
        .with_counter(counter)
        .with_processor(cfg.server.processor())
        .with_settings(cfg.server.connection_settings());

    let listener = Listener::bind(&cfg.server.listen_addr, service)
        .await
        .with_context(|| format!("Cannot listen on {}", cfg.server.listen_addr))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        idle_timeout_secs = cfg.server.idle_timeout_secs,
        "Listening"
    );

    listener
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await;

    Ok(())
}

fn demo_router(counter: Arc<Counter>) -> Router {
    Router::new()
        .route("/", |_ctx: RequestContext, res: ResponseHandle| {
            res.send(Response::ok("Hello from Switchyard\n"));
        })
        .route("/stats", move |_ctx: RequestContext, res: ResponseHandle| {
            res.send(Response::json(&counter.snapshot()));
        })
        .route("/echo/:word", |ctx: RequestContext, res: ResponseHandle| {
            let word = ctx.params.get("word").unwrap_or_default().to_string();
            res.send(Response::ok(format!("{word}\n")));
        })
        .route("/slow", |ctx: RequestContext, res: ResponseHandle| {
            if ctx.request.method != Method::GET {
                res.send(Response::method_not_allowed());
                return;
            }
            // Answers later from another task, streaming two chunks.
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let head = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 11\r\n\r\n";
                res.write(head);
                res.write("slow ");
                tokio::time::sleep(Duration::from_millis(200)).await;
                res.write("hello\n");
                if let Err(e) = res.finish().await {
                    tracing::debug!(error = %e, "Slow response not delivered");
                }
            });
        })
}
