use clap::Parser;
use dotenvy::dotenv;
use rust_upload_pipeline::config::UploadConfig;
use rust_upload_pipeline::events::{EventBus, log_events};
use rust_upload_pipeline::infrastructure::processing;
use rust_upload_pipeline::{AppState, create_app};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the HTTP server
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Overrides UPLOAD_DIR
    #[arg(short, long)]
    upload_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_upload_pipeline=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting upload pipeline...");

    let mut config = UploadConfig::from_env();
    if let Some(dir) = args.upload_dir {
        config = config.with_upload_dir(dir);
    }
    info!(
        "🛡️  Upload Config: Dir={}, Max Size={:?}, Versions={}, Identify={}",
        config.upload_dir().display(),
        config.max_file_size,
        config.image_versions.len(),
        config.identify
    );

    let events = EventBus::new(config.event_buffer);
    let config = Arc::new(config);
    let pipeline = processing::setup_pipeline(config).await?;

    tokio::spawn(log_events(events.subscribe()));

    let state = AppState::new(pipeline, events);
    let upload_url = state.config.upload_url().to_string();

    let app = create_app(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            ),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("✅ Server ready at http://{}{}", addr, upload_url);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}
