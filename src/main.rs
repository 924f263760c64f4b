use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use outreach_engine::api;
use outreach_engine::collaborators::{ContactStore, HttpContactStore, MailSender, SmtpMailSender};
use outreach_engine::config::{EngineConfig, ServiceConfig, SmtpConfig};
use outreach_engine::engine::Engine;
use outreach_engine::scheduler;
use outreach_engine::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let service = ServiceConfig::from_env()?;

    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = init_tracing(&service);

    let engine_config = EngineConfig::from_env()?;
    let smtp = SmtpConfig::from_env()?
        .context("SMTP_HOST is not set; a mail relay is required to send sequences")?;

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&service.db_path)
            .await
            .with_context(|| format!("opening {}", service.db_path.display()))?,
    );
    tracing::info!(path = %service.db_path.display(), "Database ready");

    let mailer: Arc<dyn MailSender> = Arc::new(SmtpMailSender::new(&smtp)?);
    let contacts: Arc<dyn ContactStore> = Arc::new(HttpContactStore::new(
        service.contacts_url.clone(),
        service.contacts_token.clone(),
    ));

    let tick_interval = engine_config.tick_interval;
    let engine = Arc::new(Engine::new(db, contacts, mailer, engine_config));

    // ── Notices ───────────────────────────────────────────────────────────
    let mut notices = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => tracing::info!(sequence_id = %notice.sequence_id(), ?notice, "Engine notice"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "Notice logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // ── Scheduler ─────────────────────────────────────────────────────────
    let _ticker = scheduler::spawn_ticker(engine.scheduler(), tick_interval);
    tracing::info!(interval_secs = tick_interval.as_secs(), "Scheduler started");

    // ── HTTP ──────────────────────────────────────────────────────────────
    let app = api::routes(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", service.http_port))
        .await
        .with_context(|| format!("binding port {}", service.http_port))?;
    tracing::info!(port = service.http_port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

fn init_tracing(service: &ServiceConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter());

    match &service.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "outreach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            tracing_subscriber::registry().with(stderr).with(file).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stderr).init();
            None
        }
    }
}
