use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use mail_triage::config::TriageConfig;
use mail_triage::llm::{LlmConfig, LlmInference, create_provider};
use mail_triage::mailbox::imap::{ImapConfig, ImapMailbox};
use mail_triage::mailbox::{Mailbox, StaticMailbox};
use mail_triage::pipeline::TriageOrchestrator;
use mail_triage::pipeline::scheduler;
use mail_triage::pipeline::taxonomy::Taxonomy;
use mail_triage::server::triage_routes;
use mail_triage::store::{AuditStore, LibSqlAuditStore};

const USAGE: &str = "\
Usage:
  mail-triage serve [--mailbox-file PATH]
  mail-triage run [--lookback-days N] [--mailbox-file PATH]
  mail-triage reprocess <EMAIL_ID> --reason TEXT [--mailbox-file PATH]";

enum Command {
    Serve,
    Run,
    Reprocess { email_id: String },
}

struct Cli {
    command: Command,
    lookback_days: Option<u32>,
    mailbox_file: Option<PathBuf>,
    reason: Option<String>,
}

impl Cli {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let command = match args.next().as_deref() {
            Some("serve") => Command::Serve,
            Some("run") => Command::Run,
            Some("reprocess") => Command::Reprocess {
                email_id: args.next().context("reprocess needs an email id")?,
            },
            Some(other) => bail!("unknown command '{other}'\n{USAGE}"),
            None => bail!("missing command\n{USAGE}"),
        };
        let mut cli = Self {
            command,
            lookback_days: None,
            mailbox_file: None,
            reason: None,
        };
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--lookback-days" => {
                    let value = args.next().context("--lookback-days needs a value")?;
                    cli.lookback_days = Some(
                        value
                            .parse()
                            .with_context(|| format!("invalid --lookback-days '{value}'"))?,
                    );
                }
                "--reason" => {
                    cli.reason = Some(args.next().context("--reason needs a value")?);
                }
                "--mailbox-file" => {
                    let value = args.next().context("--mailbox-file needs a path")?;
                    cli.mailbox_file = Some(PathBuf::from(value));
                }
                other => bail!("unknown argument '{other}'\n{USAGE}"),
            }
        }
        if matches!(cli.command, Command::Reprocess { .. })
            && cli.reason.as_deref().is_none_or(|r| r.trim().is_empty())
        {
            bail!("reprocess needs --reason\n{USAGE}");
        }
        Ok(cli)
    }
}

/// Console logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file under `TRIAGE_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("TRIAGE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();
    let cli = Cli::parse(std::env::args().skip(1))?;
    let config = TriageConfig::from_env().context("invalid configuration")?;

    let taxonomy = match &config.taxonomy_path {
        Some(path) => Taxonomy::from_file(path)
            .with_context(|| format!("failed to load taxonomy from {}", path.display()))?,
        None => Taxonomy::standard(),
    };

    // ── Collaborators ───────────────────────────────────────────────
    let store: Arc<dyn AuditStore> = Arc::new(
        LibSqlAuditStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open audit store at {}", config.db_path.display()))?,
    );

    let llm_config = LlmConfig::from_env().context("LLM configuration")?;
    let llm = create_provider(&llm_config)?;
    let inference = Arc::new(LlmInference::new(llm, &taxonomy));

    let mailbox: Arc<dyn Mailbox> = match &cli.mailbox_file {
        Some(path) => Arc::new(
            StaticMailbox::from_json_file(path)
                .with_context(|| format!("failed to load mailbox file {}", path.display()))?,
        ),
        None => {
            let imap = ImapConfig::from_env()
                .context("EMAIL_IMAP_HOST and credentials must be set (or pass --mailbox-file)")?;
            Arc::new(ImapMailbox::new(imap))
        }
    };

    let orchestrator = Arc::new(TriageOrchestrator::new(
        &config,
        Arc::new(taxonomy),
        inference,
        store,
    ));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        model = %llm_config.model,
        db = %config.db_path.display(),
        "Mail triage ready"
    );

    match cli.command {
        Command::Reprocess { email_id } => {
            let reason = cli.reason.unwrap_or_default();
            let record = orchestrator
                .reprocess_from_mailbox(mailbox.as_ref(), &email_id, reason.trim())
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run => {
            let lookback = cli
                .lookback_days
                .map(|days| Duration::from_secs(u64::from(days) * 24 * 3600));
            let summary = orchestrator.run_lookback(mailbox.as_ref(), lookback).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(if summary.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Command::Serve => {
            let scheduled = match &config.schedule {
                Some(expr) => {
                    let schedule = scheduler::parse_schedule(expr)?;
                    Some(scheduler::spawn_scheduled_runs(
                        Arc::clone(&orchestrator),
                        Arc::clone(&mailbox),
                        schedule,
                    ))
                }
                None => None,
            };

            let app = triage_routes(Arc::clone(&orchestrator), mailbox);
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
                .await
                .with_context(|| format!("failed to bind port {}", config.http_port))?;
            tracing::info!(port = config.http_port, "HTTP trigger listening");

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    tokio::signal::ctrl_c().await.ok();
                    tracing::info!("Shutdown signal received");
                })
                .await?;

            orchestrator.cancel();
            if let Some((handle, shutdown)) = scheduled {
                shutdown.store(true, Ordering::Relaxed);
                handle.abort();
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Cli> {
        Cli::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn reprocess_takes_id_and_reason() {
        let cli = parse(&["reprocess", "m-1", "--reason", "taxonomy update"]).unwrap();
        assert!(matches!(cli.command, Command::Reprocess { ref email_id } if email_id == "m-1"));
        assert_eq!(cli.reason.as_deref(), Some("taxonomy update"));
    }

    #[test]
    fn reprocess_without_reason_is_rejected() {
        assert!(parse(&["reprocess", "m-1"]).is_err());
        assert!(parse(&["reprocess", "m-1", "--reason", "  "]).is_err());
        assert!(parse(&["reprocess"]).is_err());
    }

    #[test]
    fn run_accepts_lookback() {
        let cli = parse(&["run", "--lookback-days", "3"]).unwrap();
        assert!(matches!(cli.command, Command::Run));
        assert_eq!(cli.lookback_days, Some(3));
    }
}
