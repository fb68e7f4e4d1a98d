//! 🚀 elastilog-cli, the front door, the bouncer, the maitre d' of elastilog.
//!
//! 🎬 *[narrator voice]* "It all started with a pipe..."
//! 📦 Reads log lines from stdin, one event per line, and ships them through a
//! `LogSink`. JSON lines keep their fields, anything else becomes a plain INFO message.
//! When stdin runs dry, the sink drains and we print the receipt. 🦆
//!
//! ```text
//! tail -f app.log | elastilog-cli elastilog.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{ContentArrangement, Table};
use elastilog::{Appender, BackendKind, DrainReport, LogEvent, LogSink};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 📡 Pipe log lines into Elasticsearch through the bulk API.
#[derive(Debug, Parser)]
#[command(name = "elastilog", version, about)]
struct Args {
    /// 🔧 TOML config file. Without one, only `ELASTILOG_*` env vars are read.
    config: Option<PathBuf>,

    /// 🧪 Swap the cluster for an in-memory client. Everything runs, nothing leaves.
    #[arg(long)]
    dry_run: bool,
}

/// 🚀 main(), where it all begins. The "I pressed F5 and held my breath" moment.
///
/// 🔧 Steps:
/// 1. Init tracing (to stderr, stdout belongs to the receipt)
/// 2. Parse args
/// 3. Load config and build the sink
/// 4. Pump stdin into the sink
/// 5. Drain, print the receipt, and exit with a code that means something
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let result = run(args).await;

    // 💀 Error handling: the part where we find out what went wrong
    // and print it in a way that's helpful at 3am
    if let Err(err) = result {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one layer at a time
        let mut the_vibes_are_giving_config_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            if cause.downcast_ref::<elastilog::ConfigError>().is_some() {
                the_vibes_are_giving_config_issues = true;
            }
        }

        if the_vibes_are_giving_config_issues {
            error!(
                "🔧 hint: the [appender] table needs at least `index` and `_type`. \
                `retry` takes 0..=60 seconds, `port` takes 1000..=65535. \
                Env vars work too: ELASTILOG_APPENDER__INDEX=app-logs"
            );
        }

        // 🗑️ Exit with prejudice. Process exitus maximus.
        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    // 🔒 Validate the config file exists before we get too emotionally attached
    if let Some(path) = args.config.as_deref() {
        let exists = path.try_exists().with_context(|| {
            format!(
                "💀 Couldn't check whether the configuration file exists. If it's a relative path, \
                 try an absolute one. Was checking here: '{}'",
                path.display()
            )
        })?;
        if !exists {
            anyhow::bail!(
                "💀 Configuration file '{}' does not exist. Double check the path, or drop the \
                 argument and configure through ELASTILOG_* env vars instead.",
                path.display()
            );
        }
    }

    let mut app_config = elastilog::load_config(args.config.as_deref()).context(
        "💀 In elastilog-cli we couldn't load the config. \
         Make sure you didn't forget something obvious",
    )?;
    if args.dry_run {
        info!("🧪 Dry run: documents go to RAM and stay there");
        app_config.connection.backend = BackendKind::InMemory;
    }

    let sink = Arc::new(
        LogSink::from_app_config(&app_config).context("💀 Could not build the log sink")?,
    );
    info!(
        "📡 Shipping stdin to index '{}' on {:?}:{}",
        sink.config().index(),
        sink.config().hosts(),
        sink.config().port()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut refused = 0u64;
    while let Some(line) = lines.next_line().await.context("💀 Reading stdin failed")? {
        if line.trim().is_empty() {
            continue;
        }
        if !sink.submit(&LogEvent::from_line(&line)) {
            refused += 1;
        }
    }

    // -- 🏁 shutdown blocks while the worker drains, keep it off the async threads
    let draining = Arc::clone(&sink);
    let report = tokio::task::spawn_blocking(move || draining.shutdown_with_report())
        .await
        .context("💀 The shutdown task panicked")?
        .context("💀 The sink was already shut down before stdin ended")?;

    println!("{}", receipt(&report, refused));

    let lost = report.stats.abandoned + report.stats.rejected + report.stats.shed;
    if lost > 0 {
        warn!("⚠️ {lost} log lines did not make it into the index");
    }
    Ok(())
}

/// 🧾 The drain report as a table, for humans.
fn receipt(report: &DrainReport, refused: u64) -> Table {
    let stats = report.stats;
    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["📊 Metric", "Count"]);
    for (label, value) in [
        ("accepted", stats.accepted),
        ("indexed", stats.indexed),
        ("rejected", stats.rejected),
        ("abandoned", stats.abandoned),
        ("shed (queue full)", stats.shed),
        ("refused", refused),
        ("bulk attempts", stats.attempts),
    ] {
        table.add_row(vec![label.to_string(), value.to_string()]);
    }
    table.add_row(vec!["elapsed".to_string(), format!("{:.2?}", report.elapsed)]);
    table
}
