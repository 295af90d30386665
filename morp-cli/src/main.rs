//! CLI entry point (spec §6), grounded on `morp/__main__.py`'s
//! `main_recv` and on the teacher's `AdminOpts`/`ControllerOpts` in
//! `plane/src/admin.rs` and `plane/src/controller/command.rs` for the
//! `clap::Parser` shape and the "report and exit non-zero" error path in
//! `admin.rs::run_admin_command`.

use clap::Parser;
use morp_core::message::{recv_polymorphic, Outcome};
use std::path::PathBuf;
use std::time::Duration;

/// Consume messages from a named queue, dispatching each delivery to
/// whichever `MessageKind` its `_classpath` metadata names (spec §4.7,
/// "Receive on the base class dispatches polymorphically").
#[derive(Parser)]
#[command(name = "morp", about = "Consume morp messages from a queue")]
struct Opts {
    /// How many messages to consume. 0 means run until interrupted,
    /// mirroring the original's `--count 0` default.
    #[arg(short, long, default_value_t = 0)]
    count: u64,

    /// Working directory used to resolve relative dropfile-engine paths.
    /// The original's `--dir` extended `sys.path` so message classes
    /// could be imported from it; a compiled binary has no equivalent of
    /// runtime class loading, so this is kept for CLI compatibility and
    /// reinterpreted as a working-directory hint (see SPEC_FULL.md's
    /// Open Question decisions).
    #[arg(short, long = "dir", visible_alias = "directory")]
    dir: Option<PathBuf>,

    /// The queue name to consume from.
    #[arg(value_name = "NAME")]
    name: String,

    /// How long each long-poll `recv` call may block before trying again.
    #[arg(long, default_value_t = 20)]
    recv_timeout_secs: u64,

    /// Ack instead of release when a handler errors.
    #[arg(long)]
    ack_on_recv: bool,
}

#[tokio::main]
async fn main() {
    morp_core::logging::init();
    let opts = Opts::parse();

    if let Some(dir) = &opts.dir {
        if let Err(e) = std::env::set_current_dir(dir) {
            tracing::error!(dir = %dir.display(), error = %e, "failed to change into --dir");
            std::process::exit(1);
        }
    }

    morp_postgres::register();
    morp_dropfile::register();
    morp_sqs::register();
    morp_core::registry::configure_environ();

    let interface = match morp_core::registry::get_interface("") {
        Some(iface) => iface,
        None => {
            tracing::error!("no MORP_DSN configured; set MORP_DSN (and optionally MORP_DSN_1, ...)");
            std::process::exit(1);
        }
    };

    if let Err(e) = interface.connect().await {
        tracing::error!(error = %e, "failed to connect to configured interface");
        std::process::exit(1);
    }

    let prefix = morp_core::registry::queue_prefix();
    let queue_name = if prefix.is_empty() {
        opts.name.clone()
    } else {
        format!("{prefix}-{}", opts.name)
    };

    tracing::info!(queue = %queue_name, count = opts.count, "consuming messages");

    let recv_timeout = Duration::from_secs(opts.recv_timeout_secs);
    let mut processed = 0u64;

    loop {
        if opts.count != 0 && processed >= opts.count {
            break;
        }

        let delivery = match recv_polymorphic(interface.as_ref(), &queue_name, recv_timeout).await
        {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(error = %e, "recv failed");
                std::process::exit(1);
            }
        };

        let (fields, message) = delivery;

        let resolved = match message.handle() {
            Ok(Outcome::Ack) => interface.ack(&queue_name, &fields).await,
            Ok(Outcome::Release { delay_seconds }) => {
                interface.release(&queue_name, &fields, delay_seconds).await
            }
            Err(handler_err) => {
                let resolve = if opts.ack_on_recv {
                    interface.ack(&queue_name, &fields).await
                } else {
                    interface.release(&queue_name, &fields, None).await
                };
                if let Err(e) = resolve {
                    tracing::error!(error = %e, "failed to resolve failed delivery");
                }
                tracing::error!(classpath = message.classpath(), error = %handler_err, "handler failed");
                std::process::exit(1);
            }
        };

        if let Err(e) = resolved {
            tracing::error!(error = %e, "failed to resolve delivery");
            std::process::exit(1);
        }

        processed += 1;
    }

    tracing::info!(processed, "done");
    let _ = interface.close().await;
}
