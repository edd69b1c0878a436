//! Perpetua daemon entry point.
//!
//! Starts the control daemon and parks until a `shutdown` command or a
//! termination signal arrives. All service management happens over the
//! local control socket; see the `daemon` module.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use perpetua::constants::VERSION;
use perpetua::Daemon;

/// Exit code mirroring shell convention for SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "perpetua")]
#[command(version = VERSION)]
#[command(about = "Software KVM daemon - share one keyboard, mouse and clipboard across machines")]
struct Cli {
    /// Control socket path (default: /tmp/perpetua_daemon.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Configuration directory (default: platform config dir)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Log to the terminal instead of the log file
    #[arg(long)]
    log_terminal: bool,
}

fn init_logging(cli: &Cli) {
    let filter = if cli.debug { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter));
    builder.format_timestamp_secs();

    if !cli.log_terminal {
        let log_path = perpetua::AppConfig::config_dir()
            .map(|dir| dir.join("perpetua.log"))
            .unwrap_or_else(|_| std::env::temp_dir().join("perpetua.log"));
        match std::fs::File::create(&log_path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("Warning: cannot open log file {}: {e}", log_path.display());
            }
        }
    }

    builder.init();
}

async fn run(cli: Cli, interrupted: Arc<AtomicBool>) -> Result<()> {
    let mut daemon = Daemon::start(cli.socket)?;
    println!("Perpetua daemon v{VERSION} running.");

    let signals = Arc::new(AtomicBool::new(false));
    {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook::flag;
        flag::register(SIGINT, Arc::clone(&signals))?;
        flag::register(SIGTERM, Arc::clone(&signals))?;
    }

    // Park on the shutdown notification, polling the signal flag so a
    // Ctrl-C still wins while no command arrives.
    loop {
        tokio::select! {
            () = daemon.wait_for_shutdown() => break,
            () = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                if signals.load(Ordering::Relaxed) {
                    interrupted.store(true, Ordering::Relaxed);
                    log::info!("[Daemon] Termination signal received");
                    break;
                }
            }
        }
    }

    daemon.stop().await;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if let Some(dir) = &cli.config_dir {
        std::env::set_var("PERPETUA_CONFIG_DIR", dir);
    }
    init_logging(&cli);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let result = runtime.block_on(run(cli, Arc::clone(&interrupted)));

    match result {
        Ok(()) if interrupted.load(Ordering::Relaxed) => std::process::exit(EXIT_INTERRUPTED),
        Ok(()) => {}
        Err(e) => {
            eprintln!("Startup failed: {e:#}");
            log::error!("Startup failed: {e:#}");
            std::process::exit(1);
        }
    }
}
