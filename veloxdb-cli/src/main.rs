use std::env;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use veloxdb::config::EngineConfig;
use veloxdb::Database;
use veloxdb_cli::command::{self, Command};
use veloxdb_cli::config::ConfigLoad;
use veloxdb_cli::trace;

#[derive(Debug, Parser)]
#[command(version, author, about = "Administrative CLI for a running VeloxDB database")]
pub struct Args {
    /// Root data directory (expands the `${SysDir}` path template).
    /// Falls back to the persisted config, then `./data`.
    #[clap(long = "data-dir")]
    data_dir: Option<String>,

    /// Node identity (expands the `${NodeName}` path template).
    /// Falls back to the persisted config, then `node-1`.
    #[clap(long = "node")]
    node: Option<String>,

    #[clap(short = 'l', long)]
    log_level: Option<String>,

    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    setup_panic_hooks();

    let args = Args::parse();
    let persisted = ConfigLoad::load().unwrap_or_default();

    let data_dir = args.data_dir.or(persisted.data_dir).unwrap_or_else(|| "./data".to_string());
    let node = args.node.or(persisted.node).unwrap_or_else(|| "node-1".to_string());
    let log_level = args.log_level.or(persisted.log_level).unwrap_or_else(|| "info".to_string());

    let log_dir = format!("{}/.veloxdb-cli", env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &log_level)?;
    info!("veloxdb-cli starting, data_dir={data_dir}, node={node}, cmd={:?}", &args.cmd);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    let db = Database::open(EngineConfig::default(), &data_dir, &node, command::demo_schema())?;
    command::run(&db, args.cmd)?;
    db.close()?;

    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();
    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta).expect("human-panic: printing error message to console failed");
        }));
    }
}
