//! krpc - command-line client for the Klipper API socket.
//!
//! This is the binary entry point. See the `klippy_rpc` library for the
//! protocol engine.

use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use klippy_rpc::{Config, Request, Session};
use mimalloc::MiMalloc;
use serde_json::{json, Value};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "krpc")]
#[command(version, about = "Talk to Klipper over its API socket")]
struct Cli {
    /// Path to klippy.sock (default: $KLIPPY_SOCKET or ~/printer_data/comms/klippy.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the response
    Query {
        /// Endpoint, e.g. `info` or `objects/list`
        method: String,
        /// Parameters as a JSON object
        params: Option<String>,
    },
    /// Open a streaming subscription and print every pushed frame
    Subscribe {
        /// Endpoint, e.g. `adxl345/dump_adxl345`
        method: String,
        /// Parameters as a JSON object
        params: Option<String>,
        /// Stop after this many frames
        #[arg(long)]
        count: Option<usize>,
    },
    /// Register a remote method and print every push until Ctrl-C
    Listen {
        /// Name the daemon should tag pushes with
        remote_method: String,
        /// Response template as a JSON object
        template: Option<String>,
    },
}

fn parse_json(raw: Option<&str>, what: &str) -> Result<Option<Value>> {
    raw.map(|text| serde_json::from_str(text).with_context(|| format!("{what} is not valid JSON: {text}")))
        .transpose()
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn connect(config: &Config) -> Result<Session> {
    Session::connect(&config.socket_path)
        .with_context(|| format!("Is Klipper running? Socket: {}", config.socket_path.display()))
}

fn run_query(config: &Config, method: String, params: Option<Value>) -> Result<()> {
    let session = connect(config)?;
    let response = session.query(Request::new(method, params.unwrap_or_else(|| json!({}))))?;
    print_json(response.as_value())?;
    session.shutdown();

    if let Some(message) = response.error_message() {
        anyhow::bail!("Klipper returned an error: {message}");
    }
    Ok(())
}

fn run_subscribe(config: &Config, method: String, params: Option<Value>, count: Option<usize>) -> Result<()> {
    let session = connect(config)?;
    let mut subscription = session.subscribe(Request::new(method, params.unwrap_or_else(|| json!({}))))?;

    let canceller = subscription.canceller();
    let on_interrupt = canceller.clone();
    ctrlc::set_handler(move || on_interrupt.cancel()).context("install Ctrl-C handler")?;

    let mut seen = 0usize;
    for item in subscription.by_ref() {
        let frame = item?;
        print_json(frame.as_value())?;
        seen += 1;
        if count.is_some_and(|limit| seen >= limit) {
            canceller.cancel();
        }
    }
    log::info!("Subscription {} ended after {seen} frame(s)", subscription.id());
    session.shutdown();
    Ok(())
}

fn run_listen(config: &Config, remote_method: &str, template: Option<Value>) -> Result<()> {
    let session = Arc::new(connect(config)?);

    let (tx, rx) = mpsc::channel::<Value>();
    // Forward pushes off the reader thread so printing never stalls it.
    session.register_remote_method(remote_method, template, move |params| {
        let _ = tx.send(params);
    })?;

    let on_interrupt = Arc::clone(&session);
    ctrlc::set_handler(move || on_interrupt.shutdown()).context("install Ctrl-C handler")?;

    log::info!("Listening for '{remote_method}' pushes, Ctrl-C to stop");
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(params) => print_json(&params)?,
            Err(mpsc::RecvTimeoutError::Timeout) if session.is_running() => {}
            Err(_) => break,
        }
    }
    session.shutdown();
    Ok(())
}

fn main() -> Result<()> {
    // stderr keeps stdout clean for JSON output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::resolve(cli.socket.as_deref())?;
    log::debug!("Using socket {}", config.socket_path.display());

    match cli.command {
        Commands::Query { method, params } => {
            let params = parse_json(params.as_deref(), "params")?;
            run_query(&config, method, params)
        }
        Commands::Subscribe { method, params, count } => {
            let params = parse_json(params.as_deref(), "params")?;
            run_subscribe(&config, method, params, count)
        }
        Commands::Listen { remote_method, template } => {
            let template = parse_json(template.as_deref(), "template")?;
            run_listen(&config, &remote_method, template)
        }
    }
}
