//! Line echo server
//!
//! Every newline-terminated line a client sends comes back unchanged. A line
//! reading `quit` closes the connection after the reply has been written.
//!
//! ## What it shows
//!
//! - An [`IoContext`] built from a `config` file or defaults
//! - An [`Acceptor`] spreading connections over the dispatcher pool
//! - Delimiter framing with a bounded line length
//!
//! Set `tls_server_cert` and `tls_server_key` in the config file to serve
//! TLS instead of plaintext.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example echo_server -- -v --bind 127.0.0.1:7000
//! ```

use clap::Parser;
use config::Config;
use nbconn::prelude::*;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const MAX_LINE: usize = 64 * 1024;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the nbconn crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("nbconn={level}");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Line echo server", long_about = None)]
struct Args {
    /// Address to bind server to
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    bind: String,

    /// Number of dispatcher threads (overrides the config file)
    #[arg(short, long)]
    dispatchers: Option<usize>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Handler
// ============================================================================

struct LineEcho;

impl ConnectionHandler for LineEcho {
    fn on_connect(&self, connection: &Connection) -> Result<bool, Error> {
        println!("{} connected", connection.remote_addr());
        Ok(true)
    }

    fn on_data(&self, connection: &Connection) -> Result<bool, Error> {
        while let Some(line) = connection.read_bytes_by_delimiter(b"\n", MAX_LINE)? {
            if line.as_ref() == b"quit" {
                connection.write_str("bye\n")?;
                connection.close()?;
                break;
            }
            connection.write_segments(vec![line, bytes::Bytes::from_static(b"\n")])?;
        }
        Ok(true)
    }

    fn on_disconnect(&self, connection: &Connection) -> Result<bool, Error> {
        println!(
            "{} disconnected ({} bytes in, {} bytes out)",
            connection.remote_addr(),
            connection.received_bytes(),
            connection.sent_bytes()
        );
        Ok(true)
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut builder = Config::builder();
    if let Some(config_path) = &args.config {
        builder = builder.add_source(config::File::with_name(config_path));
    }
    if let Some(dispatchers) = args.dispatchers {
        builder = match builder.set_override("dispatcher_pool_size", dispatchers as i64) {
            Ok(builder) => builder,
            Err(err) => {
                eprintln!("Invalid dispatcher count: {err}");
                return ExitCode::FAILURE;
            }
        };
    }
    let config = match builder.build() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let context = match IoContext::new(&config) {
        Ok(context) => context,
        Err(err) => {
            eprintln!("Failed to initialize context: {err}");
            return ExitCode::FAILURE;
        }
    };

    let acceptor = match Acceptor::bind(&context, &args.bind, HandlerPrototype::shared(LineEcho)) {
        Ok(acceptor) => acceptor,
        Err(err) => {
            eprintln!("Failed to listen on {}: {err}", args.bind);
            return ExitCode::FAILURE;
        }
    };
    println!("Echoing lines on {}", acceptor.local_addr());

    let result = acceptor.run();
    context.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Acceptor failed: {err}");
            ExitCode::FAILURE
        }
    }
}
