//! STARTTLS example - upgrading a plaintext connection to TLS
//!
//! A server and a client run in one process. Both start in plaintext; the
//! client asks for `STARTTLS`, the server answers `GO` and both sides switch
//! the same connection to TLS. Everything after that is encrypted.
//!
//! A throwaway self-signed certificate for `localhost` is generated at
//! startup.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example starttls -- -vv
//! ```

use clap::Parser;
use nbconn::prelude::*;
use nbconn::{Settings, TlsStart};
use std::io::Write;
use std::process::ExitCode;
use std::sync::mpsc::{channel, Sender};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("nbconn={level}")))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Parser)]
#[command(author, version, about = "STARTTLS upgrade demo", long_about = None)]
struct Args {
    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// ============================================================================
// Server Side
// ============================================================================

struct UpgradingServer;

impl ConnectionHandler for UpgradingServer {
    fn on_data(&self, connection: &Connection) -> Result<bool, Error> {
        while let Some(line) = connection.read_string_by_delimiter(b"\n", 1024)? {
            if line == "STARTTLS" {
                // Hold back the client hello until the upgrade is in place
                connection.prepare_secured_mode()?;
                connection.write_str("GO\n")?;
                connection.activate_secured_mode()?;
                continue;
            }
            let secure = if connection.is_secure() { "secure" } else { "plain" };
            println!("server: received {line:?} ({secure})");
            connection.write_str(&format!("{line}\n"))?;
        }
        Ok(true)
    }
}

// ============================================================================
// Client Side
// ============================================================================

struct UpgradingClient {
    done: Mutex<Sender<String>>,
}

impl ConnectionHandler for UpgradingClient {
    fn on_connect(&self, connection: &Connection) -> Result<bool, Error> {
        connection.write_str("STARTTLS\n")?;
        Ok(true)
    }

    fn on_data(&self, connection: &Connection) -> Result<bool, Error> {
        while let Some(line) = connection.read_string_by_delimiter(b"\n", 1024)? {
            if line == "GO" {
                connection.activate_secured_mode()?;
                // Queued until the handshake completes
                connection.write_str("hello over tls\n")?;
                continue;
            }
            println!("client: received {line:?}");
            connection.close()?;
            let _ = self
                .done
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .send(line);
        }
        Ok(true)
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn write_temp(contents: &str) -> std::io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn path_of(file: &NamedTempFile) -> Option<String> {
    file.path().to_str().map(str::to_string)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let certified = match rcgen::generate_simple_self_signed(vec!["localhost".into()]) {
        Ok(certified) => certified,
        Err(err) => {
            eprintln!("Failed to generate certificate: {err}");
            return ExitCode::FAILURE;
        }
    };
    let (cert_file, key_file) = match (
        write_temp(&certified.cert.pem()),
        write_temp(&certified.key_pair.serialize_pem()),
    ) {
        (Ok(cert), Ok(key)) => (cert, key),
        _ => {
            eprintln!("Failed to write certificate files");
            return ExitCode::FAILURE;
        }
    };

    let server_settings = Settings {
        name: "server".to_string(),
        tls_server_cert: path_of(&cert_file),
        tls_server_key: path_of(&key_file),
        tls_start: Some(TlsStart::OnDemand),
        ..Settings::default()
    };
    let client_settings = Settings {
        name: "client".to_string(),
        tls_ca_cert: path_of(&cert_file),
        tls_start: Some(TlsStart::OnDemand),
        ..Settings::default()
    };

    let (server, client) = match (
        IoContext::from_settings(server_settings),
        IoContext::from_settings(client_settings),
    ) {
        (Ok(server), Ok(client)) => (server, client),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("Failed to initialize context: {err}");
            return ExitCode::FAILURE;
        }
    };

    let acceptor =
        match Acceptor::bind(&server, "127.0.0.1:0", HandlerPrototype::shared(UpgradingServer)) {
            Ok(acceptor) => acceptor,
            Err(err) => {
                eprintln!("Failed to listen: {err}");
                return ExitCode::FAILURE;
            }
        };
    let addr = acceptor.local_addr();
    let (handle, thread) = match acceptor.spawn() {
        Ok(spawned) => spawned,
        Err(err) => {
            eprintln!("Failed to start acceptor: {err}");
            return ExitCode::FAILURE;
        }
    };

    let (tx, rx) = channel();
    let prototype = HandlerPrototype::shared(UpgradingClient { done: Mutex::new(tx) });
    let exit = match client.connect(addr, &prototype) {
        Ok(_connection) => match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(reply) if reply == "hello over tls" => ExitCode::SUCCESS,
            Ok(reply) => {
                eprintln!("Unexpected reply {reply:?}");
                ExitCode::FAILURE
            }
            Err(_) => {
                eprintln!("No reply within 5 seconds");
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            eprintln!("Failed to connect: {err}");
            ExitCode::FAILURE
        }
    };

    handle.shutdown();
    let _ = thread.join();
    client.shutdown();
    server.shutdown();
    exit
}
