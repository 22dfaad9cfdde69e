//! VoltKV - A Redis-Wire-Compatible In-Memory Key-Value Server
//!
//! This is the main entry point for the VoltKV server. It parses the CLI
//! flags, seeds the keyspace from a snapshot if one is configured, starts
//! the background expiry sweeper and (for replicas) the replication
//! client, and then accepts connections.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use voltkv::connection::{handle_connection, ConnectionStats};
use voltkv::server::{Config, Role, Server};
use voltkv::storage::{start_expiry_sweeper, StorageEngine};

/// Parses configuration from command-line arguments.
fn config_from_args() -> Config {
    let mut config = Config::default();
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    config.port = args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 2;
                } else {
                    eprintln!("Error: --port requires a value");
                    std::process::exit(1);
                }
            }
            "--dir" => {
                if i + 1 < args.len() {
                    config.dir = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: --dir requires a value");
                    std::process::exit(1);
                }
            }
            "--dbfilename" => {
                if i + 1 < args.len() {
                    config.dbfilename = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: --dbfilename requires a value");
                    std::process::exit(1);
                }
            }
            "--replicaof" => {
                if i + 1 < args.len() {
                    let parts: Vec<&str> = args[i + 1].split_whitespace().collect();
                    if parts.len() != 2 {
                        eprintln!("Error: --replicaof expects \"<host> <port>\"");
                        std::process::exit(1);
                    }
                    let port = parts[1].parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid --replicaof port");
                        std::process::exit(1);
                    });
                    config.replica_of = Some((parts[0].to_string(), port));
                    i += 2;
                } else {
                    eprintln!("Error: --replicaof requires a value");
                    std::process::exit(1);
                }
            }
            "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-v" => {
                println!("VoltKV version {}", voltkv::VERSION);
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    config
}

fn print_help() {
    println!(
        r#"
VoltKV - A Redis-Wire-Compatible In-Memory Key-Value Server

USAGE:
    voltkv [OPTIONS]

OPTIONS:
    -p, --port <PORT>          Port to listen on (default: 6379)
        --dir <PATH>           Directory holding the snapshot file
        --dbfilename <NAME>    Snapshot file to load at startup
        --replicaof "<H> <P>"  Follow the primary at host H, port P
    -v, --version              Print version information
        --help                 Print this help message

EXAMPLES:
    voltkv                                  # Primary on 127.0.0.1:6379
    voltkv --port 6380                      # Primary on port 6380
    voltkv --dir /data --dbfilename dump.rdb
    voltkv --port 6380 --replicaof "127.0.0.1 6379"

CONNECTING:
    Use redis-cli or any Redis client:
    $ redis-cli -p 6379
    127.0.0.1:6379> PING
    PONG
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config_from_args();

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let storage = Arc::new(StorageEngine::new());

    // Seed the keyspace from the snapshot. Loader failures are not fatal;
    // the server starts empty.
    if config.role() == Role::Primary {
        if let Some(path) = config.snapshot_path() {
            match voltkv::snapshot::load_snapshot(&path, &storage) {
                Ok(stats) => info!(
                    path = %path.display(),
                    loaded = stats.loaded,
                    "Keyspace seeded from snapshot"
                ),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Snapshot load failed, starting with an empty keyspace"
                ),
            }
        }
    }

    let _sweeper = start_expiry_sweeper(Arc::clone(&storage));

    let server = Arc::new(Server::new(config, storage));
    let stats = Arc::new(ConnectionStats::new());

    // A replica drives its own connection to the primary. Handshake or
    // link failures are fatal; the operator restarts the process.
    if server.role() == Role::Replica {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = voltkv::replication::run_replica(server).await {
                error!(error = %e, "Replication link failed");
                std::process::exit(1);
            }
        });
    }

    let bind_address = server.config().bind_address();
    let listener = TcpListener::bind(&bind_address).await?;
    info!(
        address = %bind_address,
        role = ?server.role(),
        "VoltKV v{} listening",
        voltkv::VERSION
    );

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received, stopping server...");
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&server), stats) => {}
        _ = shutdown => {}
    }

    let storage_stats = server.storage().stats();
    info!(
        keys = storage_stats.keys,
        gets = storage_stats.get_ops,
        sets = storage_stats.set_ops,
        "Server shutdown complete"
    );
    Ok(())
}

/// Main loop that accepts incoming connections.
async fn accept_loop(listener: TcpListener, server: Arc<Server>, stats: Arc<ConnectionStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let server = Arc::clone(&server);
                let stats = Arc::clone(&stats);

                tokio::spawn(async move {
                    handle_connection(stream, addr, server, stats).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
