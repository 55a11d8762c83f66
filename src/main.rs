//! EmberKV - A Durable In-Memory Key-Value Server
//!
//! This is the main entry point for the EmberKV server.
//! It parses flags, sets up logging and hands control to the event loop.

use emberkv::config::ServerConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command-line flags that map one to one onto configuration options.
const VALUE_FLAGS: &[(&str, &str)] = &[
    ("--host", "host"),
    ("-h", "host"),
    ("--port", "port"),
    ("-p", "port"),
    ("--dir", "dir"),
    ("--appendonly", "appendonly"),
    ("--appendfilename", "appendfilename"),
    ("--appendfsync", "appendfsync"),
    ("--aof-load-truncated", "aof-load-truncated"),
    ("--no-appendfsync-on-rewrite", "no-appendfsync-on-rewrite"),
    ("--hz", "hz"),
    ("--maxclients", "maxclients"),
    ("--databases", "databases"),
];

/// Parse configuration from command-line arguments
fn from_args() -> ServerConfig {
    let mut config = ServerConfig::default();
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-v" => {
                println!("EmberKV version {}", emberkv::VERSION);
                std::process::exit(0);
            }
            _ => {}
        }

        let Some(&(_, option)) = VALUE_FLAGS.iter().find(|(flag, _)| *flag == arg) else {
            eprintln!("Unknown argument: {}", arg);
            print_help();
            std::process::exit(1);
        };
        let Some(value) = args.get(i + 1) else {
            eprintln!("Error: {} requires a value", arg);
            std::process::exit(1);
        };
        if let Err(e) = config.set(option, value) {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        i += 2;
    }

    config
}

fn print_help() {
    println!(
        r#"
EmberKV - A Durable In-Memory Key-Value Server

USAGE:
    emberkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>                      Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>                      Port to listen on (default: 6379)
        --dir <DIR>                        Directory of the append-only log (default: .)
        --appendonly <yes|no>              Enable the append-only log (default: no)
        --appendfilename <NAME>            Log file name (default: appendonly.aof)
        --appendfsync <always|everysec|no> Fsync policy (default: everysec)
        --aof-load-truncated <yes|no>      Load a log with a truncated tail (default: yes)
        --no-appendfsync-on-rewrite <yes|no>
                                           Skip fsync while a rewrite runs (default: no)
        --hz <N>                           Cron runs per second (default: 10)
        --maxclients <N>                   Maximum connected clients (default: 10000)
        --databases <N>                    Number of databases (default: 16)
    -v, --version                          Print version information
        --help                             Print this help message

EXAMPLES:
    emberkv                                       # Start on 127.0.0.1:6379
    emberkv --appendonly yes --dir /var/lib/ember # Persist to /var/lib/ember/appendonly.aof
    emberkv --appendfsync always                  # Fsync on every write

CONNECTING:
    Use redis-cli or any Redis client to connect:
    $ redis-cli -p 6379
    127.0.0.1:6379> SET name "Ariz"
    OK
    127.0.0.1:6379> BGREWRITEAOF
    Background append only file rewriting started
"#
    );
}

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
EmberKV v{} - Durable In-Memory Key-Value Server
──────────────────────────────────────────────────────────────
Server starting on {}
Append-only log: {} (fsync {})

Use Ctrl+C to shutdown gracefully.
"#,
        emberkv::VERSION,
        config.bind_address(),
        if config.aof.enabled { "on" } else { "off" },
        config.aof.fsync,
    );
}

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = from_args();

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner(&config);

    if let Err(e) = emberkv::server::run(config) {
        error!(error = %e, "Server stopped on a fatal error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
