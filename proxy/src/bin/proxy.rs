//! memproxy binary.

use clap::Parser;
use proxy::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "memproxy")]
#[command(about = "Chunking proxy for memcached")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("No config file specified. Pass a config path or use --print-config");
            std::process::exit(1);
        }
    };

    // Initialize logging
    proxy::logging::init(&config.logging);

    // Install signal handler
    let shutdown = proxy::signal::install_signal_handler();

    // Run the proxy
    if let Err(e) = proxy::run(&config, shutdown) {
        tracing::error!(error = %e, "Proxy error");
        std::process::exit(1);
    }
}

fn print_default_config() {
    let config = r#"# memproxy configuration

[listener]
# Client-facing listener: { type = "tcp", port = ... } or
# { type = "unix", path = ... }
type = "tcp"
port = 11211

[l1]
# Local cache tier. Omit this section to run single-tier against L2.
address = "127.0.0.1:11213"

[l2]
# Remote (authoritative) cache tier
address = "127.0.0.1:11212"

[chunking]
# Payload bytes per stored chunk. Part of the persisted format; values
# written with an older size stay readable after a change.
chunk_size = 1024

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "info"

# Log format: "pretty", "json", or "compact"
format = "pretty"
"#;
    print!("{}", config);
}
