//! Gateway binary: load configuration, wire up tracing and serve.

use relay_gateway::core::config::GatewayConfig;
use relay_gateway::core::error::GatewayResult;
use relay_gateway::gateway::server::GatewayServer;
use relay_gateway::observability;
use std::process;
use tracing::{error, info};

struct CliArgs {
    config_path: String,
    host: Option<String>,
    port: Option<u16>,
    json_logs: bool,
}

fn print_usage() {
    println!("relay-gateway - reverse proxy API gateway");
    println!();
    println!("USAGE:");
    println!("    relay-gateway [OPTIONS] [CONFIG_PATH]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>    Configuration file [default: gateway.yaml]");
    println!("        --host <HOST>      Override the bind address");
    println!("        --port <PORT>      Override the bind port");
    println!("        --json-logs        Emit logs as JSON");
    println!("    -h, --help             Print this help");
}

fn parse_args() -> Result<CliArgs, String> {
    let mut args = CliArgs {
        config_path: "gateway.yaml".to_string(),
        host: None,
        port: None,
        json_logs: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                args.config_path = iter
                    .next()
                    .ok_or_else(|| "--config requires a path".to_string())?;
            }
            "--host" => {
                args.host = Some(iter.next().ok_or_else(|| "--host requires a value".to_string())?);
            }
            "--port" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "--port requires a value".to_string())?;
                args.port = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid port: {}", value))?,
                );
            }
            "--json-logs" => args.json_logs = true,
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            other if !other.starts_with('-') => {
                // Bare path works the same as --config
                args.config_path = other.to_string();
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }

    Ok(args)
}

async fn run(args: CliArgs) -> GatewayResult<()> {
    let mut config = GatewayConfig::load_from_file(&args.config_path).await?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!(
        config = %args.config_path,
        services = config.services.len(),
        "configuration loaded"
    );

    GatewayServer::new(config).await?.run().await
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("error: {}", message);
            eprintln!();
            print_usage();
            process::exit(2);
        }
    };

    observability::init_tracing(args.json_logs);

    if let Err(err) = run(args).await {
        error!(error = %err, "gateway failed");
        process::exit(1);
    }
}
