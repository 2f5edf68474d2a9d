//! minitm - an XA transaction manager
//!
//! Peers (clients, resource proxy instances, other domains) connect over TCP and
//! exchange newline-delimited JSON messages with the transaction manager.

use std::path::PathBuf;
use log::info;

use minitm::{Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    let port: u16 = args[i + 1].parse()?;
                    config.bind_addr = format!("127.0.0.1:{}", port).parse()?;
                    i += 1;
                }
            }
            "--log-dir" | "-d" => {
                if i + 1 < args.len() {
                    config.log_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.load_resources(&PathBuf::from(&args[i + 1]))?;
                    i += 1;
                }
            }
            "--batch" | "-b" => {
                if i + 1 < args.len() {
                    config.log.batch_size = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("minitm - an XA transaction manager");
                println!();
                println!("Usage: minitm [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -p, --port PORT       Port to listen on (default: 7400)");
                println!("  -d, --log-dir DIR     Transaction log directory (default: ./data)");
                println!("  -c, --config FILE     Resource configuration (JSON)");
                println!("  -b, --batch N         Replies per log flush (default: 64)");
                println!("  -h, --help            Show this help");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!("Starting minitm...");

    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
