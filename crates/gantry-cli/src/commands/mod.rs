//! CLI command implementations.

pub mod builds;
pub mod jobs;

use anyhow::Result;
use gantry_config::parse_node_config;

pub fn validate(path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    match parse_node_config(&content) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  listen:   {}", config.listen);
            println!("  peer url: {}", config.peer_url);
            match &config.database {
                Some(db) => println!("  database: {} connections", db.max_connections),
                None => println!("  database: in-process (single node only)"),
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
