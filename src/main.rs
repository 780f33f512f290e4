//! # logvault
//!
//! Command-line entry point. See [`logvault::cli`] for the available commands.

#[tokio::main]
async fn main() {
    if let Err(e) = logvault::cli::parse_cli_commands().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
