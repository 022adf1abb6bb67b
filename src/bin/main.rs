use cache_proxy::{cli, config::AppConfig, error::Result, server::Server};

fn main() -> Result<()> {
    let content = std::fs::read_to_string("config.yaml")?;
    let config = AppConfig::from_str(&content)?;

    config.display_config();

    if std::env::args().any(|a| a == "--debug-cli") {
        cli::run_repl();
        return Ok(());
    }

    let server = Server::new(config)?;
    server.run()
}
