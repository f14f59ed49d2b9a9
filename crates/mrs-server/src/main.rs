use anyhow::Result;
use clap::Parser;
use mrs_server::cli::{Cli, Command};
use mrs_server::config::Config;
use mrs_server::tracing::initialize_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { cors_origin, bind } => {
            let mut config = Config::from_env()?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            tracing::info!(server_url = %config.server_url, bind = %config.bind, "starting registry");

            let bind = config.bind;
            let app = mrs_server::app(config, cors_origin.as_ref()).await;
            let listener = tokio::net::TcpListener::bind(bind).await?;
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
