use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use url::Url;

#[derive(Debug, Parser)]
#[clap(name = "mrs-server")]
#[clap(about = "Mixed Reality Service federated spatial registry", long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the registry and serve clients
    Serve {
        /// Optional origin to allow CORS for; omit to disable CORS
        #[clap(long, value_parser)]
        cors_origin: Option<Url>,

        /// Overrides MRS_HOST / MRS_PORT when set
        #[clap(short, long, value_parser)]
        bind: Option<SocketAddr>,
    },
}
