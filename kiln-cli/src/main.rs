//! The kiln terminal client.

mod command;
mod watch;

use anyhow::Result;
use structopt::StructOpt;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Monitor and control a kiln build cluster.
#[derive(StructOpt)]
#[structopt(name = "kiln")]
struct Kiln {
    /// Address of the yamb hub brokering the cluster.
    #[structopt(long, default_value = "::1")]
    hub: String,
    /// Enable debug logging.
    #[structopt(short)]
    verbose: bool,
    #[structopt(subcommand)]
    action: Option<Action>,
}

#[derive(StructOpt)]
enum Action {
    /// Stream cluster activity to the terminal (the default).
    #[structopt(name = "watch")]
    Watch,
    /// Send a command to a build master.
    #[structopt(name = "master")]
    Master {
        /// Identity of the target build master.
        identity: String,
        #[structopt(subcommand)]
        cmd: command::MasterCmd,
    },
    /// Send a command to a build node.
    #[structopt(name = "node")]
    Node {
        /// Identity of the target build node.
        identity: String,
        #[structopt(subcommand)]
        cmd: command::NodeCmd,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Kiln::from_args();

    let filter = if opts.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(if opts.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO })
        .init();

    match opts.action {
        None | Some(Action::Watch) => watch::run(&opts.hub).await,
        Some(Action::Master { identity, cmd }) => command::run_master(&opts.hub, &identity, cmd).await,
        Some(Action::Node { identity, cmd }) => command::run_node(&opts.hub, &identity, cmd).await,
    }
}
