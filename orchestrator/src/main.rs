use clap::{Parser, Subcommand};
use trainyard_core::time::RealClock;
use trainyard_orchestrator::{
    binaries::{cli, orchestrator},
    binary_utils::trainyard_main,
};

#[derive(Debug, Parser)]
#[clap(multicall = true)]
enum Options {
    #[clap(name = "trainyard-orchestrator")]
    Orchestrator(orchestrator::Options),
    #[clap(name = "trainyard-cli")]
    Cli(cli::CommandLineOptions),
    #[clap(name = "trainyard", subcommand)]
    Default(Nested),
}

#[derive(Debug, Subcommand)]
#[clap(
    about = "Trainyard ML job orchestrator",
    version = env!("CARGO_PKG_VERSION"),
)]
enum Nested {
    #[clap(name = "orchestrator")]
    Orchestrator(orchestrator::Options),
    #[clap(name = "cli")]
    Cli(cli::CommandLineOptions),
}

fn main() -> anyhow::Result<()> {
    match Options::parse() {
        Options::Orchestrator(options) | Options::Default(Nested::Orchestrator(options)) => {
            tokio_main(options)
        }
        Options::Cli(options) | Options::Default(Nested::Cli(options)) => cli::run(options),
    }
}

#[tokio::main]
async fn tokio_main(options: orchestrator::Options) -> anyhow::Result<()> {
    trainyard_main(options, RealClock::default(), orchestrator::main_callback).await
}
