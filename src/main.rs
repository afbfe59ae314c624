//! wipercheck-infra CLI.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "wipercheck-infra",
    version,
    about = "Declarative AWS infrastructure for wipercheck: synthesize, plan, deploy, detect drift"
)]
struct Cli {
    #[command(subcommand)]
    command: wipercheck_infra::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = wipercheck_infra::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
