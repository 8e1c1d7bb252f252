use std::process::ExitCode;

use clap::Parser;

use pixelsync::cli;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::CliArgs::parse();
    cli::run(args).await
}
