use clap::Parser;
use canary::cli::Cli;
use canary::core::output;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match canary::run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    }
}
