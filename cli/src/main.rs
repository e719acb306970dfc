use bothost_cli::Cli;
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let output = cli.run()?;
    println!("{output}");
    Ok(())
}
