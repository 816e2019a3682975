mod cli;
mod run;
mod scene;
mod table;

use anyhow::Result;
use cli::Command;
use maskgen::TableParams;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();
    let config = run::resolve_config(&cli)?;

    match &cli.command {
        Command::Render(args) => run::render(&config, args),
        Command::Table(args) => {
            let technique = &config.technique;
            let params = TableParams {
                sample_count: technique.sample_count,
                dither_table_size: technique.dither_table_size,
                alpha_levels: technique.alpha_levels,
                seed: technique.seed,
            };
            print!("{}", table::report(params, args.all_rows)?);
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
