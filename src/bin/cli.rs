use color_eyre::Report;
use phasespace::cli_functions::cli;
use std::env;

fn main() -> Result<(), Report> {
    cli(&env::args().collect::<Vec<_>>())
}
