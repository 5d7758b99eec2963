use std::io;
use std::path::PathBuf;
use std::process;

use anyhow::{anyhow, Context};
use clap::Parser;

use package::Package;
use vm::interpreter::{interpret, Outcome};
use vm::Vm;

/// Interpret a CodeSwitch package.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Validate all packages before interpreting anything
    #[arg(short = 'v', long = "validate")]
    validate: bool,

    /// The .cswp package to run
    package: PathBuf,
}

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .env()
        .init()
        .ok();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(Outcome::Finished) => {}
        Ok(Outcome::Exit(status)) => process::exit(status as i32),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<Outcome> {
    let vm = Vm::new().context("creating the virtual machine")?;
    let package = Package::read_from_file(&cli.package, vm.roots())?;
    if cli.validate {
        package.validate()?;
    }

    let entry = package.function_by_name("main")?.ok_or_else(|| {
        anyhow!(
            "{}: could not find entry function 'main'",
            cli.package.display()
        )
    })?;

    let mut out = io::stderr();
    let outcome = interpret(&package, &entry, &vm, &mut out)?;
    Ok(outcome)
}
