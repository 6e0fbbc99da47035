use std::io;

use log::error;
use mmap_fork_probe::{logger, MappingConfig, Native, ProbeError, Result, USAGE};

fn run() -> Result<()> {
    let config = match MappingConfig::from_args(std::env::args().skip(1)) {
        Err(e @ ProbeError::Help) => {
            print!("{}", USAGE);
            return Err(e);
        }
        Err(e @ ProbeError::Usage(_)) => {
            error!("{}", e);
            print!("{}", USAGE);
            return Err(e);
        }
        res => res?,
    };
    logger::set_verbosity(config.verbosity());

    mmap_fork_probe::run(&config, &mut Native, &mut io::stdin().lock())?;
    Ok(())
}

fn main() {
    if let Err(e) = logger::init() {
        eprintln!("could not install logger: {}", e);
    }

    if let Err(e) = run() {
        if !matches!(e, ProbeError::Help | ProbeError::Usage(_)) {
            error!("{}", e);
        }
        std::process::exit(e.exit_code());
    }
}
