mod steward;

use log::error;
use std::env;

use crate::steward::{run_steward, StewardRunOptions};
use sums_lib::{parse_config_arg, DEFAULT_SUMS_CONFIG_PATH};

fn usage() -> String {
    format!(
        "usage: sums_steward [--config <path>] [--once]\n\
         defaults:\n\
         --config {}",
        DEFAULT_SUMS_CONFIG_PATH
    )
}

fn parse_args() -> Result<StewardRunOptions, String> {
    let mut args = env::args().skip(1).collect::<Vec<String>>();
    let once = match args.iter().position(|arg| arg == "--once") {
        Some(idx) => {
            args.remove(idx);
            true
        }
        None => false,
    };
    let config_path = parse_config_arg(&args, &usage())?;
    Ok(StewardRunOptions { config_path, once })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_steward(options) {
        error!("run sums_steward failed: {}", err);
        std::process::exit(1);
    }
}
