mod handlers;
mod pool;
mod session;
mod sumsd;
mod tape;

use log::error;
use std::env;

use crate::sumsd::{run_sumsd, SumsdRunOptions};
use sums_lib::{parse_config_arg, DEFAULT_SUMS_CONFIG_PATH};

fn usage() -> String {
    format!(
        "usage: sumsd [--config <path>]\n\
         defaults:\n\
         --config {}",
        DEFAULT_SUMS_CONFIG_PATH
    )
}

fn parse_args() -> Result<SumsdRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let config_path = parse_config_arg(&args, &usage())?;
    Ok(SumsdRunOptions { config_path })
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

    if let Err(err) = run_sumsd(options) {
        error!("run sumsd failed: {}", err);
        std::process::exit(1);
    }
}
