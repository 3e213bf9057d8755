// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

use bpaf::{Bpaf, Parser};
use std::path::PathBuf;
use tracing::{debug, error};

mod camera;
mod cctv;
mod config;
mod dvrip;
mod frame;
mod h264;
mod h265;
mod monitor;
mod mux;
mod recorder;
mod rtsp;
mod run;
mod stream;
mod supervise;
mod web;
mod webcast;

fn parse_config() -> impl Parser<PathBuf> {
    bpaf::long("config")
        .help("Path to the YAML configuration file.")
        .argument::<PathBuf>("PATH")
        .fallback("config.yaml".into())
        .debug_fallback()
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Watchpost: multi-camera IP video recorder and live re-broadcaster.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
struct Args {
    #[bpaf(external(parse_config))]
    config: PathBuf,
}

fn main() {
    base::tracing_setup::install();

    let args = match args().fallback_to_usage().run_inner(bpaf::Args::current_args()) {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match run::run(run::Args {
        config: args.config,
    }) {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {rv}");
            std::process::exit(rv);
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
