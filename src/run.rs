// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The daemon: load the configuration, build the supervision tree, serve
//! until a signal arrives, then unwind it.

use crate::cctv::Cctv;
use crate::{config, web};
use base::clock::RealClocks;
use base::{bail, Error};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

pub struct Args {
    pub config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = config::load(&args.config)?;
    if config.cameras.is_empty() {
        info!("no cameras configured");
        return Ok(0);
    }
    if !config.cameras.iter().any(|c| c.has_anything_to_do()) {
        info!("no cameras specify anything to do (Save or WebCast)");
        return Ok(0);
    }
    info!("started with {} camera(s)", config.cameras.len());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(run_async(config));

    // Don't wait on stray connection tasks; the tree is already down.
    rt.shutdown_background();
    result
}

async fn run_async(config: config::Config) -> Result<i32, Error> {
    let cctv = Cctv::new(&config, Arc::new(RealClocks));
    if !cctv.has_anything_to_do() {
        info!("no cameras specify anything to do (Save or WebCast)");
        return Ok(0);
    }
    let handle = cctv.start();

    if !cctv.webcast_ids().is_empty() {
        match config.web_cast_port {
            Some(port) => {
                let cctv = cctv.clone();
                tokio::spawn(async move {
                    if let Err(e) = web::serve(cctv, &port).await {
                        error!(err = %e.chain(), "webcast server failed");
                    }
                });
            }
            None => bail!(
                InvalidArgument,
                msg("cameras have WebCast streams but no WebCastPort is set")
            ),
        }
    }

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = int.recv() => info!("got SIGINT; shutting down"),
        _ = term.recv() => info!("got SIGTERM; shutting down"),
    }
    cctv.stop();
    tokio::select! {
        _ = handle.join() => {}
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
    }
    info!("all finished");
    Ok(0)
}
