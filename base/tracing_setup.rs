// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Logic for setting up a `tracing` subscriber according to our preferences.

use tracing_subscriber::{fmt::format::Writer, fmt::time::FormatTime, EnvFilter};

/// The environment variable holding the log filter, e.g.
/// `WATCHPOST_LOG=info,watchpost::dvrip=debug`.
const FILTER_ENV: &str = "WATCHPOST_LOG";

struct UtcTimer;

impl FormatTime for UtcTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            jiff::Timestamp::now().strftime("%Y-%m-%dT%H:%M:%S%.6fZ")
        )
    }
}

fn make_filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber and a panic hook that routes panic messages
/// through `tracing` before the default hook aborts the process.
pub fn install() {
    tracing_subscriber::fmt()
        .with_env_filter(make_filter())
        .with_timer(UtcTimer)
        .with_writer(std::io::stderr)
        .init();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |p| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed-thread");
        match p.location() {
            Some(l) => tracing::error!(
                target: "panic",
                "thread {thread_name} panicked at {}:{}: {p}",
                l.file(),
                l.line()
            ),
            None => tracing::error!(target: "panic", "thread {thread_name} panicked: {p}"),
        }
        default_hook(p);
    }));
}

/// Installs a basic subscriber for tests; repeated calls are no-ops.
pub fn install_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(make_filter())
        .with_writer(std::io::stderr)
        .with_test_writer()
        .try_init();
}
