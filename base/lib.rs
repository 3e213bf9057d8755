// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

pub mod clock;
mod error;
mod lock;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};
pub use crate::lock::Mutex;
