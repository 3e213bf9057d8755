// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The pull interface over a live camera stream.

use crate::frame::Frame;
use base::Error;

/// A single-consumer source of normalized frames, backed by either a DVRIP
/// or an RTSP session. Dropping a monitor tears its transport down.
#[async_trait::async_trait]
pub trait Monitor: Send {
    /// Pulls the next frame, in arrival order.
    async fn next_frame(&mut self) -> Result<Frame, Error>;
}
