// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Container muxers: Matroska for recordings, fragmented MP4 for live view.

pub mod mkv;
pub mod mp4;
