// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Client for the DVRIP (Sofia/XMeye-family) binary protocol spoken by many
//! DVR/IP-camera ODM firmwares on TCP port 34567.

mod client;
mod media;
mod monitor;
mod packet;
mod pts;

pub use client::{sofia_hash, Client, PORT};
pub use monitor::Monitor;
