// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The root of the supervision tree: all cameras, plus the lookup the
//! webcast server uses to find casters.

use crate::camera::Camera;
use crate::config::{Config, StreamId};
use crate::supervise::{NodeHandle, Supervisor};
use crate::webcast::Caster;
use base::clock::Clocks;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

pub struct Cctv {
    sup: Supervisor,
    cameras: HashMap<String, Arc<Camera>>,
    /// `"<camera>/<stream id>"` pairs allowed to be webcast.
    webcast_ids: HashSet<String>,
}

impl Cctv {
    pub fn new(config: &Config, clocks: Arc<dyn Clocks>) -> Arc<Cctv> {
        let sup = Supervisor::root("cctv");
        let mut cameras = HashMap::new();
        let mut webcast_ids = HashSet::new();
        for cam in &config.cameras {
            if !cam.has_anything_to_do() {
                continue;
            }
            for id in &cam.webcast {
                webcast_ids.insert(format!("{}/{id}", cam.name));
            }
            let camera = Camera::new(
                &sup,
                cam.clone(),
                &config.base_dir,
                clocks.clone(),
                config.fragment_duration_divisor,
            );
            cameras.insert(cam.name.clone(), camera);
        }
        Arc::new(Cctv {
            sup,
            cameras,
            webcast_ids,
        })
    }

    /// Whether any camera has work configured at all.
    pub fn has_anything_to_do(&self) -> bool {
        !self.cameras.is_empty()
    }

    pub fn webcast_ids(&self) -> &HashSet<String> {
        &self.webcast_ids
    }

    pub fn sup(&self) -> &Supervisor {
        &self.sup
    }

    pub fn start(&self) -> NodeHandle {
        for camera in self.cameras.values() {
            self.sup.watch_child(camera.sup());
            self.sup.add_child(camera.start());
        }
        info!("supervising {} camera(s)", self.cameras.len());
        let token = self.sup.token().clone();
        self.sup.start(async move { token.cancelled().await })
    }

    /// Requests a graceful stop of the whole tree; the caller awaits the
    /// handle returned by [`Cctv::start`].
    pub fn stop(&self) {
        self.sup.stop();
    }

    /// Finds (or lazily builds) the caster for a webcast endpoint. `None`
    /// when the pair isn't configured or the pipeline can't come up.
    pub async fn get_caster(&self, camera: &str, stream: &str) -> Option<Arc<Caster>> {
        if !self.webcast_ids.contains(&format!("{camera}/{stream}")) {
            return None;
        }
        let camera = self.cameras.get(camera)?;
        if camera.is_disabled() || camera.sup().is_stopping() {
            return None;
        }
        let id: u8 = stream.parse().ok()?;
        let id = StreamId::try_from(id).ok()?;
        let stream = camera.get_stream(id);
        stream.get_caster().await
    }
}
