// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! One configured camera and the supervision of its streams.
//!
//! The camera's own job is small: notice that a stream it should be saving
//! is missing, check the device answers its TCP port, and (re)create the
//! stream. Webcast-only streams are created on viewer demand instead, via
//! [`Camera::get_stream`]. Wrong credentials disable the camera permanently.

use crate::config::{CameraConfig, StreamId};
use crate::stream::Stream;
use crate::supervise::{sleep_cancellable, NodeHandle, Supervisor};
use base::clock::Clocks;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::info;

/// Budget for the TCP liveness probe. This races kernel SYN retries, so a
/// transient drop can report the camera offline; the 5 s retry absorbs it.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const OFFLINE_RETRY: Duration = Duration::from_secs(5);

/// The camera task's idle quantum.
const IDLE_TICK: Duration = Duration::from_millis(100);

pub struct Camera {
    weak: Weak<Camera>,
    sup: Supervisor,
    cfg: CameraConfig,
    dst_dir: PathBuf,
    clocks: Arc<dyn Clocks>,
    fragment_duration_divisor: u32,
    disabled: AtomicBool,
    streams: base::Mutex<HashMap<StreamId, Arc<Stream>>>,
}

impl Camera {
    pub fn new(
        parent: &Supervisor,
        cfg: CameraConfig,
        base_dir: &Path,
        clocks: Arc<dyn Clocks>,
        fragment_duration_divisor: u32,
    ) -> Arc<Camera> {
        let sup = Supervisor::child_of(parent, format!("camera [{}]", cfg.name), true);
        let dst_dir = base_dir.join(&cfg.name);
        let disabled = AtomicBool::new(cfg.disabled);
        Arc::new_cyclic(|weak| Camera {
            weak: weak.clone(),
            sup,
            cfg,
            dst_dir,
            clocks,
            fragment_duration_divisor,
            disabled,
            streams: base::Mutex::new(HashMap::new()),
        })
    }

    pub fn start(&self) -> NodeHandle {
        let me = self.weak.upgrade().expect("camera is alive while starting");
        self.sup.start(me.run())
    }

    pub(crate) fn weak_handle(&self) -> Weak<Camera> {
        self.weak.clone()
    }

    pub fn sup(&self) -> &Supervisor {
        &self.sup
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &CameraConfig {
        &self.cfg
    }

    pub fn dst_dir(&self) -> &Path {
        &self.dst_dir
    }

    pub fn clocks(&self) -> Arc<dyn Clocks> {
        self.clocks.clone()
    }

    pub fn fragment_duration_divisor(&self) -> u32 {
        self.fragment_duration_divisor
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Marks the camera terminally broken (wrong credentials) and stops it.
    /// It will not be retried.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
        self.sup.stop();
    }

    async fn run(self: Arc<Self>) {
        let token = self.sup.token().clone();
        loop {
            if token.is_cancelled() || self.is_disabled() {
                break;
            }
            if !self.cfg.save.is_empty() && !self.saving_all_it_should() {
                if self.is_online().await {
                    for id in &self.cfg.save {
                        self.get_stream(*id);
                    }
                } else {
                    info!("{} is offline, retrying in 5s", self.sup.id());
                    if !sleep_cancellable(&token, OFFLINE_RETRY).await {
                        break;
                    }
                }
            } else if !sleep_cancellable(&token, IDLE_TICK).await {
                break;
            }
        }
    }

    fn saving_all_it_should(&self) -> bool {
        let streams = self.streams.lock();
        self.cfg.save.iter().all(|id| {
            streams
                .get(id)
                .map(|s| !s.sup().is_stopping())
                .unwrap_or(false)
        })
    }

    async fn is_online(&self) -> bool {
        let addr = (self.cfg.address.as_str(), self.cfg.probe_port());
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Returns the live stream with the given id, creating and starting it
    /// if there is none (or only a stopping one).
    pub fn get_stream(&self, id: StreamId) -> Arc<Stream> {
        let mut streams = self.streams.lock();
        if let Some(s) = streams.get(&id) {
            if !s.sup().is_stopping() {
                return s.clone();
            }
        }
        let stream = Stream::new(self, id);
        let me = self.weak.clone();
        stream.sup().on_stop(move || {
            if let Some(camera) = me.upgrade() {
                let mut map = camera.streams.lock();
                // Only drop the entry if it wasn't already replaced.
                let stale = map.get(&id).map(|s| s.sup().is_stopping()).unwrap_or(false);
                if stale {
                    map.remove(&id);
                }
            }
        });
        self.sup.watch_child(stream.sup());
        let handle = stream.sup().start(stream.clone().run());
        self.sup.add_child(handle);
        streams.insert(id, stream.clone());
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::RealClocks;

    fn test_camera() -> Arc<Camera> {
        let root = Supervisor::root("cctv");
        // TEST-NET address: no monitor will ever come up.
        let cfg: CameraConfig =
            serde_yaml::from_str("Name: t\nAddress: 192.0.2.1\nSave: [0]").unwrap();
        Camera::new(
            &root,
            cfg,
            Path::new("/nonexistent"),
            Arc::new(RealClocks),
            12_000,
        )
    }

    #[tokio::test]
    async fn at_most_one_stream_per_id() {
        let camera = test_camera();
        let s1 = camera.get_stream(StreamId::Main);
        let s2 = camera.get_stream(StreamId::Main);
        assert!(Arc::ptr_eq(&s1, &s2));
        let s3 = camera.get_stream(StreamId::Extra);
        assert!(!Arc::ptr_eq(&s1, &s3));
        camera.sup().stop();
    }

    #[tokio::test]
    async fn stopping_stream_is_replaced() {
        let camera = test_camera();
        let s1 = camera.get_stream(StreamId::Main);
        s1.sup().stop();
        let s2 = camera.get_stream(StreamId::Main);
        assert!(!Arc::ptr_eq(&s1, &s2));
        camera.sup().stop();
    }

    #[test]
    fn disable_is_permanent() {
        let cfg: CameraConfig = serde_yaml::from_str("Name: t\nAddress: h\nSave: [0]").unwrap();
        let root = Supervisor::root("cctv");
        let camera = Camera::new(&root, cfg, Path::new("/nonexistent"), Arc::new(RealClocks), 12_000);
        assert!(!camera.is_disabled());
        camera.disable();
        assert!(camera.is_disabled());
        assert!(camera.sup().is_stopping());
    }
}
