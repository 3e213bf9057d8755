// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! One live stream of a camera (main or extra): owns the monitor pulling
//! frames and fans them out to the recorder and the caster.

use crate::camera::Camera;
use crate::config::StreamId;
use crate::frame::Frame;
use crate::monitor::Monitor;
use crate::recorder;
use crate::supervise::{sleep_cancellable, Supervisor};
use crate::webcast::Caster;
use crate::{dvrip, rtsp};
use base::{bail, Error};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Backoff between monitor creation attempts.
const MONITOR_RETRY: Duration = Duration::from_millis(300);

type FrameSender = mpsc::UnboundedSender<Arc<Frame>>;

pub struct Stream {
    weak: Weak<Stream>,
    sup: Supervisor,
    id: StreamId,
    camera: Weak<Camera>,
    /// Compute-once slot; the creation loop holds this lock while retrying.
    monitor: tokio::sync::Mutex<Option<Box<dyn Monitor>>>,
    /// Serializes caster creation.
    caster_make: tokio::sync::Mutex<()>,
    caster: base::Mutex<Option<Arc<Caster>>>,
    caster_tx: base::Mutex<Option<FrameSender>>,
    recorder_tx: base::Mutex<Option<FrameSender>>,
}

impl Stream {
    pub(crate) fn new(camera: &Camera, id: StreamId) -> Arc<Stream> {
        let sup = Supervisor::child_of(
            camera.sup(),
            format!("stream [{}]:{id}", camera.name()),
            false,
        );
        Arc::new_cyclic(|weak| Stream {
            weak: weak.clone(),
            sup,
            id,
            camera: camera.weak_handle(),
            monitor: tokio::sync::Mutex::new(None),
            caster_make: tokio::sync::Mutex::new(()),
            caster: base::Mutex::new(None),
            caster_tx: base::Mutex::new(None),
            recorder_tx: base::Mutex::new(None),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn sup(&self) -> &Supervisor {
        &self.sup
    }

    /// The node task: make the monitor, attach the recorder if this stream
    /// is saved, then pump frames until error or stop.
    pub(crate) async fn run(self: Arc<Self>) {
        if self.ensure_monitor().await.is_err() {
            return;
        }
        let Some(camera) = self.camera.upgrade() else {
            return;
        };
        if camera.config().save.contains(&self.id) {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.recorder_tx.lock() = Some(tx);
            let cfg = recorder::Config {
                dst_dir: camera.dst_dir().to_path_buf(),
                has_audio: camera.config().has_audio,
                suffix: self.id.to_string(),
                chunk_duration: recorder::CHUNK_DURATION,
            };
            let handle = recorder::spawn(
                &self.sup,
                cfg,
                camera.clocks(),
                rx,
                self.sup.token().clone(),
            );
            self.sup.add_child(handle);
        }
        drop(camera);

        let token = self.sup.token().clone();
        loop {
            let mut guard = self.monitor.lock().await;
            let Some(monitor) = guard.as_mut() else {
                break;
            };
            tokio::select! {
                _ = token.cancelled() => break,
                r = monitor.next_frame() => match r {
                    Ok(f) => {
                        drop(guard);
                        self.dispatch(Arc::new(f));
                    }
                    Err(e) => {
                        warn!(err = %e.chain(), "{}: read failed, restarting", self.sup.id());
                        guard.take();
                        break;
                    }
                }
            }
        }

        // Release everything so the sinks drain and close promptly.
        self.monitor.lock().await.take();
        *self.recorder_tx.lock() = None;
        *self.caster_tx.lock() = None;
    }

    fn dispatch(&self, f: Arc<Frame>) {
        if let Some(tx) = self.recorder_tx.lock().as_ref() {
            let _ = tx.send(f.clone());
        }
        if let Some(tx) = self.caster_tx.lock().as_ref() {
            let _ = tx.send(f);
        }
    }

    /// Creates the monitor if it doesn't exist yet, retrying with a backoff
    /// until it succeeds, the stream stops, or the camera turns out to have
    /// bad credentials (which disables it for good).
    async fn ensure_monitor(&self) -> Result<(), Error> {
        let mut slot = self.monitor.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let Some(camera) = self.camera.upgrade() else {
            bail!(Cancelled, msg("camera is gone"));
        };
        loop {
            if self.sup.is_stopping() || camera.is_disabled() {
                bail!(Cancelled, msg("{} is stopping", self.sup.id()));
            }
            match self.try_monitor(&camera).await {
                Ok(m) => {
                    *slot = Some(m);
                    return Ok(());
                }
                Err(e) if dvrip::Client::is_wrong_credentials(&e) => {
                    warn!("wrong credentials for camera {}", camera.name());
                    camera.disable();
                    return Err(e);
                }
                Err(e) => {
                    debug!(err = %e.chain(), "{}: monitor creation failed", self.sup.id());
                    if !sleep_cancellable(self.sup.token(), MONITOR_RETRY).await {
                        bail!(Cancelled, msg("{} is stopping", self.sup.id()));
                    }
                }
            }
        }
    }

    async fn try_monitor(&self, camera: &Camera) -> Result<Box<dyn Monitor>, Error> {
        let cfg = camera.config();
        if cfg.stream_uses_rtsp(self.id) {
            let m = rtsp::Monitor::connect(&cfg.rtsp_url(self.id)).await?;
            Ok(Box::new(m))
        } else {
            let m = dvrip::Monitor::connect(
                self.sup.token(),
                &cfg.address,
                self.id,
                &cfg.user,
                &cfg.password,
            )
            .await?;
            Ok(Box::new(m))
        }
    }

    /// The stream's caster, created lazily for the first viewer. `None` when
    /// the stream is shutting down before a monitor could be made.
    pub async fn get_caster(&self) -> Option<Arc<Caster>> {
        let _make = self.caster_make.lock().await;
        if let Some(c) = self.caster.lock().clone() {
            if !c.sup().is_stopping() {
                return Some(c);
            }
        }
        if self.ensure_monitor().await.is_err() {
            return None;
        }
        let camera = self.camera.upgrade()?;
        let (caster, tx) = Caster::new(&self.sup, camera.fragment_duration_divisor());
        let me = self.weak.clone();
        caster.sup().on_stop(move || {
            // Forget the caster so the next viewer gets a fresh one.
            if let Some(stream) = me.upgrade() {
                *stream.caster.lock() = None;
                *stream.caster_tx.lock() = None;
            }
        });
        self.sup.watch_child(caster.sup());
        let handle = caster.start();
        self.sup.add_child(handle);
        *self.caster.lock() = Some(caster.clone());
        *self.caster_tx.lock() = Some(tx);
        Some(caster)
    }
}
