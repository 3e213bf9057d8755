// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The chunked MKV recorder: one per saved stream.
//!
//! Consumes the stream's frames on the blocking pool and writes them to
//! wall-clock-named Matroska files, rotating on the first key frame that
//! would push a file past the chunk duration. Rotation finalizes the
//! previous file on a separate blocking task so a slow disk doesn't stall
//! the write path.

use crate::frame::Frame;
use crate::mux::mkv::{AudioTrack, MkvFile, VideoTrack};
use crate::supervise::{NodeHandle, Supervisor};
use base::clock::Clocks;
use base::{err, Error};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Recordings are chunked into files of this much video.
pub const CHUNK_DURATION: Duration = Duration::from_secs(10 * 60);

pub struct Config {
    pub dst_dir: PathBuf,
    pub has_audio: bool,
    /// Recording file names end in `.<suffix>.mkv`.
    pub suffix: String,
    pub chunk_duration: Duration,
}

/// The synchronous writing core; the supervision wrapper lives in [`spawn`].
pub struct Writer {
    cfg: Config,
    clocks: Arc<dyn Clocks>,
    /// Shared with the close handle so close is idempotent on every path.
    file: Arc<base::Mutex<Option<MkvFile<File>>>>,
    hevc: bool,
    video_pos: Duration,
    last_video_pos: Duration,
    audio_pos: Duration,
    last_audio_pos: Duration,
    last_frame_was_audio: bool,
}

/// Closes the writer's current file; safe to call from any thread, any
/// number of times.
#[derive(Clone)]
pub struct CloseHandle {
    file: Arc<base::Mutex<Option<MkvFile<File>>>>,
}

impl CloseHandle {
    pub fn close(&self) {
        let taken = self.file.lock().take();
        if let Some(f) = taken {
            if let Err(e) = f.finalize() {
                error!(err = %e.chain(), "failed to finalize recording");
            }
        }
    }
}

impl Writer {
    pub fn new(cfg: Config, clocks: Arc<dyn Clocks>) -> Writer {
        Writer {
            cfg,
            clocks,
            file: Arc::new(base::Mutex::new(None)),
            hevc: false,
            video_pos: Duration::ZERO,
            last_video_pos: Duration::ZERO,
            audio_pos: Duration::ZERO,
            last_audio_pos: Duration::ZERO,
            last_frame_was_audio: false,
        }
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            file: self.file.clone(),
        }
    }

    /// The path the next file would be opened at.
    fn next_path(&self) -> PathBuf {
        let stamp = self
            .clocks
            .now()
            .strftime("%Y/%m/%d/%H-%M-%S")
            .to_string();
        self.cfg
            .dst_dir
            .join(format!("{stamp}.{}.mkv", self.cfg.suffix))
    }

    fn open_file(&self) -> Result<MkvFile<File>, Error> {
        let path = self.next_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| err!(Internal, msg("creating {}", dir.display()), source(e)))?;
        }
        let f = File::create(&path)
            .map_err(|e| err!(Internal, msg("creating {}", path.display()), source(e)))?;
        info!("recording to {}", path.display());
        MkvFile::new(
            f,
            VideoTrack { hevc: self.hevc },
            self.cfg.has_audio.then_some(AudioTrack {
                sample_rate: 8000,
                channels: 1,
            }),
            self.clocks.now(),
        )
    }

    fn reset_cursors(&mut self) {
        self.video_pos = Duration::ZERO;
        self.last_video_pos = Duration::ZERO;
        self.audio_pos = Duration::ZERO;
        self.last_audio_pos = Duration::ZERO;
        self.last_frame_was_audio = false;
    }

    /// Writes one frame, opening and rotating files as needed.
    ///
    /// Rotation happens only on video key frames, so every file starts
    /// decodable; frames arriving before the first key frame of a file are
    /// dropped for the same reason.
    pub fn write_frame(&mut self, f: &Frame) -> Result<(), Error> {
        if f.is_video() && f.is_hevc() {
            self.hevc = true;
        }

        if f.is_key()
            && self.file.lock().is_some()
            && self.video_pos + f.duration > self.cfg.chunk_duration
        {
            let old = self.file.lock().take();
            if let Some(old) = old {
                // Finalizing seeks and rewrites; keep it off the write path.
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = old.finalize() {
                        error!(err = %e.chain(), "failed to finalize rotated recording");
                    }
                });
            }
            self.reset_cursors();
        }

        if self.file.lock().is_none() {
            if !f.is_key() {
                return Ok(());
            }
            let new = self.open_file()?;
            *self.file.lock() = Some(new);
        }

        let mut guard = self.file.lock();
        let file = match guard.as_mut() {
            Some(f) => f,
            // Closed concurrently (stop); nothing left to write to.
            None => return Ok(()),
        };
        if f.is_video() {
            file.write_video(self.video_pos, f.is_key(), &f.data)
                .map_err(|e| {
                    err!(
                        DataLoss,
                        msg(
                            "error writing video frame at {:?} (last video {:?}, last audio {:?})",
                            self.video_pos,
                            self.last_video_pos,
                            self.last_audio_pos
                        ),
                        source(e)
                    )
                })?;
            self.last_video_pos = self.video_pos;
            self.video_pos += f.duration;
            self.last_frame_was_audio = false;
        } else if f.is_audio() && self.cfg.has_audio {
            if !self.last_frame_was_audio {
                // Audio re-syncs to the last written video frame whenever the
                // cadences interleave, bounding drift between the tracks.
                self.audio_pos = self.last_video_pos;
            }
            file.write_audio(self.audio_pos, &f.data).map_err(|e| {
                err!(
                    DataLoss,
                    msg(
                        "error writing audio frame at {:?} (last audio {:?}, last video {:?})",
                        self.audio_pos,
                        self.last_audio_pos,
                        self.last_video_pos
                    ),
                    source(e)
                )
            })?;
            self.last_audio_pos = self.audio_pos;
            self.audio_pos += f.duration;
            self.last_frame_was_audio = true;
        }
        Ok(())
    }
}

/// Starts a recorder node consuming `rx`. A fatal write error cancels
/// `upstream` (the owning stream), which tears the pipeline down and lets
/// the camera supervisor rebuild it.
pub fn spawn(
    parent: &Supervisor,
    cfg: Config,
    clocks: Arc<dyn Clocks>,
    mut rx: mpsc::UnboundedReceiver<Arc<Frame>>,
    upstream: CancellationToken,
) -> NodeHandle {
    let sup = Supervisor::child_of(parent, format!("recorder [{}]", parent.id()), true);
    let writer = Writer::new(cfg, clocks);
    let close = writer.close_handle();
    sup.on_stop(move || close.close());
    let token = sup.token().clone();
    let id: Arc<str> = sup.id().into();
    sup.start(async move {
        let result = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            while let Some(frame) = rx.blocking_recv() {
                if token.is_cancelled() {
                    break;
                }
                writer.write_frame(&frame)?;
            }
            Ok::<_, Error>(())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(err = %e.chain(), "{id}: write failed, stopping stream");
                upstream.cancel();
            }
            Err(e) => {
                warn!(err = %e, "{id}: write loop panicked");
                upstream.cancel();
            }
        }
    })
}
