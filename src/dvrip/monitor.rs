// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The DVRIP-backed frame source.

use super::client::Client;
use super::media::{self, MediaHeader, MediaKind, VideoCodec};
use super::packet;
use super::pts::Pts;
use crate::config::StreamId;
use crate::frame::Frame;
use crate::h264;
use base::{bail, Error};
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

#[derive(Copy, Clone, Debug)]
struct VideoMeta {
    codec: Option<VideoCodec>,
}

/// Pulls frames from a claimed DVRIP monitor channel.
///
/// P-frames reuse the preceding I-frame's metadata; durations are
/// regenerated from the declared frame rate. Payloads arrive as Annex B and
/// leave as AVCC.
pub struct Monitor {
    client: Client,
    stream_type: &'static str,
    claimed: bool,
    last_i_frame: Option<VideoMeta>,
    pts: Option<Pts>,
}

impl Monitor {
    pub async fn connect(
        cancel: &tokio_util::sync::CancellationToken,
        address: &str,
        stream: StreamId,
        user: &str,
        password: &str,
    ) -> Result<Monitor, Error> {
        let client = Client::connect(cancel, address, user, password).await?;
        Ok(Monitor {
            client,
            stream_type: match stream {
                StreamId::Main => "Main",
                StreamId::Extra => "Extra",
            },
            claimed: false,
            last_i_frame: None,
            pts: None,
        })
    }

    /// Reads media message bodies until one holds a usable frame.
    async fn next_media(&mut self) -> Result<(MediaHeader, Bytes), Error> {
        loop {
            if let Err(e) = self.client.maybe_keepalive().await {
                debug!(err = %e.chain(), "keep-alive send failed");
            }
            let msg = self.client.read_message().await?;
            if msg.code == packet::KEEPALIVE_RSP {
                continue;
            }
            if msg.code != packet::MONITOR_DATA {
                bail!(
                    Internal,
                    msg("expected monitor data but received code {}", msg.code)
                );
            }
            let header = match media::decode(&msg.data)? {
                // Not a frame at all; resynchronize on the next message.
                None => continue,
                Some(h) => h,
            };
            let len = media::payload_length(&header, msg.data.len())?;
            let mut data = Bytes::from(msg.data);
            let payload = data.split_off(data.len() - len);
            return Ok((header, payload));
        }
    }

    fn video_frame(&mut self, key: bool, payload: &[u8]) -> Result<Frame, Error> {
        let meta = self
            .last_i_frame
            .expect("video_frame is only called once an I-frame has been seen");
        let pts = self
            .pts
            .as_mut()
            .expect("pts exists whenever last_i_frame does");
        let duration = Duration::from_millis(u64::from(pts.next()));
        let hevc = meta.codec == Some(VideoCodec::H265);
        let avcc = h264::annex_b_to_avcc(payload);
        Ok(Frame::video(key, hevc, duration, avcc.into()))
    }
}

#[async_trait::async_trait]
impl crate::monitor::Monitor for Monitor {
    async fn next_frame(&mut self) -> Result<Frame, Error> {
        if !self.claimed {
            self.client.claim_monitor(self.stream_type).await?;
            self.claimed = true;
        }
        loop {
            let (header, payload) = self.next_media().await?;
            match header.kind {
                MediaKind::VideoI => {
                    let info = header
                        .video
                        .expect("I-frame headers always carry video info");
                    if self.pts.as_ref().map(Pts::fps) != Some(info.fps) {
                        self.pts = Some(Pts::new(info.fps)?);
                    }
                    self.last_i_frame = Some(VideoMeta { codec: info.codec });
                    return self.video_frame(true, &payload);
                }
                MediaKind::VideoP => {
                    if self.last_i_frame.is_none() {
                        bail!(FailedPrecondition, msg("P-frame arrived before any I-frame"));
                    }
                    return self.video_frame(false, &payload);
                }
                MediaKind::Audio => {
                    if self.pts.is_none() {
                        bail!(FailedPrecondition, msg("audio arrived before any I-frame"));
                    }
                    let rate = header
                        .sample_rate
                        .unwrap_or(media::EXPECTED_AUDIO_SAMPLE_RATE);
                    return Ok(Frame::audio(rate, payload));
                }
                // Stills and device info are not part of the pipeline.
                MediaKind::Picture | MediaKind::Info => continue,
            }
        }
    }
}
