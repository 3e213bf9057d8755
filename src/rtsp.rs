// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The RTSP-backed frame source, a thin wrapper over the Retina library.

use crate::frame::Frame;
use base::{bail, err, Error};
use futures::StreamExt;
use retina::client::{Credentials, Demuxed, PlayOptions, SessionOptions, SetupOptions};
use retina::codec::CodecItem;
use std::pin::Pin;
use std::time::Duration;
use url::Url;

/// A camera that stops sending for this long is presumed gone.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Monitor {
    session: Demuxed,
    hevc: bool,
    /// Timestamp of the previous frame, in 90 kHz units.
    prev_pts: Option<i64>,
}

impl Monitor {
    pub async fn connect(url_str: &str) -> Result<Monitor, Error> {
        let mut url = Url::parse(url_str)
            .map_err(|e| err!(InvalidArgument, msg("bad RTSP URL"), source(e)))?;

        // Retina takes credentials via options, not URL userinfo.
        let mut options = SessionOptions::default()
            .user_agent(format!("Watchpost {}", env!("CARGO_PKG_VERSION")));
        if !url.username().is_empty() {
            let creds = Credentials {
                username: url.username().to_owned(),
                password: url.password().unwrap_or("").to_owned(),
            };
            url.set_username("")
                .map_err(|()| err!(InvalidArgument, msg("can't clear URL username")))?;
            url.set_password(None)
                .map_err(|()| err!(InvalidArgument, msg("can't clear URL password")))?;
            options = options.creds(Some(creds));
        }

        let mut session = retina::client::Session::describe(url, options)
            .await
            .map_err(|e| err!(Unavailable, msg("RTSP describe failed"), source(e)))?;
        let video_i = session
            .streams()
            .iter()
            .position(|s| s.media() == "video" && matches!(s.encoding_name(), "h264" | "h265"))
            .ok_or_else(|| err!(FailedPrecondition, msg("no supported video stream")))?;
        let hevc = session.streams()[video_i].encoding_name() == "h265";
        session
            .setup(video_i, SetupOptions::default())
            .await
            .map_err(|e| err!(Unavailable, msg("RTSP setup failed"), source(e)))?;
        let session = session
            .play(PlayOptions::default())
            .await
            .map_err(|e| err!(Unavailable, msg("RTSP play failed"), source(e)))?
            .demuxed()
            .map_err(|e| err!(Unavailable, msg("RTSP demux failed"), source(e)))?;

        Ok(Monitor {
            session,
            hevc,
            prev_pts: None,
        })
    }
}

#[async_trait::async_trait]
impl crate::monitor::Monitor for Monitor {
    async fn next_frame(&mut self) -> Result<Frame, Error> {
        loop {
            let item = match tokio::time::timeout(
                FRAME_TIMEOUT,
                Pin::new(&mut self.session).next(),
            )
            .await
            {
                Err(_) => bail!(
                    DeadlineExceeded,
                    msg("no RTSP frame within {FRAME_TIMEOUT:?}")
                ),
                Ok(None) => bail!(Unavailable, msg("RTSP stream closed")),
                Ok(Some(Err(e))) => {
                    return Err(err!(Unavailable, msg("RTSP read failed"), source(e)))
                }
                Ok(Some(Ok(item))) => item,
            };
            match item {
                CodecItem::VideoFrame(v) => {
                    let pts = v.timestamp().elapsed();
                    // The duration of a frame is not knowable until the next
                    // one arrives, so each frame reports the delta to its
                    // predecessor; the first frame reports zero.
                    let delta_90k = self
                        .prev_pts
                        .map(|prev| (pts - prev).max(0))
                        .unwrap_or(0);
                    self.prev_pts = Some(pts);
                    let duration = Duration::from_millis((delta_90k / 90) as u64);
                    let key = v.is_random_access_point();
                    return Ok(Frame::video(key, self.hevc, duration, v.into_data().into()));
                }
                // Audio recording is a DVRIP-path feature; other item kinds
                // (messages, audio) are skipped here.
                _ => continue,
            }
        }
    }
}
