// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Live re-broadcasting to browsers: the per-stream Caster fan-out and the
//! per-WebSocket viewer client.

use crate::frame::Frame;
use crate::mux::mp4::FragmentStream;
use crate::supervise::{NodeHandle, Supervisor};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// MP4 track timescale advertised to browsers.
pub const CLOCK_RATE: u32 = 90_000;

/// The single byte telling the browser the next binary message begins a new
/// initialization segment.
pub const RESTART_SENTINEL: u8 = 0xFF;

/// A viewer that can't take a write this fast is torn down rather than
/// allowed to back-pressure everyone else.
const WRITE_DEADLINE: Duration = Duration::from_millis(100);

static NEXT_VIEWER: AtomicU64 = AtomicU64::new(1);

/// Per-viewer muxer state: a pure frames-to-wire-bytes state machine.
///
/// Every viewer needs its own because fragmented-MP4 consumers reject
/// mid-stream sequence resets; a shared muxer would replay another viewer's
/// sequence numbers at a newly joined one.
pub struct ViewerSession {
    muxer: FragmentStream,
    started: bool,
    duration_divisor: u32,
}

impl ViewerSession {
    pub fn new(duration_divisor: u32) -> Self {
        ViewerSession {
            muxer: FragmentStream::new(),
            started: false,
            duration_divisor: duration_divisor.max(1),
        }
    }

    /// Produces the wire messages for one incoming video frame: possibly an
    /// init segment (on the first key frame after start/reset), then a
    /// fragment.
    pub fn on_frame(&mut self, f: &Frame) -> Vec<Bytes> {
        if !f.is_video() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(2);
        if f.is_key() && !self.started {
            self.muxer = FragmentStream::new();
            out.push(Bytes::from(self.muxer.init_segment(&f.data, CLOCK_RATE)));
            self.started = true;
        }
        if self.started {
            // The real duration would be ns/11111; the default divisor
            // under-reports it so the browser never buffers ahead and shows
            // each frame as soon as it arrives.
            let ticks = (f.duration.as_nanos() as u64 / u64::from(self.duration_divisor)) as u32;
            out.push(Bytes::from(self.muxer.fragment(&f.data, ticks)));
        }
        out
    }

    /// Handles a browser `"reset"`: the cut-off sentinel goes on the wire,
    /// and the next key frame re-emits an init segment.
    pub fn on_reset(&mut self) -> Bytes {
        self.started = false;
        Bytes::from_static(&[RESTART_SENTINEL])
    }
}

struct ViewerSlot {
    id: Arc<str>,
    tx: mpsc::UnboundedSender<Arc<Frame>>,
}

/// Fans a stream's video frames out to any number of viewer clients.
///
/// Created lazily by the first viewer; stops when its last viewer leaves,
/// at which point the owning stream forgets it.
pub struct Caster {
    weak: Weak<Caster>,
    sup: Supervisor,
    duration_divisor: u32,
    viewers: base::Mutex<Vec<ViewerSlot>>,
    rx: base::Mutex<Option<mpsc::UnboundedReceiver<Arc<Frame>>>>,
}

impl Caster {
    /// Creates the caster and the sender its stream feeds frames into.
    /// `start` must be called separately, after the owner has registered its
    /// finalizers.
    pub fn new(
        parent: &Supervisor,
        duration_divisor: u32,
    ) -> (Arc<Caster>, mpsc::UnboundedSender<Arc<Frame>>) {
        let sup = Supervisor::child_of(parent, format!("caster [{}]", parent.id()), false);
        let (tx, rx) = mpsc::unbounded_channel();
        let caster = Arc::new_cyclic(|weak| Caster {
            weak: weak.clone(),
            sup,
            duration_divisor,
            viewers: base::Mutex::new(Vec::new()),
            rx: base::Mutex::new(Some(rx)),
        });
        (caster, tx)
    }

    pub fn sup(&self) -> &Supervisor {
        &self.sup
    }

    pub fn start(&self) -> NodeHandle {
        let me = self.weak.upgrade().expect("caster is alive while starting");
        let mut rx = self
            .rx
            .lock()
            .take()
            .expect("a caster is started only once");
        let token = self.sup.token().clone();
        self.sup.start(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    f = rx.recv() => match f {
                        None => break,
                        Some(f) => me.forward(f),
                    }
                }
            }
        })
    }

    /// Video frames go to every viewer; anything else stops here.
    fn forward(&self, f: Arc<Frame>) {
        if !f.is_video() {
            return;
        }
        for v in self.viewers.lock().iter() {
            // A closed channel means the viewer is mid-teardown; its exit
            // finalizer removes the slot.
            let _ = v.tx.send(f.clone());
        }
    }

    /// Attaches a freshly upgraded WebSocket as a new viewer client.
    pub fn add_viewer<S>(&self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let n = NEXT_VIEWER.fetch_add(1, Ordering::Relaxed);
        let sup = Supervisor::child_of(&self.sup, format!("viewer {n} [{}]", self.sup.id()), true);
        let (tx, rx) = mpsc::unbounded_channel();
        let slot_id: Arc<str> = sup.id().into();
        self.viewers.lock().push(ViewerSlot {
            id: slot_id.clone(),
            tx,
        });
        let me = self.weak.clone();
        sup.on_stop(move || {
            if let Some(caster) = me.upgrade() {
                caster.viewers.lock().retain(|s| s.id != slot_id);
            }
        });
        self.sup.watch_child(&sup);
        let session = ViewerSession::new(self.duration_divisor);
        let token = sup.token().clone();
        let handle = sup.start(viewer_loop(ws, rx, session, token));
        self.sup.add_child(handle);
    }
}

/// One viewer's lifetime: muxing frames onto the socket and reacting to its
/// messages. All writes happen from this single task, which also orders the
/// reset sentinel strictly before the re-init.
async fn viewer_loop<S>(
    ws: WebSocketStream<S>,
    mut rx: mpsc::UnboundedReceiver<Arc<Frame>>,
    mut session: ViewerSession,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            f = rx.recv() => {
                let Some(f) = f else { break };
                let mut failed = false;
                for msg in session.on_frame(&f) {
                    if send_with_deadline(&mut sink, msg).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    // Viewer I/O errors tear the client down silently.
                    break;
                }
            }
            m = source.next() => {
                match m {
                    Some(Ok(Message::Text(t))) if t.as_str() == "reset" => {
                        let sentinel = session.on_reset();
                        if send_with_deadline(&mut sink, sentinel).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(err = %e, "viewer receive failed");
                        break;
                    }
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn send_with_deadline<S>(
    sink: &mut futures::stream::SplitSink<WebSocketStream<S>, Message>,
    data: Bytes,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Binary(data))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(err = %e, "viewer write failed");
            Err(())
        }
        Err(_) => {
            debug!("viewer write missed its deadline");
            Err(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_FRAGMENT_DURATION_DIVISOR;
    use crate::h265;

    fn key_frame() -> Frame {
        let mut data = Vec::new();
        data.extend_from_slice(&3u32.to_be_bytes());
        data.extend_from_slice(&[h265::NAL_IDR_W_RADL << 1, 0x01, 0xaa]);
        Frame::video(true, true, Duration::from_millis(40), data.into())
    }

    fn delta_frame() -> Frame {
        let mut data = Vec::new();
        data.extend_from_slice(&3u32.to_be_bytes());
        data.extend_from_slice(&[h265::NAL_TRAIL_R << 1, 0x01, 0xbb]);
        Frame::video(false, true, Duration::from_millis(40), data.into())
    }

    fn audio_frame() -> Frame {
        Frame::audio(8000, Bytes::from(vec![0u8; 320]))
    }

    #[test]
    fn session_waits_for_key_frame() {
        let mut s = ViewerSession::new(DEFAULT_FRAGMENT_DURATION_DIVISOR);
        assert!(s.on_frame(&delta_frame()).is_empty());
        let out = s.on_frame(&key_frame());
        assert_eq!(out.len(), 2, "init segment plus first fragment");
        assert_eq!(&out[0][4..8], b"ftyp");
        assert_eq!(&out[1][4..8], b"moof");
        // Subsequent frames: fragments only.
        let out = s.on_frame(&delta_frame());
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][4..8], b"moof");
    }

    #[test]
    fn session_ignores_audio() {
        let mut s = ViewerSession::new(DEFAULT_FRAGMENT_DURATION_DIVISOR);
        s.on_frame(&key_frame());
        assert!(s.on_frame(&audio_frame()).is_empty());
    }

    #[test]
    fn reset_emits_one_sentinel_then_fresh_init() {
        let mut s = ViewerSession::new(DEFAULT_FRAGMENT_DURATION_DIVISOR);
        s.on_frame(&key_frame());
        s.on_frame(&delta_frame());

        let sentinel = s.on_reset();
        assert_eq!(&sentinel[..], &[RESTART_SENTINEL]);

        // Delta frames produce nothing until the next key frame.
        assert!(s.on_frame(&delta_frame()).is_empty());
        let out = s.on_frame(&key_frame());
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][4..8], b"ftyp", "init must directly follow the sentinel");
    }

    #[test]
    fn advertised_duration_uses_divisor() {
        let mut s = ViewerSession::new(12_000);
        let out = s.on_frame(&key_frame());
        // 40 ms / 12000 ns = 3333 ticks, visible as the muxer's decode time.
        let _ = out;
        assert_eq!(s.muxer_decode_time(), 3333);
    }

    #[tokio::test]
    async fn caster_fans_out_video_only() {
        let root = Supervisor::root("stream");
        let (caster, tx) = Caster::new(&root, DEFAULT_FRAGMENT_DURATION_DIVISOR);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        caster.viewers.lock().push(ViewerSlot {
            id: "v1".into(),
            tx: tx1,
        });
        caster.viewers.lock().push(ViewerSlot {
            id: "v2".into(),
            tx: tx2,
        });
        let handle = caster.start();

        tx.send(Arc::new(key_frame())).unwrap();
        tx.send(Arc::new(audio_frame())).unwrap();
        tx.send(Arc::new(delta_frame())).unwrap();
        drop(tx);
        handle.join().await;

        for rx in [&mut rx1, &mut rx2] {
            let f1 = rx.recv().await.unwrap();
            assert!(f1.is_key());
            let f2 = rx.recv().await.unwrap();
            assert!(f2.is_video() && !f2.is_key());
            assert!(rx.try_recv().is_err(), "audio must not be forwarded");
        }
    }
}

#[cfg(test)]
impl ViewerSession {
    fn muxer_decode_time(&self) -> u64 {
        self.muxer.decode_time_for_tests()
    }
}
