// This file is part of Watchpost, a multi-camera network video recorder.
// Copyright (C) 2025 The Watchpost Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! The generic supervision node.
//!
//! Every long-lived component (CCTV root, cameras, streams, recorders,
//! casters, viewers) embeds a [`Supervisor`]: an id, a cancellation token
//! chained to its parent's, a finalizer list, and the handles of its
//! children. [`Supervisor::start`] runs the node's injected task; when the
//! task returns, the node cancels its token, stops children in reverse
//! creation order, runs its finalizers exactly once, and resolves the
//! completion channel its [`NodeHandle`] waits on.
//!
//! A node whose last child exits stops itself, unless it is flagged
//! "principally a client": such nodes (cameras, recorders, viewers) are
//! allowed to sit idle with no children. This is what tears a webcast-only
//! stream down when its caster goes away, while a camera outlives the
//! streams it keeps re-creating.

use base::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Finalizer = Box<dyn FnOnce() + Send>;

struct Inner {
    finalizers: Mutex<Vec<Finalizer>>,
    children: Mutex<Vec<NodeHandle>>,
}

/// The supervision state embedded in a node. Clones share state.
#[derive(Clone)]
pub struct Supervisor {
    id: Arc<str>,
    cancel: CancellationToken,
    principally_client: bool,
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn root(id: impl Into<Arc<str>>) -> Self {
        Self::new_impl(id.into(), CancellationToken::new(), false)
    }

    pub fn child_of(parent: &Supervisor, id: impl Into<Arc<str>>, principally_client: bool) -> Self {
        Self::new_impl(id.into(), parent.cancel.child_token(), principally_client)
    }

    fn new_impl(id: Arc<str>, cancel: CancellationToken, principally_client: bool) -> Self {
        Supervisor {
            id,
            cancel,
            principally_client,
            inner: Arc::new(Inner {
                finalizers: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Requests a stop without waiting; the owner of the [`NodeHandle`]
    /// observes completion.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Registers a finalizer, run exactly once after the node's task and
    /// children have finished. Register before `start`.
    pub fn on_stop(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.finalizers.lock().push(Box::new(f));
    }

    /// Adopts a started child; it will be stopped when this node stops.
    pub fn add_child(&self, handle: NodeHandle) {
        self.inner.children.lock().push(handle);
    }

    /// Arranges for `child`'s exit to detach it from this node's child list,
    /// stopping this node if that was the last child (see the module doc).
    pub fn watch_child(&self, child: &Supervisor) {
        let parent = self.clone();
        let child_id = child.id.clone();
        child.on_stop(move || parent.note_child_exit(&child_id));
    }

    fn note_child_exit(&self, child_id: &str) {
        let now_empty = {
            let mut children = self.inner.children.lock();
            children.retain(|h| *h.id != *child_id);
            children.is_empty()
        };
        if now_empty && !self.principally_client && !self.cancel.is_cancelled() {
            debug!("{}: last child {child_id} gone, stopping", self.id);
            self.cancel.cancel();
        }
    }

    /// Stops all children, in reverse creation order.
    pub async fn stop_children(&self) {
        let drained: Vec<NodeHandle> = {
            let mut children = self.inner.children.lock();
            children.drain(..).collect()
        };
        for h in drained.into_iter().rev() {
            h.stop().await;
        }
    }

    /// Spawns the node's task. On task exit the node's own token is
    /// cancelled, children are stopped, finalizers run, and the returned
    /// handle's completion resolves.
    pub fn start<F>(&self, task: F) -> NodeHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let sup = self.clone();
        tokio::spawn(async move {
            task.await;
            sup.cancel.cancel();
            sup.stop_children().await;
            let finalizers = std::mem::take(&mut *sup.inner.finalizers.lock());
            for f in finalizers {
                f();
            }
            debug!("{}: stopped", sup.id);
            let _ = done_tx.send(());
        });
        NodeHandle {
            id: self.id.clone(),
            cancel: self.cancel.clone(),
            done: done_rx,
        }
    }
}

/// Sleeps for `d` unless `token` is cancelled first; returns `false` on
/// cancellation. Never spin-waits.
pub async fn sleep_cancellable(token: &CancellationToken, d: std::time::Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

/// Owner's handle to a started node.
pub struct NodeHandle {
    id: Arc<str>,
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
}

impl NodeHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancels the node and waits for it (task, children, finalizers) to
    /// finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.done.await;
    }

    /// Waits for the node to finish on its own.
    pub async fn join(self) {
        let _ = self.done.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn stop_cancels_task_and_runs_finalizer() {
        let sup = Supervisor::root("node");
        let finalized = Arc::new(AtomicUsize::new(0));
        let f = finalized.clone();
        sup.on_stop(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let token = sup.token().clone();
        let handle = sup.start(async move { token.cancelled().await });
        handle.stop().await;
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parent_stop_reaches_children() {
        let parent = Supervisor::root("parent");
        let child = Supervisor::child_of(&parent, "child", false);
        let child_token = child.token().clone();
        parent.add_child(child.start(async move { child_token.cancelled().await }));
        let parent_token = parent.token().clone();
        let handle = parent.start(async move { parent_token.cancelled().await });
        // Stopping the parent must come back only after the child is done.
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("shutdown should not hang");
    }

    #[tokio::test]
    async fn last_child_exit_stops_server_node() {
        let parent = Supervisor::root("server");
        let child = Supervisor::child_of(&parent, "client", true);
        parent.watch_child(&child);
        parent.add_child(child.start(async {}));

        let parent_token = parent.token().clone();
        let handle = parent.start(async move { parent_token.cancelled().await });
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("parent should stop once its only child exits");
    }

    #[tokio::test]
    async fn principal_node_survives_child_exits() {
        let parent = Supervisor::root("camera-like");
        // A principally-client parent: children come and go freely.
        let parent = Supervisor {
            principally_client: true,
            ..parent
        };
        let child = Supervisor::child_of(&parent, "stream-like", false);
        parent.watch_child(&child);
        parent.add_child(child.start(async {}));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parent.is_stopping());
    }

    #[tokio::test]
    async fn finalizer_runs_after_children_stop() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let parent = Supervisor::root("parent");
        let child = Supervisor::child_of(&parent, "child", false);
        let o = order.clone();
        child.on_stop(move || o.lock().push("child"));
        let o = order.clone();
        parent.on_stop(move || o.lock().push("parent"));

        let child_token = child.token().clone();
        parent.add_child(child.start(async move { child_token.cancelled().await }));
        let parent_token = parent.token().clone();
        let handle = parent.start(async move { parent_token.cancelled().await });
        handle.stop().await;
        assert_eq!(*order.lock(), vec!["child", "parent"]);
    }
}
