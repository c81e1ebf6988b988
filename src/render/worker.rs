//! Background render thread.
//!
//! Keeps the caller's thread free while a render runs. At most one request is
//! in flight; further requests are refused until the running one reports
//! [`RenderEvent::Finished`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::scene::SceneSnapshot;
use crate::util::Result;

use super::{ProgressiveRenderer, RenderObserver, RenderOutcome, RenderParams, RenderState, RenderStatus};

/// Commands sent to the worker.
pub enum RenderCommand {
    Render {
        scene: Box<SceneSnapshot>,
        params: RenderParams,
    },
    /// Stop the worker thread.
    Stop,
}

/// Events sent back from the worker.
#[derive(Debug)]
pub enum RenderEvent {
    State(RenderState),
    Batch { batch: u32, total: u32, progress: f32 },
    Finished(Result<RenderOutcome>),
}

/// Forwards renderer callbacks into the event channel.
struct ChannelObserver {
    tx: Sender<RenderEvent>,
}

impl RenderObserver for ChannelObserver {
    fn state_changed(&self, state: RenderState) {
        let _ = self.tx.send(RenderEvent::State(state));
    }

    fn batch_completed(&self, batch: u32, total: u32, progress: f32) {
        let _ = self.tx.send(RenderEvent::Batch { batch, total, progress });
    }
}

/// Handle to the render thread.
pub struct RenderWorker {
    tx: Sender<RenderCommand>,
    rx: Receiver<RenderEvent>,
    status: Arc<RenderStatus>,
    pending: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RenderWorker {
    /// Move `renderer` onto a new thread. Its observer is replaced by the
    /// worker's event channel.
    pub fn spawn(renderer: ProgressiveRenderer) -> Self {
        let (cmd_tx, cmd_rx) = channel::<RenderCommand>();
        let (event_tx, event_rx) = channel::<RenderEvent>();
        let renderer = renderer.with_observer(Arc::new(ChannelObserver { tx: event_tx.clone() }));
        let status = renderer.status();
        let pending = Arc::new(AtomicBool::new(false));

        let worker_pending = pending.clone();
        let handle = thread::Builder::new()
            .name("rtcore-render".into())
            .spawn(move || worker_loop(renderer, cmd_rx, event_tx, worker_pending))
            .ok();
        if handle.is_none() {
            tracing::error!("failed to spawn render thread");
        }

        Self {
            tx: cmd_tx,
            rx: event_rx,
            status,
            pending,
            handle,
        }
    }

    /// Queue a render. Returns `false` (and does nothing) while another is pending.
    pub fn request_render(&self, scene: SceneSnapshot, params: RenderParams) -> bool {
        if self.handle.is_none() || self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        let cmd = RenderCommand::Render {
            scene: Box::new(scene),
            params,
        };
        if self.tx.send(cmd).is_err() {
            self.pending.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// A render has been requested and has not finished yet.
    pub fn is_busy(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Check for events (non-blocking).
    pub fn try_recv(&self) -> Option<RenderEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RenderEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn status(&self) -> &Arc<RenderStatus> {
        &self.status
    }

    /// Stop the worker and wait for it. A running render completes first.
    pub fn stop(&mut self) {
        let _ = self.tx.send(RenderCommand::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RenderWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    renderer: ProgressiveRenderer,
    rx: Receiver<RenderCommand>,
    tx: Sender<RenderEvent>,
    pending: Arc<AtomicBool>,
) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            RenderCommand::Render { scene, params } => {
                let result = renderer.render(&scene, &params);
                pending.store(false, Ordering::Release);
                if tx.send(RenderEvent::Finished(result)).is_err() {
                    break; // caller gone
                }
            }
            RenderCommand::Stop => break,
        }
    }
    tracing::debug!("render worker stopped");
}
