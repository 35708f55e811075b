//! Control events delivered to a running worker.
//!
//! Events are only acted on at iteration boundaries (or to cut a sleep
//! short), so a handler that is running is never interrupted.

use tokio::sync::mpsc::{self, error::TryRecvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Shutdown,
    Reload,
    /// Re-check the queue now.
    Wake,
}

pub type ControlSender = mpsc::UnboundedSender<ControlEvent>;
pub type ControlReceiver = mpsc::UnboundedReceiver<ControlEvent>;

pub fn control_channel() -> (ControlSender, ControlReceiver) {
    mpsc::unbounded_channel()
}

/// Events seen since the worker last looked.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingSignals {
    pub shutdown: bool,
    pub reload: bool,
    pub wake: bool,
}

impl PendingSignals {
    /// `None` means every sender is gone, which counts as a shutdown.
    pub fn record(&mut self, event: Option<ControlEvent>) {
        match event {
            Some(ControlEvent::Shutdown) | None => self.shutdown = true,
            Some(ControlEvent::Reload) => self.reload = true,
            Some(ControlEvent::Wake) => self.wake = true,
        }
    }

    /// Pulls everything already queued without waiting.
    pub fn drain(&mut self, control: &mut ControlReceiver) {
        loop {
            match control.try_recv() {
                Ok(event) => self.record(Some(event)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.record(None);
                    break;
                }
            }
        }
    }

    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}
