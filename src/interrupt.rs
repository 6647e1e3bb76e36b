//! Ctrl+C routing.
//!
//! The first interrupt while a stage runs asks that stage to wind down and
//! lets the pipeline continue with the next one. An interrupt outside a stage,
//! or a second one during the wind-down, aborts the run.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Idle,
    StageActive,
    GracefulStop,
    Aborted,
}

/// What an interrupt turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAck {
    StageSkip,
    Abort,
    AlreadyAborted,
}

/// The state a running stage observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Active,
    GracefulStop,
    Aborted,
}

pub struct InterruptRouter {
    state: watch::Sender<RouterState>,
}

impl Default for InterruptRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptRouter {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RouterState::Idle);
        InterruptRouter { state }
    }

    pub fn state(&self) -> RouterState {
        *self.state.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == RouterState::Aborted
    }

    /// Mark a stage as running and hand out its cancellation token.
    pub fn begin_stage(&self) -> StageToken {
        self.state.send_if_modified(|s| match s {
            RouterState::Idle | RouterState::GracefulStop => {
                *s = RouterState::StageActive;
                true
            }
            _ => false,
        });
        StageToken {
            rx: self.state.subscribe(),
        }
    }

    pub fn end_stage(&self) {
        self.state.send_if_modified(|s| match s {
            RouterState::StageActive | RouterState::GracefulStop => {
                *s = RouterState::Idle;
                true
            }
            _ => false,
        });
    }

    /// Apply one interrupt and report what it did.
    pub fn interrupt(&self) -> InterruptAck {
        let mut ack = InterruptAck::AlreadyAborted;
        self.state.send_modify(|s| {
            (*s, ack) = match *s {
                RouterState::StageActive => (RouterState::GracefulStop, InterruptAck::StageSkip),
                RouterState::Idle | RouterState::GracefulStop => (RouterState::Aborted, InterruptAck::Abort),
                RouterState::Aborted => (RouterState::Aborted, InterruptAck::AlreadyAborted),
            };
        });
        ack
    }

    /// Install the process-wide Ctrl+C listener.
    ///
    /// A third interrupt after an abort exits the process outright.
    pub fn listen(self: &Arc<Self>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                match router.interrupt() {
                    InterruptAck::StageSkip => warn!(
                        "Interrupt: finishing in-flight items, then skipping to the next stage \
                         (press Ctrl+C again to abort the run)"
                    ),
                    InterruptAck::Abort => warn!("Interrupt: aborting the run"),
                    InterruptAck::AlreadyAborted => {
                        error!("Interrupt: already aborting, exiting now");
                        std::process::exit(130);
                    }
                }
            }
        })
    }
}

/// Cooperative cancellation handle scoped to one stage.
#[derive(Clone)]
pub struct StageToken {
    rx: watch::Receiver<RouterState>,
}

impl StageToken {
    pub fn state(&self) -> TokenState {
        match *self.rx.borrow() {
            RouterState::Idle | RouterState::StageActive => TokenState::Active,
            RouterState::GracefulStop => TokenState::GracefulStop,
            RouterState::Aborted => TokenState::Aborted,
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.state() != TokenState::Active
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == TokenState::Aborted
    }

    /// Resolves once a graceful stop or an abort has been requested.
    pub async fn stopping(&self) {
        let mut rx = self.rx.clone();
        let _ = rx
            .wait_for(|s| matches!(s, RouterState::GracefulStop | RouterState::Aborted))
            .await;
    }

    /// Resolves once the run is aborted.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|s| *s == RouterState::Aborted).await;
    }
}
