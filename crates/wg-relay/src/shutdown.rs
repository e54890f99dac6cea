use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::{futures::Notified, Notify},
    task::JoinHandle,
};
use tracing::info;

/// One-shot cancellation token shared by every task of an interface
#[derive(Clone, Default)]
pub struct Shutdown {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    triggered: AtomicBool,
    notify: Notify,
}

pin_project! {
    pub struct Triggered<'a> {
        #[pin]
        notified: Notified<'a>,
        shared: &'a Shared,
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the token and wake every waiter. Only the first call returns
    /// `true`.
    pub fn trigger(&self) -> bool {
        let first = !self.shared.triggered.swap(true, Ordering::AcqRel);
        if first {
            self.shared.notify.notify_waiters();
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.shared.triggered.load(Ordering::Acquire)
    }

    /// Resolves once the token has been triggered
    pub fn triggered(&self) -> Triggered<'_> {
        Triggered {
            notified: self.shared.notify.notified(),
            shared: &self.shared,
        }
    }
}

impl<'a> Future for Triggered<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.shared.triggered.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            self.project().notified.poll(cx)
        }
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Shutdown")
            .field(&self.is_triggered())
            .finish()
    }
}

/// Spawn the task that turns SIGINT, SIGQUIT or SIGTERM into a shutdown.
///
/// Handlers are installed before this returns. The task also exits when
/// the token is triggered some other way.
pub fn listen(shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = quit.recv() => "SIGQUIT",
            _ = terminate.recv() => "SIGTERM",
            _ = shutdown.triggered() => return,
        };
        info!(signal = name, "received signal, exiting");
        shutdown.trigger();
    }))
}
