//! Periodic protocol maintenance, independent of traffic.

use std::time::Duration;

use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::{
    error::{Error, Result},
    shutdown::Shutdown,
};

#[derive(Debug)]
pub struct ProtocolTimer {
    task: JoinHandle<()>,
}

impl ProtocolTimer {
    /// Call `callback` every `interval`, first after one full interval.
    ///
    /// The timer is bound to `shutdown`: once the token is triggered no
    /// further callback starts.
    pub fn start<F>(interval: Duration, shutdown: Shutdown, mut callback: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(Error::Timer("interval must be nonzero".into()));
        }
        let runtime = Handle::try_current().map_err(|e| Error::Timer(e.to_string()))?;

        let first = Instant::now() + interval;
        let task = runtime.spawn(async move {
            let mut ticks = time::interval_at(first, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.triggered() => break,
                    _ = ticks.tick() => {}
                }
                if shutdown.is_triggered() {
                    break;
                }
                callback();
            }
            debug!("protocol timer finished");
        });

        Ok(Self { task })
    }

    pub fn stop(self) {
        debug!("stopping protocol timer");
    }
}

impl Drop for ProtocolTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
