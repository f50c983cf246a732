// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs an [`Instance`] on a dedicated thread.
//!
//! The thread is the only writer of the instance. Events from the outside
//! arrive over an mpsc channel, and the thread sleeps in `recv_timeout`
//! until either an event arrives or the next timer is due. Wall clock time
//! is mapped onto the instance clock as the time elapsed since spawn.

use crate::error::Error;
use crate::event::Event;
use crate::instance::Instance;
use crate::log::driver_log;
use crate::platform::{ForwardingPlane, JoinPruneSender, RouteSource};
use slog::Logger;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on a single wait when no timer is pending.
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum Input {
    Event(Event),
    Shutdown,
}

pub struct Driver<R, F, S>
where
    R: RouteSource,
    F: ForwardingPlane,
    S: JoinPruneSender,
{
    tx: Sender<Input>,
    thread: JoinHandle<Instance<R, F, S>>,
}

impl<R, F, S> Driver<R, F, S>
where
    R: RouteSource + Send + 'static,
    F: ForwardingPlane + Send + 'static,
    S: JoinPruneSender + Send + 'static,
{
    pub fn spawn(
        mut instance: Instance<R, F, S>,
        log: &Logger,
    ) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel::<Input>();
        let log = log.clone();
        let name = format!("pim-{}", instance.name());

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let start = Instant::now();
                let offset = instance.now();
                let clock = || offset + start.elapsed();
                driver_log!(log, info, "driver started for {}", name);
                loop {
                    instance.advance_to(clock());
                    let wait = instance
                        .next_deadline()
                        .map(|d| d.saturating_sub(instance.now()))
                        .unwrap_or(IDLE_WAIT)
                        .min(IDLE_WAIT);
                    match rx.recv_timeout(wait) {
                        Ok(Input::Event(event)) => {
                            instance.advance_to(clock());
                            instance.handle(event);
                        }
                        Ok(Input::Shutdown) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                instance.shutdown();
                driver_log!(log, info, "driver stopped for {}", name);
                instance
            })
            .map_err(|e| Error::Driver(format!("spawn: {e}")))?;

        Ok(Self { tx, thread })
    }

    /// A handle for feeding events to the instance.
    pub fn sender(&self) -> Sender<Input> {
        self.tx.clone()
    }

    pub fn send(&self, event: Event) -> Result<(), Error> {
        self.tx
            .send(Input::Event(event))
            .map_err(|_| Error::Driver("driver stopped".into()))
    }

    /// Stop the thread, shut the instance down and hand it back.
    pub fn shutdown(self) -> Result<Instance<R, F, S>, Error> {
        // the thread may already be gone if every sender was dropped
        let _ = self.tx.send(Input::Shutdown);
        self.thread
            .join()
            .map_err(|_| Error::Driver("driver thread panicked".into()))
    }
}
