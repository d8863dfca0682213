// Copyright 2022, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! ASHA hearing aid support, and the thread its session runs on.
//!
//! The session is single threaded. [`AshaModuleRunner::run`] owns it on a
//! dedicated thread; everything else reaches it by posting callbacks with
//! [`do_in_asha_thread`] or events with [`post_event`].

use anyhow::anyhow;
use log::{error, info, warn};
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use std::sync::{Mutex, MutexGuard};

pub mod asha;
pub mod core;
pub mod utils;

pub use asha::SessionController;

use asha::events::AshaEvent;

/// The ASHA session runner. Starts in an idle state.
#[derive(Default, Debug)]
pub enum AshaModuleRunner {
    /// Not started yet
    #[default]
    NotStarted,
    /// Main event loop is running and callbacks can be posted.
    Running { tx: mpsc::UnboundedSender<BoxedSessionCallback> },
    /// The event loop has been asked to stop and will stop when all
    /// callbacks in the queue are processed. No further callbacks can be sent.
    Stopping,
    /// The event loop has ended. `result` holds an error if the thread ended not gracefully.
    Ended { result: Result<(), String> },
}

static GLOBAL_MODULE_RUNNER: Mutex<AshaModuleRunner> = Mutex::new(AshaModuleRunner::new());

fn global_runner() -> MutexGuard<'static, AshaModuleRunner> {
    // The runner state stays consistent across a panicking callback.
    GLOBAL_MODULE_RUNNER.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AshaModuleRunner {
    const fn new() -> Self {
        Self::NotStarted
    }

    /// Runs the session on the calling thread until [`AshaModuleRunner::stop`]
    /// is called and the queue drains. `make_session` is invoked on this
    /// thread, so the session's collaborators need not be `Send`.
    ///
    /// Can only be run once.
    pub fn run(
        make_session: impl FnOnce() -> SessionController,
        on_started: impl FnOnce(),
    ) -> anyhow::Result<()> {
        utils::init_logging();
        info!("starting ASHA session");
        let mut rx = global_runner()
            .start()
            .map_err(|reason| anyhow!("Cannot start ASHA session: {reason}"))?;

        let rt = match Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!("failed to start tokio runtime: {e}");
                if let Err(e) = global_runner().finished(Err(e.to_string())) {
                    warn!("failed to record runner finish: {e}");
                }
                return Err(e.into());
            }
        };
        let local = LocalSet::new();

        let result = local.block_on(&rt, async move {
            let mut session = make_session();
            if !session.initialize() {
                return Err("GATT registration failed".to_string());
            }

            on_started();

            info!("starting event loop");
            while let Some(f) = rx.recv().await {
                f(&mut session);
            }
            session.clean_up();
            Ok(())
        });
        warn!("AshaModuleRunner has stopped, shutting down executor thread");

        if let Err(e) = global_runner().finished(result.clone()) {
            warn!("failed to record runner finish: {e}");
        }
        result.map_err(anyhow::Error::msg)
    }

    /// Externally stop the global runner.
    pub fn stop() {
        global_runner().shutdown();
    }

    fn send(&self, f: BoxedSessionCallback) -> Result<(), (String, BoxedSessionCallback)> {
        match self {
            Self::NotStarted => Err(("Not started yet".to_string(), f)),
            Self::Ended { .. } | Self::Stopping => Err(("Runner ended".to_string(), f)),
            Self::Running { tx } => tx.send(f).map_err(|e| ("Failed to send".to_string(), e.0)),
        }
    }

    fn start(&mut self) -> Result<mpsc::UnboundedReceiver<BoxedSessionCallback>, String> {
        match self {
            Self::Running { .. } => {
                return Err("Already started".to_string());
            }
            Self::Ended { result } => {
                return Err(format!("Already finished: {result:?}"));
            }
            Self::Stopping => {
                return Err("Can't start, finishing".to_string());
            }
            Self::NotStarted => {}
        };

        let (tx, rx) = mpsc::unbounded_channel();

        *self = Self::Running { tx };
        Ok(rx)
    }

    fn shutdown(&mut self) {
        match std::mem::replace(self, Self::Stopping) {
            Self::NotStarted => {
                warn!("Runner being stopped when it hasn't been started");
                if let Err(e) = self.finished(Err("Never started".to_string())) {
                    warn!("{e}");
                }
            }
            Self::Stopping => {
                warn!("Asked to shutdown twice before stopped");
            }
            ended @ Self::Ended { .. } => *self = ended,
            Self::Running { .. } => {}
        }
    }

    fn finished(&mut self, result: Result<(), String>) -> Result<(), String> {
        match self {
            Self::NotStarted => return Err("Not started".to_string()),
            Self::Ended { result } => return Err(format!("Already finished with {result:?}")),
            Self::Running { .. } | Self::Stopping => {}
        }

        *self = Self::Ended { result };
        Ok(())
    }
}

pub type BoxedSessionCallback = Box<dyn FnOnce(&mut SessionController) + Send + 'static>;

/// Posts a callback to the ASHA thread and gives it access to the session.
///
/// Do not call this from the ASHA thread itself to wait on the result; the
/// callback only runs once the current one returns.
pub fn do_in_asha_thread<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut SessionController) + Send + 'static,
{
    global_runner().send(Box::new(f)).map_err(|(reason, _)| {
        error!("Failed to do_in_asha_thread: {reason}");
        anyhow!("ASHA thread unavailable: {reason}")
    })
}

/// Delivers a stack completion or audio event to the session.
pub fn post_event(event: AshaEvent) -> anyhow::Result<()> {
    do_in_asha_thread(move |session| session.handle_event(event))
}
