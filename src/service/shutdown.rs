// Copyright 2025 jonefeewang@gmail.com
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

//! Shutdown signalling shared by the scheduler and the executor workers.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// Why a listener stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// the shutdown broadcast fired
    Requested,
    /// every sender is gone, nothing can fire anymore
    Orphaned,
}

/// One component's subscription to the shutdown broadcast. The first cause
/// observed sticks, later `recv` calls return it at once.
#[derive(Debug)]
pub struct Shutdown {
    owner: String,
    cause: Option<ShutdownCause>,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// `owner` names the listener in logs.
    pub fn subscribe(owner: impl Into<String>, notify: &broadcast::Sender<()>) -> Self {
        Self {
            owner: owner.into(),
            cause: None,
            notify: notify.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.cause.is_some()
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        self.cause
    }

    pub async fn recv(&mut self) -> ShutdownCause {
        if let Some(cause) = self.cause {
            return cause;
        }
        let cause = match self.notify.recv().await {
            // a lagging listener still missed a shutdown
            Ok(()) | Err(RecvError::Lagged(_)) => ShutdownCause::Requested,
            Err(RecvError::Closed) => ShutdownCause::Orphaned,
        };
        debug!("{} sees shutdown: {:?}", self.owner, cause);
        self.cause = Some(cause);
        cause
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requested_shutdown_sticks() {
        let (notify, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::subscribe("worker", &notify);
        assert!(!shutdown.is_shutdown());
        assert_eq!(shutdown.cause(), None);

        notify.send(()).expect("one subscriber");
        assert_eq!(shutdown.recv().await, ShutdownCause::Requested);
        assert!(shutdown.is_shutdown());

        // a later drop of the sender does not change the cause
        drop(notify);
        assert_eq!(shutdown.recv().await, ShutdownCause::Requested);
    }

    #[tokio::test]
    async fn test_dropped_sender_orphans_listener() {
        let (notify, _) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::subscribe("scheduler", &notify);
        drop(notify);
        assert_eq!(shutdown.recv().await, ShutdownCause::Orphaned);
        assert_eq!(shutdown.cause(), Some(ShutdownCause::Orphaned));
    }

    #[tokio::test]
    async fn test_lagging_listener_still_shuts_down() {
        let (notify, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::subscribe("worker", &notify);
        notify.send(()).expect("one subscriber");
        notify.send(()).expect("one subscriber");
        assert_eq!(shutdown.recv().await, ShutdownCause::Requested);
    }
}
