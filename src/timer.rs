//! Sleep timer: stop reading after a number of minutes.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::info;

use crate::playback::PlaybackManager;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Running { remaining_secs: u64, total_secs: u64 },
}

pub struct SleepTimer {
    state: watch::Sender<TimerState>,
    expired: broadcast::Sender<()>,
    task: Mutex<Option<AbortHandle>>,
}

impl Default for SleepTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl SleepTimer {
    pub fn new() -> Self {
        let (state, _) = watch::channel(TimerState::Idle);
        let (expired, _) = broadcast::channel(1);
        Self {
            state,
            expired,
            task: Mutex::new(None),
        }
    }

    /// Count down from `minutes`, replacing any running countdown. Zero
    /// minutes expires immediately.
    pub fn start(&self, minutes: u64) {
        self.cancel();
        let total_secs = minutes.saturating_mul(60);
        let state = self.state.clone();
        let expired = self.expired.clone();
        info!(minutes, "Sleep timer started");

        let task = tokio::spawn(async move {
            let mut remaining_secs = total_secs;
            while remaining_secs > 0 {
                state.send_replace(TimerState::Running {
                    remaining_secs,
                    total_secs,
                });
                tokio::time::sleep(Duration::from_secs(1)).await;
                remaining_secs -= 1;
            }
            state.send_replace(TimerState::Idle);
            info!("Sleep timer expired");
            let _ = expired.send(());
        });
        *self.task.lock() = Some(task.abort_handle());
    }

    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.state.send_replace(TimerState::Idle);
    }

    pub fn state(&self) -> TimerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TimerState> {
        self.state.subscribe()
    }

    /// Fires once per expiry.
    pub fn expired(&self) -> broadcast::Receiver<()> {
        self.expired.subscribe()
    }
}

impl Drop for SleepTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Stop `manager` every time `timer` expires. The task ends once the timer
/// or the manager is dropped.
pub fn stop_on_expiry(timer: &SleepTimer, manager: &Arc<PlaybackManager>) -> JoinHandle<()> {
    let mut expired = timer.expired();
    let manager: Weak<PlaybackManager> = Arc::downgrade(manager);
    tokio::spawn(async move {
        loop {
            match expired.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    let Some(manager) = manager.upgrade() else {
                        return;
                    };
                    manager.stop();
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_down_and_expires() {
        let timer = SleepTimer::new();
        let mut expired = timer.expired();
        timer.start(1);
        tokio::task::yield_now().await;
        assert_eq!(
            timer.state(),
            TimerState::Running {
                remaining_secs: 60,
                total_secs: 60
            }
        );

        tokio::time::sleep(Duration::from_millis(30_500)).await;
        match timer.state() {
            TimerState::Running { remaining_secs, .. } => assert_eq!(remaining_secs, 30),
            other => panic!("unexpected state {other:?}"),
        }

        expired.recv().await.unwrap();
        assert_eq!(timer.state(), TimerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_duration_saturates() {
        let timer = SleepTimer::new();
        timer.start(u64::MAX);
        tokio::task::yield_now().await;
        assert_eq!(
            timer.state(),
            TimerState::Running {
                remaining_secs: u64::MAX,
                total_secs: u64::MAX
            }
        );
        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_expiry() {
        let timer = SleepTimer::new();
        let mut expired = timer.expired();
        timer.start(1);
        tokio::task::yield_now().await;
        timer.cancel();
        assert_eq!(timer.state(), TimerState::Idle);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(matches!(
            expired.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_countdown() {
        let timer = SleepTimer::new();
        timer.start(10);
        timer.start(1);
        tokio::task::yield_now().await;
        assert_eq!(
            timer.state(),
            TimerState::Running {
                remaining_secs: 60,
                total_secs: 60
            }
        );
    }
}
