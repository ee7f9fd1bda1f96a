//! Per-account mutual exclusion between the scheduled cycle and a forced refresh.
//!
//! The guard is a state flag, checked and set under a short lock at cycle
//! entry; nothing is held across a suspension point except the permit.
//! A regular tick that finds the account busy, or a refresh waiting, is
//! skipped. A refresh waits for the running cycle; a second refresh
//! requested while one is already waiting is coalesced into it.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Regular,
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Running(CycleKind),
}

#[derive(Debug)]
struct Flags {
    state: GuardState,
    refresh_pending: bool,
}

#[derive(Debug)]
pub struct AccountGuard {
    flags: Mutex<Flags>,
    released: Notify,
}

/// Held for the duration of one cycle. Dropping it returns the account to idle.
#[derive(Debug)]
pub struct CyclePermit {
    guard: Arc<AccountGuard>,
    kind: CycleKind,
}

impl CyclePermit {
    pub fn kind(&self) -> CycleKind {
        self.kind
    }
}

impl Drop for CyclePermit {
    fn drop(&mut self) {
        self.guard.lock().state = GuardState::Idle;
        self.guard.released.notify_waiters();
    }
}

/// Clears the pending flag if a waiting refresh is dropped before it starts.
struct PendingRefresh<'a> {
    guard: &'a AccountGuard,
    armed: bool,
}

impl Drop for PendingRefresh<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.guard.lock().refresh_pending = false;
            self.guard.released.notify_waiters();
        }
    }
}

impl Default for AccountGuard {
    fn default() -> Self {
        Self {
            flags: Mutex::new(Flags {
                state: GuardState::Idle,
                refresh_pending: false,
            }),
            released: Notify::new(),
        }
    }
}

impl AccountGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> GuardState {
        self.lock().state
    }

    pub fn refresh_pending(&self) -> bool {
        self.lock().refresh_pending
    }

    /// Enter a scheduled cycle, or `None` if this tick must be skipped.
    pub fn try_begin_regular(self: &Arc<Self>) -> Option<CyclePermit> {
        let mut flags = self.lock();
        if flags.state != GuardState::Idle || flags.refresh_pending {
            return None;
        }
        flags.state = GuardState::Running(CycleKind::Regular);
        Some(CyclePermit {
            guard: Arc::clone(self),
            kind: CycleKind::Regular,
        })
    }

    /// Wait for the account to go idle and enter a forced refresh.
    ///
    /// Returns `None` when another refresh is already waiting; that one
    /// covers this request.
    pub async fn begin_refresh(self: &Arc<Self>) -> Option<CyclePermit> {
        {
            let mut flags = self.lock();
            if flags.refresh_pending {
                return None;
            }
            flags.refresh_pending = true;
        }
        let mut pending = PendingRefresh {
            guard: self,
            armed: true,
        };

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut flags = self.lock();
                if flags.state == GuardState::Idle {
                    flags.state = GuardState::Running(CycleKind::Refresh);
                    flags.refresh_pending = false;
                    pending.armed = false;
                    return Some(CyclePermit {
                        guard: Arc::clone(self),
                        kind: CycleKind::Refresh,
                    });
                }
            }

            notified.await;
        }
    }
}
