//! Single-flight execution: one run at a time, late callers share its result.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::watch;

type Slot<R> = Option<SyncResult<R>>;

/// Runs at most one future at a time; concurrent callers await the
/// in-flight run and receive a clone of its result.
pub(crate) struct SingleFlight<R> {
    in_flight: Mutex<Option<watch::Receiver<Slot<R>>>>,
}

enum Role<R> {
    Leader(watch::Sender<Slot<R>>),
    Follower(watch::Receiver<Slot<R>>),
}

/// Clears the in-flight slot even if the leader is dropped mid-run.
struct ClearOnDrop<'a, R>(&'a Mutex<Option<watch::Receiver<Slot<R>>>>);

impl<R> Drop for ClearOnDrop<'_, R> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

impl<R: Clone> SingleFlight<R> {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: Mutex::new(None),
        }
    }

    /// Returns true while a run is in flight.
    pub(crate) fn is_running(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Runs `fut` unless a run is already in flight, in which case `fut`
    /// is dropped unpolled and the in-flight result is returned.
    ///
    /// The flag reports whether this caller joined another run.
    pub(crate) async fn run<Fut>(&self, fut: Fut) -> (SyncResult<R>, bool)
    where
        Fut: Future<Output = SyncResult<R>>,
    {
        let role = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let guard = ClearOnDrop(&self.in_flight);
                let result = fut.await;
                tx.send_replace(Some(result.clone()));
                drop(guard);
                (result, false)
            }
            Role::Follower(mut rx) => {
                let result = match rx.wait_for(Option::is_some).await {
                    Ok(value) => value.clone().unwrap_or(Err(SyncError::Abandoned)),
                    Err(_) => Err(SyncError::Abandoned),
                };
                (result, true)
            }
        }
    }
}
