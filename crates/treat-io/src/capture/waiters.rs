use super::{CaptureError, CaptureResult};
use std::mem;
use tokio::sync::oneshot;

/// Callers waiting for the next completed capture.
///
/// Each waiter is a oneshot sender, so it resolves at most once. A caller
/// that gave up has dropped its receiver; such waiters are pruned.
#[derive(Debug, Default)]
pub struct WaiterSet {
    waiters: Vec<oneshot::Sender<CaptureResult>>,
}

impl WaiterSet {
    pub fn push(&mut self, waiter: oneshot::Sender<CaptureResult>) {
        self.waiters.push(waiter);
    }

    pub fn prune(&mut self) {
        self.waiters.retain(|w| !w.is_closed());
    }

    /// Live waiters, after pruning.
    pub fn live(&mut self) -> usize {
        self.prune();
        self.waiters.len()
    }

    /// Resolve every queued waiter with `name`. The list is taken first so
    /// waiters added afterwards wait for the next capture. Returns how many
    /// callers were still listening.
    pub fn fulfill_all(&mut self, name: &str) -> usize {
        mem::take(&mut self.waiters)
            .into_iter()
            .filter_map(|w| w.send(Ok(name.to_string())).ok())
            .count()
    }

    pub fn fail_all(&mut self, error: CaptureError) -> usize {
        mem::take(&mut self.waiters)
            .into_iter()
            .filter_map(|w| w.send(Err(error.clone())).ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fulfil_resolves_everyone_once() {
        let mut set = WaiterSet::default();
        let (a_tx, mut a_rx) = oneshot::channel();
        let (b_tx, mut b_rx) = oneshot::channel();
        set.push(a_tx);
        set.push(b_tx);

        assert_eq!(set.fulfill_all("capture-20240301-120000.jpg"), 2);
        assert_eq!(a_rx.try_recv().unwrap().unwrap(), "capture-20240301-120000.jpg");
        assert!(b_rx.try_recv().unwrap().is_ok());
        assert_eq!(set.live(), 0);
        assert_eq!(set.fail_all(CaptureError::Timeout), 0);
    }

    #[test]
    fn abandoned_waiters_do_not_affect_others() {
        let mut set = WaiterSet::default();
        let (gone_tx, gone_rx) = oneshot::channel();
        let (kept_tx, mut kept_rx) = oneshot::channel();
        set.push(gone_tx);
        set.push(kept_tx);
        drop(gone_rx);

        assert_eq!(set.live(), 1);
        assert_eq!(
            set.fail_all(CaptureError::Trigger("connection refused".into())),
            1
        );
        assert!(matches!(
            kept_rx.try_recv().unwrap(),
            Err(CaptureError::Trigger(_))
        ));
    }
}
