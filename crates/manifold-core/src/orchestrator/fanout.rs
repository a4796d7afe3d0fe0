//! Concurrent fan-out over backends.
//!
//! Each backend gets one scoped thread per fan-out call; backend counts are
//! small, so no pooling or backpressure is needed. Failures are captured in
//! the tagged result instead of propagated, so one unreachable backend
//! never aborts the operation.

use std::thread;

use crossbeam_channel::unbounded;

use manifold_types::Result;

use super::BackendHandle;

/// One backend's answer, correlated by nickname rather than call order.
pub struct Tagged<T> {
    pub nickname: String,
    pub outcome: Result<T>,
}

/// Run `op` against every backend concurrently and collect all answers.
/// Results come back in resolution order regardless of completion order.
pub fn fan_out<T, F>(backends: &[BackendHandle], op: F) -> Vec<Tagged<T>>
where
    T: Send,
    F: Fn(&BackendHandle) -> Result<T> + Sync,
{
    let (tx, rx) = unbounded();
    thread::scope(|scope| {
        for (slot, backend) in backends.iter().enumerate() {
            let tx = tx.clone();
            let op = &op;
            scope.spawn(move || {
                let outcome = op(backend);
                let _ = tx.send((
                    slot,
                    Tagged {
                        nickname: backend.nickname().to_string(),
                        outcome,
                    },
                ));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<Tagged<T>>> =
            (0..backends.len()).map(|_| None).collect();
        for (slot, tagged) in rx {
            slots[slot] = Some(tagged);
        }
        slots.into_iter().flatten().collect()
    })
}
