// lattice/src/batch.rs
//
// Lattice batches on a fixed pool of worker threads. Every item gets its
// own deadline; a failure, a timeout or a panic in one item is reported
// and the rest of the batch carries on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use crate::deadline::Deadline;
use crate::error::{LatticeError, Result};

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Item position and message of every failure, in item order.
    pub failures: Vec<(usize, String)>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }
}

enum Outcome {
    Done,
    Failed(String),
    TimedOut(String),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Run `process` over `items` on `workers` threads (0 uses one per CPU).
/// `describe` names an item in log messages.
pub fn run_batch<T, P, D>(items: &[T], workers: usize, timeout: Option<Duration>, describe: D, process: P) -> BatchSummary
where
    T: Sync,
    P: Fn(&T, &Deadline) -> Result<()> + Sync,
    D: Fn(&T) -> String + Sync,
{
    let workers = match workers {
        0 => num_cpus::get(),
        n => n,
    }
    .clamp(1, items.len().max(1));

    let next = Mutex::new(0usize);
    let (tx, rx) = mpsc::channel::<(usize, Outcome)>();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let (next, process, describe) = (&next, &process, &describe);
            scope.spawn(move || loop {
                let index = {
                    let Ok(mut guard) = next.lock() else { return };
                    let i = *guard;
                    *guard += 1;
                    i
                };
                let Some(item) = items.get(index) else { return };
                let deadline = Deadline::after(timeout);
                let result = panic::catch_unwind(AssertUnwindSafe(|| process(item, &deadline)));
                let outcome = match result {
                    Ok(Ok(())) => Outcome::Done,
                    Ok(Err(e)) if e.is_resource_limit() => {
                        tracing::warn!(item = %describe(item), error = %e, "skipped");
                        Outcome::TimedOut(e.to_string())
                    }
                    Ok(Err(e)) => {
                        tracing::error!(item = %describe(item), error = %e, "failed");
                        Outcome::Failed(e.to_string())
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(item = %describe(item), panic = %message, "worker panicked");
                        Outcome::Failed(format!("panic: {}", message))
                    }
                };
                if tx.send((index, outcome)).is_err() {
                    return;
                }
            });
        }
    });
    drop(tx);

    let mut summary = BatchSummary::default();
    let mut outcomes: Vec<(usize, Outcome)> = rx.into_iter().collect();
    outcomes.sort_by_key(|(i, _)| *i);
    for (index, outcome) in outcomes {
        match outcome {
            Outcome::Done => summary.succeeded += 1,
            Outcome::Failed(message) => {
                summary.failed += 1;
                summary.failures.push((index, message));
            }
            Outcome::TimedOut(message) => {
                summary.timed_out += 1;
                summary.failures.push((index, message));
            }
        }
    }
    tracing::info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        timed_out = summary.timed_out,
        "batch finished"
    );
    summary
}

/// Turn a batch with failures into an error for callers that want one.
pub fn require_success(summary: &BatchSummary) -> Result<()> {
    match summary.failures.first() {
        None => Ok(()),
        Some((index, message)) => Err(LatticeError::Config(format!(
            "{} of {} items failed; first was item {}: {}",
            summary.failures.len(),
            summary.total(),
            index,
            message
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_every_outcome() {
        let items: Vec<u32> = (0..20).collect();
        let summary = run_batch(&items, 4, None, |i| i.to_string(), |&i, _| match i % 5 {
            0 => Err(LatticeError::malformed("x", "bad")),
            1 => Err(LatticeError::NodeLimit {
                lattice: "x".into(),
                limit: 1,
            }),
            _ => Ok(()),
        });
        assert_eq!(summary.succeeded, 12);
        assert_eq!(summary.failed, 4);
        assert_eq!(summary.timed_out, 4);
        assert_eq!(summary.failures[0].0, 0);
        assert!(require_success(&summary).is_err());
    }

    #[test]
    fn panics_stay_inside_their_item() {
        let items = vec!["ok", "boom", "ok"];
        let summary = run_batch(&items, 2, None, |s| s.to_string(), |&s, _| {
            if s == "boom" {
                panic!("exploded");
            }
            Ok(())
        });
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.failures[0].1.contains("exploded"));
    }

    #[test]
    fn empty_batch_succeeds() {
        let items: Vec<u8> = Vec::new();
        let summary = run_batch(&items, 0, None, |_| String::new(), |_, _| Ok(()));
        assert_eq!(summary.total(), 0);
        assert!(require_success(&summary).is_ok());
    }
}
