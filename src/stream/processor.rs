use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::bounded;

/// Run `work` over every item on a bounded pool of
/// `min(workers, items.len())` scoped threads, each with its own bounded
/// queue fed round-robin. Returns once every item was processed.
pub(crate) fn process_all<T, F>(workers: usize, buffer: usize, label: &str, items: Vec<T>, work: F) -> usize
where
    T: Send,
    F: Fn(T) + Sync,
{
    let total = items.len();
    if total == 0 {
        return 0;
    }
    let workers = workers.clamp(1, total);
    let done = AtomicUsize::new(0);
    let step = (total / 10).max(1);
    tracing::info!(label, total, workers, "processing remaining streams");

    thread::scope(|scope| {
        let mut queues = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = bounded::<T>(buffer.max(1));
            queues.push(tx);
            let work = &work;
            let done = &done;
            scope.spawn(move || {
                for item in rx {
                    work(item);
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % step == 0 || n == total {
                        tracing::debug!(label, "processed ({n}/{total})");
                    }
                }
            });
        }

        for (i, item) in items.into_iter().enumerate() {
            if queues[i % workers].send(item).is_err() {
                tracing::warn!(label, "stream processor exited early");
                break;
            }
        }
    });

    let processed = done.load(Ordering::Relaxed);
    tracing::info!(label, "processed ({processed}/{total})");
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_every_item_once() {
        let seen = Mutex::new(Vec::new());
        let n = process_all(4, 2, "test", (0..100).collect(), |i: u32| seen.lock().push(i));
        assert_eq!(n, 100);
        let mut seen = seen.into_inner();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_and_oversized_pool() {
        assert_eq!(process_all(8, 1, "test", Vec::<u8>::new(), |_| {}), 0);
        assert_eq!(process_all(64, 1, "test", vec![1u8, 2], |_| {}), 2);
    }
}
