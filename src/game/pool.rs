/// Bounded per-round worker pool
///
/// Jobs go through a crossbeam queue to at most `workers` scoped threads.
/// `run_bounded` returns only after every job has finished, so the end of
/// the scope is the round's barrier.
use crossbeam_channel::{bounded, unbounded};
use std::thread;

/// Run `job` over every input with at most `workers` in flight.
/// Results come back in input order.
pub fn run_bounded<T, R, F>(inputs: Vec<T>, workers: usize, job: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = inputs.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total);

    let (job_tx, job_rx) = bounded::<(usize, T)>(total);
    let (result_tx, result_rx) = unbounded::<(usize, R)>();
    for entry in inputs.into_iter().enumerate() {
        // Capacity equals the job count and the receiver is alive.
        let _ = job_tx.send(entry);
    }
    drop(job_tx);

    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let job = &job;
            scope.spawn(move || {
                while let Ok((index, input)) = job_rx.recv() {
                    if result_tx.send((index, job(input))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    for (index, result) in result_rx.iter() {
        slots[index] = Some(result);
    }
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn results_keep_input_order() {
        let out = run_bounded((0..20).collect(), 4, |n: u64| {
            thread::sleep(Duration::from_millis(20 - n));
            n * 2
        });
        assert_eq!(out, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn concurrency_is_bounded() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        run_bounded((0..12).collect::<Vec<u32>>(), 3, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn jobs_run_concurrently() {
        let started = std::time::Instant::now();
        run_bounded(vec![(); 4], 4, |_| thread::sleep(Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[test]
    fn empty_input_is_empty_output() {
        let out: Vec<u8> = run_bounded(Vec::<u8>::new(), 4, |x| x);
        assert!(out.is_empty());
    }
}
