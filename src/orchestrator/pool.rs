// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A pool of scoped worker threads fed through a bounded channel.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    thread,
};

use crossbeam_channel::{bounded, unbounded};
use log::trace;

use crate::CANCEL_REQUESTED;

/// How a task ended.
#[derive(Debug)]
pub(crate) enum TaskResult<R> {
    Done(R),
    /// The task panicked with this message.
    Panicked(String),
    /// Cancellation was requested before the task started.
    Cancelled,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f` over every task on up to `n_workers` threads. `on_result` is called
/// on the calling thread as each task returns, with the task's index. The
/// results come back in task order.
pub(crate) fn run_pool<T, R, F, C>(
    tasks: Vec<T>,
    n_workers: usize,
    f: F,
    mut on_result: C,
) -> Vec<TaskResult<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
    C: FnMut(usize, &TaskResult<R>),
{
    let n = tasks.len();
    let mut results: Vec<Option<TaskResult<R>>> = (0..n).map(|_| None).collect();
    if n == 0 {
        return vec![];
    }
    let n_workers = n_workers.clamp(1, n);
    let (tx_task, rx_task) = bounded::<(usize, T)>(n_workers);
    let (tx_result, rx_result) = unbounded::<(usize, TaskResult<R>)>();

    thread::scope(|scope| {
        for i in 0..n_workers {
            let rx_task = rx_task.clone();
            let tx_result = tx_result.clone();
            let f = &f;
            thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn_scoped(scope, move || {
                    for (index, task) in rx_task.iter() {
                        let result = if CANCEL_REQUESTED.load() {
                            TaskResult::Cancelled
                        } else {
                            match catch_unwind(AssertUnwindSafe(|| f(task))) {
                                Ok(r) => TaskResult::Done(r),
                                Err(payload) => TaskResult::Panicked(panic_message(payload.as_ref())),
                            }
                        };
                        if tx_result.send((index, result)).is_err() {
                            break;
                        }
                    }
                    trace!("Worker {i} finished");
                })
                .expect("OS can create threads");
        }
        drop(rx_task);
        drop(tx_result);

        thread::Builder::new()
            .name("feeder".to_string())
            .spawn_scoped(scope, move || {
                for task in tasks.into_iter().enumerate() {
                    // Only fails if every worker is gone.
                    if tx_task.send(task).is_err() {
                        break;
                    }
                }
            })
            .expect("OS can create threads");

        for (index, result) in rx_result.iter() {
            on_result(index, &result);
            results[index] = Some(result);
        }
    });

    results
        .into_iter()
        .map(|r| r.unwrap_or(TaskResult::Cancelled))
        .collect()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_results_in_task_order() {
        let mut seen = vec![];
        let results = run_pool(
            (0..20).collect(),
            4,
            |x: u64| x * x,
            |i, _| seen.push(i),
        );
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        for (i, r) in results.iter().enumerate() {
            assert!(matches!(r, TaskResult::Done(v) if *v == (i * i) as u64));
        }
    }

    #[test]
    #[serial]
    fn test_panics_are_caught() {
        let results = run_pool(
            vec![1, 0, 2],
            2,
            |x: i32| {
                if x == 0 {
                    panic!("division by zero");
                }
                10 / x
            },
            |_, _| (),
        );
        assert!(matches!(results[0], TaskResult::Done(10)));
        assert!(matches!(&results[1], TaskResult::Panicked(m) if m == "division by zero"));
        assert!(matches!(results[2], TaskResult::Done(5)));
    }

    #[test]
    #[serial]
    fn test_cancelled_tasks_do_not_run() {
        CANCEL_REQUESTED.store(true);
        let results = run_pool(vec![1, 2], 1, |x: i32| x, |_, _| ());
        CANCEL_REQUESTED.store(false);
        assert!(results.iter().all(|r| matches!(r, TaskResult::Cancelled)));
    }
}
