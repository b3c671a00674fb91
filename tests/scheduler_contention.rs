//! Multi-threaded end-to-end exercise of the steal protocol.
//!
//! Four OS threads drive real worker loops against one scheduler. All
//! tasks are created on worker 0, so the other three workers can only make
//! progress through steal requests. The test checks the lifecycle
//! invariant (every task leaves its queue exactly once and is reclaimed
//! exactly once) and counter conservation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use taskmill::{
    ScheduleHint, SchedulerInit, ThreadId, ThreadInitData, ThreadState, WorkRequestingScheduler,
};

const WORKERS: usize = 4;
const TASKS: usize = 2000;

#[test]
fn four_workers_execute_every_task_exactly_once() {
    let scheduler = Arc::new(WorkRequestingScheduler::new(SchedulerInit::new(WORKERS)));
    let running = Arc::new(AtomicBool::new(true));
    let executed: Arc<Mutex<HashSet<ThreadId>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut created = HashSet::new();
    for _ in 0..TASKS {
        let id = scheduler
            .create_thread(
                ThreadInitData::new("contention task").with_hint(ScheduleHint::worker(0)),
                ThreadState::Pending,
                true,
            )
            .expect("create_thread");
        created.insert(id);
    }

    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            let executed = Arc::clone(&executed);
            thread::spawn(move || {
                scheduler.on_start_thread(worker);
                let mut busy = TASKS as i64;
                loop {
                    let mut task = scheduler.get_next_thread(worker, true);
                    if task.is_none() {
                        let result = scheduler.wait_or_add_new(
                            worker,
                            running.load(Ordering::Acquire),
                            0,
                            true,
                        );
                        task = result.next_thread;
                        if task.is_none() && result.terminate {
                            break;
                        }
                    }

                    if let Some(id) = task {
                        scheduler
                            .set_thread_state(id, ThreadState::Active)
                            .expect("mark active");
                        {
                            let mut executed = executed.lock().unwrap();
                            assert!(executed.insert(id), "task {id:?} ran twice");
                        }
                        scheduler
                            .set_thread_state(id, ThreadState::Terminated)
                            .expect("mark terminated");
                        scheduler.destroy_thread(id, &mut busy).expect("destroy");
                    } else {
                        thread::yield_now();
                    }
                }
                scheduler.on_stop_thread(worker);
            })
        })
        .collect();

    // Request shutdown once every task has run.
    while executed.lock().unwrap().len() < TASKS {
        thread::yield_now();
    }
    running.store(false, Ordering::Release);

    for handle in handles {
        handle.join().expect("worker thread");
    }

    let executed = executed.lock().unwrap();
    assert_eq!(executed.len(), TASKS);
    assert_eq!(*executed, created, "every created task ran exactly once");

    // Reclaim everything; repeated passes converge to quiescence.
    while !scheduler.cleanup_terminated(true) {}
    assert_eq!(
        scheduler
            .get_thread_count(ThreadState::Unknown, taskmill::ThreadPriority::Default, None)
            .unwrap(),
        0
    );

    // Conservation: admissions match extractions, and no worker drained
    // more requests than were ever sent.
    #[cfg(feature = "steal-stats")]
    assert_eq!(
        scheduler.get_num_stolen_from_pending(None, false),
        scheduler.get_num_stolen_to_pending(None, false)
    );
    let sent = scheduler.get_num_steal_requests_sent(None, false);
    let received = scheduler.get_num_steal_requests_received(None, false);
    assert!(
        received <= sent,
        "drained more requests ({received}) than sent ({sent})"
    );
}
