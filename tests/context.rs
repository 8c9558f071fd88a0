mod common;

use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use common::{Recorder, init_test_logging};
use taskline::{
    ContextRef, DetachedThread, Error, ExecutionContext, Inline, PoolSubmit, Task, WorkerQueue,
};

fn thread_name() -> Option<String> {
    thread::current().name().map(str::to_string)
}

#[test]
fn inline_runs_on_the_caller() {
    init_test_logging();
    let caller = thread::current().id();
    let ran = Recorder::default();
    let ran2 = ran.clone();
    Inline.execute(Box::new(move || ran2.push(thread::current().id())));
    assert_eq!(ran.snapshot(), vec![caller]);
}

#[test]
fn worker_queue_runs_jobs_in_order_on_one_thread() {
    init_test_logging();
    let worker = WorkerQueue::builder().thread_name("fifo").build().unwrap();
    let seen = Recorder::default();
    for i in 0..100 {
        let seen = seen.clone();
        worker.execute(Box::new(move || seen.push((i, thread_name()))));
    }
    worker.shutdown();
    worker.join();

    let seen = seen.snapshot();
    assert_eq!(seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(), (0..100).collect::<Vec<_>>());
    assert!(seen.iter().all(|(_, name)| name.as_deref() == Some("fifo")));
}

#[test]
fn worker_queue_drops_jobs_after_shutdown() {
    init_test_logging();
    let worker = WorkerQueue::new().unwrap();
    worker.shutdown();
    assert!(!worker.is_active());

    let ran = Recorder::default();
    let ran2 = ran.clone();
    worker.execute(Box::new(move || ran2.push(())));
    worker.join();
    assert!(ran.snapshot().is_empty());
}

#[test]
fn task_on_shut_down_worker_is_abandoned() {
    init_test_logging();
    let worker = WorkerQueue::new().unwrap();
    worker.shutdown();
    let task = Task::spawn(worker, |_cx| async { Ok(1) });
    assert!(matches!(task.blocking_result(), Err(Error::Abandoned)));
}

#[test]
fn worker_survives_a_panicking_job() {
    init_test_logging();
    let worker = WorkerQueue::new().unwrap();
    let (tx, rx) = mpsc::channel();
    worker.execute(Box::new(|| panic!("job failure")));
    worker.execute(Box::new(move || tx.send("still alive").unwrap()));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "still alive");
}

#[test]
fn detached_threads_are_named_and_distinct() {
    init_test_logging();
    let context = DetachedThread::named("detached");
    let (tx, rx) = mpsc::channel();
    for _ in 0..3 {
        let tx = tx.clone();
        context.execute(Box::new(move || tx.send(thread_name()).unwrap()));
    }
    let mut names: Vec<_> = (0..3)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["detached-0", "detached-1", "detached-2"]);
}

#[test]
fn pool_submit_runs_every_job() {
    init_test_logging();
    let pool = PoolSubmit::with_name_prefix(3, "pool-").unwrap();
    let (tx, rx) = mpsc::channel();
    for i in 0..10 {
        let tx = tx.clone();
        pool.execute(Box::new(move || tx.send((i, thread_name())).unwrap()));
    }
    let mut got: Vec<_> = (0..10)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert!(got.iter().all(|(_, name)| name.as_deref().is_some_and(|n| n.starts_with("pool-"))));
    got.sort_by_key(|(i, _)| *i);
    assert_eq!(got.into_iter().map(|(i, _)| i).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
}

#[test]
fn tasks_share_a_context() {
    init_test_logging();
    let shared: ContextRef = Arc::new(WorkerQueue::builder().thread_name("shared").build().unwrap());
    let tasks: Vec<_> = (0..4)
        .map(|i| Task::spawn(Arc::clone(&shared), move |_cx| async move { Ok((i, thread_name())) }))
        .collect();
    for (i, task) in tasks.iter().enumerate() {
        let (n, name) = task.blocking_result().unwrap();
        assert_eq!(n, i);
        assert_eq!(name.as_deref(), Some("shared"));
    }
}
