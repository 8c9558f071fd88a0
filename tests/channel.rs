mod common;

use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use common::{init_test_logging, wait_finished};
use taskline::{
    Channel, DetachedThread, Error, Inline, Task, TaskExt, TimerScheduler, WorkerQueue,
};

const N: usize = 20;

#[test]
fn values_arrive_in_write_order() {
    init_test_logging();
    for capacity in [0, 1, 5] {
        let channel = Channel::new(capacity);
        let tx = channel.clone();

        let producer = Task::spawn(WorkerQueue::new().unwrap(), move |cx| async move {
            for i in 0..N {
                cx.wait(tx.write(i)).await?;
            }
            Ok(())
        });
        let consumer = Task::spawn(WorkerQueue::new().unwrap(), move |cx| async move {
            let mut received = Vec::with_capacity(N);
            for _ in 0..N {
                received.push(cx.wait(channel.read()).await?);
            }
            Ok(received)
        });

        producer.blocking_result().unwrap();
        assert_eq!(
            consumer.blocking_result().unwrap(),
            (0..N).collect::<Vec<_>>(),
            "Values should be read in FIFO order for capacity {capacity}"
        );
    }
}

#[test]
fn buffered_writes_do_not_wait_for_readers() {
    init_test_logging();
    let channel = Channel::new(5);
    let tx = channel.clone();
    let writer = Task::spawn(Inline, move |cx| async move {
        for i in 0..5 {
            cx.wait(tx.write(i)).await?;
        }
        Ok(())
    });

    assert!(writer.is_finished(), "Writes into free buffer space resume immediately");
    writer.blocking_result().unwrap();
    assert_eq!(channel.len(), 5);
    assert_eq!(channel.capacity(), 5);
}

#[test]
fn rendezvous_write_waits_for_a_reader() {
    init_test_logging();
    let channel = Channel::new(0);
    let tx = channel.clone();
    let writer = Task::spawn(Inline, move |cx| async move { cx.wait(tx.write("hello")).await });
    assert!(!writer.is_finished(), "A rendezvous write must wait for a reader");
    assert!(channel.is_empty());

    let reader = Task::spawn(Inline, move |cx| async move { cx.wait(channel.read()).await });
    assert_eq!(reader.blocking_result().unwrap(), "hello");
    writer.blocking_result().unwrap();
}

#[test]
fn read_promotes_the_first_pending_writer() {
    init_test_logging();
    let channel = Channel::new(1);
    let writers: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|v| {
            let tx = channel.clone();
            Task::spawn(Inline, move |cx| async move { cx.wait(tx.write(v)).await })
        })
        .collect();
    assert!(writers[0].is_finished());
    assert!(!writers[1].is_finished());
    assert!(!writers[2].is_finished());

    let rx = channel.clone();
    let first = Task::spawn(Inline, move |cx| async move { cx.wait(rx.read()).await });
    assert_eq!(first.blocking_result().unwrap(), "a");
    assert!(writers[1].is_finished(), "Freed buffer slot goes to the longest waiting writer");
    assert!(!writers[2].is_finished());
    assert_eq!(channel.len(), 1);

    let rx = channel.clone();
    let rest = Task::spawn(Inline, move |cx| async move {
        let b = cx.wait(rx.read()).await?;
        let c = cx.wait(rx.read()).await?;
        Ok(vec![b, c])
    });
    assert_eq!(rest.blocking_result().unwrap(), vec!["b", "c"]);
    for writer in &writers {
        writer.blocking_result().unwrap();
    }
}

#[test]
fn close_fails_every_pending_reader() {
    init_test_logging();
    let channel: Channel<u8> = Channel::new(0);
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let rx = channel.clone();
            Task::spawn(DetachedThread::new(), move |cx| async move { cx.wait(rx.read()).await })
        })
        .collect();

    // Let every reader reach its suspension point.
    std::thread::sleep(Duration::from_millis(50));
    channel.close();
    for reader in &readers {
        assert!(matches!(reader.blocking_result(), Err(Error::ChannelClosed)));
    }
}

#[test]
fn close_fails_pending_writers_and_discards_buffer() {
    init_test_logging();
    let channel = Channel::new(1);
    let writers: Vec<_> = (0..4)
        .map(|i| {
            let tx = channel.clone();
            Task::spawn(Inline, move |cx| async move { cx.wait(tx.write(i)).await })
        })
        .collect();
    assert_eq!(channel.len(), 1);

    channel.close();
    assert!(!channel.is_active());
    assert!(channel.is_empty(), "Buffered values are discarded on close");
    writers[0].blocking_result().unwrap();
    for writer in &writers[1..] {
        assert!(matches!(writer.blocking_result(), Err(Error::ChannelClosed)));
    }

    // A second close is a no-op.
    channel.close();
    assert!(!channel.is_active());
}

#[test]
fn concurrent_closes_drain_once() {
    init_test_logging();
    let channel: Channel<u32> = Channel::new(0);
    let closed = Arc::new(AtomicUsize::new(0));
    let readers: Vec<_> = (0..5)
        .map(|_| {
            let rx = channel.clone();
            let task = Task::spawn(Inline, move |cx| async move { cx.wait(rx.read()).await });
            let closed = Arc::clone(&closed);
            task.on_complete(move |o| {
                if matches!(o, Err(Error::ChannelClosed)) {
                    closed.fetch_add(1, Ordering::SeqCst);
                }
            });
            task
        })
        .collect();
    assert!(readers.iter().all(|r| !r.is_finished()));

    let barrier = Arc::new(Barrier::new(8));
    let closers: Vec<_> = (0..8)
        .map(|_| {
            let channel = channel.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                channel.close();
            })
        })
        .collect();
    for closer in closers {
        closer.join().unwrap();
    }

    for reader in &readers {
        assert!(matches!(reader.blocking_result(), Err(Error::ChannelClosed)));
    }
    assert_eq!(
        closed.load(Ordering::SeqCst),
        5,
        "Every pending reader should be failed exactly once"
    );
    assert!(!channel.is_active());
}

#[test]
fn operations_on_closed_channel_fail_immediately() {
    init_test_logging();
    let channel = Channel::new(3);
    channel.close();
    let tx = channel.clone();
    let task = Task::spawn(Inline, move |cx| async move {
        let write = cx.wait(tx.write(1)).await;
        let read = cx.wait(tx.read()).await;
        Ok((write, read))
    });
    let (write, read) = task.try_result().unwrap().unwrap();
    assert!(write.unwrap_err().is_channel_closed());
    assert!(read.unwrap_err().is_channel_closed());
}

#[test]
fn producer_then_close_ends_consumer() {
    init_test_logging();
    let timer = TimerScheduler::new().unwrap();
    let channel = Channel::new(0);
    let tx = channel.clone();

    let producer = Task::with_timer(WorkerQueue::new().unwrap(), timer.handle(), move |cx| async move {
        for i in 0..10 {
            cx.wait(Duration::from_millis(1)).await?;
            cx.wait(tx.write(i)).await?;
        }
        tx.close();
        Ok(())
    });
    let consumer = Task::spawn(WorkerQueue::new().unwrap(), move |cx| async move {
        let mut received = Vec::new();
        loop {
            match cx.wait(channel.read()).await {
                Ok(v) => received.push(v),
                Err(e) if e.is_channel_closed() => return Ok(received),
                Err(e) => return Err(e),
            }
        }
    });

    producer.blocking_result().unwrap();
    assert_eq!(consumer.blocking_result().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn dropping_last_handle_closes_the_channel() {
    init_test_logging();
    let channel: Channel<u32> = Channel::new(0);
    let read = channel.read();
    let reader = Task::spawn(DetachedThread::new(), move |cx| async move { cx.wait(read).await });

    std::thread::sleep(Duration::from_millis(20));
    assert!(!reader.is_finished());
    drop(channel);
    assert!(matches!(reader.blocking_result(), Err(Error::ChannelClosed)));
}

#[test]
fn abandoned_read_releases_its_slot() {
    init_test_logging();
    let timer = TimerScheduler::new().unwrap();
    let channel = Channel::new(0);
    let rx = channel.clone();

    let impatient = Task::with_timer(Inline, timer.handle(), move |cx| async move {
        let first = cx.wait(rx.read()).timeout(&cx, Duration::from_millis(10)).await;
        Ok(first.is_err())
    });
    assert!(impatient.blocking_result().unwrap(), "Read should have timed out");

    let tx = channel.clone();
    let writer = Task::spawn(Inline, move |cx| async move { cx.wait(tx.write(9)).await });
    assert!(
        wait_finished(&writer, Duration::from_millis(30)).is_none(),
        "Timed out reader must not take the value"
    );

    let reader = Task::spawn(Inline, move |cx| async move { cx.wait(channel.read()).await });
    assert_eq!(reader.blocking_result().unwrap(), 9);
    writer.blocking_result().unwrap();
}
