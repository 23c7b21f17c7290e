//! Channel and scope end-to-end scenarios.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use trellis::{scoped, supervised, Channel, ChannelValue, ErrorKind, Scope};

#[test]
fn simple_handoff() {
    let received = supervised(|scope| {
        let ch = Arc::new(Channel::<u32>::rendezvous());
        let sender = Arc::clone(&ch);
        scope.fork(move |_| sender.send(5));
        ch.receive()
    })
    .expect("scope completes cleanly");
    assert_eq!(received, 5);
}

#[test]
fn many_producers_many_consumers_preserve_the_multiset() {
    const SIDES: u32 = 250;

    let received: Vec<u32> = supervised(|scope| {
        let ch = Arc::new(Channel::<u32>::rendezvous());
        for i in 1..=SIDES {
            let sender = Arc::clone(&ch);
            scope.fork_user::<(), _>(move |_| sender.send(i));
        }
        let consumers: Vec<_> = (0..SIDES)
            .map(|_| {
                let receiver = Arc::clone(&ch);
                scope.fork_user(move |_| receiver.receive())
            })
            .collect();
        consumers.into_iter().map(trellis::Fork::join).collect()
    })
    .expect("all forks complete");

    let received: BTreeSet<u32> = received.into_iter().collect();
    let expected: BTreeSet<u32> = (1..=SIDES).collect();
    assert_eq!(received, expected);
}

#[test]
fn per_sender_fifo_is_preserved() {
    const COUNT: u32 = 1000;

    let received = supervised(|scope| {
        let ch = Arc::new(Channel::<u32>::buffered(16));
        let sender = Arc::clone(&ch);
        scope.fork_user(move |_| {
            for i in 0..COUNT {
                sender.send(i)?;
            }
            Ok(())
        });
        let mut seen = Vec::with_capacity(COUNT as usize);
        for _ in 0..COUNT {
            seen.push(ch.receive()?);
        }
        Ok(seen)
    })
    .expect("all values delivered");

    let expected: Vec<u32> = (0..COUNT).collect();
    assert_eq!(received, expected);
}

#[test]
fn receive_after_done_and_drain_is_done_forever() {
    let ch = Channel::<u32>::buffered(8);
    for i in 0..4 {
        ch.send(i).expect("buffer has room");
    }
    ch.done();

    for i in 0..4 {
        assert_eq!(ch.receive().expect("draining"), i);
    }
    for _ in 0..16 {
        assert!(matches!(ch.receive_or_closed(), Ok(ChannelValue::Done)));
        let err = ch.receive().expect_err("done forever");
        assert_eq!(err.kind(), ErrorKind::ChannelDone);
    }
}

#[test]
fn done_wakes_parked_receiver() {
    supervised(|scope| {
        let ch = Arc::new(Channel::<u32>::rendezvous());
        let closer = Arc::clone(&ch);
        scope.fork(move |_| {
            trellis::sleep(Duration::from_millis(30))?;
            closer.done();
            Ok(())
        });
        match ch.receive_or_closed()? {
            ChannelValue::Done => Ok(()),
            other => panic!("expected done, got {other:?}"),
        }
    })
    .expect("scope result");
}

#[test]
fn done_fails_parked_sender() {
    supervised(|scope| {
        let ch = Arc::new(Channel::<u32>::rendezvous());
        let closer = Arc::clone(&ch);
        scope.fork(move |_| {
            trellis::sleep(Duration::from_millis(30))?;
            closer.done();
            Ok(())
        });
        let err = ch.send(1).expect_err("no receiver ever arrives");
        assert_eq!(err.kind(), ErrorKind::ChannelDone);
        Ok(())
    })
    .expect("scope result");
}

#[test]
fn error_closure_propagates_to_receivers() {
    let ch = Channel::<u32>::buffered(2);
    ch.send(1).expect("buffered");
    ch.error(trellis::Error::new(ErrorKind::Internal).with_context("upstream died"));

    // Unlike done(), an error is observed before buffered values.
    match ch.receive_or_closed().expect("not interrupted") {
        ChannelValue::Error(e) => assert_eq!(e.kind(), ErrorKind::Internal),
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn scope_exit_interrupts_parked_channel_operations() {
    let started = Instant::now();
    supervised(|scope| {
        let ch = Arc::new(Channel::<u32>::rendezvous());
        // Parks forever: no sender will arrive. Daemon forks are
        // interrupted once the body completes.
        scope.fork(move |_: &Scope| ch.receive().map(|_| ()));
        Ok(())
    })
    .expect("scope ends despite the parked receiver");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn interrupted_sender_tombstone_is_skipped_by_receivers() {
    let delivered = supervised(|scope| {
        let ch = Arc::new(Channel::<u32>::rendezvous());
        let doomed = Arc::clone(&ch);
        let parked = scope.fork_cancellable(move |_| doomed.send(13));
        // Let the sender park, then cancel it, leaving a tombstoned cell.
        trellis::sleep(Duration::from_millis(30))?;
        let err = parked.cancel().expect_err("sender was parked");
        assert!(err.is_interrupted());

        // A fresh rendezvous still works: the receiver retries past the
        // interrupted cell.
        let sender = Arc::clone(&ch);
        scope.fork(move |_| sender.send(99));
        ch.receive()
    })
    .expect("scope result");
    assert_eq!(delivered, 99);
}

#[test]
fn unsupervised_scope_runs_channel_pipelines() {
    let total = scoped(|scope| {
        let ch = Arc::new(Channel::<u64>::buffered(4));
        let sender = Arc::clone(&ch);
        scope.fork_unsupervised(move |_| {
            for i in 1..=10 {
                sender.send(i)?;
            }
            sender.done();
            Ok(())
        });
        let mut total = 0;
        loop {
            match ch.receive_or_closed()? {
                ChannelValue::Value(v) => total += v,
                ChannelValue::Done => break,
                ChannelValue::Error(e) => panic!("unexpected channel error: {e}"),
            }
        }
        Ok(total)
    })
    .expect("pipeline completes");
    assert_eq!(total, 55);
}
