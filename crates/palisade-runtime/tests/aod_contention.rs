//! Contended object-bound dispatch: concurrent publishers, one logical
//! object, non-atomic state mutation.

use std::sync::mpsc;
use std::thread;

use palisade_runtime::SharedObject;

#[derive(Default)]
struct Counter {
    // deliberately a plain integer: the dispatcher's exclusivity is the
    // only thing keeping the read-modify-write safe
    value: u64,
}

#[test]
fn contended_posts_lose_no_increments() {
    const PUBLISHERS: usize = 3;
    const PER_PUBLISHER: usize = 10_000;

    let object = SharedObject::new(Counter::default());

    let publishers: Vec<_> = (0..PUBLISHERS)
        .map(|_| {
            let object = object.clone();
            thread::spawn(move || {
                for _ in 0..PER_PUBLISHER {
                    object.post(|counter| counter.value += 1);
                }
            })
        })
        .collect();

    for publisher in publishers {
        publisher.join().unwrap();
    }

    // every post call has returned, so every increment has run; read the
    // final value through the same serialization
    let (tx, rx) = mpsc::channel();
    object.post(move |counter| tx.send(counter.value).unwrap());

    assert_eq!(rx.recv().unwrap(), (PUBLISHERS * PER_PUBLISHER) as u64);
}

#[test]
fn publisher_order_survives_contention() {
    const PER_PUBLISHER: usize = 5_000;

    let object = SharedObject::new(Vec::<(usize, usize)>::new());

    let publishers: Vec<_> = (0..2usize)
        .map(|publisher| {
            let object = object.clone();
            thread::spawn(move || {
                for i in 0..PER_PUBLISHER {
                    object.post(move |log| log.push((publisher, i)));
                }
            })
        })
        .collect();

    for publisher in publishers {
        publisher.join().unwrap();
    }

    let (tx, rx) = mpsc::channel();
    object.post(move |log| tx.send(log.clone()).unwrap());
    let log = rx.recv().unwrap();

    assert_eq!(log.len(), 2 * PER_PUBLISHER);
    for publisher in 0..2 {
        let sequence: Vec<_> = log
            .iter()
            .filter(|(p, _)| *p == publisher)
            .map(|(_, i)| *i)
            .collect();
        let expected: Vec<_> = (0..PER_PUBLISHER).collect();
        assert_eq!(sequence, expected, "publisher {publisher} order broken");
    }
}
