use sandbox_spy::{EventListener, ListenerTable, Ret, SelfCallBarrier, Spy, SpyResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn many_threads_enter_and_exit_independently() {
    let barrier = Arc::new(SelfCallBarrier::new());
    let start = Arc::new(Barrier::new(128));

    let handles = (0..128)
        .map(|_| {
            let barrier = barrier.clone();
            let start = start.clone();
            thread::spawn(move || {
                let me = thread::current().id();
                start.wait();
                for _ in 0..200 {
                    assert!(!barrier.is_entered(me));
                    let outer = barrier.enter(me);
                    let inner = barrier.enter(me);
                    assert!(barrier.is_entered(me));
                    barrier.exit(me, inner);
                    assert!(barrier.is_entered(me));
                    barrier.exit(me, outer);
                }
                assert!(!barrier.is_entered(me));
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(barrier.entered_count(), 0);
}

#[test]
fn entries_of_other_threads_are_invisible() {
    let barrier = Arc::new(SelfCallBarrier::new());
    let _guard = barrier.guard();

    let other = barrier.clone();
    let seen = thread::spawn(move || other.is_entered(thread::current().id()))
        .join()
        .unwrap();
    assert!(!seen);
    assert!(barrier.is_entered(thread::current().id()));
}

struct Counting {
    lines: AtomicUsize,
}

impl EventListener for Counting {
    fn line(&self, _line_number: i32) -> SpyResult {
        self.lines.fetch_add(1, Ordering::SeqCst);
        Ok(Ret::None)
    }
}

#[test]
fn concurrent_dispatch_reaches_listener_from_every_thread() {
    let spy = Arc::new(Spy::new());
    let table = Arc::new(ListenerTable::new());
    let listener = Arc::new(Counting {
        lines: AtomicUsize::new(0),
    });
    table.register(9, listener.clone());
    spy.init("alpha", table);

    let handles = (0..32)
        .map(|_| {
            let spy = spy.clone();
            thread::spawn(move || {
                for line in 0..50 {
                    assert!(spy.spy_method_on_line(9, line).unwrap().is_none());
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(listener.lines.load(Ordering::SeqCst), 32 * 50);
    assert_eq!(spy.barrier().entered_count(), 0);
}

#[test]
fn global_spy_is_shared() {
    assert!(std::ptr::eq(sandbox_spy::global(), sandbox_spy::global()));
}

#[test]
fn concurrent_rebinding_reports_each_replaced_listener_once() {
    let table = Arc::new(ListenerTable::new());
    let start = Arc::new(Barrier::new(16));

    let handles = (0..16)
        .map(|_| {
            let table = table.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                (0..100)
                    .filter_map(|_| {
                        let listener: Arc<dyn EventListener> = Arc::new(Counting {
                            lines: AtomicUsize::new(0),
                        });
                        table.register(1, listener)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>();

    // Replaced listeners stay alive until the end so addresses are unique.
    let kept: Vec<Arc<dyn EventListener>> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    let mut replaced: Vec<usize> = kept
        .iter()
        .map(|previous| Arc::as_ptr(previous) as *const () as usize)
        .collect();
    assert_eq!(replaced.len(), 16 * 100 - 1);
    replaced.sort_unstable();
    replaced.dedup();
    assert_eq!(replaced.len(), 16 * 100 - 1);

    let last = table.unregister(1).unwrap();
    let last = Arc::as_ptr(&last) as *const () as usize;
    assert!(replaced.binary_search(&last).is_err());
    assert!(table.unregister(1).is_none());
}
