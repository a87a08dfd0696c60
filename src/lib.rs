//! A [`CowCell`] is a container for one logical value that is read far more
//! often than it is written. Readers get an owned, always-consistent
//! [`Snapshot`] without ever blocking on a writer; writers serialize on a
//! mutex, build a complete replacement value, publish it with one atomic
//! exchange and only then reclaim the superseded value. There are no torn
//! reads: a concurrent reader observes either the whole old value or the
//! whole new one.
//!
//! The pointer to the current value and a small counter of readers that are
//! mid-way through acquiring it share a single atomic word, using the 16
//! high-order bits a canonical 64 bit address leaves unused. That keeps the
//! entire read path inside compare-and-swap loops on one word, with no
//! per-read allocation and no lock. Reclamation is plain reference counting
//! plus a short drain wait on the writer side, so a snapshot taken before a
//! write stays valid for as long as it is held.
//!
//! Writes come in four flavors, each optionally guarded by a verifier
//! predicate that can veto the change before anything is built:
//! [`replace`](CowCell::replace) (unconditional fresh value),
//! [`reset`](CowCell::reset) (fresh-construct then modify),
//! [`edit`](CowCell::edit) (clone the current value then modify), and the
//! non-blocking [`try_reset`](CowCell::try_reset)/[`try_edit`](CowCell::try_edit)
//! counterparts which fail fast when another write is in progress.

mod cow_cell;
mod packed;

pub use cow_cell::{CowCell, Snapshot};

#[cfg(all(test, not(miri)))]
#[test]
fn test_load_multi() {
    use std::hint::black_box;
    use std::sync::Arc;
    use std::thread;
    let tmp: Arc<CowCell<i32>> = Arc::new(CowCell::new(3));
    let mut threads = vec![];
    for _ in 0..20 {
        let tmp = tmp.clone();
        threads.push(thread::spawn(move || {
            for _ in 0..2000 {
                let l1 = tmp.load();
                black_box(*l1);
            }
        }));
    }
    for _ in 0..20 {
        let tmp = tmp.clone();
        threads.push(thread::spawn(move || {
            for _ in 0..2000 {
                tmp.replace(rand::random());
            }
        }));
    }
    threads.into_iter().for_each(|thread| thread.join().unwrap());
}

#[test]
fn test_load() {
    let tmp = CowCell::new(3);
    assert_eq!(*tmp.load(), 3);
}

#[test]
fn test_store() {
    let tmp = CowCell::new(3);
    assert!(tmp.replace(-2));
    assert_eq!(*tmp.load(), -2);
}
