//! Pool ownership across threads.

use flowkernel::buffer::BufferError;
use flowkernel::pool::{BufferPool, PoolArgs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn args(num_buffers: usize, buffer_size: usize) -> PoolArgs {
    PoolArgs {
        num_buffers,
        buffer_size,
        node_affinity: -1,
    }
}

#[test]
fn slot_dropped_on_another_thread_returns_to_pool() {
    let mut pool = BufferPool::make_with("generic", args(2, 64)).unwrap();
    let first = pool.front();
    let first_slot = first.managed().unwrap().slot();
    pool.pop(64).unwrap();
    let second = pool.front();
    pool.pop(64).unwrap();
    assert!(pool.is_empty());
    assert!(pool.front().is_null());

    thread::spawn(move || drop(first)).join().unwrap();

    assert!(!pool.is_empty());
    assert_eq!(pool.front().managed().unwrap().slot(), first_slot);
    drop(second);
}

#[test]
fn shared_slot_waits_for_every_holder() {
    let mut pool = BufferPool::make_with("generic", args(1, 32)).unwrap();
    let chunk = pool.front();
    pool.pop(32).unwrap();
    let copy = chunk.clone();
    let handle = chunk.managed().unwrap().clone();
    drop(chunk);
    pool.push(handle).unwrap();
    assert!(pool.is_empty(), "a clone is still alive");

    let channel = pool.return_channel();
    thread::spawn(move || {
        let lease = copy.managed().unwrap().clone();
        drop(copy);
        channel.push_external(lease).unwrap();
    })
    .join()
    .unwrap();
    assert!(!pool.is_empty());
}

#[test]
fn foreign_slots_are_rejected() {
    let mut a = BufferPool::make_with("generic", args(2, 16)).unwrap();
    let mut b = BufferPool::make_with("generic", args(2, 16)).unwrap();
    let chunk = a.front();
    a.pop(16).unwrap();
    let lease = chunk.managed().unwrap().clone();

    let err = b.push(lease.clone()).unwrap_err();
    assert_eq!(
        err,
        BufferError::ForeignBuffer {
            pool: b.id(),
            buffer_pool: a.id(),
        }
    );
    assert!(matches!(
        b.return_channel().push_external(lease),
        Err(BufferError::ForeignBuffer { .. })
    ));
}

#[test]
fn return_notifier_runs_on_release() {
    let mut pool = BufferPool::make_with("generic", args(2, 16)).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    pool.set_return_notifier(Some(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    let chunk = pool.front();
    pool.pop(16).unwrap();
    thread::spawn(move || drop(chunk)).join().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn small_pops_shrink_the_head_in_place() {
    let mut pool = BufferPool::make_with("generic", args(2, 64)).unwrap();
    let head = pool.front();
    pool.pop(8).unwrap();
    let shrunk = pool.front();
    assert_eq!(shrunk.len(), 56);
    assert_eq!(shrunk.address(), head.address() + 8);
}
