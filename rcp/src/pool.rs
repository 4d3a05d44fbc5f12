//! Reusable datagram buffers.
//!
//! A [`BufferPool`] hands out exclusively-owned [`BUFFER_SIZE`] buffers.  A
//! checked-out buffer is a [`PooledBuffer`] guard; dropping the guard returns
//! the buffer, so a buffer can never be handed out twice or returned while
//! still borrowed.
//!
//! The pool is shared by the receive task and every connection sending on the
//! same socket, hence the `Mutex`.  When it runs dry a fresh buffer is
//! allocated; at most `capacity` idle buffers are kept.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::packet::PACKET_SIZE;

/// Size of every pooled buffer: one byte more than the largest packet, so an
/// oversized datagram shows up as such instead of being silently truncated.
pub const BUFFER_SIZE: usize = PACKET_SIZE + 1;

type Buffer = Box<[u8; BUFFER_SIZE]>;

#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Buffer>>,
    capacity: usize,
    outstanding: AtomicUsize,
}

/// A buffer checked out of a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer<'p> {
    pool: &'p BufferPool,
    /// Handed back to the pool in `drop`, hence not dropped here.
    buf: ManuallyDrop<Buffer>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Check out a buffer, reusing an idle one if there is any.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let reused = self.lock().pop();
        let buf = reused.unwrap_or_else(|| Box::new([0u8; BUFFER_SIZE]));
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            pool: self,
            buf: ManuallyDrop::new(buf),
        }
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Idle buffers ready for reuse.
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, buf: Buffer) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Buffer>> {
        // The list holds plain buffers; a panic elsewhere cannot leave it
        // inconsistent.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8; BUFFER_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: `buf` is never touched again after this.
        let buf = unsafe { ManuallyDrop::take(&mut self.buf) };
        self.pool.release(buf);
    }
}
