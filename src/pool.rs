//! `BufferPool`: `2·K` `BoundedBuffer`s shared across `K` input streams
//! for stage 2, plus per-stream queues of currently-assigned buffers and
//! each stream's reading/EOF status.
//!
//! Grounded on `BufferQueue<T, BufferType, nway, buffer_size>` in
//! `original_source/structures.hpp`. The original guards `buffers_[i]`
//! under the same mutex as `free_buffers_` but checks `is_reading_[i]`
//! under a *different* mutex, so `K_Merge`'s wait predicate
//! (`!is_reading_[q] && !buffers_[q].empty()`) reads one field without
//! holding the lock that protects it. This folds the reading/EOF flags
//! into the same lock as the queues they are always consulted alongside,
//! closing that hazard rather than reproducing it.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::buffer::BoundedBuffer;
use crate::key::Key;

struct StreamFlags<K: Key> {
    eof: bool,
    is_reading: bool,
    /// Last key delivered for this stream, used by the feeder to
    /// prioritize whichever stream is likely to be drained soonest.
    cur_max: Option<K>,
}

struct PoolState<K: Key> {
    free: VecDeque<BoundedBuffer<K>>,
    assigned: Vec<VecDeque<BoundedBuffer<K>>>,
    flags: Vec<StreamFlags<K>>,
}

pub struct BufferPool<K: Key> {
    state: Mutex<PoolState<K>>,
    free_nonempty: Condvar,
    /// Notified whenever an assigned queue or a stream's flags change, so
    /// a consumer blocked waiting for a particular stream's next buffer
    /// can re-check its predicate.
    changed: Condvar,
    num_streams: usize,
    capacity: usize,
}

impl<K: Key> BufferPool<K> {
    /// Allocates `2 * num_streams` buffers of `capacity` keys each, all
    /// initially free. Every stream starts not-reading and not-EOF.
    pub fn new(num_streams: usize, capacity: usize) -> Self {
        let mut free = VecDeque::with_capacity(2 * num_streams);
        for tag in 0..2 * num_streams {
            free.push_back(BoundedBuffer::new(tag, capacity));
        }
        let assigned = (0..num_streams).map(|_| VecDeque::new()).collect();
        let flags = (0..num_streams)
            .map(|_| StreamFlags { eof: false, is_reading: false, cur_max: None })
            .collect();
        BufferPool {
            state: Mutex::new(PoolState { free, assigned, flags }),
            free_nonempty: Condvar::new(),
            changed: Condvar::new(),
            num_streams,
            capacity,
        }
    }

    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until a buffer is free, then removes it from the free queue
    /// and returns it to the caller.
    pub fn check_out(&self) -> BoundedBuffer<K> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(buf) = state.free.pop_front() {
                return buf;
            }
            state = self.free_nonempty.wait(state).unwrap();
        }
    }

    pub fn return_to_free(&self, mut buf: BoundedBuffer<K>) {
        buf.clear();
        let mut state = self.state.lock().unwrap();
        state.free.push_back(buf);
        self.free_nonempty.notify_one();
    }

    pub fn push_assigned(&self, stream: usize, buf: BoundedBuffer<K>) {
        let mut state = self.state.lock().unwrap();
        state.assigned[stream].push_back(buf);
        self.changed.notify_all();
    }

    /// Marks `stream` as currently being filled by a transient reader.
    pub fn mark_reading(&self, stream: usize) {
        let mut state = self.state.lock().unwrap();
        state.flags[stream].is_reading = true;
    }

    /// Clears the reading flag for `stream`, records whether the read
    /// that just finished hit end of file and the last key it delivered
    /// (if any), then wakes anyone waiting on this stream's next buffer
    /// or readiness.
    pub fn finish_reading(&self, stream: usize, hit_eof: bool, last_key: Option<K>) {
        let mut state = self.state.lock().unwrap();
        state.flags[stream].is_reading = false;
        if hit_eof {
            state.flags[stream].eof = true;
        }
        if last_key.is_some() {
            state.flags[stream].cur_max = last_key;
        }
        self.changed.notify_all();
    }

    /// `true` once `stream` has reached EOF and has no transient read in
    /// flight: it will never produce another buffer.
    pub fn is_settled_eof(&self, stream: usize) -> bool {
        let state = self.state.lock().unwrap();
        state.flags[stream].eof && !state.flags[stream].is_reading
    }

    pub fn is_reading(&self, stream: usize) -> bool {
        let state = self.state.lock().unwrap();
        state.flags[stream].is_reading
    }

    /// Among streams that are not at EOF, not already being read, and
    /// have no buffer already queued, returns the one with the smallest
    /// last-delivered key (the stream the merger is likely to drain
    /// soonest), or a stream that has never been read yet if any exists,
    /// or `None` if every stream is settled or already being serviced.
    pub fn pick_stream_to_refill(&self) -> Option<usize> {
        let state = self.state.lock().unwrap();
        let mut best: Option<(usize, Option<K>)> = None;
        for i in 0..self.num_streams {
            let f = &state.flags[i];
            if f.eof || f.is_reading || !state.assigned[i].is_empty() {
                continue;
            }
            match (&best, f.cur_max) {
                (None, key) => best = Some((i, key)),
                (Some((_, None)), _) => {} // an unread stream already has top priority
                (Some((_, Some(_))), None) => best = Some((i, None)),
                (Some((_, Some(b))), Some(k)) if k < *b => best = Some((i, Some(k))),
                _ => {}
            }
        }
        best.map(|(i, _)| i)
    }

    /// Blocks until `stream` either has an assigned buffer to hand out,
    /// has settled at EOF, or `aborted` is set.
    pub fn wait_for_stream(&self, stream: usize, aborted: &std::sync::atomic::AtomicBool) {
        use std::sync::atomic::Ordering;
        let state = self.state.lock().unwrap();
        let _state = self
            .changed
            .wait_while(state, |s| {
                s.assigned[stream].is_empty()
                    && !(s.flags[stream].eof && !s.flags[stream].is_reading)
                    && !aborted.load(Ordering::SeqCst)
            })
            .unwrap();
    }

    /// Wakes every waiter on both condvars; used when a job aborts so no
    /// thread blocks forever on a predicate that can no longer progress.
    pub fn notify_all(&self) {
        self.free_nonempty.notify_all();
        self.changed.notify_all();
    }

    /// Blocks until some stream's assigned queue or flags change, or
    /// `timeout` elapses, whichever comes first. Used by the feeder when
    /// every stream is momentarily either settled or already being read.
    pub fn wait_for_any_change(&self, timeout: std::time::Duration) {
        let state = self.state.lock().unwrap();
        let _ = self.changed.wait_timeout(state, timeout).unwrap();
    }

    /// Applies `f` to the front buffer of `stream`'s assigned queue, if
    /// any is currently assigned.
    pub fn with_front_assigned<R>(
        &self,
        stream: usize,
        f: impl FnOnce(&mut BoundedBuffer<K>) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock().unwrap();
        state.assigned[stream].front_mut().map(f)
    }

    pub fn has_assigned(&self, stream: usize) -> bool {
        let state = self.state.lock().unwrap();
        !state.assigned[stream].is_empty()
    }

    /// Pops the front (now-exhausted) buffer from `stream`'s assigned
    /// queue and returns it to the free pool, notifying any waiter.
    pub fn retire_front_assigned(&self, stream: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(mut buf) = state.assigned[stream].pop_front() {
            buf.clear();
            state.free.push_back(buf);
            self.free_nonempty.notify_one();
            self.changed.notify_all();
        }
    }

    /// Total buffer accounting invariant check, used by tests and
    /// `cleanup`: `|free| + sum(|assigned[i]|) == 2 * num_streams` when
    /// no buffer is held transiently by a thread.
    #[cfg(test)]
    fn total_accounted(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.free.len() + state.assigned.iter().map(|q| q.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_fully_free() {
        let pool: BufferPool<u32> = BufferPool::new(3, 8);
        assert_eq!(pool.total_accounted(), 6);
    }

    #[test]
    fn check_out_and_return_preserves_total() {
        let pool: BufferPool<u32> = BufferPool::new(2, 4);
        let buf = pool.check_out();
        assert_eq!(pool.total_accounted(), 3);
        pool.push_assigned(0, buf);
        assert_eq!(pool.total_accounted(), 4);
        pool.retire_front_assigned(0);
        assert_eq!(pool.total_accounted(), 4);
    }

    #[test]
    fn with_front_assigned_mutates_buffer() {
        let pool: BufferPool<u32> = BufferPool::new(1, 4);
        let mut buf = pool.check_out();
        buf.push(42);
        pool.push_assigned(0, buf);
        let taken = pool.with_front_assigned(0, |b| b.take());
        assert_eq!(taken, Some(Some(42)));
    }

    #[test]
    fn stream_flags_track_reading_and_eof() {
        let pool: BufferPool<u32> = BufferPool::new(1, 4);
        assert!(!pool.is_reading(0));
        assert!(!pool.is_settled_eof(0));
        pool.mark_reading(0);
        assert!(pool.is_reading(0));
        assert!(!pool.is_settled_eof(0));
        pool.finish_reading(0, true, None);
        assert!(!pool.is_reading(0));
        assert!(pool.is_settled_eof(0));
    }

    #[test]
    fn wait_for_stream_returns_once_settled_eof() {
        use std::sync::atomic::AtomicBool;
        let pool: BufferPool<u32> = BufferPool::new(1, 4);
        pool.mark_reading(0);
        pool.finish_reading(0, true, None);
        let aborted = AtomicBool::new(false);
        pool.wait_for_stream(0, &aborted); // must not block: already settled
    }

    #[test]
    fn pick_stream_to_refill_prefers_smallest_cur_max() {
        let pool: BufferPool<u32> = BufferPool::new(3, 4);
        pool.mark_reading(0);
        pool.finish_reading(0, false, Some(50));
        pool.mark_reading(1);
        pool.finish_reading(1, false, Some(10));
        // stream 2 never read yet: top priority regardless of the others.
        assert_eq!(pool.pick_stream_to_refill(), Some(2));
        pool.mark_reading(2);
        pool.finish_reading(2, false, Some(99));
        assert_eq!(pool.pick_stream_to_refill(), Some(1));
    }
}
