//! Stage-2 pipeline: merges `run_ids.len()` sorted runs into one new run
//! via a loser-tree tournament, with a feeder thread keeping every input
//! stream read ahead and transient reader/writer threads dispatched
//! through a bounded pool.
//!
//! Grounded on `K_Merge`/`buffer_feeder`/`do_work` in
//! `original_source/LoserTree.hpp`. Two points deliberately diverge from
//! the literal C++:
//!
//! - There, `K_Merge` spawns a writer thread and immediately `.join()`s
//!   it, which serializes merging and flushing despite holding two
//!   output buffers. Here the merger dispatches the flush and keeps
//!   merging into the other output buffer, so the two genuinely overlap.
//! - There, `is_reading_[i]` is read under a different mutex than the one
//!   guarding the buffer queue `K_Merge`'s wait predicate also touches.
//!   `BufferPool` folds both under one lock (see its module comment).
//!
//! The feeder's choice of which stream to refill next (smallest
//! most-recently-delivered key) follows the same module; which buffer a
//! stream's read lands in is otherwise immaterial to correctness.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::buffer::BoundedBuffer;
use crate::error::{SortError, SortResult};
use crate::key::Key;
use crate::loser_tree::LoserTree;
use crate::pool::BufferPool;
use crate::run_io::{run_path, KeyReader, KeyWriter};

struct OutputShared<K: Key> {
    buffers: [BoundedBuffer<K>; 2],
    active: usize,
    is_writing: bool,
}

struct Stage2Shared<K: Key> {
    pool: BufferPool<K>,
    readers: Vec<Mutex<KeyReader<K>>>,
    output: Mutex<OutputShared<K>>,
    out_cond: Condvar,
    aborted: AtomicBool,
    first_error: Mutex<Option<SortError>>,
    eff_k: usize,
    prefix: PathBuf,
    out_run_id: u64,
}

impl<K: Key> Stage2Shared<K> {
    fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn fail(&self, err: SortError) {
        let mut slot = self.first_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.aborted.store(true, Ordering::SeqCst);
        self.pool.notify_all();
        self.out_cond.notify_all();
    }
}

/// Merges the runs named by `run_ids` (read from `<prefix><id>`) into a
/// single new run `<prefix><out_run_id>`, all under `prefix`. `capacity`
/// is the per-buffer key budget, the same `B` used by stage 1.
pub fn run_stage2_job<K: Key>(
    prefix: &Path,
    run_ids: &[u64],
    out_run_id: u64,
    capacity: usize,
) -> SortResult<()> {
    let eff_k = run_ids.len();
    assert!(eff_k >= 2, "a merge job needs at least two input runs");

    let pool = BufferPool::<K>::new(eff_k, capacity);
    let mut readers = Vec::with_capacity(eff_k);
    for &id in run_ids {
        readers.push(Mutex::new(KeyReader::<K>::open(run_path(prefix, id))?));
    }

    let shared = Arc::new(Stage2Shared {
        pool,
        readers,
        output: Mutex::new(OutputShared {
            buffers: [BoundedBuffer::new(0, capacity), BoundedBuffer::new(1, capacity)],
            active: 0,
            is_writing: false,
        }),
        out_cond: Condvar::new(),
        aborted: AtomicBool::new(false),
        first_error: Mutex::new(None),
        eff_k,
        prefix: prefix.to_path_buf(),
        out_run_id,
    });

    let workers = eff_k.min(num_cpus::get().max(1)).max(1);
    let thread_pool = threadpool::ThreadPool::new(workers);

    // Prime every stream with an initial buffer before the tree is built,
    // so the tournament starts with real keys rather than placeholder MAX
    // sentinels for streams that simply haven't been read yet.
    for i in 0..eff_k {
        let buf = shared.pool.check_out();
        shared.pool.mark_reading(i);
        let shared = Arc::clone(&shared);
        thread_pool.execute(move || read_stream_job(&shared, i, buf));
    }
    thread_pool.join();
    if let Some(err) = shared.first_error.lock().unwrap().take() {
        return Err(err);
    }

    let feeder_pool = thread_pool.clone();
    let feeder_shared = Arc::clone(&shared);
    let feeder = thread::spawn(move || feeder_thread(feeder_shared, feeder_pool));

    let merge_result = run_merger(&shared, &thread_pool);

    feeder.join().expect("feeder thread panicked");
    thread_pool.join();

    merge_result?;
    if let Some(err) = shared.first_error.lock().unwrap().take() {
        return Err(err);
    }
    Ok(())
}

/// Continuously keeps every non-exhausted stream's assigned queue fed,
/// preferring whichever stream is likely to be drained soonest.
fn feeder_thread<K: Key>(shared: Arc<Stage2Shared<K>>, thread_pool: threadpool::ThreadPool) {
    loop {
        if shared.aborted() {
            return;
        }
        if (0..shared.eff_k).all(|i| shared.pool.is_settled_eof(i)) {
            return;
        }
        match shared.pool.pick_stream_to_refill() {
            Some(stream) => {
                let buf = shared.pool.check_out();
                shared.pool.mark_reading(stream);
                let shared = Arc::clone(&shared);
                thread_pool.execute(move || read_stream_job(&shared, stream, buf));
            }
            None => shared.pool.wait_for_any_change(Duration::from_millis(5)),
        }
    }
}

/// Fills `buf` from stream `stream`'s file until full or EOF, then hands
/// it back to the pool and updates the stream's flags.
fn read_stream_job<K: Key>(shared: &Stage2Shared<K>, stream: usize, mut buf: BoundedBuffer<K>) {
    let result: SortResult<bool> = (|| {
        let mut reader = shared.readers[stream].lock().unwrap();
        loop {
            if buf.is_full() {
                return Ok(false);
            }
            match reader.next_key()? {
                Some(key) => {
                    buf.push(key);
                }
                None => return Ok(true),
            }
        }
    })();

    match result {
        Ok(hit_eof) => {
            let last_key = buf.peek_back();
            if buf.is_empty() {
                shared.pool.return_to_free(buf);
            } else {
                shared.pool.push_assigned(stream, buf);
            }
            shared.pool.finish_reading(stream, hit_eof, last_key);
        }
        Err(e) => {
            shared.pool.return_to_free(buf);
            shared.pool.finish_reading(stream, true, None);
            shared.fail(e);
        }
    }
}

/// Takes the next key for `stream` from its assigned queue, retiring the
/// buffer once it is drained. Returns `None` if the queue is empty.
fn try_take<K: Key>(shared: &Stage2Shared<K>, stream: usize) -> Option<K> {
    let key = shared.pool.with_front_assigned(stream, |b| b.take()).flatten();
    if key.is_some() {
        let now_empty = shared.pool.with_front_assigned(stream, |b| b.is_empty()).unwrap_or(false);
        if now_empty {
            shared.pool.retire_front_assigned(stream);
        }
    } else {
        shared.pool.retire_front_assigned(stream);
    }
    key
}

/// Advances stream `stream` to its next key, blocking on the feeder if
/// necessary. Returns `None` once the stream is exhausted.
fn advance_stream<K: Key>(shared: &Stage2Shared<K>, stream: usize) -> Option<K> {
    loop {
        if let Some(key) = try_take(shared, stream) {
            return Some(key);
        }
        if shared.pool.is_settled_eof(stream) {
            return None;
        }
        shared.pool.wait_for_stream(stream, &shared.aborted);
        if shared.aborted() {
            return None;
        }
    }
}

fn run_merger<K: Key>(shared: &Arc<Stage2Shared<K>>, thread_pool: &threadpool::ThreadPool) -> SortResult<()> {
    let mut initial = Vec::with_capacity(shared.eff_k);
    for i in 0..shared.eff_k {
        initial.push(advance_stream(shared, i));
    }
    if shared.aborted() {
        return Ok(());
    }
    let mut tree = LoserTree::new(shared.eff_k, initial);

    while !tree.is_exhausted() {
        if shared.aborted() {
            return Ok(());
        }
        let q = tree.winner();
        let key = tree.winner_key().expect("tree not exhausted implies a winner key");
        push_output(shared, thread_pool, key)?;
        let next = advance_stream(shared, q);
        tree.advance(q, next);
    }

    flush_final(shared, thread_pool)
}

/// Pushes `key` into the active output buffer. If that fills it, waits
/// for the other buffer to be idle and empty, then dispatches a writer
/// for the full one and swaps the merger onto the now-idle buffer.
fn push_output<K: Key>(
    shared: &Arc<Stage2Shared<K>>,
    thread_pool: &threadpool::ThreadPool,
    key: K,
) -> SortResult<()> {
    let mut guard = shared.output.lock().unwrap();
    let active = guard.active;
    guard.buffers[active].push(key);
    if !guard.buffers[active].is_full() {
        return Ok(());
    }

    let full_idx = guard.active;
    guard = shared
        .out_cond
        .wait_while(guard, |o| {
            (o.is_writing || !o.buffers[1 - o.active].is_empty()) && !shared.aborted()
        })
        .unwrap();
    if shared.aborted() {
        return Ok(());
    }
    guard.active = 1 - full_idx;
    guard.is_writing = true;
    drop(guard);

    let job_shared = Arc::clone(shared);
    thread_pool.execute(move || flush_buffer(&job_shared, full_idx));
    if let Some(err) = shared.first_error.lock().unwrap().take() {
        return Err(err);
    }
    Ok(())
}

/// Drains the full buffer and writes it to the output run, appending
/// rather than overwriting so each dispatched flush is independent.
fn flush_buffer<K: Key>(shared: &Stage2Shared<K>, idx: usize) {
    let keys: Vec<K> = {
        let mut guard = shared.output.lock().unwrap();
        let mut keys = Vec::with_capacity(guard.buffers[idx].size());
        while let Some(k) = guard.buffers[idx].take() {
            keys.push(k);
        }
        keys
    };

    let path = run_path(&shared.prefix, shared.out_run_id);
    let result: SortResult<()> = (|| {
        let mut writer = KeyWriter::<K>::open_append(&path)?;
        for key in keys {
            writer.write_key(key)?;
        }
        writer.finish()
    })();

    let mut guard = shared.output.lock().unwrap();
    guard.is_writing = false;
    drop(guard);
    shared.out_cond.notify_all();

    if let Err(e) = result {
        shared.fail(e);
    }
}

/// Flushes whatever remains in the active output buffer once the merge
/// is done, waiting for it synchronously since there is no more merging
/// left to overlap it with.
fn flush_final<K: Key>(shared: &Arc<Stage2Shared<K>>, thread_pool: &threadpool::ThreadPool) -> SortResult<()> {
    let mut guard = shared.output.lock().unwrap();
    guard = shared.out_cond.wait_while(guard, |o| o.is_writing && !shared.aborted()).unwrap();
    if shared.aborted() {
        drop(guard);
        thread_pool.join();
        return Ok(());
    }
    let idx = guard.active;
    let empty = guard.buffers[idx].is_empty();
    if empty {
        return Ok(());
    }
    guard.is_writing = true;
    drop(guard);

    let job_shared = Arc::clone(shared);
    thread_pool.execute(move || flush_buffer(&job_shared, idx));
    thread_pool.join();
    if let Some(err) = shared.first_error.lock().unwrap().take() {
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;
    use std::io::Write;

    fn write_run(path: &Path, keys: &[u32]) {
        let mut f = std::fs::File::create(path).unwrap();
        for k in keys {
            f.write_all(&k.to_le_bytes()).unwrap();
        }
    }

    fn read_run(path: &Path) -> Vec<u32> {
        let bytes = std::fs::read(path).unwrap();
        bytes.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn merges_three_sorted_runs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("run_");
        write_run(&run_path(&prefix, 1), &[1, 4, 8]);
        write_run(&run_path(&prefix, 2), &[2, 3]);
        write_run(&run_path(&prefix, 3), &[5, 6, 7]);

        run_stage2_job::<u32>(&prefix, &[1, 2, 3], 4, 4).unwrap();

        let merged = read_run(&run_path(&prefix, 4));
        assert_eq!(merged, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn merges_runs_longer_than_one_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("run_");
        let run_a: Vec<u32> = (0..20).map(|i| i * 2).collect();
        let run_b: Vec<u32> = (0..20).map(|i| i * 2 + 1).collect();
        write_run(&run_path(&prefix, 1), &run_a);
        write_run(&run_path(&prefix, 2), &run_b);

        run_stage2_job::<u32>(&prefix, &[1, 2], 3, 4).unwrap();

        let merged = read_run(&run_path(&prefix, 3));
        let expected: Vec<u32> = (0..40).collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn merges_runs_of_unequal_length() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("run_");
        write_run(&run_path(&prefix, 1), &[10]);
        write_run(&run_path(&prefix, 2), &[1, 2, 3, 4, 5, 6, 7, 8, 9]);

        run_stage2_job::<u32>(&prefix, &[1, 2], 3, 4).unwrap();

        let merged = read_run(&run_path(&prefix, 3));
        assert_eq!(merged, (1..=10).collect::<Vec<u32>>());
    }
}
