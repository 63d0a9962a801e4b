use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

/// A pool of threads for the data-parallel inner loops of the tracker.
///
/// Passing no worker to an operation makes it run on the calling thread.
pub struct Worker {
    pool: ThreadPool,
}

impl Worker {
    /// Creates a worker with `threads` threads, zero picks the number of logical cores.
    pub fn new(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("rmv-worker-{index}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` inside the pool so that rayon iterators within it use the pool's threads.
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        R: Send,
        OP: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }

    /// Calls `function(start, size)` for disjoint chunks covering `[first, first + size)`.
    ///
    /// Chunks hold at least `minimal_chunk` elements. Returns once every chunk has been processed.
    pub fn execute_function<F>(&self, function: F, first: usize, size: usize, minimal_chunk: usize)
    where
        F: Fn(usize, usize) + Sync,
    {
        if size == 0 {
            return;
        }
        let chunks = (size / minimal_chunk.max(1)).clamp(1, self.threads().max(1));
        let chunk_size = (size + chunks - 1) / chunks;
        let function = &function;
        self.pool.scope(|scope| {
            let mut start = first;
            let end = first + size;
            while start < end {
                let len = chunk_size.min(end - start);
                scope.spawn(move |_| function(start, len));
                start += len;
            }
        });
    }
}
