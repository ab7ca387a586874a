use crate::runtime::Handle;
use crate::runtime::worker::Worker;
use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use std::thread;

/// Worker threads of an executor.
#[derive(Debug)]
pub(super) struct ThreadPool {
    handles: Mutex<Vec<(usize, thread::JoinHandle<()>)>>,
}

impl ThreadPool {
    /// Spawns one thread per configured worker. If any spawn fails, the
    /// threads already started are shut down and joined.
    pub(super) fn spawn(handle: &Handle) -> Result<Self> {
        let num_workers = handle.worker_count();
        let pool = Self {
            handles: Mutex::new(Vec::with_capacity(num_workers)),
        };

        for id in 0..num_workers {
            match spawn_worker_thread(handle.clone(), id) {
                Ok(join) => pool.handles.lock().push((id, join)),
                Err(e) => {
                    handle.begin_shutdown();
                    if let Err(join_err) = pool.join_all() {
                        tracing::error!(error = %join_err, "failed to join workers after spawn error");
                    }
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    /// Joins every worker thread. Idempotent.
    pub(super) fn join_all(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock());

        let errors = handles
            .into_iter()
            .filter_map(|(id, handle)| handle.join().err().map(|_| id))
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} worker thread(s) panicked: {:?}",
                errors.len(),
                errors
            ))
        }
    }
}

fn spawn_worker_thread(handle: Handle, id: usize) -> Result<thread::JoinHandle<()>> {
    let mut builder = thread::Builder::new().name((handle.cfg.thread_name.0)());

    if let Some(stack_size) = handle.cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(move || Worker::new(id, handle).run())
        .with_context(|| format!("failed to spawn worker thread {}", id))
}
