//! A thread pool that carries the submitter's trace context into its
//! workers.
//!
//! Spans created inside background work submitted through
//! [`TracedThreadPool`] are parented under whatever span was active on the
//! submitting thread, instead of coming out as orphan roots. When no span
//! was active at submit time the task runs with the worker's own context;
//! none is fabricated.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use opentelemetry::trace::TraceContextExt;
use opentelemetry::{otel_warn, Context};
use thiserror::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Error returned by [`TaskHandle::join`].
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskError {
    /// The task panicked while running.
    #[error("task panicked")]
    Panicked,
    /// The task was dropped before it produced a result, for example because
    /// the pool was shut down before the task was picked up.
    #[error("task was dropped before completion")]
    Canceled,
}

/// Handle to a task submitted to a [`TracedThreadPool`].
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes and returns its result unchanged, or
    /// the reason it produced none.
    pub fn join(self) -> Result<T, TaskError> {
        self.receiver.recv().unwrap_or(Err(TaskError::Canceled))
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}

/// Fixed-size worker pool whose tasks inherit the submitter's trace context.
pub struct TracedThreadPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl TracedThreadPool {
    /// Spawns `workers` named worker threads.
    pub fn new(workers: usize, thread_name_prefix: &str) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("{thread_name_prefix}-{index}"))
                .spawn(move || loop {
                    // Hold the lock only while waiting, never while running
                    // the job.
                    let job = {
                        let Ok(receiver) = receiver.lock() else { break };
                        receiver.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })?;
            handles.push(handle);
        }

        Ok(TracedThreadPool {
            sender: Some(sender),
            workers: handles,
        })
    }

    /// Submits `task` to the pool.
    ///
    /// The current context is captured here when it has an active span and
    /// re-attached around `task` inside the worker, then detached again so a
    /// reused worker thread starts the next task with a clean context. A
    /// panicking task surfaces as [`TaskError::Panicked`] on the handle.
    pub fn submit<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let captured = Context::current();
        let captured = captured.has_active_span().then_some(captured);
        let (result_sender, result_receiver) = mpsc::channel();

        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| match captured {
                Some(cx) => {
                    let _guard = cx.attach();
                    task()
                }
                None => task(),
            }));
            // The receiver may be gone when the caller dropped the handle.
            let _ = result_sender.send(outcome.map_err(|_| TaskError::Panicked));
        });

        match &self.sender {
            Some(sender) if sender.send(job).is_ok() => {}
            _ => {
                otel_warn!(name: "TracedThreadPool.SubmitAfterShutdown");
            }
        }
        TaskHandle {
            receiver: result_receiver,
        }
    }

    /// Stops accepting tasks, drains the queue and joins all workers.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                otel_warn!(name: "TracedThreadPool.WorkerPanicked");
            }
        }
    }
}

impl Drop for TracedThreadPool {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

impl fmt::Debug for TracedThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedThreadPool")
            .field("workers", &self.workers.len())
            .field("shut_down", &self.sender.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Span, SpanId, TraceContextExt, Tracer, TracerProvider};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};

    fn test_provider() -> (SdkTracerProvider, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (provider, exporter)
    }

    #[test]
    fn propagates_span_to_worker() {
        let (provider, exporter) = test_provider();
        let tracer = provider.tracer("traced-pool-test");
        let pool = TracedThreadPool::new(1, "traced-pool-test").unwrap();

        let parent_cx = Context::current_with_span(tracer.start("submitting"));
        let worker_tracer = tracer.clone();
        let handle = {
            let _guard = parent_cx.clone().attach();
            pool.submit(move || {
                let mut span = worker_tracer.start("background-work");
                span.end();
            })
        };
        handle.join().unwrap();
        parent_cx.span().end();
        pool.shutdown();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 2);
        let parent = spans.iter().find(|s| s.name == "submitting").unwrap();
        let child = spans.iter().find(|s| s.name == "background-work").unwrap();
        assert_eq!(child.parent_span_id, parent.span_context.span_id());
        assert_eq!(
            child.span_context.trace_id(),
            parent.span_context.trace_id()
        );
    }

    #[test]
    fn no_context_when_none_active_at_submit() {
        let (provider, exporter) = test_provider();
        let tracer = provider.tracer("traced-pool-test");
        let pool = TracedThreadPool::new(1, "traced-pool-test").unwrap();

        let worker_tracer = tracer.clone();
        let handle = pool.submit(move || {
            let mut span = worker_tracer.start("background-work");
            span.end();
        });
        handle.join().unwrap();
        pool.shutdown();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].parent_span_id, SpanId::INVALID);
    }

    #[test]
    fn result_passes_through() {
        let pool = TracedThreadPool::new(2, "traced-pool-test").unwrap();
        let handle = pool.submit(|| 6 * 7);
        assert_eq!(handle.join(), Ok(42));
    }

    #[test]
    fn panic_surfaces_as_task_error_and_worker_survives() {
        let pool = TracedThreadPool::new(1, "traced-pool-test").unwrap();
        let boom = pool.submit(|| panic!("boom"));
        assert_eq!(boom.join(), Err(TaskError::Panicked));

        // The single worker is still alive and picks up the next task.
        let handle = pool.submit(|| "still alive");
        assert_eq!(handle.join(), Ok("still alive"));
    }
}
