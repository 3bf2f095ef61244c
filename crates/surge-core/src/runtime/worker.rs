//! 阻塞工作线程池：把会阻塞的闭包挪出循环线程执行。
//!
//! # 逻辑解析（How）
//! - 每个 [`Worker`] 拥有一个常驻 OS 线程，通过互斥量 + 条件变量接收
//!   单个待执行任务；
//! - [`to_thread`] 从池里借出（或新建）一个工作线程，闭包执行完毕后由
//!   完成回调把线程归还池中，归还动作永远发生在循环线程上——即使等待
//!   方已经被取消，也不会把仍在忙碌的线程塞回池里；
//! - 取消是尽力而为：不带钩子时只能等闭包自然返回；带钩子时由钩子拿着
//!   OS 线程句柄决定如何打断（例如向其投递中断信号）。

use crate::error::TaskError;
use crate::promise::{Promise, Settled};
use crate::runtime::current_context;
use crate::task::cancellable_at;
use parking_lot::{Condvar, Mutex};
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send>;

struct WorkerShared {
    job: Mutex<Option<Job>>,
    cond: Condvar,
    exit: AtomicBool,
}

pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn() -> Worker {
        let shared = Arc::new(WorkerShared {
            job: Mutex::new(None),
            cond: Condvar::new(),
            exit: AtomicBool::new(false),
        });

        let runner = Arc::clone(&shared);
        let thread = std::thread::spawn(move || {
            loop {
                let job = {
                    let mut slot = runner.job.lock();
                    loop {
                        if runner.exit.load(Ordering::Acquire) {
                            return;
                        }
                        if let Some(job) = slot.take() {
                            break job;
                        }
                        runner.cond.wait(&mut slot);
                    }
                };

                job();
            }
        });

        Worker {
            shared,
            thread: Some(thread),
        }
    }

    pub(crate) fn execute(&self, job: Job) {
        let mut slot = self.shared.job.lock();
        debug_assert!(slot.is_none(), "worker already has a pending job");
        *slot = Some(job);
        self.shared.cond.notify_one();
    }

    /// 执行线程的 OS 句柄，供取消钩子使用。
    pub(crate) fn thread_handle(&self) -> std::thread::Thread {
        self.thread
            .as_ref()
            .expect("worker thread is always present until drop")
            .thread()
            .clone()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        self.shared.cond.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn dispatch_to_worker<T, E, F>(f: F) -> (crate::promise::Future<T, E>, std::thread::Thread)
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let ctx = current_context().expect("to_thread requires a bound event loop");
    let worker = ctx.checkout_worker();
    let thread = worker.thread_handle();

    let promise: Promise<T, E> = Promise::bound(ctx.handle().clone());
    let future = promise.future();

    worker.execute(Box::new(move || {
        match f() {
            Ok(value) => promise.resolve(value),
            Err(error) => promise.reject(error),
        }
    }));

    // 完成回调在循环线程上执行，借此把线程安全地还回池中。
    future.add_callback(move || {
        if let Some(ctx) = current_context() {
            ctx.return_worker(worker);
        }
    });

    (future, thread)
}

/// 在工作线程上执行阻塞闭包，结果通过所属循环交付。
///
/// 不带取消钩子：等待方即使被取消，也要等 `f` 返回后才观察到结果。
pub fn to_thread<T, E, F>(f: F) -> impl std::future::Future<Output = Result<T, E>>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let (future, _thread) = dispatch_to_worker(f);
    Settled::new(future)
}

/// 带取消钩子的 [`to_thread`]：任务被取消时，钩子拿到工作线程的 OS
/// 句柄自行决定打断方式；闭包返回后等待按其真实结果落定。
#[track_caller]
pub fn to_thread_cancellable<T, E, F, C>(
    f: F,
    cancel: C,
) -> impl std::future::Future<Output = Result<T, E>>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    C: FnOnce(&std::thread::Thread) -> Result<(), TaskError> + 'static,
{
    let site = Location::caller();
    let (future, thread) = dispatch_to_worker(f);
    cancellable_at(Settled::new(future), move || cancel(&thread), site)
}
