//! 事件循环：所有非阻塞续体的唯一执行上下文。
//!
//! # 设计背景（Why）
//! - 调度模型是单线程协作式：任务只在显式挂起点让出，所有恢复都回到
//!   循环线程执行，省去用户态的并发防护；
//! - 跨线程投递（工作线程回报、通道唤醒）通过注入队列与条件变量唤醒
//!   串行化，这两者共同构成本运行时的「反应器」：任意线程可唤醒 + 定时
//!   回调。fd 就绪通知属于平台适配层，不在本模块范围内。
//!
//! # 契约说明（What）
//! - [`EventLoop`] 与创建它的线程绑定（`!Send`），[`Handle`] 是可跨线程
//!   克隆的投递句柄；
//! - `post` 从任意线程入队回调：不带延迟时在下一轮迭代执行，带延迟时
//!   至少等待指定时长；
//! - `dispatch` 即使队列为空也不会退出，直到 `loop_exit` 设定的截止点；
//!   截止点之前到期的定时器与回调仍会执行；
//! - 每个 OS 线程同一时刻至多绑定一个循环，任务默认继承当前线程的绑定。

pub(crate) mod worker;

pub use worker::{to_thread, to_thread_cancellable};

use crate::error::RunError;
use crate::fs::Framework;
use crate::task::frame::Frame;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use worker::Worker;

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    RunAt(Instant, Job),
    Wake(u64),
}

struct Shared {
    queue: Mutex<VecDeque<Message>>,
    cond: Condvar,
    stop_at: Mutex<Option<Instant>>,
}

/// 跨线程投递句柄。
///
/// 克隆成本是一次引用计数；所有方法都可以在任意线程调用。来自同一线程
/// 的投递保持提交顺序，不同线程之间的交错顺序不作保证。
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    fn push(&self, message: Message) {
        self.shared.queue.lock().push_back(message);
        self.shared.cond.notify_one();
    }

    /// 入队一个回调，在循环的下一轮迭代执行。
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Message::Run(Box::new(f)));
    }

    /// 入队一个延迟回调，至少等待 `delay` 之后执行。
    pub fn post_delayed<F>(&self, f: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Message::RunAt(Instant::now() + delay, Box::new(f)));
    }

    /// 请求优雅停机：`delay` 之内到期的回调与定时器照常执行。
    pub fn loop_exit(&self, delay: Option<Duration>) {
        let at = Instant::now() + delay.unwrap_or(Duration::ZERO);
        *self.shared.stop_at.lock() = Some(at);
        self.shared.cond.notify_one();
    }

    pub(crate) fn wake_task(&self, id: u64) {
        self.push(Message::Wake(id));
    }
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap 是大根堆；反转比较让最早到期、最先登记的条目先出。
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

pub(crate) struct TaskSlot {
    future: Option<Pin<Box<dyn Future<Output = ()>>>>,
    frame: Rc<Frame>,
}

pub(crate) struct LoopContext {
    handle: Handle,
    tasks: RefCell<HashMap<u64, TaskSlot>>,
    locals: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    next_task: Cell<u64>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    timer_seq: Cell<u64>,
    current: RefCell<Option<Rc<Frame>>>,
    workers: RefCell<VecDeque<Worker>>,
    max_workers: usize,
    framework: Option<Box<dyn Framework>>,
}

impl LoopContext {
    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn insert_task(&self, future: Pin<Box<dyn Future<Output = ()>>>, frame: Rc<Frame>) -> u64 {
        let id = self.next_task.get();
        self.next_task.set(id + 1);
        self.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                future: Some(future),
                frame,
            },
        );
        id
    }

    pub(crate) fn current_frame(&self) -> Option<Rc<Frame>> {
        self.current.borrow().clone()
    }

    /// 循环线程专用的本地队列，下一轮迭代执行（无需跨线程搬运）。
    pub(crate) fn post_local(&self, job: Box<dyn FnOnce()>) {
        self.locals.borrow_mut().push_back(job);
    }

    pub(crate) fn checkout_worker(&self) -> Worker {
        match self.workers.borrow_mut().pop_front() {
            Some(worker) => {
                trace!("reusing pooled worker");
                worker
            }
            None => {
                debug!("spawning blocking worker");
                Worker::spawn()
            }
        }
    }

    pub(crate) fn return_worker(&self, worker: Worker) {
        let mut workers = self.workers.borrow_mut();
        if workers.len() < self.max_workers {
            workers.push_back(worker);
        }
        // 超出上限的工作线程随 drop 一起退出。
    }
}

thread_local! {
    static CURRENT: RefCell<Weak<LoopContext>> = RefCell::new(Weak::new());
}

pub(crate) fn current_context() -> Option<Rc<LoopContext>> {
    CURRENT.with(|current| current.borrow().upgrade())
}

/// 返回当前线程绑定的事件循环。
pub fn get_event_loop() -> Option<EventLoop> {
    current_context().map(|ctx| EventLoop { ctx })
}

/// 绑定事件循环到当前线程，替换既有绑定。
pub fn set_event_loop(event_loop: &EventLoop) {
    CURRENT.with(|current| {
        *current.borrow_mut() = Rc::downgrade(&event_loop.ctx);
    });
}

/// 绑定期守卫：随 drop 恢复此前的线程绑定。
pub struct Binding {
    previous: Weak<LoopContext>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            *current.borrow_mut() = std::mem::replace(&mut self.previous, Weak::new());
        });
    }
}

/// 事件循环的构造配置。
pub struct EventLoopOptions {
    max_workers: usize,
    framework: Option<Box<dyn Framework>>,
}

impl Default for EventLoopOptions {
    fn default() -> Self {
        EventLoopOptions {
            max_workers: 16,
            framework: None,
        }
    }
}

impl EventLoopOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 工作线程池的上限，超出部分用完即弃。
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// 安装平台文件 I/O 提交器。
    pub fn framework(mut self, framework: Box<dyn Framework>) -> Self {
        self.framework = Some(framework);
        self
    }

    pub fn build(self) -> EventLoop {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stop_at: Mutex::new(None),
        });

        EventLoop {
            ctx: Rc::new(LoopContext {
                handle: Handle { shared },
                tasks: RefCell::new(HashMap::new()),
                locals: RefCell::new(VecDeque::new()),
                next_task: Cell::new(0),
                timers: RefCell::new(BinaryHeap::new()),
                timer_seq: Cell::new(0),
                current: RefCell::new(None),
                workers: RefCell::new(VecDeque::new()),
                max_workers: self.max_workers,
                framework: self.framework,
            }),
        }
    }
}

/// 单线程协作式事件循环。
///
/// 值本身是循环线程内的廉价克隆句柄（`!Send`）；跨线程投递一律通过
/// [`EventLoop::handle`] 取得的 [`Handle`] 进行。
#[derive(Clone)]
pub struct EventLoop {
    ctx: Rc<LoopContext>,
}

struct TaskWaker {
    handle: Handle,
    id: u64,
}

impl std::task::Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.handle.wake_task(self.id);
    }
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoopOptions::default().build()
    }

    pub fn handle(&self) -> &Handle {
        &self.ctx.handle
    }

    /// 平台文件 I/O 提交器（若已安装）。
    pub fn framework(&self) -> Option<&dyn Framework> {
        self.ctx.framework.as_deref()
    }

    /// 入队回调；`delay` 为空时在下一轮迭代执行。
    pub fn post<F>(&self, f: F, delay: Option<Duration>)
    where
        F: FnOnce() + Send + 'static,
    {
        match delay {
            None => self.ctx.handle.post(f),
            Some(delay) => self.ctx.handle.post_delayed(f, delay),
        }
    }

    /// 请求优雅停机，语义见 [`Handle::loop_exit`]。
    pub fn loop_exit(&self, delay: Option<Duration>) {
        self.ctx.handle.loop_exit(delay);
    }

    /// 绑定当前线程；线程已被其它循环占用时失败。
    pub fn bind(&self) -> Result<Binding, RunError> {
        CURRENT.with(|current| {
            let mut slot = current.borrow_mut();
            if slot.upgrade().is_some() {
                return Err(RunError::AlreadyBound);
            }
            let previous = std::mem::replace(&mut *slot, Rc::downgrade(&self.ctx));
            Ok(Binding { previous })
        })
    }

    fn poll_task(&self, id: u64) {
        let (mut future, frame) = {
            let mut tasks = self.ctx.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(&id) else {
                return;
            };
            let Some(future) = slot.future.take() else {
                return;
            };
            (future, Rc::clone(&slot.frame))
        };

        let waker = Waker::from(Arc::new(TaskWaker {
            handle: self.ctx.handle.clone(),
            id,
        }));
        let mut cx = Context::from_waker(&waker);

        let previous = self.ctx.current.replace(Some(frame));
        let poll = future.as_mut().poll(&mut cx);
        self.ctx.current.replace(previous);

        match poll {
            Poll::Ready(()) => {
                self.ctx.tasks.borrow_mut().remove(&id);
            }
            Poll::Pending => {
                if let Some(slot) = self.ctx.tasks.borrow_mut().get_mut(&id) {
                    slot.future = Some(future);
                }
            }
        }
    }

    fn push_timer(&self, at: Instant, job: Job) {
        let seq = self.ctx.timer_seq.get();
        self.ctx.timer_seq.set(seq + 1);
        self.ctx.timers.borrow_mut().push(TimerEntry { at, seq, job });
    }

    fn run_due_timers(&self, now: Instant) {
        loop {
            let due = {
                let mut timers = self.ctx.timers.borrow_mut();
                match timers.peek() {
                    Some(entry) if entry.at <= now => timers.pop(),
                    _ => None,
                }
            };

            match due {
                Some(entry) => (entry.job)(),
                None => break,
            }
        }
    }

    fn next_deadline(&self, stop_at: Option<Instant>) -> Option<Instant> {
        let timer = self.ctx.timers.borrow().peek().map(|entry| entry.at);
        match (timer, stop_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, other) => other,
        }
    }

    /// 运行循环直到 `loop_exit` 的截止点到达。
    ///
    /// 队列一时为空不会导致退出；循环在下一个定时器到期或被任意线程
    /// 唤醒之前挂在条件变量上。若当前线程尚未绑定本循环，调度期间会
    /// 临时绑定。
    pub fn dispatch(&self) {
        let _binding = match current_context() {
            Some(ctx) if Rc::ptr_eq(&ctx, &self.ctx) => None,
            _ => Some(self.bind().ok()),
        };

        debug!("event loop dispatch started");
        let shared = Arc::clone(&self.ctx.handle.shared);

        loop {
            let locals: Vec<Box<dyn FnOnce()>> = self.ctx.locals.borrow_mut().drain(..).collect();
            for job in locals {
                job();
            }

            let batch: Vec<Message> = shared.queue.lock().drain(..).collect();
            for message in batch {
                match message {
                    Message::Run(job) => job(),
                    Message::RunAt(at, job) => self.push_timer(at, job),
                    Message::Wake(id) => self.poll_task(id),
                }
            }

            let now = Instant::now();
            self.run_due_timers(now);

            let stop_at = *shared.stop_at.lock();
            if let Some(at) = stop_at
                && Instant::now() >= at
            {
                // 停机请求只对本次 dispatch 生效。
                *shared.stop_at.lock() = None;
                break;
            }

            if !self.ctx.locals.borrow().is_empty() {
                continue;
            }

            let deadline = self.next_deadline(stop_at);
            let mut queue = shared.queue.lock();
            if queue.is_empty() {
                match deadline {
                    Some(at) => {
                        shared.cond.wait_until(&mut queue, at);
                    }
                    None => shared.cond.wait(&mut queue),
                }
            }
        }

        debug!("event loop dispatch stopped");
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}

/// 便捷入口：建循环、绑线程、跑根任务、随根任务结束停机。
///
/// # 契约说明（What）
/// - 外层 `Result` 承载入口自身的失败：线程已绑定其它循环，或循环在根
///   任务落定之前被手动停掉；
/// - 内层 `Result` 是根任务自己的业务结果。
pub fn run<F, Fut, T, E>(factory: F) -> Result<Result<T, E>, RunError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + 'static,
    T: 'static,
    E: 'static,
{
    let event_loop = EventLoop::new();
    let binding = event_loop.bind()?;

    let task = crate::task::spawn(factory());
    let handle = event_loop.handle().clone();
    task.add_callback(move || handle.loop_exit(None));

    event_loop.dispatch();
    drop(binding);

    task.try_take_result().ok_or(RunError::Stopped)
}
