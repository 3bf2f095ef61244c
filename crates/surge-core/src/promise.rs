//! 单次交会的 Promise/Future 原语。
//!
//! # 设计背景（Why）
//! - 生产方可能在任意线程完成（工作线程、定时器、通道唤醒），而消费方的
//!   回调必须回到其所属事件循环执行，避免用户回调跑在错误的线程上；
//! - 生产与消费的安装顺序不可预知，需要一个无锁裁决：谁后到，谁负责触发。
//!
//! # 逻辑解析（How）
//! - 内部是四状态原子机：`PENDING → (ONLY_RESULT | ONLY_CALLBACK) → DONE`；
//! - 生产方先落结果再做 CAS：从 `PENDING` 赢得 `ONLY_RESULT` 即可返回，
//!   从 `ONLY_CALLBACK` 推进到 `DONE` 则说明消费方先到，此时通过所属
//!   事件循环 `post` 一次回调触发；
//! - 消费方先登记回调再做 CAS：发现 `ONLY_RESULT`/`DONE` 时结果已经就绪，
//!   回调在消费方线程上同步执行。
//!
//! # 契约说明（What）
//! - `resolve` / `reject` 合计至多调用一次，违反者直接 panic（契约违规视为
//!   致命错误）；取消钩子等竞争场景请使用 `try_resolve` / `try_reject`；
//! - Future 可以克隆并被多次等待，每个等待者看到同一份最终结果；
//! - `wait` 为 OS 线程提供阻塞式等待，带可选超时。

use crate::error::TaskError;
use crate::runtime::Handle;
use crate::task;
use parking_lot::{Condvar, Mutex};
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

const PENDING: u8 = 0;
const ONLY_RESULT: u8 = 1;
const ONLY_CALLBACK: u8 = 2;
const DONE: u8 = 3;

enum Slot<T, E> {
    Empty,
    Stored(Result<T, E>),
    Taken,
}

type Callback = Box<dyn FnOnce() + Send>;

struct Core<T, E> {
    state: AtomicU8,
    result: Mutex<Slot<T, E>>,
    callbacks: Mutex<Vec<Callback>>,
    settled: Mutex<bool>,
    cond: Condvar,
    handle: Handle,
}

impl<T, E> Core<T, E> {
    fn run_callbacks(&self) {
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }

    fn mark_settled(&self) {
        *self.settled.lock() = true;
        self.cond.notify_all();
    }
}

impl<T: 'static, E: 'static> Core<T, E> {
    /// 落结果并裁决触发责任；结果槽已被占用时返回 `false`。
    fn settle(self: &Arc<Self>, result: Result<T, E>) -> bool {
        {
            let mut slot = self.result.lock();
            if !matches!(*slot, Slot::Empty) {
                return false;
            }
            *slot = Slot::Stored(result);
        }

        loop {
            let state = self.state.load(Ordering::Acquire);
            match state {
                PENDING => {
                    if self
                        .state
                        .compare_exchange(PENDING, ONLY_RESULT, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.mark_settled();
                        return true;
                    }
                }
                ONLY_CALLBACK => {
                    if self
                        .state
                        .compare_exchange(
                            ONLY_CALLBACK,
                            DONE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.mark_settled();
                        // 消费方先到：把已登记的回调整体挪到其所属事件循环
                        // 上执行。只搬运回调本身，结果值留在原地。
                        let callbacks = std::mem::take(&mut *self.callbacks.lock());
                        if !callbacks.is_empty() {
                            self.handle.post(move || {
                                for callback in callbacks {
                                    callback();
                                }
                            });
                        }
                        return true;
                    }
                }
                _ => unreachable!("promise result slot was empty in state {state}"),
            }
        }
    }

    fn add_callback(self: &Arc<Self>, callback: Callback) {
        self.callbacks.lock().push(callback);

        loop {
            let state = self.state.load(Ordering::Acquire);
            match state {
                PENDING => {
                    if self
                        .state
                        .compare_exchange(
                            PENDING,
                            ONLY_CALLBACK,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                ONLY_CALLBACK => return,
                ONLY_RESULT => {
                    if self
                        .state
                        .compare_exchange(ONLY_RESULT, DONE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // 结果先到：回调在消费方线程上同步执行。
                        self.run_callbacks();
                        return;
                    }
                }
                DONE => {
                    self.run_callbacks();
                    return;
                }
                _ => unreachable!("promise core in impossible state {state}"),
            }
        }
    }
}

/// 单次交会的生产端。
///
/// 取消钩子等竞争路径应使用 [`try_resolve`](Promise::try_resolve) /
/// [`try_reject`](Promise::try_reject)：它们以结果槽为裁决点，保证
/// 「完成」与「取消」的竞赛恰好留下一个结果。
pub struct Promise<T, E> {
    core: Arc<Core<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Promise {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: 'static, E: 'static> Promise<T, E> {
    /// 绑定当前线程事件循环的构造方式。
    ///
    /// # Panics
    ///
    /// 当前线程未绑定事件循环时 panic。
    pub fn new() -> Self {
        let handle = crate::runtime::get_event_loop()
            .expect("Promise::new requires a bound event loop")
            .handle()
            .clone();
        Promise::bound(handle)
    }

    /// 显式指定结果交付所用的事件循环。
    pub fn bound(handle: Handle) -> Self {
        Promise {
            core: Arc::new(Core {
                state: AtomicU8::new(PENDING),
                result: Mutex::new(Slot::Empty),
                callbacks: Mutex::new(Vec::new()),
                settled: Mutex::new(false),
                cond: Condvar::new(),
                handle,
            }),
        }
    }

    /// 获取消费端句柄；可多次调用，也可克隆。
    #[track_caller]
    pub fn future(&self) -> Future<T, E> {
        Future {
            core: Arc::clone(&self.core),
            waker: None,
            visited: false,
            site: Location::caller(),
        }
    }

    /// 以成功值完成交会。
    ///
    /// # Panics
    ///
    /// 交会已经完成时 panic（双重完成属于契约违规）。
    pub fn resolve(&self, value: T) {
        assert!(
            self.core.settle(Ok(value)),
            "promise resolved more than once"
        );
    }

    /// 以错误完成交会。
    ///
    /// # Panics
    ///
    /// 交会已经完成时 panic。
    pub fn reject(&self, error: E) {
        assert!(
            self.core.settle(Err(error)),
            "promise rejected more than once"
        );
    }

    /// 竞争安全的完成：落败（已有结果）时返回 `false`。
    pub fn try_resolve(&self, value: T) -> bool {
        self.core.settle(Ok(value))
    }

    /// 竞争安全的拒绝：落败（已有结果）时返回 `false`。
    pub fn try_reject(&self, error: E) -> bool {
        self.core.settle(Err(error))
    }

    /// 结果是否已经就绪。
    pub fn is_settled(&self) -> bool {
        let state = self.core.state.load(Ordering::Acquire);
        state == ONLY_RESULT || state == DONE
    }

    /// 两个句柄是否指向同一交会核心。
    pub fn ptr_eq(&self, other: &Promise<T, E>) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

/// 阻塞式等待的失败原因：超时。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitTimeout;

/// 单次交会的消费端。
///
/// 克隆出的每个句柄都拥有独立的唤醒登记；`await` 产出共享结果的克隆，
/// 任务联结等独占消费路径通过 [`take_result`](Future::take_result) 按值
/// 取走结果。
pub struct Future<T, E> {
    core: Arc<Core<T, E>>,
    waker: Option<Arc<Mutex<Option<Waker>>>>,
    visited: bool,
    site: &'static Location<'static>,
}

impl<T, E> Clone for Future<T, E> {
    fn clone(&self) -> Self {
        Future {
            core: Arc::clone(&self.core),
            waker: None,
            visited: false,
            site: self.site,
        }
    }
}

impl<T: 'static, E: 'static> Future<T, E> {
    /// 结果是否已经就绪。
    pub fn is_ready(&self) -> bool {
        let state = self.core.state.load(Ordering::Acquire);
        state == ONLY_RESULT || state == DONE
    }

    /// 完成后执行一次性回调；若已完成则在当前线程同步执行。
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.core.add_callback(Box::new(callback));
    }

    /// 按值取走结果；尚未就绪或已被取走时返回 `None`。
    pub fn take_result(&self) -> Option<Result<T, E>> {
        let mut slot = self.core.result.lock();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Stored(result) => Some(result),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// 登记唤醒并报告就绪状态；供任务联结等手写 poll 复用。
    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> bool {
        if self.is_ready() {
            return true;
        }

        match &self.waker {
            Some(slot) => {
                *slot.lock() = Some(cx.waker().clone());
            }
            None => {
                let slot = Arc::new(Mutex::new(Some(cx.waker().clone())));
                self.waker = Some(Arc::clone(&slot));
                self.core.add_callback(Box::new(move || {
                    if let Some(waker) = slot.lock().take() {
                        waker.wake();
                    }
                }));
            }
        }

        // 登记与完成可能交错；再检查一次避免漏掉唤醒。
        self.is_ready()
    }

    /// 阻塞当前 OS 线程直到交会完成或超时。
    ///
    /// 仅供事件循环之外的线程使用；在循环线程上调用会造成死锁。
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Result<T, E>, WaitTimeout>
    where
        T: Clone,
        E: Clone,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut settled = self.core.settled.lock();

        while !*settled {
            match deadline {
                Some(at) => {
                    if self.core.cond.wait_until(&mut settled, at).timed_out() && !*settled {
                        return Err(WaitTimeout);
                    }
                }
                None => self.core.cond.wait(&mut settled),
            }
        }
        drop(settled);

        Ok(self
            .clone_result()
            .expect("settled promise must carry a result"))
    }

    fn clone_result(&self) -> Option<Result<T, E>>
    where
        T: Clone,
        E: Clone,
    {
        match &*self.core.result.lock() {
            Slot::Stored(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// 可取消地等待共享结果。
    ///
    /// 取消只拒绝本次等待：交会本身与其它等待者不受影响，结果未就绪时
    /// 取消方拿到 `Cancelled`。
    #[track_caller]
    pub fn get(&self) -> impl std::future::Future<Output = Result<T, E>> + use<T, E>
    where
        T: Clone,
        E: Clone + From<TaskError>,
    {
        let site = Location::caller();
        let future = self.clone();

        async move {
            if future.is_ready() {
                return future
                    .clone_result()
                    .expect("ready promise must carry a result");
            }

            let handle = crate::runtime::get_event_loop()
                .expect("Future::get requires a bound event loop")
                .handle()
                .clone();

            // 本地桥接：共享交会完成时放行，取消只打掉桥接自身。
            let bridge: Promise<(), TaskError> = Promise::bound(handle);
            {
                let bridge = bridge.clone();
                future.add_callback(move || {
                    let _ = bridge.try_resolve(());
                });
            }

            let guard = bridge.clone();
            let hook = move || {
                if guard.try_reject(TaskError::Cancelled) {
                    Ok(())
                } else {
                    Err(TaskError::WillBeDone)
                }
            };

            match task::cancellable_at(Settled::new(bridge.future()), hook, site).await {
                Ok(()) => future
                    .clone_result()
                    .expect("ready promise must carry a result"),
                Err(error) => Err(E::from(error)),
            }
        }
    }
}

impl<T, E> std::future::Future for Future<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.visited {
            this.visited = true;
            task::record_site(this.site);
        }

        if this.poll_ready(cx) {
            task::step_current();
            Poll::Ready(
                this.clone_result()
                    .expect("ready promise must carry a result"),
            )
        } else {
            Poll::Pending
        }
    }
}

/// 独占消费等待：就绪后按值取走结果。
pub(crate) struct Settled<T, E> {
    future: Future<T, E>,
}

impl<T, E> Settled<T, E> {
    pub(crate) fn new(future: Future<T, E>) -> Self {
        Settled { future }
    }
}

impl<T: 'static, E: 'static> std::future::Future for Settled<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.future.poll_ready(cx) {
            Poll::Ready(
                this.future
                    .take_result()
                    .expect("settled result taken twice"),
            )
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EventLoop;

    fn detached_promise() -> Promise<u32, TaskError> {
        let event_loop = EventLoop::new();
        Promise::bound(event_loop.handle().clone())
    }

    #[test]
    fn resolve_before_any_consumer_is_only_result() {
        let promise = detached_promise();
        let future = promise.future();

        assert!(!future.is_ready());
        promise.resolve(5);
        assert!(future.is_ready(), "结果先到后消费端立即可见");
        assert_eq!(future.take_result(), Some(Ok(5)));
        assert_eq!(future.take_result(), None, "结果只能按值取走一次");
    }

    #[test]
    fn late_callbacks_run_synchronously() {
        let promise = detached_promise();
        let future = promise.future();
        promise.resolve(1);

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let fired = std::sync::Arc::clone(&fired);
            future.add_callback(move || fired.store(true, std::sync::atomic::Ordering::SeqCst));
        }
        assert!(
            fired.load(std::sync::atomic::Ordering::SeqCst),
            "完成之后登记的回调必须同步执行"
        );
    }

    #[test]
    fn settle_races_leave_exactly_one_result() {
        let promise = detached_promise();

        assert!(promise.try_resolve(7), "首个完成应获胜");
        assert!(!promise.try_reject(TaskError::Cancelled), "迟到的拒绝必须落败");
        assert!(promise.is_settled());
        assert_eq!(promise.future().take_result(), Some(Ok(7)));
    }

    #[test]
    fn blocking_wait_times_out_when_pending() {
        let promise = detached_promise();
        let future = promise.future();

        assert_eq!(
            future.wait(Some(Duration::from_millis(10))),
            Err(WaitTimeout),
            "未完成的交会在截止后报超时"
        );

        promise.resolve(3);
        assert_eq!(future.wait(None), Ok(Ok(3)));
    }
}
