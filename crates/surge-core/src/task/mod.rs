//! 任务与取消机制。
//!
//! # 设计背景（Why）
//! - 用户代码用普通的 `async` 块表达逻辑，[`spawn`] 把它装进一个带
//!   [`Frame`] 的任务：帧记录父子关系、当前挂起位置与取消钩子，是取消
//!   传播与调用树追踪的载体；
//! - 等待一个 [`Task`] 会把它的帧挂到等待方的帧之下，于是对外层任务的
//!   一次 `cancel` 能沿帧树触达所有在途的挂起点。
//!
//! # 契约说明（What）
//! - `cancel` 是同步且幂等的：标记整棵子树并触发各层当前的取消钩子；
//! - 处于 `lock` 区内的帧吸收取消并推迟到 `unlock` 之后的下一个挂起点；
//! - 没有钩子的挂起点返回「不支持取消」，但标记保留，下一个可取消挂起
//!   点会让取消生效；
//! - 任务完成后再取消，返回「即将完成」，结果不受影响。

pub(crate) mod frame;

mod combinators;
mod group;

pub use combinators::{Either, Either3, all, all2, all3, all_settled, all_settled2, any, any2, any3, race, race2, race3};
pub use frame::{CallNode, SourceSite};
pub use group::TaskGroup;

use crate::error::TaskError;
use crate::promise::{Future as ResultFuture, Promise};
use crate::runtime::current_context;
use frame::{CancelHook, Frame};
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

pub(crate) fn with_current_frame<R>(f: impl FnOnce(Option<&Rc<Frame>>) -> R) -> R {
    match current_context() {
        Some(ctx) => {
            let frame = ctx.current_frame();
            f(frame.as_ref())
        }
        None => f(None),
    }
}

pub(crate) fn record_site(site: &'static Location<'static>) {
    with_current_frame(|frame| {
        if let Some(frame) = frame {
            frame.set_site(site);
        }
    });
}

pub(crate) fn step_current() {
    with_current_frame(|frame| {
        if let Some(frame) = frame {
            frame.step();
        }
    });
}

/// 把 `future` 装进新任务并交给当前线程绑定的事件循环调度。
///
/// 任务立即排队等待首次推进；返回的 [`Task`] 是其唯一句柄。
///
/// # Panics
///
/// 当前线程未绑定事件循环时 panic。
#[track_caller]
pub fn spawn<Fut, T, E>(future: Fut) -> Task<T, E>
where
    Fut: Future<Output = Result<T, E>> + 'static,
    T: 'static,
    E: 'static,
{
    let site = Location::caller();
    let ctx = current_context().expect("spawn requires a bound event loop");

    let frame = Frame::new(site);
    let promise: Promise<T, E> = Promise::bound(ctx.handle().clone());
    let result = promise.future();

    let driver_frame = Rc::clone(&frame);
    let driver = async move {
        let output = future.await;
        driver_frame.end();
        match output {
            Ok(value) => promise.resolve(value),
            Err(error) => promise.reject(error),
        }
    };

    let id = ctx.insert_task(Box::pin(driver), Rc::clone(&frame));
    ctx.handle().wake_task(id);

    Task {
        frame,
        result,
        site,
        linked: false,
    }
}

/// 正在运行的任务的用户可见句柄。
///
/// # 契约说明（What）
/// - 句柄是移动语义的：`await` 消费句柄并按值取走结果；
/// - `cancel`/`done`/`cancelled`/`locked`/`trace` 随时可查，不影响执行；
/// - 在另一个任务中等待本任务会建立父子帧关系，外层取消沿帧树传播。
pub struct Task<T, E> {
    frame: Rc<Frame>,
    result: ResultFuture<T, E>,
    site: &'static Location<'static>,
    linked: bool,
}

impl<T: 'static, E: 'static> Task<T, E> {
    /// 取消整棵任务子树，语义见模块文档。
    pub fn cancel(&self) -> Result<(), TaskError> {
        self.frame.cancel_all()
    }

    /// 协程体是否已经返回。
    pub fn done(&self) -> bool {
        self.frame.is_finished()
    }

    /// 取消标记是否已置位。
    pub fn cancelled(&self) -> bool {
        self.frame.is_cancelled()
    }

    /// 是否处于推迟取消的锁定区内。
    pub fn locked(&self) -> bool {
        self.frame.is_locked()
    }

    /// 以本任务为根的挂起点调用树。
    pub fn call_tree(&self) -> CallNode {
        self.frame.call_tree()
    }

    /// 调用树的可读文本。
    pub fn trace(&self) -> String {
        self.frame.trace()
    }

    /// 任务结果的共享消费端；可克隆、可多次等待。
    pub fn future(&self) -> ResultFuture<T, E> {
        self.result.clone()
    }

    /// 注册完成回调；任务已完成时回调排到循环的下一轮迭代。
    pub fn add_callback(&self, callback: impl FnOnce() + 'static) {
        if self.done() {
            if let Some(ctx) = current_context() {
                ctx.post_local(Box::new(callback));
            }
            return;
        }

        self.frame.add_callback(Box::new(callback));
    }

    /// 不等待地取走已就绪的结果。
    pub fn try_take_result(&self) -> Option<Result<T, E>> {
        self.result.take_result()
    }

    pub(crate) fn frame_handle(&self) -> Rc<Frame> {
        Rc::clone(&self.frame)
    }

    /// 成功值的链式变换；错误原样透传。
    #[track_caller]
    pub fn map<U, F>(self, f: F) -> Task<U, E>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        spawn(async move { self.await.map(f) })
    }

    /// 错误的链式变换；成功值原样透传。
    #[track_caller]
    pub fn map_err<U, F>(self, f: F) -> Task<T, U>
    where
        U: 'static,
        F: FnOnce(E) -> U + 'static,
    {
        spawn(async move { self.await.map_err(f) })
    }

    /// 成功后继续执行 `f` 产出的后继异步步骤。
    #[track_caller]
    pub fn and_then<U, F, Fut>(self, f: F) -> Task<U, E>
    where
        U: 'static,
        F: FnOnce(T) -> Fut + 'static,
        Fut: Future<Output = Result<U, E>> + 'static,
    {
        spawn(async move {
            match self.await {
                Ok(value) => f(value).await,
                Err(error) => Err(error),
            }
        })
    }

    /// 失败后以 `f` 产出的异步步骤兜底。
    #[track_caller]
    pub fn or_else<U, F, Fut>(self, f: F) -> Task<T, U>
    where
        U: 'static,
        F: FnOnce(E) -> Fut + 'static,
        Fut: Future<Output = Result<T, U>> + 'static,
    {
        spawn(async move {
            match self.await {
                Ok(value) => Ok(value),
                Err(error) => f(error).await,
            }
        })
    }
}

impl<T: 'static, E: 'static> Future for Task<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.linked {
            this.linked = true;
            with_current_frame(|parent| {
                if let Some(parent) = parent {
                    parent.adopt(&this.frame, this.site);
                    if parent.is_cancelled() && !parent.is_locked() {
                        let _ = this.frame.cancel_all();
                    }
                }
            });
        }

        if this.result.poll_ready(cx) {
            step_current();
            Poll::Ready(
                this.result
                    .take_result()
                    .expect("task result taken twice"),
            )
        } else {
            Poll::Pending
        }
    }
}

/// 可取消等待：`future` 与一次性取消钩子的捆绑。
///
/// 首次推进时把钩子安装到宿主帧的当前挂起点上；宿主帧已处于取消态
/// （且未锁定）时立即触发钩子。完成时清理挂起点状态。
pub struct Cancellable<F> {
    future: F,
    hook: Option<CancelHook>,
    site: &'static Location<'static>,
    armed: bool,
}

/// 把 `future` 与取消钩子捆绑为一个可取消等待。
#[track_caller]
pub fn cancellable<F, C>(future: F, hook: C) -> Cancellable<F>
where
    F: Future + Unpin,
    C: FnOnce() -> Result<(), TaskError> + 'static,
{
    cancellable_at(future, hook, Location::caller())
}

pub(crate) fn cancellable_at<F, C>(
    future: F,
    hook: C,
    site: &'static Location<'static>,
) -> Cancellable<F>
where
    F: Future + Unpin,
    C: FnOnce() -> Result<(), TaskError> + 'static,
{
    Cancellable {
        future,
        hook: Some(Box::new(hook)),
        site,
        armed: false,
    }
}

impl<F: Future + Unpin> Future for Cancellable<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.armed {
            this.armed = true;
            let hook = this.hook.take();
            with_current_frame(|frame| {
                if let Some(frame) = frame {
                    frame.set_site(this.site);
                    if let Some(hook) = hook {
                        if frame.is_cancelled() && !frame.is_locked() {
                            let _ = hook();
                        } else {
                            frame.install_cancel(hook);
                        }
                    }
                }
            });
        }

        match Pin::new(&mut this.future).poll(cx) {
            Poll::Ready(output) => {
                step_current();
                Poll::Ready(output)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// 把一个裸 Future 句柄包装成任务。
#[track_caller]
pub fn from_future<T, E>(future: ResultFuture<T, E>) -> Task<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    spawn(async move { future.await })
}

/// 把可取消等待包装成任务。
#[track_caller]
pub fn from_cancellable<F, T, E>(cancellable: Cancellable<F>) -> Task<T, E>
where
    F: Future<Output = Result<T, E>> + Unpin + 'static,
    T: 'static,
    E: 'static,
{
    spawn(async move { cancellable.await })
}

struct CancelledSentinel;

impl Future for CancelledSentinel {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<bool> {
        Poll::Ready(with_current_frame(|frame| {
            frame.is_some_and(|frame| frame.is_cancelled())
        }))
    }
}

/// 读取当前任务的取消标记。
pub fn cancelled() -> impl Future<Output = bool> {
    CancelledSentinel
}

struct LockSentinel;

impl Future for LockSentinel {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        with_current_frame(|frame| {
            if let Some(frame) = frame {
                frame.set_locked(true);
            }
        });
        Poll::Ready(())
    }
}

/// 进入锁定区：取消传播推迟到解锁之后。
pub fn lock() -> impl Future<Output = ()> {
    LockSentinel
}

struct UnlockSentinel;

impl Future for UnlockSentinel {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        with_current_frame(|frame| {
            if let Some(frame) = frame {
                debug_assert!(frame.is_locked(), "unlock outside of a locked section");
                frame.set_locked(false);
            }
        });
        Poll::Ready(())
    }
}

/// 离开锁定区；被吸收的取消会在下一个挂起点生效。
pub fn unlock() -> impl Future<Output = ()> {
    UnlockSentinel
}

struct BacktraceSentinel {
    site: &'static Location<'static>,
}

impl Future for BacktraceSentinel {
    type Output = Vec<SourceSite>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Vec<SourceSite>> {
        let mut sites = vec![SourceSite::from(self.site)];
        with_current_frame(|frame| {
            if let Some(frame) = frame {
                sites.extend(frame.ancestor_sites());
            }
        });
        Poll::Ready(sites)
    }
}

/// 当前任务到根任务的挂起点路径。
#[track_caller]
pub fn backtrace() -> impl Future<Output = Vec<SourceSite>> {
    BacktraceSentinel {
        site: Location::caller(),
    }
}
