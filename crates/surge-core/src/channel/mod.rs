//! 有界 MPMC 通道。
//!
//! # 设计背景（Why）
//! - 通道是跨线程协调的唯一原语：端点可以自由克隆并移动到其它 OS 线程，
//!   而等待者的唤醒永远回到注册时所属的事件循环上执行；
//! - 快速路径走无锁环形缓冲（见 [`ring`]），互斥量只保护等待队列与关闭
//!   握手，满/空的慢路径才会触碰它。
//!
//! # 契约说明（What）
//! - 三类操作：`try_*` 非阻塞、`*_sync` 阻塞 OS 线程（可带超时）、协程式
//!   `send`/`receive` 可取消；
//! - 关闭时机：显式 `close`，或任一侧最后一个端点被 drop；关闭后缓冲内
//!   残余元素仍可接收，之后的接收与全部发送返回 `Disconnected`；关闭会
//!   唤醒两侧所有等待者；
//! - `*_ex` 变体在失败时把元素原样归还调用方；
//! - 每一侧的等待队列严格 FIFO。
//!
//! 在循环线程上调用 `*_sync` 会阻塞调度器本身，属于使用错误。

mod ring;

use crate::error::{
    ReceiveError, ReceiveSyncError, SendError, SendSyncError, TaskError, TryReceiveError,
    TrySendError,
};
use crate::promise::{Promise, Settled};
use crate::runtime::{Handle, get_event_loop};
use crate::task::cancellable_at;
use parking_lot::Mutex;
use ring::RingBuffer;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

struct Waiters {
    senders: VecDeque<Promise<(), TaskError>>,
    receivers: VecDeque<Promise<(), TaskError>>,
}

struct ChannelCore<T> {
    ring: RingBuffer<T>,
    closed: AtomicBool,
    handle: Handle,
    waiters: Mutex<Waiters>,
    senders: AtomicUsize,
    receivers: AtomicUsize,
}

impl<T> ChannelCore<T> {
    fn notify_senders(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(waiter) = waiters.senders.pop_front() {
            let _ = waiter.try_resolve(());
        }
    }

    fn notify_receivers(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(waiter) = waiters.receivers.pop_front() {
            let _ = waiter.try_resolve(());
        }
    }

    fn close(&self) {
        {
            let _guard = self.waiters.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }

        trace!("channel closed");
        self.notify_senders();
        self.notify_receivers();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn remove_sender_waiter(&self, promise: &Promise<(), TaskError>) {
        self.waiters
            .lock()
            .senders
            .retain(|waiter| !waiter.ptr_eq(promise));
    }

    fn remove_receiver_waiter(&self, promise: &Promise<(), TaskError>) {
        self.waiters
            .lock()
            .receivers
            .retain(|waiter| !waiter.ptr_eq(promise));
    }
}

fn cancel_hook(promise: &Promise<(), TaskError>) -> impl FnOnce() -> Result<(), TaskError> + 'static {
    let guard = promise.clone();
    move || {
        if guard.try_reject(TaskError::Cancelled) {
            Ok(())
        } else {
            Err(TaskError::WillBeDone)
        }
    }
}

/// 通道的发送端；克隆共享同一核心。
pub struct Sender<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.core.senders.fetch_add(1, Ordering::AcqRel);
        Sender {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.core.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.core.close();
        }
    }
}

impl<T: 'static> Sender<T> {
    /// 非阻塞发送。
    pub fn try_send(&self, value: T) -> Result<(), TrySendError> {
        self.try_send_ex(value).map_err(|(_, error)| error)
    }

    /// 非阻塞发送；失败时把元素归还调用方。
    pub fn try_send_ex(&self, value: T) -> Result<(), (T, TrySendError)> {
        if self.core.is_closed() {
            return Err((value, TrySendError::Disconnected));
        }

        match self.core.ring.reserve() {
            Some(pos) => {
                self.core.ring.write(pos, value);
                self.core.ring.commit(pos);
                self.core.notify_receivers();
                Ok(())
            }
            None => Err((value, TrySendError::Full)),
        }
    }

    /// 阻塞当前 OS 线程直到送入成功、通道关闭或超时。
    pub fn send_sync(&self, value: T, timeout: Option<Duration>) -> Result<(), SendSyncError> {
        self.send_sync_ex(value, timeout).map_err(|(_, error)| error)
    }

    /// [`send_sync`](Sender::send_sync) 的归还元素变体。
    pub fn send_sync_ex(
        &self,
        value: T,
        timeout: Option<Duration>,
    ) -> Result<(), (T, SendSyncError)> {
        if self.core.is_closed() {
            return Err((value, SendSyncError::Disconnected));
        }

        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(pos) = self.core.ring.reserve() {
                self.core.ring.write(pos, value);
                self.core.ring.commit(pos);
                self.core.notify_receivers();
                return Ok(());
            }

            let promise = {
                let mut waiters = self.core.waiters.lock();

                if self.core.is_closed() {
                    return Err((value, SendSyncError::Disconnected));
                }

                if !self.core.ring.is_full() {
                    continue;
                }

                let promise: Promise<(), TaskError> = Promise::bound(self.core.handle.clone());
                waiters.senders.push_back(promise.clone());
                promise
            };

            let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));
            if promise.future().wait(remaining).is_err() {
                self.core.remove_sender_waiter(&promise);
                return Err((value, SendSyncError::Timeout));
            }
        }
    }

    /// 协程式发送：缓冲满时挂起，可被取消。
    #[track_caller]
    pub fn send(&self, value: T) -> impl Future<Output = Result<(), SendError>> + use<T> {
        let site = Location::caller();
        let core = Arc::clone(&self.core);
        async move {
            match Self::send_on(core, value, site).await {
                Ok(()) => Ok(()),
                Err((_, error)) => Err(error),
            }
        }
    }

    /// [`send`](Sender::send) 的归还元素变体。
    #[track_caller]
    pub fn send_ex(&self, value: T) -> impl Future<Output = Result<(), (T, SendError)>> + use<T> {
        let site = Location::caller();
        let core = Arc::clone(&self.core);
        Self::send_on(core, value, site)
    }

    async fn send_on(
        core: Arc<ChannelCore<T>>,
        value: T,
        site: &'static Location<'static>,
    ) -> Result<(), (T, SendError)> {
        if core.is_closed() {
            return Err((value, SendError::Disconnected));
        }

        loop {
            if let Some(pos) = core.ring.reserve() {
                core.ring.write(pos, value);
                core.ring.commit(pos);
                core.notify_receivers();
                return Ok(());
            }

            let promise = {
                let mut waiters = core.waiters.lock();

                if core.is_closed() {
                    return Err((value, SendError::Disconnected));
                }

                if !core.ring.is_full() {
                    continue;
                }

                let promise: Promise<(), TaskError> = Promise::bound(core.handle.clone());
                waiters.senders.push_back(promise.clone());
                promise
            };

            let waited =
                cancellable_at(Settled::new(promise.future()), cancel_hook(&promise), site).await;
            if waited.is_err() {
                core.remove_sender_waiter(&promise);
                return Err((value, SendError::Cancelled));
            }
        }
    }

    /// 显式关闭通道（两侧立即可见）。
    pub fn close(&self) {
        self.core.close();
    }

    /// 当前缓冲的元素数量（瞬时值）。
    pub fn len(&self) -> usize {
        self.core.ring.len()
    }

    /// 通道容量。
    pub fn capacity(&self) -> usize {
        self.core.ring.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.core.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.core.ring.is_full()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

/// 通道的接收端；克隆共享同一核心。
pub struct Receiver<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.core.receivers.fetch_add(1, Ordering::AcqRel);
        Receiver {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.core.receivers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.core.close();
        }
    }
}

impl<T: 'static> Receiver<T> {
    /// 非阻塞接收。关闭后先把缓冲清空，再报告断开。
    pub fn try_receive(&self) -> Result<T, TryReceiveError> {
        match self.core.ring.acquire() {
            Some(pos) => {
                let value = self.core.ring.read(pos);
                self.core.ring.release(pos);
                self.core.notify_senders();
                Ok(value)
            }
            None => Err(if self.core.is_closed() {
                TryReceiveError::Disconnected
            } else {
                TryReceiveError::Empty
            }),
        }
    }

    /// 阻塞当前 OS 线程直到取到元素、通道耗尽关闭或超时。
    pub fn receive_sync(&self, timeout: Option<Duration>) -> Result<T, ReceiveSyncError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(pos) = self.core.ring.acquire() {
                let value = self.core.ring.read(pos);
                self.core.ring.release(pos);
                self.core.notify_senders();
                return Ok(value);
            }

            let promise = {
                let mut waiters = self.core.waiters.lock();

                if !self.core.ring.is_empty() {
                    continue;
                }

                if self.core.is_closed() {
                    return Err(ReceiveSyncError::Disconnected);
                }

                let promise: Promise<(), TaskError> = Promise::bound(self.core.handle.clone());
                waiters.receivers.push_back(promise.clone());
                promise
            };

            let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));
            if promise.future().wait(remaining).is_err() {
                self.core.remove_receiver_waiter(&promise);
                return Err(ReceiveSyncError::Timeout);
            }
        }
    }

    /// 协程式接收：缓冲空时挂起，可被取消。
    #[track_caller]
    pub fn receive(&self) -> impl Future<Output = Result<T, ReceiveError>> + use<T> {
        let site = Location::caller();
        let core = Arc::clone(&self.core);
        async move {
            loop {
                if let Some(pos) = core.ring.acquire() {
                    let value = core.ring.read(pos);
                    core.ring.release(pos);
                    core.notify_senders();
                    return Ok(value);
                }

                let promise = {
                    let mut waiters = core.waiters.lock();

                    if !core.ring.is_empty() {
                        continue;
                    }

                    if core.is_closed() {
                        return Err(ReceiveError::Disconnected);
                    }

                    let promise: Promise<(), TaskError> = Promise::bound(core.handle.clone());
                    waiters.receivers.push_back(promise.clone());
                    promise
                };

                let waited =
                    cancellable_at(Settled::new(promise.future()), cancel_hook(&promise), site)
                        .await;
                if waited.is_err() {
                    core.remove_receiver_waiter(&promise);
                    return Err(ReceiveError::Cancelled);
                }
            }
        }
    }

    /// 当前缓冲的元素数量（瞬时值）。
    pub fn len(&self) -> usize {
        self.core.ring.len()
    }

    /// 通道容量。
    pub fn capacity(&self) -> usize {
        self.core.ring.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.core.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.core.ring.is_full()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

/// 一对端点。
pub type Channel<T> = (Sender<T>, Receiver<T>);

/// 在指定循环上建一条容量为 `capacity` 的通道。
pub fn channel_with<T>(handle: Handle, capacity: usize) -> Channel<T> {
    let core = Arc::new(ChannelCore {
        ring: RingBuffer::new(capacity),
        closed: AtomicBool::new(false),
        handle,
        waiters: Mutex::new(Waiters {
            senders: VecDeque::new(),
            receivers: VecDeque::new(),
        }),
        senders: AtomicUsize::new(1),
        receivers: AtomicUsize::new(1),
    });

    (
        Sender {
            core: Arc::clone(&core),
        },
        Receiver { core },
    )
}

/// 在当前线程绑定的循环上建通道。
///
/// # Panics
///
/// 当前线程未绑定事件循环时 panic。
pub fn channel<T>(capacity: usize) -> Channel<T> {
    let handle = get_event_loop()
        .expect("channel requires a bound event loop")
        .handle()
        .clone();
    channel_with(handle, capacity)
}
