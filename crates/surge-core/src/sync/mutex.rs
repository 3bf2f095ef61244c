//! 协程互斥锁。

use crate::error::TaskError;
use crate::promise::{Promise, Settled};
use crate::task::cancellable_at;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::Location;

struct State {
    locked: bool,
    waiters: VecDeque<Promise<(), TaskError>>,
}

/// 排他锁，等待队列严格 FIFO。
///
/// # 契约说明（What）
/// - `lock` 返回可取消等待；解锁时锁直接移交给最老的等待者（不经过
///   重新竞争），因此授予顺序与排队顺序一致；
/// - `unlock` 是同步操作，唤醒经由所属循环投递；
/// - 不支持重入：持有者再次 `lock` 会死锁，运行时不做检查；
/// - 取消与移交赛跑时移交获胜：取消钩子发现等待已被满足时返回
///   [`TaskError::WillBeDone`]。
#[derive(Default)]
pub struct Mutex {
    state: RefCell<State>,
}

impl Default for State {
    fn default() -> Self {
        State {
            locked: false,
            waiters: VecDeque::new(),
        }
    }
}

impl Mutex {
    pub fn new() -> Self {
        Mutex::default()
    }

    /// 当前是否有持有者。
    pub fn locked(&self) -> bool {
        self.state.borrow().locked
    }

    /// 获取锁；成功返回后由调用方负责 `unlock`。
    #[track_caller]
    pub fn lock(&self) -> impl Future<Output = Result<(), TaskError>> + '_ {
        let site = Location::caller();
        self.lock_at(site)
    }

    pub(crate) async fn lock_at(&self, site: &'static Location<'static>) -> Result<(), TaskError> {
        let promise = {
            let mut state = self.state.borrow_mut();
            if !state.locked {
                state.locked = true;
                return Ok(());
            }

            let promise: Promise<(), TaskError> = Promise::new();
            state.waiters.push_back(promise.clone());
            promise
        };

        let guard = promise.clone();
        let hook = move || {
            if guard.try_reject(TaskError::Cancelled) {
                Ok(())
            } else {
                Err(TaskError::WillBeDone)
            }
        };

        match cancellable_at(Settled::new(promise.future()), hook, site).await {
            // 直接移交：unlock 已经替我们保持了 locked 状态。
            Ok(()) => Ok(()),
            Err(_) => {
                self.state
                    .borrow_mut()
                    .waiters
                    .retain(|waiter| !waiter.ptr_eq(&promise));
                Err(TaskError::Cancelled)
            }
        }
    }

    /// 释放锁并唤醒最老的等待者。
    ///
    /// # Panics
    ///
    /// 在未上锁的互斥量上调用属于契约违规，直接 panic。
    pub fn unlock(&self) {
        let mut state = self.state.borrow_mut();
        assert!(state.locked, "unlock on an unlocked mutex");

        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.try_resolve(()) {
                // 锁移交给该等待者，locked 保持为真。
                return;
            }
        }

        state.locked = false;
    }

    /// RAII 风格的获取：守卫随 drop 解锁。
    #[track_caller]
    pub fn guard(&self) -> impl Future<Output = Result<MutexGuard<'_>, TaskError>> {
        let site = Location::caller();
        async move {
            self.lock_at(site).await?;
            Ok(MutexGuard { mutex: self })
        }
    }
}

/// [`Mutex::guard`] 的持有凭据。
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
