//! 条件变量。

use super::Mutex;
use crate::error::TaskError;
use crate::promise::{Promise, Settled};
use crate::task;
use crate::task::cancellable_at;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::Location;

/// 与 [`Mutex`] 搭配使用的条件变量。
///
/// # 契约说明（What）
/// - `wait` 原子地释放互斥锁、挂起、并在被唤醒后重新取得互斥锁；
/// - 取消发生在等待期间时，先把互斥锁拿回来再上报取消错误；
/// - 取消与 `notify` 赛跑时 `notify` 获胜（取消钩子返回
///   [`TaskError::WillBeDone`]），等待按正常唤醒处理。
#[derive(Default)]
pub struct Condition {
    waiters: RefCell<VecDeque<Promise<(), TaskError>>>,
}

impl Condition {
    pub fn new() -> Self {
        Condition::default()
    }

    /// 唤醒最老的一个等待者。
    pub fn notify(&self) {
        let mut waiters = self.waiters.borrow_mut();
        while let Some(waiter) = waiters.pop_front() {
            if waiter.try_resolve(()) {
                return;
            }
        }
    }

    /// 唤醒全部等待者。
    pub fn broadcast(&self) {
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waiter in waiters {
            let _ = waiter.try_resolve(());
        }
    }

    /// 释放 `mutex` 并等待通知；返回前重新取得 `mutex`。
    ///
    /// 调用方必须正持有 `mutex`。
    #[track_caller]
    pub fn wait<'a>(&'a self, mutex: &'a Mutex) -> impl Future<Output = Result<(), TaskError>> + 'a {
        let site = Location::caller();
        async move {
            let promise: Promise<(), TaskError> = Promise::new();
            self.waiters.borrow_mut().push_back(promise.clone());
            mutex.unlock();

            let guard = promise.clone();
            let hook = move || {
                if guard.try_reject(TaskError::Cancelled) {
                    Ok(())
                } else {
                    Err(TaskError::WillBeDone)
                }
            };

            let waited = cancellable_at(Settled::new(promise.future()), hook, site).await;

            // 重新取锁不允许被同一次取消打断：锁定区让标记保持在帧上，
            // 等互斥锁到手后再统一上报。
            task::lock().await;
            let relock = mutex.lock_at(site).await;
            task::unlock().await;
            relock?;

            match waited {
                Ok(()) => Ok(()),
                Err(_) => {
                    self.waiters
                        .borrow_mut()
                        .retain(|waiter| !waiter.ptr_eq(&promise));
                    Err(TaskError::Cancelled)
                }
            }
        }
    }

    /// 带谓词的等待：持锁检查谓词，不满足则继续等待。
    pub async fn wait_until<P>(&self, mutex: &Mutex, mut predicate: P) -> Result<(), TaskError>
    where
        P: FnMut() -> bool,
    {
        while !predicate() {
            self.wait(mutex).await?;
        }

        Ok(())
    }
}
