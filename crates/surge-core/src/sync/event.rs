//! 手动复位事件。

use crate::error::TaskError;
use crate::promise::{Promise, Settled};
use crate::task::cancellable_at;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::Location;

/// 一次 `set` 放行当前全部等待者的会合点。
///
/// `reset` 撤销信号；信号置位期间的 `wait` 立即返回。
#[derive(Default)]
pub struct Event {
    value: Cell<bool>,
    waiters: RefCell<Vec<Promise<(), TaskError>>>,
}

impl Event {
    pub fn new() -> Self {
        Event::default()
    }

    /// 信号是否处于置位状态。
    pub fn is_set(&self) -> bool {
        self.value.get()
    }

    /// 置位并放行当前全部等待者。
    pub fn set(&self) {
        self.value.set(true);

        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waiter in waiters {
            let _ = waiter.try_resolve(());
        }
    }

    /// 撤销信号；不影响已经被放行的等待者。
    pub fn reset(&self) {
        self.value.set(false);
    }

    /// 等待信号置位；可取消。
    #[track_caller]
    pub fn wait(&self) -> impl Future<Output = Result<(), TaskError>> + '_ {
        let site = Location::caller();
        async move {
            if self.value.get() {
                return Ok(());
            }

            let promise: Promise<(), TaskError> = Promise::new();
            self.waiters.borrow_mut().push(promise.clone());

            let guard = promise.clone();
            let hook = move || {
                if guard.try_reject(TaskError::Cancelled) {
                    Ok(())
                } else {
                    Err(TaskError::WillBeDone)
                }
            };

            match cancellable_at(Settled::new(promise.future()), hook, site).await {
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
}
