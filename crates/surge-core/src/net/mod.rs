//! 网络侧抽象：接受循环与 TLS。
//!
//! 原生套接字的绑定与监听由平台适配层提供（见外部协作者约定）；本模块
//! 只要求对方满足读/写/关闭契约，并在其上组合接受循环与 TLS 引擎。

pub mod tls;

use crate::error::IoError;
use crate::sync::Event;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

struct AcceptQueue<S> {
    pending: RefCell<VecDeque<Result<S, IoError>>>,
    event: Event,
    closed: Cell<bool>,
}

/// 监听器的完成投递端，由底层接受回调持有。
///
/// 协程尚未等待时完成结果被缓存；监听器被取消或关闭后投递被丢弃。
pub struct Acceptor<S> {
    queue: Rc<AcceptQueue<S>>,
}

impl<S> Clone for Acceptor<S> {
    fn clone(&self) -> Self {
        Acceptor {
            queue: Rc::clone(&self.queue),
        }
    }
}

impl<S> Acceptor<S> {
    /// 投递一次接受完成（成功的客户端流或错误）。
    pub fn complete(&self, result: Result<S, IoError>) {
        if self.queue.closed.get() {
            return;
        }

        self.queue.pending.borrow_mut().push_back(result);
        self.queue.event.set();
    }

    /// 停用接受回调；挂起中的 `accept` 以坏文件描述符失败。
    pub fn close(&self) {
        self.queue.closed.set(true);
        self.queue.event.set();
    }
}

/// 接受循环的协程侧。
///
/// # 契约说明（What）
/// - `accept` 返回下一个已接受的客户端流或底层错误；
/// - 完成先于等待到达时直接从缓存弹出；
/// - 等待期间被取消时接受回调被停用，错误以
///   [`IoError::BadFileDescriptor`] 浮出。
pub struct Listener<S> {
    queue: Rc<AcceptQueue<S>>,
}

/// 建一对接受端点。
pub fn listener<S>() -> (Acceptor<S>, Listener<S>) {
    let queue = Rc::new(AcceptQueue {
        pending: RefCell::new(VecDeque::new()),
        event: Event::new(),
        closed: Cell::new(false),
    });

    (
        Acceptor {
            queue: Rc::clone(&queue),
        },
        Listener { queue },
    )
}

impl<S> Listener<S> {
    /// 下一个已接受的客户端流。
    pub async fn accept(&self) -> Result<S, IoError> {
        loop {
            if let Some(result) = self.queue.pending.borrow_mut().pop_front() {
                return result;
            }

            if self.queue.closed.get() {
                return Err(IoError::BadFileDescriptor);
            }

            self.queue.event.reset();
            if self.queue.event.wait().await.is_err() {
                // 等待被取消：停用接受回调，让错误以坏描述符浮出。
                self.queue.closed.set(true);
                return Err(IoError::BadFileDescriptor);
            }
        }
    }

    /// 关闭监听器本身。
    pub fn close(&self) {
        self.queue.closed.set(true);
        self.queue.event.set();
    }
}
