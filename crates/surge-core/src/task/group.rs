//! 任务组：作为一个整体被等待、被取消的一组帧。
//!
//! 成员完成时通过完成回调把自己从组里摘除；取消组等价于取消每个
//! 仍在组内的成员。组合子（`all`/`race` 等）的宿主取消语义建立在
//! 「等待组会把全部成员帧过继给宿主帧」之上。

use super::frame::Frame;
use super::{Task, step_current, with_current_frame};
use crate::error::TaskError;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// 可变的帧集合，整体等待、整体取消。
#[derive(Default)]
pub struct TaskGroup {
    frames: Rc<RefCell<Vec<Rc<Frame>>>>,
    cancelled: Cell<bool>,
}

impl TaskGroup {
    pub fn new() -> Self {
        TaskGroup::default()
    }

    /// 组是否已被取消；取消后加入的成员会被立即取消。
    pub fn cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// 把任务纳入组内。任务完成时自动退出组。
    pub fn add<T: 'static, E: 'static>(&self, task: &Task<T, E>) {
        if self.cancelled.get() {
            let _ = task.cancel();
        }

        let frame = task.frame_handle();
        self.frames.borrow_mut().push(Rc::clone(&frame));

        let frames = Rc::clone(&self.frames);
        task.add_callback(move || {
            frames
                .borrow_mut()
                .retain(|member| !Rc::ptr_eq(member, &frame));
        });
    }

    /// 取消组内所有成员；返回第一个失败原因（若有）。
    pub fn cancel(&self) -> Result<(), TaskError> {
        self.cancelled.set(true);

        let members: Vec<Rc<Frame>> = self.frames.borrow().clone();
        let mut result = Ok(());

        for member in members {
            let outcome = member.cancel_all();
            if result.is_ok() {
                result = outcome;
            }
        }

        result
    }

    /// 等待组内全部成员结束。
    ///
    /// 首次推进时把所有成员帧过继给宿主帧，宿主的取消由此触达成员。
    #[track_caller]
    pub fn wait(&self) -> GroupWait {
        GroupWait {
            frames: Rc::clone(&self.frames),
            state: None,
            site: Location::caller(),
        }
    }
}

struct WaitState {
    remaining: Cell<usize>,
    waker: RefCell<Option<Waker>>,
}

/// [`TaskGroup::wait`] 返回的等待体。
pub struct GroupWait {
    frames: Rc<RefCell<Vec<Rc<Frame>>>>,
    state: Option<Rc<WaitState>>,
    site: &'static Location<'static>,
}

impl Future for GroupWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.state.is_none() {
            let members: Vec<Rc<Frame>> = this.frames.borrow().clone();
            let state = Rc::new(WaitState {
                remaining: Cell::new(0),
                waker: RefCell::new(None),
            });

            with_current_frame(|host| {
                if let Some(host) = host {
                    for member in &members {
                        host.adopt(member, this.site);
                    }
                }
            });

            for member in &members {
                if member.is_finished() {
                    continue;
                }

                state.remaining.set(state.remaining.get() + 1);
                let state = Rc::clone(&state);
                member.add_callback(Box::new(move || {
                    state.remaining.set(state.remaining.get() - 1);
                    if state.remaining.get() == 0
                        && let Some(waker) = state.waker.borrow_mut().take()
                    {
                        waker.wake();
                    }
                }));
            }

            with_current_frame(|host| {
                if let Some(host) = host
                    && host.is_cancelled()
                    && !host.is_locked()
                {
                    for member in &members {
                        let _ = member.cancel_all();
                    }
                }
            });

            this.state = Some(state);
        }

        let state = this
            .state
            .as_ref()
            .expect("group wait state initialized on first poll");

        if state.remaining.get() == 0 {
            step_current();
            Poll::Ready(())
        } else {
            *state.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}
