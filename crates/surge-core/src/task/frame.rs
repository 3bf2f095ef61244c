//! 任务帧：调度器视角下每个任务的运行时记录。
//!
//! # 设计背景（Why）
//! - 取消、调用树追踪与完成回调都需要一个独立于用户 Future 的载体；
//! - 帧之间构成父子图：子帧被等待它的父帧强持有，子帧以弱引用回指父帧，
//!   避免成环。子帧完成后在父帧下一次恢复（`step`）时被摘除。
//!
//! # 契约说明（What）
//! - `finished ⇒ children 为空`（回调执行前清空）；
//! - `locked ⇒ 取消传播推迟到解锁`，标记仍会置位；
//! - 一个帧可以处于 `cancelled` 而未 `finished` 的状态；
//! - 取消钩子至多被调用一次，`step` 在每次恢复时将其取走。

use crate::error::TaskError;
use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::panic::Location;
use std::rc::{Rc, Weak};

/// 取消钩子：一次性函数，中断当前挂起点。
pub type CancelHook = Box<dyn FnOnce() -> Result<(), TaskError>>;

/// 源码位置的轻量视图，用于调用树与回溯。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceSite {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl From<&'static Location<'static>> for SourceSite {
    fn from(location: &'static Location<'static>) -> Self {
        SourceSite {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl std::fmt::Display for SourceSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// 挂起点调用树的一个节点。
#[derive(Clone, Debug)]
pub struct CallNode {
    pub site: SourceSite,
    pub children: Vec<CallNode>,
}

pub(crate) struct Frame {
    parent: RefCell<Weak<Frame>>,
    children: RefCell<Vec<Rc<Frame>>>,
    site: Cell<Option<&'static Location<'static>>>,
    cancel: RefCell<Option<CancelHook>>,
    callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
    finished: Cell<bool>,
    locked: Cell<bool>,
    cancelled: Cell<bool>,
    created_at: &'static Location<'static>,
}

impl Frame {
    pub(crate) fn new(created_at: &'static Location<'static>) -> Rc<Frame> {
        Rc::new(Frame {
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
            site: Cell::new(None),
            cancel: RefCell::new(None),
            callbacks: RefCell::new(Vec::new()),
            finished: Cell::new(false),
            locked: Cell::new(false),
            cancelled: Cell::new(false),
            created_at,
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.get()
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locked.get()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub(crate) fn set_locked(&self, locked: bool) {
        self.locked.set(locked);
    }

    pub(crate) fn set_site(&self, site: &'static Location<'static>) {
        self.site.set(Some(site));
    }

    pub(crate) fn install_cancel(&self, hook: CancelHook) {
        *self.cancel.borrow_mut() = Some(hook);
    }

    /// 把 `child` 挂为当前帧的子帧，并记录等待位置。
    pub(crate) fn adopt(self: &Rc<Self>, child: &Rc<Frame>, site: &'static Location<'static>) {
        *child.parent.borrow_mut() = Rc::downgrade(self);
        self.children.borrow_mut().push(Rc::clone(child));
        self.set_site(site);
    }

    pub(crate) fn add_callback(&self, callback: Box<dyn FnOnce()>) {
        self.callbacks.borrow_mut().push(callback);
    }

    /// 每次恢复时调用：取消钩子作废，已完成的子帧被摘除。
    pub(crate) fn step(&self) {
        self.cancel.borrow_mut().take();
        self.children
            .borrow_mut()
            .retain(|child| !child.is_finished());
    }

    /// 协程体返回时调用：按登记顺序执行完成回调。
    pub(crate) fn end(&self) {
        self.finished.set(true);
        self.cancel.borrow_mut().take();
        self.site.set(None);
        self.children.borrow_mut().clear();

        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        for callback in callbacks {
            callback();
        }
    }

    /// 标记整棵子树为取消并逐层触发当前取消钩子。
    ///
    /// # 契约说明（What）
    /// - 已完成的帧返回 [`TaskError::WillBeDone`]，结果不受影响；
    /// - 锁定中的帧吸收取消（标记置位）并返回 [`TaskError::Locked`]，
    ///   解锁后的下一个挂起点会观察到标记；
    /// - 既无钩子也无子帧的挂起点返回
    ///   [`TaskError::CancellationNotSupported`]，标记仍然置位。
    pub(crate) fn cancel_all(self: &Rc<Self>) -> Result<(), TaskError> {
        if self.finished.get() {
            return Err(TaskError::WillBeDone);
        }

        if self.locked.get() {
            self.cancelled.set(true);
            return Err(TaskError::Locked);
        }

        self.cancelled.set(true);

        let hook = self.cancel.borrow_mut().take();
        let children: Vec<Rc<Frame>> = self.children.borrow().clone();

        let mut result = match hook {
            Some(hook) => hook(),
            None if children.is_empty() => Err(TaskError::CancellationNotSupported),
            None => Ok(()),
        };

        for child in &children {
            let outcome = child.cancel_all();
            if result.is_ok() {
                result = outcome;
            }
        }

        result
    }

    fn current_site(&self) -> SourceSite {
        self.site.get().unwrap_or(self.created_at).into()
    }

    /// 以本帧为根的挂起点调用树。
    pub(crate) fn call_tree(&self) -> CallNode {
        CallNode {
            site: self.current_site(),
            children: self
                .children
                .borrow()
                .iter()
                .map(|child| child.call_tree())
                .collect(),
        }
    }

    /// 祖先帧的挂起点路径（自底向上，不含本帧）。
    pub(crate) fn ancestor_sites(&self) -> Vec<SourceSite> {
        let mut sites = Vec::new();
        let mut parent = self.parent.borrow().upgrade();

        while let Some(frame) = parent {
            sites.push(frame.current_site());
            parent = frame.parent.borrow().upgrade();
        }

        sites
    }

    /// 可读的调用树文本，一行一个挂起点。
    pub(crate) fn trace(&self) -> String {
        fn render(node: &CallNode, depth: usize, out: &mut String) {
            let _ = writeln!(out, "{}at {}", "  ".repeat(depth), node.site);
            for child in &node.children {
                render(child, depth + 1, out);
            }
        }

        let mut out = String::new();
        render(&self.call_tree(), 0, &mut out);
        out
    }
}
