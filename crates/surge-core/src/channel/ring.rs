//! 有界 MPMC 环形缓冲。
//!
//! # 逻辑解析（How）
//! - 每个槽位携带序号，生产与消费各自推进一个全局位置计数；序号与位置
//!   的差值指示槽位处于「可写 / 写入中 / 可读 / 读取中」哪个阶段；
//! - `reserve`/`acquire` 用 CAS 抢占位置，`commit`/`release` 用序号发布，
//!   快速路径不经过任何互斥量；
//! - 槽内的值由自旋锁保护：序号门控保证同一槽位不会被两方同时触碰，
//!   自旋锁只在极短的写入/取出窗口内持有。
//!
//! # 契约说明（What）
//! - `reserve` 成功后必须依次调用 `write` 与 `commit`；
//! - `acquire` 成功后必须依次调用 `read` 与 `release`；
//! - 缓冲中的元素数量永远不超过构造时的容量。

use spin::Mutex as SpinMutex;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    sequence: AtomicUsize,
    value: SpinMutex<Option<T>>,
}

pub(crate) struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

impl<T> RingBuffer<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "ring buffer capacity must be at least 1");

        let slots = (0..capacity)
            .map(|index| Slot {
                sequence: AtomicUsize::new(index),
                value: SpinMutex::new(None),
            })
            .collect();

        RingBuffer {
            slots,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        let enqueue = self.enqueue_pos.load(Ordering::Relaxed);
        let dequeue = self.dequeue_pos.load(Ordering::Relaxed);
        enqueue.saturating_sub(dequeue)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// 抢占一个写入位置；缓冲已满时返回 `None`。
    pub(crate) fn reserve(&self) -> Option<usize> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[pos % self.slots.len()];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let difference = (sequence as isize).wrapping_sub(pos as isize);

            if difference == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(pos),
                    Err(current) => pos = current,
                }
            } else if difference < 0 {
                return None;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn write(&self, pos: usize, value: T) {
        *self.slots[pos % self.slots.len()].value.lock() = Some(value);
    }

    /// 发布写入：此后该位置对消费方可见。
    pub(crate) fn commit(&self, pos: usize) {
        self.slots[pos % self.slots.len()]
            .sequence
            .store(pos.wrapping_add(1), Ordering::Release);
    }

    /// 抢占一个读取位置；缓冲为空时返回 `None`。
    pub(crate) fn acquire(&self) -> Option<usize> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[pos % self.slots.len()];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let difference = (sequence as isize).wrapping_sub(pos.wrapping_add(1) as isize);

            if difference == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(pos),
                    Err(current) => pos = current,
                }
            } else if difference < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn read(&self, pos: usize) -> T {
        self.slots[pos % self.slots.len()]
            .value
            .lock()
            .take()
            .expect("ring slot acquired without a committed value")
    }

    /// 归还槽位：此后该位置对生产方可用。
    pub(crate) fn release(&self, pos: usize) {
        self.slots[pos % self.slots.len()]
            .sequence
            .store(pos.wrapping_add(self.slots.len()), Ordering::Release);
    }
}
