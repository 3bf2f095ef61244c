//! 同步原语的端到端测试。

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use surge_core::prelude::*;

/// 互斥锁：任意时刻至多一个持有者，授予顺序与排队顺序一致。
#[test]
fn mutex_grants_in_fifo_order() {
    run(|| async {
        let mutex = Rc::new(Mutex::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        mutex.lock().await.expect("空闲锁应立即到手");

        let contenders: Vec<_> = (0..3)
            .map(|index| {
                let mutex = Rc::clone(&mutex);
                let order = Rc::clone(&order);
                spawn(async move {
                    mutex.lock().await?;
                    order.borrow_mut().push(index);
                    mutex.unlock();
                    Ok::<_, TaskError>(())
                })
            })
            .collect();

        // 让三个竞争者全部排进等待队列后再放锁。
        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        assert!(mutex.locked(), "锁仍在根任务手里");
        mutex.unlock();

        all(contenders).await.expect("竞争者应全部完成");
        assert_eq!(*order.borrow(), vec![0, 1, 2], "授予顺序必须是 FIFO");
        assert!(!mutex.locked(), "最后一个持有者放锁后恢复空闲");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 等待锁的任务可以被取消；取消者出队，不影响后续授予。
#[test]
fn cancelled_lock_waiter_leaves_the_queue() {
    run(|| async {
        let mutex = Rc::new(Mutex::new());
        mutex.lock().await.expect("空闲锁应立即到手");

        let waiter = {
            let mutex = Rc::clone(&mutex);
            spawn(async move {
                mutex.lock().await?;
                mutex.unlock();
                Ok::<_, TaskError>(())
            })
        };

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        waiter.cancel().expect("取消应命中等待钩子");
        assert_eq!(waiter.await, Err(TaskError::Cancelled));

        mutex.unlock();
        assert!(!mutex.locked(), "被取消的等待者不得再拿到锁");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 事件：`set` 放行当前全部等待者，`reset` 撤销信号。
#[test]
fn event_releases_all_current_waiters() {
    run(|| async {
        let event = Rc::new(Event::new());
        assert!(!event.is_set());

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let event = Rc::clone(&event);
                spawn(async move { event.wait().await })
            })
            .collect();

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        event.set();
        all(waiters).await.expect("等待者应全部被放行");

        event.reset();
        assert!(!event.is_set(), "reset 之后信号撤销");

        event.set();
        event.wait().await.expect("信号置位期间的等待立即返回");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 条件变量：notify 唤醒一个，broadcast 唤醒全部。
#[test]
fn condition_notify_and_broadcast() {
    run(|| async {
        let mutex = Rc::new(Mutex::new());
        let condition = Rc::new(Condition::new());
        let woken = Rc::new(RefCell::new(0usize));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let mutex = Rc::clone(&mutex);
                let condition = Rc::clone(&condition);
                let woken = Rc::clone(&woken);
                spawn(async move {
                    mutex.lock().await?;
                    condition.wait(&mutex).await?;
                    *woken.borrow_mut() += 1;
                    mutex.unlock();
                    Ok::<_, TaskError>(())
                })
            })
            .collect();

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");

        condition.notify();
        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        assert_eq!(*woken.borrow(), 1, "notify 只唤醒一个等待者");

        condition.broadcast();
        all(waiters).await.expect("广播后剩余等待者全部醒来");
        assert_eq!(*woken.borrow(), 3);
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 谓词循环：虚假唤醒不满足谓词时继续等待。
#[test]
fn condition_predicate_loops_until_satisfied() {
    run(|| async {
        let mutex = Rc::new(Mutex::new());
        let condition = Rc::new(Condition::new());
        let counter = Rc::new(RefCell::new(0usize));

        let consumer = {
            let mutex = Rc::clone(&mutex);
            let condition = Rc::clone(&condition);
            let counter = Rc::clone(&counter);
            spawn(async move {
                mutex.lock().await?;
                condition
                    .wait_until(&mutex, || *counter.borrow() >= 2)
                    .await?;
                let value = *counter.borrow();
                mutex.unlock();
                Ok::<_, TaskError>(value)
            })
        };

        for _ in 0..2 {
            sleep(Duration::from_millis(5)).await.expect("定时器应触发");
            mutex.lock().await.expect("生产者拿锁");
            *counter.borrow_mut() += 1;
            mutex.unlock();
            condition.notify();
        }

        assert_eq!(consumer.await, Ok(2), "谓词满足后才返回");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 取消等待中的条件变量：先拿回互斥锁，再上报取消。
#[test]
fn cancelled_condition_wait_reacquires_the_mutex() {
    run(|| async {
        let mutex = Rc::new(Mutex::new());
        let condition = Rc::new(Condition::new());
        let held_after_cancel = Rc::new(RefCell::new(None));

        let waiter = {
            let mutex = Rc::clone(&mutex);
            let condition = Rc::clone(&condition);
            let held = Rc::clone(&held_after_cancel);
            spawn(async move {
                mutex.lock().await?;
                let outcome = condition.wait(&mutex).await;
                *held.borrow_mut() = Some(mutex.locked());
                mutex.unlock();
                outcome
            })
        };

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        waiter.cancel().expect("取消应命中条件等待钩子");

        assert_eq!(waiter.await, Err(TaskError::Cancelled));
        assert_eq!(
            *held_after_cancel.borrow(),
            Some(true),
            "取消错误浮出之前互斥锁必须已经重新到手"
        );
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 取消与 notify 赛跑：notify 获胜，取消方拿到 WillBeDone。
#[test]
fn notify_beats_a_racing_cancel() {
    run(|| async {
        let mutex = Rc::new(Mutex::new());
        let condition = Rc::new(Condition::new());

        let waiter = {
            let mutex = Rc::clone(&mutex);
            let condition = Rc::clone(&condition);
            spawn(async move {
                mutex.lock().await?;
                condition.wait(&mutex).await?;
                mutex.unlock();
                Ok::<_, TaskError>("woken")
            })
        };

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");

        // 先通知、后取消，且不让等待者有机会恢复：钩子必须观察到已满足。
        condition.notify();
        assert_eq!(
            waiter.cancel(),
            Err(TaskError::WillBeDone),
            "已被通知的等待者报告 WillBeDone"
        );

        assert_eq!(waiter.await, Ok("woken"), "等待按正常唤醒完成");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}
