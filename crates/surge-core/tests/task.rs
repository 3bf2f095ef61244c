//! 任务模型与取消传播的端到端测试。
//!
//! 所有用例都通过 `run` 驱动一个真实事件循环：根任务即测试体，断言
//! 失败直接 panic 终止调度。

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use surge_core::prelude::*;

/// 按 `RUST_LOG` 输出调度器内部日志，方便排查挂死的用例。
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// 最小闭环：任务跑完、结果送达、`done` 恰好翻转一次。
#[test]
fn spawn_delivers_result_and_done_flips_once() {
    init_tracing();

    let result = run(|| async {
        let task = spawn(async {
            sleep(Duration::from_millis(1)).await?;
            Ok::<_, TaskError>(42)
        });

        assert!(!task.done(), "尚未调度完成的任务不应报告 done");

        let value = task.await.expect("任务应当成功返回");
        assert_eq!(value, 42, "任务结果必须原样送达");
        Ok::<_, TaskError>(())
    });

    result.expect("事件循环应正常退出").expect("根任务应成功");
}

/// 完成后的取消不改变结果，只返回「即将完成」。
#[test]
fn cancel_after_completion_returns_will_be_done() {
    run(|| async {
        let task = spawn(async { Ok::<_, TaskError>(7) });
        sleep(Duration::from_millis(5)).await.expect("定时器应触发");

        assert!(task.done(), "任务早已结束");
        assert_eq!(
            task.cancel(),
            Err(TaskError::WillBeDone),
            "完成后的取消必须返回 WillBeDone"
        );
        assert_eq!(task.await, Ok(7), "结果不受迟到取消的影响");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 取消一个挂在可取消挂起点上的任务：本地立刻观察到取消错误。
#[test]
fn cancel_interrupts_cancellable_suspension() {
    run(|| async {
        let task = spawn(async {
            sleep(Duration::from_secs(30)).await?;
            Ok::<_, TaskError>(())
        });

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        task.cancel().expect("取消应当命中定时器钩子");

        assert!(task.cancelled(), "取消标记必须置位");
        assert_eq!(task.await, Err(TaskError::Cancelled), "等待方看到取消错误");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 场景：取消传播进 `all`——外层一刀，两个成员都观察到 CANCELLED。
#[test]
fn cancel_propagates_into_all_members() {
    run(|| async {
        let observed_first = Rc::new(Cell::new(false));
        let observed_second = Rc::new(Cell::new(false));

        let member = |observed: Rc<Cell<bool>>| async move {
            match sleep(Duration::from_secs(30)).await {
                Err(TaskError::Cancelled) => {
                    observed.set(true);
                    Err(TaskError::Cancelled)
                }
                other => other,
            }
        };

        let first = spawn(member(Rc::clone(&observed_first)));
        let second = spawn(member(Rc::clone(&observed_second)));
        let outer = spawn(async move { all([first, second]).await });

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        outer.cancel().expect("外层取消应传播到成员");

        assert_eq!(
            outer.await,
            Err(TaskError::Cancelled),
            "组合子把成员的取消统一上报"
        );
        assert!(observed_first.get(), "成员一必须观察到取消");
        assert!(observed_second.get(), "成员二必须观察到取消");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 锁定区吸收取消：解锁后的下一个可取消挂起点才让取消生效。
#[test]
fn locked_frame_defers_cancellation_until_unlock() {
    run(|| async {
        let task = spawn(async {
            lock().await;
            sleep(Duration::from_millis(20)).await?;
            unlock().await;
            // 解锁后的第一个可取消挂起点：取消在这里浮出。
            sleep(Duration::from_secs(30)).await?;
            Ok::<_, TaskError>(())
        });

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        assert!(task.locked(), "任务应处于锁定区内");
        assert_eq!(
            task.cancel(),
            Err(TaskError::Locked),
            "锁定中的取消被吸收并报告 Locked"
        );

        assert_eq!(
            task.await,
            Err(TaskError::Cancelled),
            "解锁后取消标记在下一个挂起点生效"
        );
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 完成回调按登记顺序执行。
#[test]
fn callbacks_run_in_insertion_order() {
    run(|| async {
        let order = Rc::new(RefCell::new(Vec::new()));
        let task = spawn(async {
            sleep(Duration::from_millis(5)).await?;
            Ok::<_, TaskError>(())
        });

        for index in 0..3 {
            let order = Rc::clone(&order);
            task.add_callback(move || order.borrow_mut().push(index));
        }

        task.await.expect("任务应成功");
        assert_eq!(*order.borrow(), vec![0, 1, 2], "回调顺序必须与登记一致");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 链式变换：map / and_then / map_err / or_else。
#[test]
fn chained_transforms_compose() {
    run(|| async {
        let value = spawn(async { Ok::<_, TaskError>(5) })
            .map(|v| v * 2)
            .and_then(|v| async move { Ok(v + 1) })
            .await
            .expect("链式变换应成功");
        assert_eq!(value, 11);

        let recovered = spawn(async { Err::<i32, _>(TaskError::Cancelled) })
            .or_else(|_| async { Ok::<_, TaskError>(0) })
            .await
            .expect("or_else 应兜底成功");
        assert_eq!(recovered, 0);
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 任务组：取消组触达每个成员，成员结束后自动退出组。
#[test]
fn task_group_cancels_members_as_a_unit() {
    run(|| async {
        let group = TaskGroup::new();
        let first = spawn(async {
            sleep(Duration::from_secs(30)).await?;
            Ok::<_, TaskError>(())
        });
        let second = spawn(async {
            sleep(Duration::from_secs(30)).await?;
            Ok::<_, TaskError>(())
        });

        group.add(&first);
        group.add(&second);

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        group.cancel().expect("组取消应命中成员钩子");
        group.wait().await;

        assert!(first.done() && second.done(), "组等待返回时所有成员已结束");
        assert_eq!(first.await, Err(TaskError::Cancelled));
        assert_eq!(second.await, Err(TaskError::Cancelled));
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// `any`：首个成功即收束，其余成员被取消。
#[test]
fn any_resolves_on_first_success() {
    run(|| async {
        let slow = spawn(async {
            sleep(Duration::from_secs(30)).await?;
            Ok::<_, TaskError>("slow")
        });
        let fast = spawn(async {
            sleep(Duration::from_millis(5)).await?;
            Ok::<_, TaskError>("fast")
        });

        let winner = any([slow, fast]).await.expect("应有成员成功");
        assert_eq!(winner, "fast", "先完成的成功者胜出");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// `race`：首个完成者（无论成败）即为结果。
#[test]
fn race_returns_first_completion_even_on_failure() {
    run(|| async {
        let failing = spawn(async {
            sleep(Duration::from_millis(5)).await?;
            Err::<(), _>(TaskError::CancellationNotSupported)
        });
        let slow = spawn(async {
            sleep(Duration::from_secs(30)).await?;
            Ok::<_, TaskError>(())
        });

        assert_eq!(
            race([failing, slow]).await,
            Err(TaskError::CancellationNotSupported),
            "失败同样可以赢下 race"
        );
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// `all_settled` 不把个别失败当取消，等齐所有成员。
#[test]
fn all_settled_waits_for_everyone() {
    run(|| async {
        let ok = spawn(async {
            sleep(Duration::from_millis(5)).await?;
            Ok::<_, TaskError>(1)
        });
        let err = spawn(async { Err::<i32, _>(TaskError::Cancelled) });

        let results = all_settled([ok, err]).await;
        assert_eq!(results, vec![Ok(1), Err(TaskError::Cancelled)]);
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 异构组合子：`all2` 聚合成元组，`race2` 带标签返回胜者。
#[test]
fn heterogeneous_combinators_tag_their_values() {
    run(|| async {
        let number = spawn(async { Ok::<_, TaskError>(7) });
        let text = spawn(async { Ok::<_, TaskError>("seven") });
        let (n, s) = all2(number, text).await.expect("all2 应成功");
        assert_eq!((n, s), (7, "seven"));

        let fast = spawn(async { Ok::<_, TaskError>(1u8) });
        let slow = spawn(async {
            sleep(Duration::from_secs(30)).await?;
            Ok::<_, TaskError>("never")
        });
        match race2(fast, slow).await.expect("race2 应成功") {
            Either::Left(v) => assert_eq!(v, 1),
            Either::Right(_) => panic!("慢成员不应胜出"),
        }
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 回溯：子任务里能看到父任务的挂起位置。
#[test]
fn backtrace_reaches_the_root_task() {
    run(|| async {
        let child = spawn(async {
            // 等一拍，确保父帧完成收养。
            sleep(Duration::from_millis(5)).await?;
            Ok::<_, TaskError>(backtrace().await)
        });

        let sites = child.await.expect("子任务应成功");
        assert!(
            sites.len() >= 2,
            "回溯应至少包含调用点与父帧位置，实际 {sites:?}"
        );
        assert!(
            sites[0].file.ends_with("task.rs"),
            "首个位置应是本测试文件中的调用点"
        );
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 调用树：等待中的子任务出现在父任务的树里。
#[test]
fn call_tree_lists_pending_children() {
    run(|| async {
        let outer = spawn(async {
            let inner = spawn(async {
                sleep(Duration::from_secs(30)).await?;
                Ok::<_, TaskError>(())
            });
            inner.await
        });

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");

        let tree = outer.call_tree();
        assert_eq!(tree.children.len(), 1, "外层任务应有一个在途子帧");
        assert!(
            outer.trace().lines().count() >= 2,
            "trace 文本应覆盖父子两层"
        );

        outer.cancel().expect("清理：取消挂起的子树");
        let _ = outer.await;
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 跨线程投递：任意线程的 post 都能唤醒空转的循环。
#[test]
fn cross_thread_post_wakes_the_loop() {
    run(|| async {
        let handle = get_event_loop()
            .expect("run 内必有绑定循环")
            .handle()
            .clone();
        let promise: Promise<u32, TaskError> = Promise::new();
        let future = promise.future();

        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            handle.post(move || promise.resolve(99));
        });

        let value = from_future(future).await.expect("投递的结果应送达");
        assert_eq!(value, 99);
        poster.join().expect("投递线程应正常退出");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// `to_thread`：阻塞闭包在工作线程执行，结果回到循环。
#[test]
fn to_thread_offloads_blocking_work() {
    run(|| async {
        let value = to_thread(|| {
            std::thread::sleep(Duration::from_millis(10));
            Ok::<_, TaskError>(123)
        })
        .await
        .expect("阻塞闭包的结果应回到循环");
        assert_eq!(value, 123);
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 手动 `loop_exit` 抢在根任务结束之前：`run` 报告 Stopped。
#[test]
fn premature_loop_exit_is_reported() {
    let result = run(|| async {
        get_event_loop()
            .expect("run 内必有绑定循环")
            .loop_exit(Some(Duration::from_millis(10)));

        sleep(Duration::from_secs(30)).await?;
        Ok::<_, TaskError>(())
    });

    assert_eq!(
        result.expect_err("根任务来不及落定"),
        RunError::Stopped,
        "提前停机必须以 Stopped 上报"
    );
}
