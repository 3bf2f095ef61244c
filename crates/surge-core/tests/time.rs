//! 定时原语的端到端测试。

use std::time::{Duration, Instant};
use surge_core::prelude::*;

/// `sleep` 至少等待请求的时长。
#[test]
fn sleep_waits_at_least_the_requested_duration() {
    run(|| async {
        let started = Instant::now();
        sleep(Duration::from_millis(20)).await.expect("定时器应触发");
        assert!(
            started.elapsed() >= Duration::from_millis(20),
            "实际等待不得短于请求时长"
        );
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// `sleep(0)` 不注册定时器：让出一轮后立即恢复。
#[test]
fn zero_sleep_yields_once() {
    run(|| async {
        let started = Instant::now();
        sleep(Duration::ZERO).await.expect("零时长睡眠应立即恢复");
        assert!(
            started.elapsed() < Duration::from_millis(50),
            "零时长睡眠不应产生可感知的延迟"
        );
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 取消睡眠：以 Cancelled 收场。
#[test]
fn cancelled_sleep_reports_cancelled() {
    run(|| async {
        let sleeper = spawn(async {
            sleep(Duration::from_secs(30)).await?;
            Ok::<_, TaskError>(())
        });

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        sleeper.cancel().expect("取消应命中定时器钩子");
        assert_eq!(sleeper.await, Err(TaskError::Cancelled));
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 场景：定时器先到——`timeout(sleep(20ms), 10ms)` 报告 Elapsed。
#[test]
fn timer_wins_and_reports_elapsed() {
    run(|| async {
        let task = spawn(async {
            sleep(Duration::from_millis(20)).await?;
            Ok::<_, TaskError>(())
        });

        assert_eq!(
            timeout(task, Duration::from_millis(10)).await,
            Err(Elapsed),
            "定时器先到必须以 Elapsed 失败"
        );
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 场景：任务先到——`timeout(sleep(10ms), 20ms)` 返回任务结果。
#[test]
fn task_wins_and_returns_its_result() {
    run(|| async {
        let task = spawn(async {
            sleep(Duration::from_millis(10)).await?;
            Ok::<_, TaskError>(7)
        });

        let result = timeout(task, Duration::from_millis(20))
            .await
            .expect("任务先到不应报超时");
        assert_eq!(result, Ok(7), "内层任务的结果原样返回");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 边界：零时长的 `timeout` 等价于直接等待任务。
#[test]
fn zero_timeout_is_plain_await() {
    run(|| async {
        let task = spawn(async {
            sleep(Duration::from_millis(10)).await?;
            Ok::<_, TaskError>("done")
        });

        let result = timeout(task, Duration::ZERO)
            .await
            .expect("零时长不引入超时语义");
        assert_eq!(result, Ok("done"));
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 取消外层：内层任务与定时器都被取消。
#[test]
fn cancelling_the_outer_timeout_cancels_the_inner_task() {
    run(|| async {
        let observed = std::rc::Rc::new(std::cell::Cell::new(false));
        let inner = {
            let observed = std::rc::Rc::clone(&observed);
            spawn(async move {
                match sleep(Duration::from_secs(30)).await {
                    Err(TaskError::Cancelled) => {
                        observed.set(true);
                        Err(TaskError::Cancelled)
                    }
                    other => other,
                }
            })
        };

        let outer = spawn(async move {
            match timeout(inner, Duration::from_secs(60)).await {
                Ok(result) => result,
                Err(Elapsed) => Err(TaskError::Cancelled),
            }
        });

        sleep(Duration::from_millis(5)).await.expect("定时器应触发");
        outer.cancel().expect("外层取消应传播");

        assert_eq!(outer.await, Err(TaskError::Cancelled));
        assert!(observed.get(), "内层任务必须观察到取消");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 同一截止时刻的多个定时器按登记顺序触发。
#[test]
fn equal_deadline_timers_fire_in_registration_order() {
    run(|| async {
        let first = spawn(async {
            sleep(Duration::from_millis(10)).await?;
            Ok::<_, TaskError>(1)
        });
        let second = spawn(async {
            sleep(Duration::from_millis(10)).await?;
            Ok::<_, TaskError>(2)
        });

        match race2(first, second).await.expect("race 应成功") {
            Either::Left(v) => assert_eq!(v, 1, "先登记的定时器先触发"),
            Either::Right(_) => panic!("后登记的定时器不应先触发"),
        }
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}
