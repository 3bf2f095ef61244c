//! 定时原语：`sleep` 与 `timeout`。

use crate::error::{Elapsed, TaskError};
use crate::promise::{Promise, Settled};
use crate::runtime::current_context;
use crate::task::{Cancellable, Task, cancellable_at, spawn};
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// 至少经过 `duration` 之后完成的可取消等待。
///
/// 零时长不会注册定时器，而是排到循环的下一轮迭代；取消以
/// [`TaskError::Cancelled`] 收场。
#[track_caller]
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        site: Location::caller(),
        state: None,
    }
}

pub struct Sleep {
    duration: Duration,
    site: &'static Location<'static>,
    state: Option<Cancellable<Settled<(), TaskError>>>,
}

impl Future for Sleep {
    type Output = Result<(), TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.state.is_none() {
            let ctx = current_context().expect("sleep requires a bound event loop");
            let promise: Promise<(), TaskError> = Promise::bound(ctx.handle().clone());

            let timer = promise.clone();
            let fire = move || {
                // 取消可能先一步落定结果；迟到的定时器直接失效。
                let _ = timer.try_resolve(());
            };

            if this.duration.is_zero() {
                ctx.handle().post(fire);
            } else {
                ctx.handle().post_delayed(fire, this.duration);
            }

            let guard = promise.clone();
            let hook = move || {
                if guard.try_reject(TaskError::Cancelled) {
                    Ok(())
                } else {
                    Err(TaskError::CancellationTooLate)
                }
            };

            this.state = Some(cancellable_at(Settled::new(promise.future()), hook, this.site));
        }

        Pin::new(
            this.state
                .as_mut()
                .expect("sleep state initialized on first poll"),
        )
        .poll(cx)
    }
}

/// 并行运行 `task` 与一个 `duration` 的定时器，先完成者取消另一方。
///
/// # 契约说明（What）
/// - 定时器先到：内层任务被取消，外层以 [`Elapsed`] 失败；
/// - 任务先到：定时器被取消，返回任务自己的结果；
/// - 零时长等价于直接等待任务本身；
/// - 外层任务被取消时，内层任务与定时器都会收到取消。
pub fn timeout<T, E>(
    task: Task<T, E>,
    duration: Duration,
) -> impl Future<Output = Result<Result<T, E>, Elapsed>>
where
    T: 'static,
    E: 'static,
{
    async move {
        if duration.is_zero() {
            return Ok(task.await);
        }

        let frame = task.frame_handle();
        let timer: Task<(), TaskError> = spawn(async move {
            sleep(duration).await?;
            // 内层挂起点不支持取消时只会留下标记，任务按自身节奏收尾。
            let _ = frame.cancel_all();
            Ok(())
        });

        let result = task.await;

        if timer.done() {
            match timer.try_take_result() {
                Some(Ok(())) => Err(Elapsed),
                _ => Ok(result),
            }
        } else {
            let _ = timer.cancel();
            let _ = timer.await;
            Ok(result)
        }
    }
}
