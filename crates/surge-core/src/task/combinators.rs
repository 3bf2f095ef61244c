//! 任务组合子：`all` / `all_settled` / `any` / `race`。
//!
//! # 逻辑解析（How）
//! - 组合子是手写 poll 的等待体：成员任务在被等待时各自把帧挂到宿主帧
//!   之下，宿主取消沿帧树触达每个成员，无需额外机关；
//! - 每次被唤醒时轮询尚未落定的成员，按表格语义决定提前收束还是继续等；
//! - 提前收束（首个失败 / 首个成功 / 首个完成）时取消其余成员，被取消的
//!   成员在各自的下一个可取消挂起点结束。
//!
//! # 契约说明（What）
//! - `all`：首个失败立即失败并取消其余成员，否则等齐全部成功值；
//! - `all_settled`：无条件等齐所有成员，逐个返回 `Result`；
//! - `any`：首个成功即完成并取消其余成员，全部失败时返回错误集合；
//! - `race`：首个完成（无论成败）即完成并取消其余成员。
//!
//! 异构元素的变长版本（`all2`/`race3` 等）把成员映射为带标签的联合类型
//! 后复用同构实现，成功值以 [`Either`] / [`Either3`] 携带。

use super::Task;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// 二元标签联合。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Either<L, R> {
    Left(L),
    Right(R),
}

/// 三元标签联合。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Either3<A, B, C> {
    A(A),
    B(B),
    C(C),
}

/// 等待所有任务成功；任何一个失败都立即终止并取消其余任务。
pub fn all<T, E>(tasks: impl IntoIterator<Item = Task<T, E>>) -> All<T, E> {
    let tasks: Vec<Option<Task<T, E>>> = tasks.into_iter().map(Some).collect();
    let outputs = tasks.iter().map(|_| None).collect();
    All { tasks, outputs }
}

pub struct All<T, E> {
    tasks: Vec<Option<Task<T, E>>>,
    outputs: Vec<Option<T>>,
}

impl<T, E> Unpin for All<T, E> {}

impl<T: 'static, E: 'static> Future for All<T, E> {
    type Output = Result<Vec<T>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut failure = None;

        for (index, slot) in this.tasks.iter_mut().enumerate() {
            let Some(task) = slot else { continue };

            match Pin::new(task).poll(cx) {
                Poll::Ready(Ok(value)) => {
                    this.outputs[index] = Some(value);
                    *slot = None;
                }
                Poll::Ready(Err(error)) => {
                    *slot = None;
                    failure = Some(error);
                    break;
                }
                Poll::Pending => {}
            }
        }

        if let Some(error) = failure {
            for task in this.tasks.iter().flatten() {
                let _ = task.cancel();
            }
            return Poll::Ready(Err(error));
        }

        if this.tasks.iter().all(Option::is_none) {
            let values = this
                .outputs
                .iter_mut()
                .map(|slot| slot.take().expect("all combinator lost a value"))
                .collect();
            Poll::Ready(Ok(values))
        } else {
            Poll::Pending
        }
    }
}

/// 无条件等齐每个任务，逐个返回其 `Result`。
pub fn all_settled<T, E>(tasks: impl IntoIterator<Item = Task<T, E>>) -> AllSettled<T, E> {
    let tasks: Vec<Option<Task<T, E>>> = tasks.into_iter().map(Some).collect();
    let outputs = tasks.iter().map(|_| None).collect();
    AllSettled { tasks, outputs }
}

pub struct AllSettled<T, E> {
    tasks: Vec<Option<Task<T, E>>>,
    outputs: Vec<Option<Result<T, E>>>,
}

impl<T, E> Unpin for AllSettled<T, E> {}

impl<T: 'static, E: 'static> Future for AllSettled<T, E> {
    type Output = Vec<Result<T, E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        for (index, slot) in this.tasks.iter_mut().enumerate() {
            let Some(task) = slot else { continue };

            if let Poll::Ready(result) = Pin::new(task).poll(cx) {
                this.outputs[index] = Some(result);
                *slot = None;
            }
        }

        if this.tasks.iter().all(Option::is_none) {
            let results = this
                .outputs
                .iter_mut()
                .map(|slot| slot.take().expect("all_settled combinator lost a result"))
                .collect();
            Poll::Ready(results)
        } else {
            Poll::Pending
        }
    }
}

/// 首个成功即完成并取消其余任务；全部失败时返回错误集合。
pub fn any<T, E>(tasks: impl IntoIterator<Item = Task<T, E>>) -> Any<T, E> {
    let tasks: Vec<Option<Task<T, E>>> = tasks.into_iter().map(Some).collect();
    let errors = tasks.iter().map(|_| None).collect();
    Any { tasks, errors }
}

pub struct Any<T, E> {
    tasks: Vec<Option<Task<T, E>>>,
    errors: Vec<Option<E>>,
}

impl<T, E> Unpin for Any<T, E> {}

impl<T: 'static, E: 'static> Future for Any<T, E> {
    type Output = Result<T, Vec<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut winner = None;

        for (index, slot) in this.tasks.iter_mut().enumerate() {
            let Some(task) = slot else { continue };

            match Pin::new(task).poll(cx) {
                Poll::Ready(Ok(value)) => {
                    *slot = None;
                    winner = Some(value);
                    break;
                }
                Poll::Ready(Err(error)) => {
                    this.errors[index] = Some(error);
                    *slot = None;
                }
                Poll::Pending => {}
            }
        }

        if let Some(value) = winner {
            for task in this.tasks.iter().flatten() {
                let _ = task.cancel();
            }
            return Poll::Ready(Ok(value));
        }

        if this.tasks.iter().all(Option::is_none) {
            let errors = this
                .errors
                .iter_mut()
                .map(|slot| slot.take().expect("any combinator lost an error"))
                .collect();
            Poll::Ready(Err(errors))
        } else {
            Poll::Pending
        }
    }
}

/// 首个完成（无论成败）即完成并取消其余任务。
pub fn race<T, E>(tasks: impl IntoIterator<Item = Task<T, E>>) -> Race<T, E> {
    Race {
        tasks: tasks.into_iter().map(Some).collect(),
    }
}

pub struct Race<T, E> {
    tasks: Vec<Option<Task<T, E>>>,
}

impl<T: 'static, E: 'static> Future for Race<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut outcome = None;

        for slot in this.tasks.iter_mut() {
            let Some(task) = slot else { continue };

            if let Poll::Ready(result) = Pin::new(task).poll(cx) {
                *slot = None;
                outcome = Some(result);
                break;
            }
        }

        match outcome {
            Some(result) => {
                for task in this.tasks.iter().flatten() {
                    let _ = task.cancel();
                }
                Poll::Ready(result)
            }
            None => Poll::Pending,
        }
    }
}

fn expect_left<L, R>(value: Either<L, R>) -> L {
    match value {
        Either::Left(left) => left,
        Either::Right(_) => unreachable!("combinator produced a value at the wrong position"),
    }
}

fn expect_right<L, R>(value: Either<L, R>) -> R {
    match value {
        Either::Right(right) => right,
        Either::Left(_) => unreachable!("combinator produced a value at the wrong position"),
    }
}

/// 两个异构任务的 `all`。
#[track_caller]
pub fn all2<A, B, E>(
    a: Task<A, E>,
    b: Task<B, E>,
) -> impl Future<Output = Result<(A, B), E>>
where
    A: 'static,
    B: 'static,
    E: 'static,
{
    let a = a.map(Either::Left);
    let b = b.map(Either::Right);
    async move {
        let mut values = all([a, b]).await?;
        let second = expect_right(values.pop().expect("all2 lost a value"));
        let first = expect_left(values.pop().expect("all2 lost a value"));
        Ok((first, second))
    }
}

/// 三个异构任务的 `all`。
#[track_caller]
pub fn all3<A, B, C, E>(
    a: Task<A, E>,
    b: Task<B, E>,
    c: Task<C, E>,
) -> impl Future<Output = Result<(A, B, C), E>>
where
    A: 'static,
    B: 'static,
    C: 'static,
    E: 'static,
{
    let bc: Task<Either<A, (B, C)>, E> =
        super::spawn(async move { all2(b, c).await.map(Either::Right) });
    let a = a.map(Either::Left);
    async move {
        let mut values = all([a, bc]).await?;
        let tail = expect_right(values.pop().expect("all3 lost a value"));
        let head = expect_left(values.pop().expect("all3 lost a value"));
        let (second, third) = tail;
        Ok((head, second, third))
    }
}

/// 两个异构任务的 `all_settled`。
#[track_caller]
pub fn all_settled2<A, B, E>(
    a: Task<A, E>,
    b: Task<B, E>,
) -> impl Future<Output = (Result<A, E>, Result<B, E>)>
where
    A: 'static,
    B: 'static,
    E: 'static,
{
    let a = a.map(Either::Left);
    let b = b.map(Either::Right);
    async move {
        let mut results = all_settled([a, b]).await;
        let second = results.pop().expect("all_settled2 lost a result");
        let first = results.pop().expect("all_settled2 lost a result");
        (first.map(expect_left), second.map(expect_right))
    }
}

/// 两个异构任务的 `any`：首个成功值带着标签返回。
#[track_caller]
pub fn any2<A, B, E>(
    a: Task<A, E>,
    b: Task<B, E>,
) -> impl Future<Output = Result<Either<A, B>, Vec<E>>>
where
    A: 'static,
    B: 'static,
    E: 'static,
{
    let a = a.map(Either::Left);
    let b = b.map(Either::Right);
    any([a, b])
}

/// 三个异构任务的 `any`。
#[track_caller]
pub fn any3<A, B, C, E>(
    a: Task<A, E>,
    b: Task<B, E>,
    c: Task<C, E>,
) -> impl Future<Output = Result<Either3<A, B, C>, Vec<E>>>
where
    A: 'static,
    B: 'static,
    C: 'static,
    E: 'static,
{
    let a = a.map(Either3::A);
    let b = b.map(Either3::B);
    let c = c.map(Either3::C);
    any([a, b, c])
}

/// 两个异构任务的 `race`：首个完成者带着标签返回。
#[track_caller]
pub fn race2<A, B, E>(
    a: Task<A, E>,
    b: Task<B, E>,
) -> impl Future<Output = Result<Either<A, B>, E>>
where
    A: 'static,
    B: 'static,
    E: 'static,
{
    let a = a.map(Either::Left);
    let b = b.map(Either::Right);
    race([a, b])
}

/// 三个异构任务的 `race`。
#[track_caller]
pub fn race3<A, B, C, E>(
    a: Task<A, E>,
    b: Task<B, E>,
    c: Task<C, E>,
) -> impl Future<Output = Result<Either3<A, B, C>, E>>
where
    A: 'static,
    B: 'static,
    C: 'static,
    E: 'static,
{
    let a = a.map(Either3::A);
    let b = b.map(Either3::B);
    let c = c.map(Either3::C);
    race([a, b, c])
}
