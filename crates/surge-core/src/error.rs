//! 运行时统一错误域。
//!
//! # 设计背景（Why）
//! - 调度器、通道、I/O 与 TLS 各自拥有独立的失败语义，但日志、指标与上层
//!   容错策略需要一个稳定、可机读的错误编号空间；
//! - 因此每个错误枚举都携带「类别标签 + 域内序号」组成的 32 位稳定码，并
//!   通过 [`Condition`] 将语义兼容的错误聚合成可跨域匹配的条件组。
//!
//! # 契约说明（What）
//! - `code()` 返回 `(category << 16) | index`，在次要版本内保持稳定；
//! - `condition()` 返回语义分组，调用方可按码值或按条件匹配；
//! - 可恢复错误一律以 `Result` 返回；契约违规（双重 resolve、越界 unlock）
//!   视为致命错误并直接 panic。

use thiserror::Error;

/// 错误类别，占据稳定码的高 16 位。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Category {
    Task = 1,
    Io = 2,
    Channel = 3,
    Timeout = 4,
    Tls = 5,
}

/// 跨域错误条件，将语义兼容的错误码聚合为一组。
///
/// # 契约说明（What）
/// - 一个条件可以覆盖多个域的多个码值，例如发送端与接收端的
///   `Disconnected` 共享 [`Condition::Disconnected`]；
/// - 条件集合允许在次要版本中增加新成员，但既有映射不变。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Condition {
    /// 操作被任务取消打断。
    Cancelled,
    /// 非阻塞操作当前无法推进（队列满/空）。
    WouldBlock,
    /// 在截止时间内未完成。
    TimedOut,
    /// 对端已经关闭或句柄已失效。
    Disconnected,
    /// 数据在预期长度之前终止。
    UnexpectedEof,
    /// 请求的能力不被支持。
    NotSupported,
    /// 当前状态不允许该操作。
    NotPermitted,
    /// 参数不合法。
    InvalidArgument,
    /// 资源暂时不可用。
    Busy,
}

/// 稳定错误码的公共视图。
pub trait ErrorCode {
    /// 所属类别。
    fn category(&self) -> Category;

    /// 域内序号（低 16 位）。
    fn index(&self) -> u16;

    /// 聚合条件；并非所有错误都落在某个条件组内。
    fn condition(&self) -> Option<Condition>;

    /// 类别打标后的 32 位稳定码。
    fn code(&self) -> u32 {
        (self.category() as u32) << 16 | u32::from(self.index())
    }
}

/// 任务与取消机制的错误域。
///
/// # 契约说明（What）
/// - `Cancelled`：当前挂起点被取消钩子中断，取消语义已经生效；
/// - `CancellationNotSupported`：当前挂起点没有安装取消钩子，标记已置位，
///   将在下一个可取消挂起点生效；
/// - `Locked`：帧处于锁定区，取消被吸收并推迟到解锁之后；
/// - `CancellationTooLate`：取消到达时挂起点的结果已经就绪；
/// - `AlreadyCompleted` / `WillBeDone`：任务已经（或即将）带着既有结果结束，
///   取消不再改变结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,
    #[error("task does not support cancellation")]
    CancellationNotSupported,
    #[error("task is locked")]
    Locked,
    #[error("cancellation is too late")]
    CancellationTooLate,
    #[error("task is already completed")]
    AlreadyCompleted,
    #[error("task will be done")]
    WillBeDone,
}

impl ErrorCode for TaskError {
    fn category(&self) -> Category {
        Category::Task
    }

    fn index(&self) -> u16 {
        match self {
            TaskError::Cancelled => 1,
            TaskError::CancellationNotSupported => 2,
            TaskError::Locked => 3,
            TaskError::CancellationTooLate => 4,
            TaskError::AlreadyCompleted => 5,
            TaskError::WillBeDone => 6,
        }
    }

    fn condition(&self) -> Option<Condition> {
        match self {
            TaskError::Cancelled => Some(Condition::Cancelled),
            TaskError::CancellationNotSupported => Some(Condition::NotSupported),
            TaskError::Locked => Some(Condition::Busy),
            TaskError::CancellationTooLate
            | TaskError::AlreadyCompleted
            | TaskError::WillBeDone => Some(Condition::NotPermitted),
        }
    }
}

/// 流式 I/O 的错误域。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("device or resource busy")]
    Busy,
    #[error("timed out")]
    TimedOut,
    #[error("operation not supported")]
    NotSupported,
    #[error("not enough memory")]
    NotEnoughMemory,
    #[error("address family not supported")]
    AddressFamilyNotSupported,
    #[error("operation cancelled")]
    Cancelled,
}

impl ErrorCode for IoError {
    fn category(&self) -> Category {
        Category::Io
    }

    fn index(&self) -> u16 {
        match self {
            IoError::UnexpectedEof => 1,
            IoError::BrokenPipe => 2,
            IoError::InvalidArgument => 3,
            IoError::BadFileDescriptor => 4,
            IoError::Busy => 5,
            IoError::TimedOut => 6,
            IoError::NotSupported => 7,
            IoError::NotEnoughMemory => 8,
            IoError::AddressFamilyNotSupported => 9,
            IoError::Cancelled => 10,
        }
    }

    fn condition(&self) -> Option<Condition> {
        match self {
            IoError::UnexpectedEof => Some(Condition::UnexpectedEof),
            IoError::BrokenPipe | IoError::BadFileDescriptor => Some(Condition::Disconnected),
            IoError::InvalidArgument => Some(Condition::InvalidArgument),
            IoError::Busy => Some(Condition::Busy),
            IoError::TimedOut => Some(Condition::TimedOut),
            IoError::NotSupported | IoError::AddressFamilyNotSupported => {
                Some(Condition::NotSupported)
            }
            IoError::NotEnoughMemory => None,
            IoError::Cancelled => Some(Condition::Cancelled),
        }
    }
}

impl From<TaskError> for IoError {
    fn from(value: TaskError) -> Self {
        match value {
            TaskError::Cancelled => IoError::Cancelled,
            TaskError::Locked => IoError::Busy,
            _ => IoError::NotSupported,
        }
    }
}

macro_rules! channel_errors {
    ($($(#[$doc:meta])* $name:ident { $($variant:ident => ($index:expr, $cond:expr, $text:literal),)+ })+) => {
        $(
            $(#[$doc])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
            pub enum $name {
                $(
                    #[error($text)]
                    $variant,
                )+
            }

            impl ErrorCode for $name {
                fn category(&self) -> Category {
                    Category::Channel
                }

                fn index(&self) -> u16 {
                    match self {
                        $($name::$variant => $index,)+
                    }
                }

                fn condition(&self) -> Option<Condition> {
                    match self {
                        $($name::$variant => Some($cond),)+
                    }
                }
            }
        )+
    };
}

channel_errors! {
    /// 非阻塞发送的失败原因。
    TrySendError {
        Disconnected => (1, Condition::Disconnected, "sending on a disconnected channel"),
        Full => (2, Condition::WouldBlock, "sending on a full channel"),
    }
    /// 同步（OS 线程阻塞式）发送的失败原因。
    SendSyncError {
        Disconnected => (3, Condition::Disconnected, "sending on a disconnected channel"),
        Timeout => (4, Condition::TimedOut, "timed out waiting on send operation"),
    }
    /// 协程式发送的失败原因。
    SendError {
        Disconnected => (5, Condition::Disconnected, "sending on a disconnected channel"),
        Cancelled => (6, Condition::Cancelled, "send operation has been cancelled"),
    }
    /// 非阻塞接收的失败原因。
    TryReceiveError {
        Disconnected => (7, Condition::Disconnected, "receiving on an empty and disconnected channel"),
        Empty => (8, Condition::WouldBlock, "receiving on an empty channel"),
    }
    /// 同步（OS 线程阻塞式）接收的失败原因。
    ReceiveSyncError {
        Disconnected => (9, Condition::Disconnected, "channel is empty and disconnected"),
        Timeout => (10, Condition::TimedOut, "timed out waiting on receive operation"),
    }
    /// 协程式接收的失败原因。
    ReceiveError {
        Disconnected => (11, Condition::Disconnected, "channel is empty and disconnected"),
        Cancelled => (12, Condition::Cancelled, "receive operation has been cancelled"),
    }
}

/// 超时组合子的唯一错误：截止时间先于任务完成到达。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("deadline has elapsed")]
pub struct Elapsed;

impl ErrorCode for Elapsed {
    fn category(&self) -> Category {
        Category::Timeout
    }

    fn index(&self) -> u16 {
        1
    }

    fn condition(&self) -> Option<Condition> {
        Some(Condition::TimedOut)
    }
}

/// TLS 引擎的错误域。
///
/// `UnexpectedEof` 与普通 I/O 错误分开：前者表示底层流在 TLS 记录中途
/// 终止，后者原样携带底层流的失败原因。
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("io error: {0}")]
    Io(#[from] IoError),
    #[error("tls session error: {0}")]
    Session(rustls::Error),
}

impl ErrorCode for TlsError {
    fn category(&self) -> Category {
        Category::Tls
    }

    fn index(&self) -> u16 {
        match self {
            TlsError::UnexpectedEof => 1,
            TlsError::Io(_) => 2,
            TlsError::Session(_) => 3,
        }
    }

    fn condition(&self) -> Option<Condition> {
        match self {
            TlsError::UnexpectedEof => Some(Condition::UnexpectedEof),
            TlsError::Io(inner) => inner.condition(),
            TlsError::Session(_) => None,
        }
    }
}

impl From<TaskError> for TlsError {
    fn from(value: TaskError) -> Self {
        TlsError::Io(IoError::from(value))
    }
}

/// `run` 入口自身的失败原因，与根任务的业务结果分属两个通道。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("current thread is already bound to an event loop")]
    AlreadyBound,
    #[error("event loop stopped before the root task settled")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_category_tagged() {
        assert_eq!(TaskError::Cancelled.code(), 0x0001_0001, "任务域占据高 16 位的类别 1");
        assert_eq!(IoError::UnexpectedEof.code(), 0x0002_0001);
        assert_eq!(TrySendError::Full.code(), 0x0003_0002);
        assert_eq!(Elapsed.code(), 0x0004_0001);
    }

    #[test]
    fn disconnected_condition_spans_both_sides() {
        let all = [
            TrySendError::Disconnected.condition(),
            SendSyncError::Disconnected.condition(),
            SendError::Disconnected.condition(),
            TryReceiveError::Disconnected.condition(),
            ReceiveSyncError::Disconnected.condition(),
            ReceiveError::Disconnected.condition(),
        ];
        assert!(
            all.iter().all(|c| *c == Some(Condition::Disconnected)),
            "所有断开错误必须聚合到同一个条件组"
        );
    }

    #[test]
    fn cancellation_maps_into_io_domain() {
        assert_eq!(IoError::from(TaskError::Cancelled), IoError::Cancelled);
        assert_eq!(
            IoError::from(TaskError::CancellationNotSupported),
            IoError::NotSupported
        );
    }
}
