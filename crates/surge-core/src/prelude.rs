//! 常用项的一站式导入。

pub use crate::channel::{Channel, Receiver, Sender, channel, channel_with};
pub use crate::error::{
    Category, Condition as ErrorCondition, Elapsed, ErrorCode, IoError, ReceiveError,
    ReceiveSyncError, RunError, SendError, SendSyncError, TaskError, TlsError, TryReceiveError,
    TrySendError,
};
pub use crate::io::{
    AsyncRead, AsyncWrite, BufReader, BufWriter, Closeable, DuplexStream, MemoryStream, Seekable,
    Whence, copy, copy_bidirectional, duplex,
};
pub use crate::net::{Acceptor, Listener, listener};
pub use crate::promise::{Future, Promise};
pub use crate::runtime::{
    EventLoop, EventLoopOptions, Handle, get_event_loop, run, set_event_loop, to_thread,
    to_thread_cancellable,
};
pub use crate::sync::{Condition, Event, Mutex, MutexGuard};
pub use crate::task::{
    Either, Either3, Task, TaskGroup, all, all2, all3, all_settled, all_settled2, any, any2, any3,
    backtrace, cancellable, cancelled, from_future, lock, race, race2, race3, spawn, unlock,
};
pub use crate::time::{sleep, timeout};
