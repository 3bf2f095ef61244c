#![deny(unsafe_code)]
#![doc = "surge-core: 单线程协作式异步 I/O 运行时。"]
#![doc = ""]
#![doc = "核心构件：事件循环（任意线程可唤醒 + 定时回调）、带一等取消语义的"]
#![doc = "结构化任务模型、Promise/Future 单次交会、可取消的同步原语与有界"]
#![doc = "MPMC 通道，以及在读/写/关闭契约之上分层的缓冲与 TLS 流。"]
#![doc = ""]
#![doc = "调度模型是单线程协作式：任务只在显式挂起点让出；阻塞工作经由"]
#![doc = "[`to_thread`] 下放到工作线程池。多个循环可以共存于一个进程，各自"]
#![doc = "钉在独立的线程上。"]

pub mod channel;
pub mod error;
pub mod fs;
pub mod io;
pub mod net;
pub mod prelude;
pub mod promise;
pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use promise::{Future, Promise};
pub use runtime::{
    EventLoop, EventLoopOptions, Handle, get_event_loop, run, set_event_loop, to_thread,
    to_thread_cancellable,
};
pub use task::{Task, TaskGroup, spawn};
pub use time::{sleep, timeout};
