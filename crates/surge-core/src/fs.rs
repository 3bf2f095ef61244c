//! 平台文件 I/O 提交器契约。
//!
//! 具体后端（io_uring / IOCP / POSIX AIO 等）由平台适配层实现并通过
//! [`crate::runtime::EventLoopOptions::framework`] 安装；核心只面向本
//! 契约提交定位读写。

use crate::error::IoError;
use crate::runtime::EventLoop;
use async_trait::async_trait;

/// 平台句柄的裸表示，由具体后端解释。
pub type RawHandle = u64;

/// 文件 I/O 提交器。
///
/// # 契约说明（What）
/// - `associate` 把句柄登记到后端（例如绑定完成端口），同一句柄至多
///   登记一次；
/// - `read` / `write` 按绝对偏移提交一次定位 I/O，返回实际传输的字节
///   数；两者都必须可取消，结果经由 `event_loop` 交付。
#[async_trait(?Send)]
pub trait Framework {
    fn associate(&self, handle: RawHandle) -> Result<(), IoError>;

    async fn read(
        &self,
        event_loop: &EventLoop,
        handle: RawHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, IoError>;

    async fn write(
        &self,
        event_loop: &EventLoop,
        handle: RawHandle,
        offset: u64,
        buf: &[u8],
    ) -> Result<usize, IoError>;
}
