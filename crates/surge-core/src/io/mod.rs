//! 流式 I/O 契约与通用工具。
//!
//! # 设计背景（Why）
//! - 读、写、关闭、定位是四种相互独立的能力，各自成 trait；具体端点按
//!   自身能力选择实现，缓冲层与 TLS 层对着契约组合，不关心底层类型；
//! - 本运行时的端点普遍是廉价克隆的句柄（内部引用计数），双向拷贝与
//!   TLS 的并发读写都建立在这一点之上。
//!
//! # 契约说明（What）
//! - `read` 返回实际读到的字节数，流结束以 `0` 表示；
//! - `write` 允许短写；`write_all` 在短写之间响应取消；
//! - `close` 每个实例幂等：第二次调用返回「坏文件描述符」，之后的读写
//!   一律失败；
//! - `copy` 在整轮「读 + 写全」之间响应取消，写全本身处于锁定区内，
//!   不会留下半截写。

mod binary;
mod buffered;
mod duplex;
mod memory;

pub use binary::{
    read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le, write_u16_be,
    write_u16_le, write_u32_be, write_u32_le, write_u64_be, write_u64_le,
};
pub use buffered::{BufReader, BufWriter, DEFAULT_BUFFER_CAPACITY};
pub use duplex::{DuplexStream, duplex};
pub use memory::MemoryStream;

use crate::error::IoError;
use crate::task;
use async_trait::async_trait;

/// 字节源。
#[async_trait(?Send)]
pub trait AsyncRead {
    /// 读取至多 `buf.len()` 个字节；`0` 表示流结束。
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;

    /// 读满整个缓冲；数据不足时以 [`IoError::UnexpectedEof`] 失败。
    async fn read_exactly(&mut self, buf: &mut [u8]) -> Result<(), IoError> {
        let mut offset = 0;

        while offset < buf.len() {
            let n = self.read(&mut buf[offset..]).await?;
            if n == 0 {
                return Err(IoError::UnexpectedEof);
            }
            offset += n;
        }

        Ok(())
    }

    /// 读到流结束，返回累积的全部字节。
    async fn read_all(&mut self) -> Result<Vec<u8>, IoError> {
        let mut data = Vec::new();
        let mut chunk = [0u8; 8192];

        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&chunk[..n]);
        }
    }
}

/// 字节汇。
#[async_trait(?Send)]
pub trait AsyncWrite {
    /// 写出至多 `buf.len()` 个字节，返回实际写出数。
    async fn write(&mut self, buf: &[u8]) -> Result<usize, IoError>;

    /// 写出整个缓冲；仅在短写之间响应取消。
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), IoError> {
        let mut offset = 0;

        while offset < buf.len() {
            if task::cancelled().await {
                return Err(IoError::Cancelled);
            }

            let n = self.write(&buf[offset..]).await?;
            if n == 0 {
                return Err(IoError::BrokenPipe);
            }
            offset += n;
        }

        Ok(())
    }
}

/// 可关闭端点。
#[async_trait(?Send)]
pub trait Closeable {
    /// 关闭端点；重复关闭返回 [`IoError::BadFileDescriptor`]。
    async fn close(&mut self) -> Result<(), IoError>;
}

/// 随机定位能力。
pub trait Seekable {
    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, IoError>;

    fn rewind(&mut self) -> Result<(), IoError> {
        self.seek(0, Whence::Begin).map(|_| ())
    }

    fn length(&self) -> Result<u64, IoError>;

    fn position(&self) -> Result<u64, IoError>;
}

/// 定位基准。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Begin,
    Current,
    End,
}

/// 把 `reader` 的全部字节按序搬到 `writer`，直到流结束或出错。
///
/// 每轮搬运的「写全」处于锁定区内：取消只在完整的读写轮次之间生效，
/// 不会留下半截写。
pub async fn copy<R, W>(reader: &mut R, writer: &mut W) -> Result<(), IoError>
where
    R: AsyncRead + ?Sized,
    W: AsyncWrite + ?Sized,
{
    let mut chunk = [0u8; 10240];

    loop {
        if task::cancelled().await {
            return Err(IoError::Cancelled);
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }

        task::lock().await;
        let written = writer.write_all(&chunk[..n]).await;
        task::unlock().await;
        written?;
    }
}

/// 双向搬运：任一方向碰到流结束或错误即完成，并取消另一方向。
#[track_caller]
pub fn copy_bidirectional<A, B>(
    first: A,
    second: B,
) -> impl std::future::Future<Output = Result<(), IoError>>
where
    A: AsyncRead + AsyncWrite + Clone + 'static,
    B: AsyncRead + AsyncWrite + Clone + 'static,
{
    let forward = {
        let (first, second) = (first.clone(), second.clone());
        async move {
            let (mut reader, mut writer) = (first, second);
            copy(&mut reader, &mut writer).await
        }
    };
    let backward = async move {
        let (mut reader, mut writer) = (second, first);
        copy(&mut reader, &mut writer).await
    };

    async move {
        let forward = task::spawn(forward);
        let backward = task::spawn(backward);
        task::race2(forward, backward).await.map(|_| ())
    }
}
