//! 缓冲读写适配器。

use super::{AsyncRead, AsyncWrite, Closeable};
use crate::error::IoError;
use crate::task;
use async_trait::async_trait;

/// 缓冲适配器的默认容量。
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024 * 1024;

/// 任意读端之上的缓冲适配器。
///
/// # 逻辑解析（How）
/// - 内部缓冲用 `(head, tail)` 两个游标界定有效区间；`read` 先从缓冲
///   拷贝，缓冲空时用一次底层读填充；
/// - 调用方的请求不小于缓冲容量时完全绕过缓冲，直接读底层；
/// - `read_line` / `read_until` / `peek` 在缓冲之上提供按分隔符与前瞻
///   的消费方式。
pub struct BufReader<R> {
    inner: R,
    buffer: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl<R: AsyncRead> BufReader<R> {
    pub fn new(inner: R) -> Self {
        BufReader::with_capacity(inner, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        assert!(capacity >= 1, "buffer capacity must be at least 1");
        BufReader {
            inner,
            buffer: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// 缓冲中尚未消费的字节数。
    pub fn available(&self) -> usize {
        self.tail - self.head
    }

    /// 缓冲容量。
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// 取回底层读端；缓冲中未消费的字节随之丢弃。
    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn fill(&mut self) -> Result<usize, IoError> {
        self.head = 0;
        self.tail = 0;

        let n = self.inner.read(&mut self.buffer).await?;
        self.tail = n;
        Ok(n)
    }

    /// 读取一行：以 LF 或 CRLF 结尾，结尾的 CR 被剥除。
    ///
    /// 分隔符出现之前流就结束时返回 [`IoError::UnexpectedEof`]。
    pub async fn read_line(&mut self) -> Result<String, IoError> {
        let mut data = self.read_until(b'\n').await?;

        if data.last() == Some(&b'\r') {
            data.pop();
        }

        String::from_utf8(data).map_err(|_| IoError::InvalidArgument)
    }

    /// 读到 `delimiter` 为止；分隔符被消费但不包含在返回值中。
    pub async fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>, IoError> {
        let mut data = Vec::new();

        loop {
            let window = &self.buffer[self.head..self.tail];

            if let Some(index) = window.iter().position(|&byte| byte == delimiter) {
                data.extend_from_slice(&window[..index]);
                self.head += index + 1;
                return Ok(data);
            }

            data.extend_from_slice(window);

            if self.fill().await? == 0 {
                return Err(IoError::UnexpectedEof);
            }
        }
    }

    /// 填充缓冲直到覆盖 `out.len()` 个字节并拷出，不消费。
    ///
    /// 请求超过缓冲容量时返回 [`IoError::InvalidArgument`]。
    pub async fn peek(&mut self, out: &mut [u8]) -> Result<(), IoError> {
        if out.len() > self.buffer.len() {
            return Err(IoError::InvalidArgument);
        }

        if self.available() < out.len() {
            // 压缩到缓冲头部，腾出尾部空间继续填充。
            if self.head > 0 {
                let available = self.available();
                self.buffer.copy_within(self.head..self.tail, 0);
                self.head = 0;
                self.tail = available;
            }

            while self.tail < out.len() {
                let n = self.inner.read(&mut self.buffer[self.tail..]).await?;
                if n == 0 {
                    return Err(IoError::UnexpectedEof);
                }
                self.tail += n;
            }
        }

        out.copy_from_slice(&self.buffer[self.head..self.head + out.len()]);
        Ok(())
    }
}

#[async_trait(?Send)]
impl<R: AsyncRead> AsyncRead for BufReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        if self.available() == 0 {
            // 大请求直接穿透，避免双重拷贝。
            if buf.len() >= self.buffer.len() {
                return self.inner.read(buf).await;
            }

            if self.fill().await? == 0 {
                return Ok(0);
            }
        }

        let n = self.available().min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[self.head..self.head + n]);
        self.head += n;

        Ok(n)
    }
}

#[async_trait(?Send)]
impl<R: AsyncRead + Closeable> Closeable for BufReader<R> {
    async fn close(&mut self) -> Result<(), IoError> {
        self.inner.close().await
    }
}

/// 任意写端之上的缓冲适配器。
///
/// `write` 先进内部缓冲，写满或显式 `flush` 时冲到底层；冲洗在短写之间
/// 响应取消，剩余字节压缩回缓冲头部，不会丢失。
pub struct BufWriter<W> {
    inner: W,
    buffer: Box<[u8]>,
    pending: usize,
}

impl<W: AsyncWrite> BufWriter<W> {
    pub fn new(inner: W) -> Self {
        BufWriter::with_capacity(inner, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(inner: W, capacity: usize) -> Self {
        assert!(capacity >= 1, "buffer capacity must be at least 1");
        BufWriter {
            inner,
            buffer: vec![0u8; capacity].into_boxed_slice(),
            pending: 0,
        }
    }

    /// 缓冲中尚未冲洗的字节数。
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// 缓冲容量。
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// 取回底层写端；缓冲中未冲洗的字节随之丢弃。
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// 把缓冲内容全部写到底层。
    ///
    /// 取消或错误发生时，已写出的部分不再回滚，剩余字节压缩到缓冲头部
    /// 等待下一次冲洗。
    pub async fn flush(&mut self) -> Result<(), IoError> {
        let mut result = Ok(());
        let mut offset = 0;

        while offset < self.pending {
            if task::cancelled().await {
                result = Err(IoError::Cancelled);
                break;
            }

            match self.inner.write(&self.buffer[offset..self.pending]).await {
                Ok(n) => offset += n,
                Err(error) => {
                    result = Err(error);
                    break;
                }
            }
        }

        if offset > 0 && offset < self.pending {
            self.buffer.copy_within(offset..self.pending, 0);
        }
        self.pending -= offset;

        result
    }
}

#[async_trait(?Send)]
impl<W: AsyncWrite> AsyncWrite for BufWriter<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        let mut written = 0;

        while written < buf.len() {
            if self.pending == self.buffer.len() {
                match self.flush().await {
                    Ok(()) => continue,
                    Err(error) => {
                        if written > 0 {
                            break;
                        }
                        return Err(error);
                    }
                }
            }

            let n = (self.buffer.len() - self.pending).min(buf.len() - written);
            self.buffer[self.pending..self.pending + n].copy_from_slice(&buf[written..written + n]);

            self.pending += n;
            written += n;
        }

        Ok(written)
    }
}

#[async_trait(?Send)]
impl<W: AsyncWrite + Closeable> Closeable for BufWriter<W> {
    async fn close(&mut self) -> Result<(), IoError> {
        self.flush().await?;
        self.inner.close().await
    }
}
