//! 内存字节流：同时具备读、写、定位能力的测试与拼装用端点。

use super::{AsyncRead, AsyncWrite, Closeable, Seekable, Whence};
use crate::error::IoError;
use async_trait::async_trait;

/// 全内存流，读写共用一个游标。
#[derive(Default)]
pub struct MemoryStream {
    data: Vec<u8>,
    position: usize,
    closed: bool,
}

impl MemoryStream {
    pub fn new() -> Self {
        MemoryStream::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        MemoryStream {
            data,
            position: 0,
            closed: false,
        }
    }

    /// 取回内部缓冲。
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn ensure_open(&self) -> Result<(), IoError> {
        if self.closed {
            Err(IoError::BadFileDescriptor)
        } else {
            Ok(())
        }
    }
}

#[async_trait(?Send)]
impl AsyncRead for MemoryStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        self.ensure_open()?;

        let remaining = self.data.len().saturating_sub(self.position);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;

        Ok(n)
    }
}

#[async_trait(?Send)]
impl AsyncWrite for MemoryStream {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        self.ensure_open()?;

        let end = self.position + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.position..end].copy_from_slice(buf);
        self.position = end;

        Ok(buf.len())
    }
}

#[async_trait(?Send)]
impl Closeable for MemoryStream {
    async fn close(&mut self) -> Result<(), IoError> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}

impl Seekable for MemoryStream {
    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, IoError> {
        self.ensure_open()?;

        let base = match whence {
            Whence::Begin => 0i64,
            Whence::Current => self.position as i64,
            Whence::End => self.data.len() as i64,
        };

        let target = base.checked_add(offset).ok_or(IoError::InvalidArgument)?;
        if target < 0 {
            return Err(IoError::InvalidArgument);
        }

        self.position = target as usize;
        Ok(self.position as u64)
    }

    fn length(&self) -> Result<u64, IoError> {
        self.ensure_open()?;
        Ok(self.data.len() as u64)
    }

    fn position(&self) -> Result<u64, IoError> {
        self.ensure_open()?;
        Ok(self.position as u64)
    }
}
