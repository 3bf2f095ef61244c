//! 内存双工流：一对互联的字节流端点。
//!
//! 两个端点各自持有一条方向管道的读侧与另一条的写侧；端点是廉价克隆的
//! 句柄，克隆体共享同一连接（这也是 TLS 层与双向拷贝要求的形态）。
//! 只能在所属事件循环的线程内使用。

use super::{AsyncRead, AsyncWrite, Closeable};
use crate::error::IoError;
use crate::sync::Event;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct Pipe {
    buffer: RefCell<BytesMut>,
    capacity: usize,
    closed: Cell<bool>,
    readable: Event,
    writable: Event,
}

impl Pipe {
    fn new(capacity: usize) -> Rc<Pipe> {
        Rc::new(Pipe {
            buffer: RefCell::new(BytesMut::new()),
            capacity,
            closed: Cell::new(false),
            readable: Event::new(),
            writable: Event::new(),
        })
    }

    fn close(&self) {
        self.closed.set(true);
        self.readable.set();
        self.writable.set();
    }
}

/// 互联流对的一端。
#[derive(Clone)]
pub struct DuplexStream {
    read: Rc<Pipe>,
    write: Rc<Pipe>,
    closed: Rc<Cell<bool>>,
}

/// 建一对互联端点；`capacity` 是单方向管道的容量。
pub fn duplex(capacity: usize) -> (DuplexStream, DuplexStream) {
    assert!(capacity >= 1, "duplex capacity must be at least 1");

    let forward = Pipe::new(capacity);
    let backward = Pipe::new(capacity);

    (
        DuplexStream {
            read: Rc::clone(&backward),
            write: Rc::clone(&forward),
            closed: Rc::new(Cell::new(false)),
        },
        DuplexStream {
            read: forward,
            write: backward,
            closed: Rc::new(Cell::new(false)),
        },
    )
}

#[async_trait(?Send)]
impl AsyncRead for DuplexStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        loop {
            if self.closed.get() {
                return Err(IoError::BadFileDescriptor);
            }

            {
                let mut data = self.read.buffer.borrow_mut();
                if !data.is_empty() {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    data.advance(n);
                    self.read.writable.set();
                    return Ok(n);
                }
            }

            if self.read.closed.get() {
                return Ok(0);
            }

            self.read.readable.reset();
            self.read.readable.wait().await.map_err(IoError::from)?;
        }
    }
}

#[async_trait(?Send)]
impl AsyncWrite for DuplexStream {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        loop {
            if self.closed.get() {
                return Err(IoError::BadFileDescriptor);
            }

            if self.write.closed.get() {
                return Err(IoError::BrokenPipe);
            }

            {
                let mut data = self.write.buffer.borrow_mut();
                let space = self.write.capacity - data.len();
                if space > 0 {
                    let n = space.min(buf.len());
                    data.extend_from_slice(&buf[..n]);
                    self.write.readable.set();
                    return Ok(n);
                }
            }

            self.write.writable.reset();
            self.write.writable.wait().await.map_err(IoError::from)?;
        }
    }
}

#[async_trait(?Send)]
impl Closeable for DuplexStream {
    async fn close(&mut self) -> Result<(), IoError> {
        if self.closed.get() {
            return Err(IoError::BadFileDescriptor);
        }

        self.closed.set(true);
        // 写向管道关闭：对端把缓冲读空后观察到流结束。
        self.write.close();
        self.read.close();
        Ok(())
    }
}
