//! 纯缓冲驱动的 TLS 引擎。
//!
//! # 设计背景（Why）
//! - 会话对象永远不直接接触网络：明文与密文都经由会话内部的一对内存
//!   缓冲（rustls 的 `read_tls` / `write_tls` 即输入/输出侧），引擎负责
//!   在底层字节流与这对缓冲之间搬运；
//! - 同一连接上可能同时有读方向与写方向的任务在泵数据，两个搬运方向
//!   各配一把协程互斥锁串行化对共享会话缓冲的访问。
//!
//! # 逻辑解析（How）
//! - `transfer_in`：从底层流读至多 10 KiB 喂给会话输入侧。入方向互斥锁
//!   采用「先试探」：发现已有持锁者时，排队等它结束后直接返回——外层
//!   调用者自会把数据喂进来，避免握手与并发读之间的活锁；
//! - `transfer_out`：把会话输出侧攒下的密文全部写到底层流，由独立的
//!   出方向互斥锁串行化；
//! - `handshake` / `read` / `write` 都是同一个泵循环：推进会话状态，按
//!   「要写就先冲出去、要读就喂进来」的次序搬运，直到拿到结果或出错。
//!
//! # 契约说明（What）
//! - 明文读到 `0` 表示对端完成半关闭（close_notify），引擎回应半关闭并
//!   向调用方报告流结束；
//! - 底层流在 TLS 记录中途终止时报告 [`TlsError::UnexpectedEof`]，与
//!   普通 I/O 错误区分；
//! - `close` 发出 close_notify、冲净输出侧，然后关闭底层流。

use crate::error::{IoError, TlsError};
use crate::io::{AsyncRead, AsyncWrite, Closeable};
use crate::sync::Mutex;
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, SupportedProtocolVersion};
use std::cell::{Cell, RefCell};
use std::io::ErrorKind;
use std::rc::Rc;
use std::sync::Arc;
use tracing::warn;

const TRANSFER_CHUNK: usize = 10240;

/// 支持的协议版本。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Tls12,
    Tls13,
}

impl Version {
    fn supported(self) -> &'static SupportedProtocolVersion {
        match self {
            Version::Tls12 => &rustls::version::TLS12,
            Version::Tls13 => &rustls::version::TLS13,
        }
    }
}

fn protocol_versions(min: Version, max: Version) -> Vec<&'static SupportedProtocolVersion> {
    match (min, max) {
        (Version::Tls12, Version::Tls13) => {
            vec![Version::Tls13.supported(), Version::Tls12.supported()]
        }
        (Version::Tls12, Version::Tls12) => vec![Version::Tls12.supported()],
        _ => vec![Version::Tls13.supported()],
    }
}

/// DER 编码的证书。
#[derive(Clone, Debug)]
pub struct Certificate {
    der: CertificateDer<'static>,
}

impl Certificate {
    pub fn from_der(der: Vec<u8>) -> Self {
        Certificate {
            der: CertificateDer::from(der),
        }
    }
}

/// PKCS#8 DER 编码的私钥。
#[derive(Debug)]
pub struct PrivateKey {
    der: PrivateKeyDer<'static>,
}

impl PrivateKey {
    pub fn from_pkcs8_der(der: Vec<u8>) -> Result<Self, TlsError> {
        PrivateKeyDer::try_from(der)
            .map(|der| PrivateKey { der })
            .map_err(|_| TlsError::Io(IoError::InvalidArgument))
    }
}

/// 证书与私钥的配对。
#[derive(Debug)]
pub struct CertKeyPair {
    pub certs: Vec<Certificate>,
    pub key: PrivateKey,
}

fn root_store(roots: &[Certificate]) -> Result<RootCertStore, TlsError> {
    let mut store = RootCertStore::empty();
    for root in roots {
        store.add(root.der.clone()).map_err(TlsError::Session)?;
    }
    Ok(store)
}

fn cert_chain(pair: &CertKeyPair) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let certs = pair.certs.iter().map(|cert| cert.der.clone()).collect();
    let key = pair.key.der.clone_key();
    (certs, key)
}

/// 客户端侧配置。
///
/// 服务器证书始终按 `roots` 验证；提供 `identity` 时响应对端的客户端
/// 证书请求（双向认证）。
pub struct ClientConfig {
    min_version: Version,
    max_version: Version,
    roots: Vec<Certificate>,
    identity: Option<CertKeyPair>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            min_version: Version::Tls12,
            max_version: Version::Tls13,
            roots: Vec::new(),
            identity: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        ClientConfig::default()
    }

    pub fn min_version(mut self, version: Version) -> Self {
        self.min_version = version;
        self
    }

    pub fn max_version(mut self, version: Version) -> Self {
        self.max_version = version;
        self
    }

    /// 追加受信任的根证书。
    pub fn root_ca(mut self, certificate: Certificate) -> Self {
        self.roots.push(certificate);
        self
    }

    /// 配置客户端证书（双向认证）。
    pub fn identity(mut self, pair: CertKeyPair) -> Self {
        self.identity = Some(pair);
        self
    }

    pub fn build(self) -> Result<Arc<rustls::ClientConfig>, TlsError> {
        let versions = protocol_versions(self.min_version, self.max_version);
        let builder = rustls::ClientConfig::builder_with_protocol_versions(&versions)
            .with_root_certificates(root_store(&self.roots)?);

        let config = match &self.identity {
            Some(pair) => {
                let (certs, key) = cert_chain(pair);
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(TlsError::Session)?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}

/// 服务端侧配置。
///
/// `client_roots` 非空时强制验证客户端证书。
pub struct ServerConfig {
    min_version: Version,
    max_version: Version,
    client_roots: Vec<Certificate>,
    identity: CertKeyPair,
}

impl ServerConfig {
    pub fn new(identity: CertKeyPair) -> Self {
        ServerConfig {
            min_version: Version::Tls12,
            max_version: Version::Tls13,
            client_roots: Vec::new(),
            identity,
        }
    }

    pub fn min_version(mut self, version: Version) -> Self {
        self.min_version = version;
        self
    }

    pub fn max_version(mut self, version: Version) -> Self {
        self.max_version = version;
        self
    }

    /// 追加用于验证客户端证书的根；非空即开启双向认证。
    pub fn client_root_ca(mut self, certificate: Certificate) -> Self {
        self.client_roots.push(certificate);
        self
    }

    pub fn build(self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        let versions = protocol_versions(self.min_version, self.max_version);
        let builder = rustls::ServerConfig::builder_with_protocol_versions(&versions);

        let builder = if self.client_roots.is_empty() {
            builder.with_no_client_auth()
        } else {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(&self.client_roots)?))
                .build()
                .map_err(|error| {
                    warn!(%error, "client certificate verifier rejected configuration");
                    TlsError::Io(IoError::InvalidArgument)
                })?;
            builder.with_client_cert_verifier(verifier)
        };

        let (certs, key) = cert_chain(&self.identity);
        let config = builder
            .with_single_cert(certs, key)
            .map_err(TlsError::Session)?;

        Ok(Arc::new(config))
    }
}

struct TlsInner<S> {
    session: RefCell<rustls::Connection>,
    reader: RefCell<S>,
    writer: RefCell<S>,
    in_mutex: Mutex,
    out_mutex: Mutex,
    shutdown_sent: Cell<bool>,
}

/// 叠在任意字节流之上的 TLS 流。
///
/// 端点是廉价克隆的句柄；读方向与写方向可以由不同任务并发驱动，内部
/// 的两把搬运互斥锁保证共享会话不被交叉访问。
pub struct TlsStream<S> {
    inner: Rc<TlsInner<S>>,
}

impl<S> Clone for TlsStream<S> {
    fn clone(&self) -> Self {
        TlsStream {
            inner: Rc::clone(&self.inner),
        }
    }
}

enum ReadStep {
    Data(usize),
    Eof,
    NeedInput,
}

impl<S> TlsStream<S>
where
    S: AsyncRead + AsyncWrite + Closeable + Clone + 'static,
{
    fn new(stream: S, session: rustls::Connection) -> Self {
        TlsStream {
            inner: Rc::new(TlsInner {
                session: RefCell::new(session),
                reader: RefCell::new(stream.clone()),
                writer: RefCell::new(stream),
                in_mutex: Mutex::new(),
                out_mutex: Mutex::new(),
                shutdown_sent: Cell::new(false),
            }),
        }
    }

    /// 从底层流搬一批密文喂给会话输入侧。
    ///
    /// 入方向互斥锁先试探：已有持锁者时，等它结束后直接返回——外层
    /// 调用者会替嵌套者完成喂入。
    async fn transfer_in(&self) -> Result<(), TlsError> {
        let busy = self.inner.in_mutex.locked();
        let _guard = self.inner.in_mutex.guard().await?;

        if busy {
            return Ok(());
        }

        let mut data = [0u8; TRANSFER_CHUNK];
        let n = {
            let mut reader = self.inner.reader.borrow_mut();
            reader.read(&mut data).await.map_err(TlsError::Io)?
        };

        if n == 0 {
            return Err(TlsError::UnexpectedEof);
        }

        let mut remaining = &data[..n];
        while !remaining.is_empty() {
            let mut session = self.inner.session.borrow_mut();
            session
                .read_tls(&mut remaining)
                .map_err(|_| TlsError::Io(IoError::Busy))?;
            session.process_new_packets().map_err(TlsError::Session)?;
        }

        Ok(())
    }

    /// 把会话输出侧攒下的密文全部写到底层流。
    async fn transfer_out(&self) -> Result<(), TlsError> {
        let _guard = self.inner.out_mutex.guard().await?;

        loop {
            let mut chunk = Vec::new();
            {
                let mut session = self.inner.session.borrow_mut();
                if !session.wants_write() {
                    break;
                }
                session
                    .write_tls(&mut chunk)
                    .map_err(|_| TlsError::Io(IoError::Busy))?;
            }

            if chunk.is_empty() {
                break;
            }

            let mut writer = self.inner.writer.borrow_mut();
            writer.write_all(&chunk).await.map_err(TlsError::Io)?;
        }

        Ok(())
    }

    /// 推进握手直到完成或出错。
    pub async fn handshake(&self) -> Result<(), TlsError> {
        loop {
            let (handshaking, wants_write) = {
                let session = self.inner.session.borrow();
                (session.is_handshaking(), session.wants_write())
            };

            if !handshaking {
                break;
            }

            if wants_write {
                self.transfer_out().await?;
                continue;
            }

            self.transfer_in().await?;
        }

        // 末班飞行数据（如会话票据）一并冲出去。
        self.transfer_out().await
    }

    /// 读取明文；`0` 表示对端完成半关闭。
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TlsError> {
        loop {
            let step = {
                let mut session = self.inner.session.borrow_mut();
                match std::io::Read::read(&mut session.reader(), buf) {
                    Ok(0) => ReadStep::Eof,
                    Ok(n) => ReadStep::Data(n),
                    Err(error) if error.kind() == ErrorKind::WouldBlock => ReadStep::NeedInput,
                    Err(error) if error.kind() == ErrorKind::UnexpectedEof => {
                        return Err(TlsError::UnexpectedEof);
                    }
                    Err(_) => return Err(TlsError::Io(IoError::NotSupported)),
                }
            };

            match step {
                ReadStep::Data(n) => {
                    self.transfer_out().await?;
                    return Ok(n);
                }
                ReadStep::Eof => {
                    // 对端半关闭：尽力回应 close_notify（对端可能已经整个
                    // 离场），随后向上报告流结束。
                    if !self.inner.shutdown_sent.replace(true) {
                        self.inner.session.borrow_mut().send_close_notify();
                    }
                    let _ = self.transfer_out().await;
                    return Ok(0);
                }
                ReadStep::NeedInput => {
                    self.transfer_out().await?;
                    self.transfer_in().await?;
                }
            }
        }
    }

    /// 写出明文并冲洗产生的密文。
    pub async fn write(&self, buf: &[u8]) -> Result<usize, TlsError> {
        let n = {
            let mut session = self.inner.session.borrow_mut();
            std::io::Write::write(&mut session.writer(), buf)
                .map_err(|_| TlsError::Io(IoError::NotEnoughMemory))?
        };

        self.transfer_out().await?;
        Ok(n)
    }

    /// 发起关闭：close_notify、冲净输出、关闭底层流。
    pub async fn close(&self) -> Result<(), TlsError> {
        if !self.inner.shutdown_sent.replace(true) {
            self.inner.session.borrow_mut().send_close_notify();
        }

        self.transfer_out().await?;

        // 出方向互斥锁隔开并发的 transfer_out 与底层关闭。
        let _guard = self.inner.out_mutex.guard().await?;
        let mut writer = self.inner.writer.borrow_mut();
        writer.close().await.map_err(TlsError::Io)?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl<S> AsyncRead for TlsStream<S>
where
    S: AsyncRead + AsyncWrite + Closeable + Clone + 'static,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        TlsStream::read(self, buf).await.map_err(downgrade)
    }
}

#[async_trait(?Send)]
impl<S> AsyncWrite for TlsStream<S>
where
    S: AsyncRead + AsyncWrite + Closeable + Clone + 'static,
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        TlsStream::write(self, buf).await.map_err(downgrade)
    }
}

#[async_trait(?Send)]
impl<S> Closeable for TlsStream<S>
where
    S: AsyncRead + AsyncWrite + Closeable + Clone + 'static,
{
    async fn close(&mut self) -> Result<(), IoError> {
        TlsStream::close(self).await.map_err(downgrade)
    }
}

fn downgrade(error: TlsError) -> IoError {
    match error {
        TlsError::UnexpectedEof => IoError::UnexpectedEof,
        TlsError::Io(inner) => inner,
        TlsError::Session(_) => IoError::NotSupported,
    }
}

/// 以客户端身份在 `stream` 之上建立 TLS。
///
/// `server_name` 同时用于 SNI 与主机名校验，必须提供。
pub async fn connect<S>(
    stream: S,
    config: Arc<rustls::ClientConfig>,
    server_name: impl Into<String>,
) -> Result<TlsStream<S>, TlsError>
where
    S: AsyncRead + AsyncWrite + Closeable + Clone + 'static,
{
    let name = ServerName::try_from(server_name.into())
        .map_err(|_| TlsError::Io(IoError::InvalidArgument))?;

    let session = rustls::ClientConnection::new(config, name).map_err(TlsError::Session)?;
    let tls = TlsStream::new(stream, rustls::Connection::from(session));

    if let Err(error) = tls.handshake().await {
        warn!(?error, "tls client handshake failed");
        return Err(error);
    }

    Ok(tls)
}

/// 以服务端身份在 `stream` 之上建立 TLS。
pub async fn accept<S>(
    stream: S,
    config: Arc<rustls::ServerConfig>,
) -> Result<TlsStream<S>, TlsError>
where
    S: AsyncRead + AsyncWrite + Closeable + Clone + 'static,
{
    let session = rustls::ServerConnection::new(config).map_err(TlsError::Session)?;
    let tls = TlsStream::new(stream, rustls::Connection::from(session));

    if let Err(error) = tls.handshake().await {
        warn!(?error, "tls server handshake failed");
        return Err(error);
    }

    Ok(tls)
}
