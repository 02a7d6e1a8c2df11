//! 传输层
//!
//! 帧协议只依赖 [`Transport`] 提供的读写两端，TCP 是目前唯一的实现。

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Result, WireError};
use crate::CONNECT_TIMEOUT;

/// 套接字选项
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// 解析地址加建立连接的总时限
    pub connect_timeout: Duration,
    /// TCP_NODELAY
    pub nodelay: bool,
    /// 单帧读取时限，`None` 表示一直等待
    ///
    /// 超时按连接关闭处理，而不是分发错误。
    pub read_timeout: Option<Duration>,
}

impl TransportConfig {
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            nodelay: true,
            read_timeout: None,
        }
    }
}

/// 一条已建立的双向字节流
pub trait Transport: Send + Sized {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// 连接到 `host:port`
    fn connect(
        host: &str,
        port: u16,
        config: &TransportConfig,
    ) -> impl Future<Output = Result<Self>> + Send;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// 拆成可以分别移交给读写任务的两端
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// 服务端监听套接字
pub trait TransportListener: Send + Sync + Sized {
    type Transport: Transport;

    fn bind(host: &str, port: u16) -> impl Future<Output = Result<Self>> + Send;

    /// 等待下一条入站连接，并按 `config` 设置套接字选项
    fn accept(
        &self,
        config: &TransportConfig,
    ) -> impl Future<Output = Result<Self::Transport>> + Send;

    fn local_addr(&self) -> Result<SocketAddr>;
}

/// TCP 连接
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl TcpTransport {
    /// 包装已建立的 TcpStream
    pub fn from_stream(stream: TcpStream, nodelay: bool) -> Result<Self> {
        stream.set_nodelay(nodelay)?;
        Ok(Self {
            peer: stream.peer_addr().ok(),
            local: stream.local_addr().ok(),
            stream,
        })
    }

    /// 依次尝试解析出的每个地址，返回第一个成功的连接
    async fn connect_any(host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in lookup_host((host, port)).await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}:{} did not resolve to any address", host, port),
            )
        }))
    }
}

impl Transport for TcpTransport {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    async fn connect(host: &str, port: u16, config: &TransportConfig) -> Result<Self> {
        let stream = timeout(config.connect_timeout, Self::connect_any(host, port))
            .await
            .map_err(|_| WireError::ConnectionTimeout)??;
        Self::from_stream(stream, config.nodelay)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        self.stream.into_split()
    }
}

/// TCP 监听套接字
#[derive(Debug)]
pub struct TcpListener {
    inner: tokio::net::TcpListener,
}

impl TransportListener for TcpListener {
    type Transport = TcpTransport;

    async fn bind(host: &str, port: u16) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind((host, port)).await?;
        Ok(Self { inner })
    }

    async fn accept(&self, config: &TransportConfig) -> Result<TcpTransport> {
        let (stream, _) = self.inner.accept().await?;
        TcpTransport::from_stream(stream, config.nodelay)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}
