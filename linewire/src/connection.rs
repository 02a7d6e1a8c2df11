//! 连接封装
//!
//! [`Connection`] 是一个可克隆的句柄：写入端由互斥锁保护，
//! 处理器的回复、外部 `send` 和广播不会在线路上交错。
//! 读取端交给 [`ConnectionListener`](crate::ConnectionListener) 独占。

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::command::{encode_command, Command};
use crate::config::WireConfig;
use crate::error::{Result, WireError};
use crate::transport::Transport;
use crate::{INBOX_CAPACITY, SHUTDOWN_GRACE};

/// 装箱后的读取端
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// 装箱后的写入端
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 连接状态，`Stopped` 是终态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Running,
    Stopped,
}

struct Inner {
    id: u64,
    peer_addr: Option<SocketAddr>,
    config: Arc<WireConfig>,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    state: watch::Sender<ConnectionState>,
    closing: AtomicBool,
    inbox_tx: mpsc::Sender<Vec<u8>>,
    inbox_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// 单个连接的共享句柄
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// 从传输层创建连接，返回句柄和对应的帧读取器
    pub fn new<T: Transport>(
        transport: T,
        config: Arc<WireConfig>,
    ) -> (Self, FrameReader<BoxedReader>) {
        let peer_addr = transport.peer_addr();
        let (reader, writer) = transport.split();
        Self::from_parts(reader, writer, peer_addr, config)
    }

    /// 从读写端直接创建连接
    pub fn from_parts<R, W>(
        reader: R,
        writer: W,
        peer_addr: Option<SocketAddr>,
        config: Arc<WireConfig>,
    ) -> (Self, FrameReader<BoxedReader>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        let (state, _) = watch::channel(ConnectionState::Created);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let frame_reader = FrameReader::new(reader).with_max_frame_size(config.max_frame_size());
        let connection = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                config,
                writer: Mutex::new(FrameWriter::new(writer)),
                state,
                closing: AtomicBool::new(false),
                inbox_tx,
                inbox_rx: Mutex::new(inbox_rx),
            }),
        };
        (connection, frame_reader)
    }

    /// 进程内唯一的连接编号
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    pub fn config(&self) -> &Arc<WireConfig> {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() != ConnectionState::Stopped
    }

    /// 标记为运行中（仅从 Created 迁移）
    pub(crate) fn mark_running(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Created {
                *state = ConnectionState::Running;
                true
            } else {
                false
            }
        });
    }

    /// 使用当前分隔符写出一帧
    ///
    /// 等待写锁或阻塞在写入时调用 `stop()`，返回 [`WireError::ConnectionClosed`]。
    pub async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        if *state.borrow_and_update() == ConnectionState::Stopped {
            return Err(WireError::ConnectionClosed);
        }
        let delimiter = self.inner.config.delimiter();

        tokio::select! {
            biased;
            _ = wait_stopped(&mut state) => Err(WireError::ConnectionClosed),
            written = async {
                let mut writer = self.inner.writer.lock().await;
                writer.write_frame(payload, &delimiter).await
            } => written,
        }
    }

    /// 写出一行文本
    pub async fn write_line(&self, line: &str) -> Result<()> {
        self.write_frame(line.as_bytes()).await
    }

    /// 序列化并发送命令
    pub async fn send<C: Command>(&self, command: &C) -> Result<()> {
        debug!(id = self.id(), tag = command.tag(), "Sending command: {:?}", command);
        let frame = encode_command(command)?;
        self.write_frame(&frame).await
    }

    /// 将收到的帧放入接收队列，供 [`recv_frame`](Self::recv_frame) 读取
    ///
    /// 队列最多容纳 [`INBOX_CAPACITY`] 帧。队列满时等待读取方取走帧，
    /// 期间监听循环不再读取套接字，压力传回对端。连接停止时返回
    /// [`WireError::ConnectionClosed`]。
    pub async fn deliver(&self, frame: Vec<u8>) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        if *state.borrow_and_update() == ConnectionState::Stopped {
            return Err(WireError::ConnectionClosed);
        }

        tokio::select! {
            biased;
            _ = wait_stopped(&mut state) => Err(WireError::ConnectionClosed),
            // 接收端由 Inner 持有，发送只会因停止失败
            sent = self.inner.inbox_tx.send(frame) => sent.map_err(|_| WireError::ConnectionClosed),
        }
    }

    /// 从接收队列取出一帧
    ///
    /// 连接停止且队列清空后返回 [`WireError::ConnectionClosed`]。
    pub async fn recv_frame(&self) -> Result<Vec<u8>> {
        let mut inbox = self.inner.inbox_rx.lock().await;
        let mut state = self.inner.state.subscribe();

        tokio::select! {
            biased;
            frame = inbox.recv() => return frame.ok_or(WireError::ConnectionClosed),
            _ = wait_stopped(&mut state) => {}
        }

        // 已停止：取出停止前送达的帧
        inbox.try_recv().map_err(|_| WireError::ConnectionClosed)
    }

    /// 读取一行文本
    pub async fn read_line(&self) -> Result<String> {
        let frame = self.recv_frame().await?;
        Ok(String::from_utf8(frame)?)
    }

    /// 等待连接进入 Stopped
    pub async fn stopped(&self) {
        let mut state = self.inner.state.subscribe();
        wait_stopped(&mut state).await;
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// 关闭连接
    ///
    /// 先进入 Stopped，唤醒阻塞中的读取循环、写入和投递，再关闭写入端
    /// （失败只记录日志）。套接字在读写两端都释放后关闭。重复调用无副作用。
    pub async fn stop(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(id = self.id(), peer = ?self.peer_addr(), "Stopping connection");

        self.inner.state.send_replace(ConnectionState::Stopped);

        // 被唤醒的写入会放开写锁
        let closed = timeout(SHUTDOWN_GRACE, async {
            let mut writer = self.inner.writer.lock().await;
            writer.shutdown().await
        })
        .await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(id = self.id(), "Unable to close write side: {}", e),
            Err(_) => warn!(id = self.id(), "Write side busy, closing without shutdown"),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// 等待状态进入 Stopped
pub(crate) async fn wait_stopped(state: &mut watch::Receiver<ConnectionState>) {
    loop {
        if *state.borrow_and_update() == ConnectionState::Stopped {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
