//! 客户端：一条主动建立的连接

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::command::Command;
use crate::config::WireConfig;
use crate::connection::Connection;
use crate::error::{Result, WireError};
use crate::listener::{ConnectionListener, FrameHandler};
use crate::transport::{TcpTransport, Transport, TransportConfig};

/// 客户端连接
///
/// 连接建立后立即在后台运行监听循环。入站帧如何处理由工厂创建的
/// [`FrameHandler`] 决定：使用 [`Inbox`](crate::Inbox) 时可以通过
/// [`read_frame`](Self::read_frame) 逐帧读取。
pub struct Connector {
    conn: Connection,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Connector {
    /// 使用默认传输配置连接
    pub async fn connect<F, H>(
        host: &str,
        port: u16,
        config: Arc<WireConfig>,
        factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Connection) -> H + Send,
        H: FrameHandler,
    {
        Self::connect_with(host, port, config, TransportConfig::default(), factory).await
    }

    /// 连接并启动监听循环
    ///
    /// # Arguments
    /// * `host` - 服务端主机名或 IP
    /// * `port` - 服务端端口
    /// * `config` - 分隔符与白名单，需与服务端一致
    /// * `transport` - 连接超时、TCP_NODELAY 和读取超时
    /// * `factory` - 为这条连接创建处理器
    ///
    /// 连接失败时直接返回错误，不会留下后台任务。
    pub async fn connect_with<F, H>(
        host: &str,
        port: u16,
        config: Arc<WireConfig>,
        transport: TransportConfig,
        factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Connection) -> H + Send,
        H: FrameHandler,
    {
        let stream = TcpTransport::connect(host, port, &transport).await?;
        info!(peer = ?stream.peer_addr(), "Connected to {}:{}", host, port);

        let (conn, reader) = Connection::new(stream, config);
        let handler = factory(&conn);
        let listener = ConnectionListener::new(conn.clone(), reader, handler)
            .with_read_timeout(transport.read_timeout);
        let task = tokio::spawn(listener.run());

        Ok(Self {
            conn,
            task: Mutex::new(Some(task)),
        })
    }

    /// 序列化并发送命令
    pub async fn send<C: Command>(&self, command: &C) -> Result<()> {
        self.conn.send(command).await
    }

    pub async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        self.conn.write_frame(payload).await
    }

    pub async fn write_line(&self, line: &str) -> Result<()> {
        self.conn.write_line(line).await
    }

    /// 读取下一帧（需要 [`Inbox`](crate::Inbox) 处理器）
    pub async fn read_frame(&self) -> Result<Vec<u8>> {
        self.conn.recv_frame().await
    }

    /// 读取下一行文本（需要 [`Inbox`](crate::Inbox) 处理器）
    pub async fn read_line(&self) -> Result<String> {
        self.conn.read_line().await
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_open()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// 关闭连接并等待监听循环退出
    ///
    /// 如果循环因错误结束（传输错误、处理器错误等），返回该错误。
    /// 再次调用返回 `Ok`。
    pub async fn stop(&self) -> Result<()> {
        self.conn.stop().await;

        let task = self.task.lock().take();
        match task {
            Some(task) => {
                let result = task.await.map_err(WireError::from)?;
                debug!(id = self.conn.id(), "Connector stopped");
                result
            }
            None => Ok(()),
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
