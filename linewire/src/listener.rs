//! 连接监听循环
//!
//! 每个连接一个 [`ConnectionListener`]：读一帧 → 交给 [`FrameHandler`] → 重复，
//! 直到对端关闭、读超时、调用 `stop()` 或处理器返回错误。

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info};

use crate::codec::{FrameReader, ReadFrame};
use crate::connection::{wait_stopped, BoxedReader, Connection};
use crate::error::{Result, WireError};

/// 帧处理钩子
///
/// 返回错误会终止该连接的监听循环。可恢复的问题应在内部记录并返回 `Ok`。
pub trait FrameHandler: Send + 'static {
    fn on_frame(
        &mut self,
        frame: Vec<u8>,
        conn: &Connection,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// 原样回写收到的帧
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl FrameHandler for Echo {
    async fn on_frame(&mut self, frame: Vec<u8>, conn: &Connection) -> Result<()> {
        conn.write_frame(&frame).await
    }
}

/// 把帧放入连接的接收队列，由 [`Connection::recv_frame`] 读取
///
/// 队列有上限，读取方跟不上时监听循环暂停读取套接字。
#[derive(Debug, Default, Clone, Copy)]
pub struct Inbox;

impl FrameHandler for Inbox {
    async fn on_frame(&mut self, frame: Vec<u8>, conn: &Connection) -> Result<()> {
        conn.deliver(frame).await
    }
}

/// 丢弃所有帧
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl FrameHandler for Discard {
    async fn on_frame(&mut self, frame: Vec<u8>, conn: &Connection) -> Result<()> {
        debug!(id = conn.id(), "Discarding {} byte frame", frame.len());
        Ok(())
    }
}

/// 单个连接的读取-分发循环
pub struct ConnectionListener<H> {
    conn: Connection,
    reader: FrameReader<BoxedReader>,
    handler: H,
    read_timeout: Option<Duration>,
}

impl<H: FrameHandler> ConnectionListener<H> {
    pub fn new(conn: Connection, reader: FrameReader<BoxedReader>, handler: H) -> Self {
        Self {
            conn,
            reader,
            handler,
            read_timeout: None,
        }
    }

    /// 设置单帧读取超时
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// 运行循环直到连接结束
    ///
    /// 对端关闭、读超时和 `stop()` 返回 `Ok`；传输错误、超大帧和处理器错误
    /// 原样返回。`stop()` 之后已缓冲的帧不再分发。无论哪种情况，
    /// 返回前连接都已进入 Stopped。
    pub async fn run(mut self) -> Result<()> {
        let mut state = self.conn.subscribe_state();
        self.conn.mark_running();
        debug!(id = self.conn.id(), peer = ?self.conn.peer_addr(), "Listener running");

        let result = loop {
            // 每帧读取一次分隔符，修改立即生效
            let delimiter = self.conn.config().delimiter();

            let read = tokio::select! {
                biased;
                _ = wait_stopped(&mut state) => break Ok(()),
                read = read_with_timeout(&mut self.reader, &delimiter, self.read_timeout) => read,
            };

            match read {
                Ok(ReadFrame::Complete(frame)) => {
                    if !self.conn.is_open() {
                        break Ok(());
                    }
                    match self.handler.on_frame(frame, &self.conn).await {
                        Ok(()) => {}
                        // 处理中途被 stop() 打断
                        Err(WireError::ConnectionClosed) if !self.conn.is_open() => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                Ok(ReadFrame::Eof(rest)) => {
                    if rest.is_empty() {
                        debug!(id = self.conn.id(), "Peer closed connection");
                    } else {
                        debug!(
                            id = self.conn.id(),
                            "Peer closed mid-frame, dropping {} bytes",
                            rest.len()
                        );
                    }
                    break Ok(());
                }
                Err(WireError::ConnectionTimeout) => {
                    info!(id = self.conn.id(), peer = ?self.conn.peer_addr(), "Read timeout");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        self.conn.stop().await;
        result
    }
}

async fn read_with_timeout(
    reader: &mut FrameReader<BoxedReader>,
    delimiter: &[u8],
    limit: Option<Duration>,
) -> Result<ReadFrame> {
    match limit {
        Some(limit) => timeout(limit, reader.read_frame(delimiter))
            .await
            .map_err(|_| WireError::ConnectionTimeout)?,
        None => reader.read_frame(delimiter).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireConfig;
    use crate::connection::ConnectionState;
    use crate::codec::FrameWriter;
    use std::sync::Arc;
    use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream};

    fn listener<H: FrameHandler>(
        handler: H,
        config: WireConfig,
    ) -> (ConnectionListener<H>, DuplexStream) {
        let (local, remote) = duplex(4096);
        let (reader, writer) = split(local);
        let (conn, frames) = Connection::from_parts(reader, writer, None, Arc::new(config));
        (ConnectionListener::new(conn, frames, handler), remote)
    }

    struct Failing;

    impl FrameHandler for Failing {
        async fn on_frame(&mut self, _frame: Vec<u8>, _conn: &Connection) -> Result<()> {
            Err(WireError::Handler(anyhow::anyhow!("boom")))
        }
    }

    #[tokio::test]
    async fn test_echo() {
        let (listener, remote) = listener(Echo, WireConfig::new());
        let task = tokio::spawn(listener.run());

        let (read_half, write_half) = split(remote);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        for line in [&b"hello"[..], b"olleh", b""] {
            writer.write_frame(line, b"\n").await.unwrap();
            assert_eq!(
                reader.read_frame(b"\n").await.unwrap(),
                ReadFrame::Complete(line.to_vec())
            );
        }

        // 对端关闭后循环正常结束
        writer.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_inbox_receives_frames_in_order() {
        let (listener, mut remote) = listener(Inbox, WireConfig::new());
        let conn = listener.connection().clone();
        let task = tokio::spawn(listener.run());

        remote.write_all(b"one\ntwo\nthree").await.unwrap();
        remote.shutdown().await.unwrap();

        assert_eq!(conn.read_line().await.unwrap(), "one");
        assert_eq!(conn.read_line().await.unwrap(), "two");
        // 半帧在关闭时被丢弃
        task.await.unwrap().unwrap();
        assert!(matches!(conn.read_line().await, Err(WireError::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_interrupts_blocked_read() {
        let (listener, _remote) = listener(Discard, WireConfig::new());
        let conn = listener.connection().clone();
        let task = tokio::spawn(listener.run());

        tokio::task::yield_now().await;
        conn.stop().await;
        task.await.unwrap().unwrap();
        assert_eq!(conn.state(), ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_closes_connection() {
        let (listener, _remote) = listener(Discard, WireConfig::new());
        let conn = listener.connection().clone();
        let listener = listener.with_read_timeout(Some(Duration::from_secs(30)));

        // 超时按关闭处理
        listener.run().await.unwrap();
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_handler_error_terminates_listener() {
        let (listener, mut remote) = listener(Failing, WireConfig::new());
        let task = tokio::spawn(listener.run());

        remote.write_all(b"anything\n").await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, WireError::Handler(_)));

        // 对端看到连接关闭
        let mut reader = FrameReader::new(remote);
        assert_eq!(reader.read_frame(b"\n").await.unwrap(), ReadFrame::Eof(Vec::new()));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let (listener, mut remote) = listener(Discard, WireConfig::new().with_max_frame_size(8));
        let task = tokio::spawn(listener.run());

        remote.write_all(b"0123456789abcdef\n").await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { max: 8 }));
    }

    #[tokio::test]
    async fn test_stop_with_buffered_frames_is_clean() {
        for _ in 0..20 {
            let (listener, mut remote) = listener(Echo, WireConfig::new());
            let conn = listener.connection().clone();

            // 对端写入后不读取，回显很快写满缓冲
            remote.write_all(&b"x\n".repeat(2000)).await.unwrap();
            let task = tokio::spawn(listener.run());
            tokio::task::yield_now().await;

            conn.stop().await;
            let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
            assert!(result.is_ok(), "stop reported {:?}", result);
        }
    }

    #[tokio::test]
    async fn test_inbox_backpressure_released_by_stop() {
        let (listener, mut remote) = listener(Inbox, WireConfig::new());
        let conn = listener.connection().clone();
        let task = tokio::spawn(listener.run());

        // 超过队列容量且没有读取方
        for _ in 0..crate::INBOX_CAPACITY + 10 {
            remote.write_all(b"y\n").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        conn.stop().await;
        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
