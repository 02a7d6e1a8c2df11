//! 服务端：监听套接字和存活连接集合

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::command::{encode_command, Command};
use crate::config::WireConfig;
use crate::connection::Connection;
use crate::error::{Result, WireError};
use crate::listener::{ConnectionListener, FrameHandler};
use crate::transport::{TcpListener, TcpTransport, TransportConfig, TransportListener};
use crate::{ACCEPT_BACKOFF, SHUTDOWN_GRACE, UNLIMITED_CLIENTS};

/// Acceptor 选项
#[derive(Clone, Debug)]
pub struct AcceptorOptions {
    /// 最大并发连接数，0 表示不限制
    pub max_clients: usize,
    /// 应用到每个已接受连接的传输配置
    pub transport: TransportConfig,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self {
            max_clients: UNLIMITED_CLIENTS,
            transport: TransportConfig::default(),
        }
    }
}

/// 存活连接集合，按接受顺序排列
///
/// 遍历基于快照，遍历期间连接被移除不会影响广播。
#[derive(Debug, Default)]
pub struct ListenerSet {
    connections: Mutex<BTreeMap<u64, Connection>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Connection) {
        self.connections.lock().insert(conn.id(), conn);
    }

    pub fn remove(&self, id: u64) -> Option<Connection> {
        self.connections.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// 当前连接的快照
    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections.lock().values().cloned().collect()
    }

    /// 取出全部连接并清空集合
    pub fn drain(&self) -> Vec<Connection> {
        std::mem::take(&mut *self.connections.lock())
            .into_values()
            .collect()
    }

    /// 取出全部连接并同时停止它们
    pub async fn stop_all(&self) {
        let mut stopping = JoinSet::new();
        for conn in self.drain() {
            stopping.spawn(async move { conn.stop().await });
        }
        while let Some(joined) = stopping.join_next().await {
            report_join(joined);
        }
    }

    /// 向每个连接写出同一帧，返回成功数
    ///
    /// 单个连接失败时调用 `on_failure` 并继续下一个。
    pub async fn broadcast_frame<F>(&self, frame: &[u8], mut on_failure: F) -> usize
    where
        F: FnMut(&Connection, &WireError),
    {
        let mut delivered = 0;
        for conn in self.snapshot() {
            match conn.write_frame(frame).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(id = conn.id(), peer = ?conn.peer_addr(), "Broadcast failed: {}", e);
                    on_failure(&conn, &e);
                }
            }
        }
        delivered
    }

    /// 向每个连接发送命令，返回成功数
    ///
    /// 只有命令本身无法序列化时返回错误。
    pub async fn broadcast<C, F>(&self, command: &C, on_failure: F) -> Result<usize>
    where
        C: Command,
        F: FnMut(&Connection, &WireError),
    {
        debug!(tag = command.tag(), "Broadcasting command: {:?}", command);
        let frame = encode_command(command)?;
        Ok(self.broadcast_frame(&frame, on_failure).await)
    }
}

/// TCP 服务端
///
/// 绑定后立即在后台接受连接，每个连接由工厂创建一个 [`FrameHandler`]
/// 并运行独立的监听任务。
pub struct Acceptor {
    local_addr: SocketAddr,
    listeners: Arc<ListenerSet>,
    listening: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    /// 使用默认选项绑定并开始接受连接
    pub async fn bind<F, H>(
        host: &str,
        port: u16,
        config: Arc<WireConfig>,
        factory: F,
    ) -> Result<Self>
    where
        F: Fn(&Connection) -> H + Send + Sync + 'static,
        H: FrameHandler,
    {
        Self::bind_with(host, port, config, AcceptorOptions::default(), factory).await
    }

    /// 绑定并开始接受连接
    ///
    /// # Arguments
    /// * `host` - 监听地址，可以是主机名
    /// * `port` - 监听端口，0 表示由系统分配
    /// * `config` - 所有连接共享的分隔符与白名单
    /// * `options` - 连接上限和每个连接的传输配置
    /// * `factory` - 为每个接受的连接创建处理器
    ///
    /// 绑定失败直接返回错误，不会启动后台任务。
    pub async fn bind_with<F, H>(
        host: &str,
        port: u16,
        config: Arc<WireConfig>,
        options: AcceptorOptions,
        factory: F,
    ) -> Result<Self>
    where
        F: Fn(&Connection) -> H + Send + Sync + 'static,
        H: FrameHandler,
    {
        let listener = TcpListener::bind(host, port).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Listening on {} (max clients: {})",
            local_addr,
            if options.max_clients == UNLIMITED_CLIENTS {
                "unlimited".to_string()
            } else {
                options.max_clients.to_string()
            }
        );

        let listeners = Arc::new(ListenerSet::new());
        let listening = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_loop = AcceptLoop {
            listener,
            local_addr,
            config,
            options,
            factory,
            listeners: Arc::clone(&listeners),
            listening: Arc::clone(&listening),
            shutdown_rx,
        };
        let accept_task = tokio::spawn(accept_loop.run());

        Ok(Self {
            local_addr,
            listeners,
            listening,
            shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// 当前存活连接数
    pub fn connection_count(&self) -> usize {
        self.listeners.len()
    }

    /// 当前存活连接的快照
    pub fn connections(&self) -> Vec<Connection> {
        self.listeners.snapshot()
    }

    /// 向所有连接发送命令，返回成功数
    pub async fn broadcast<C, F>(&self, command: &C, on_failure: F) -> Result<usize>
    where
        C: Command,
        F: FnMut(&Connection, &WireError),
    {
        self.listeners.broadcast(command, on_failure).await
    }

    /// 向所有连接写出同一帧，返回成功数
    pub async fn broadcast_frame<F>(&self, frame: &[u8], on_failure: F) -> usize
    where
        F: FnMut(&Connection, &WireError),
    {
        self.listeners.broadcast_frame(frame, on_failure).await
    }

    /// 停止所有连接并关闭监听套接字
    ///
    /// 可以在接受循环运行时调用，重复调用无副作用。
    pub async fn stop(&self) {
        self.listeners.stop_all().await;

        let _ = self.shutdown_tx.send(true);
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                error!("Accept loop on {} failed: {}", self.local_addr, e);
            }
        }
    }
}

/// 后台接受循环
struct AcceptLoop<F> {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<WireConfig>,
    options: AcceptorOptions,
    factory: F,
    listeners: Arc<ListenerSet>,
    listening: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<F, H> AcceptLoop<F>
where
    F: Fn(&Connection) -> H + Send + Sync + 'static,
    H: FrameHandler,
{
    async fn run(mut self) {
        let mut tasks = JoinSet::new();

        loop {
            // 达到上限时不再 accept，等待的连接留在内核 backlog 中
            if self.at_capacity() {
                tokio::select! {
                    _ = self.shutdown_rx.changed() => break,
                    Some(joined) = tasks.join_next() => report_join(joined),
                    _ = sleep(ACCEPT_BACKOFF) => {}
                }
                continue;
            }

            let accepted = tokio::select! {
                _ = self.shutdown_rx.changed() => break,
                Some(joined) = tasks.join_next() => {
                    report_join(joined);
                    continue;
                }
                accepted = self.listener.accept(&self.options.transport) => accepted,
            };

            match accepted {
                Ok(transport) => self.start_listener(transport, &mut tasks),
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        // 关闭监听套接字
        self.listening.store(false, Ordering::SeqCst);
        drop(self.listener);

        self.listeners.stop_all().await;

        // 等待所有连接任务退出（最多等待 SHUTDOWN_GRACE）
        let drained = timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = tasks.join_next().await {
                report_join(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown timeout, {} listeners still active", tasks.len());
            tasks.shutdown().await;
        }

        info!("Acceptor on {} stopped", self.local_addr);
    }

    fn at_capacity(&self) -> bool {
        self.options.max_clients != UNLIMITED_CLIENTS
            && self.listeners.len() >= self.options.max_clients
    }

    fn start_listener(&self, transport: TcpTransport, tasks: &mut JoinSet<()>) {
        let (conn, reader) = Connection::new(transport, Arc::clone(&self.config));
        let handler = (self.factory)(&conn);
        let listener = ConnectionListener::new(conn.clone(), reader, handler)
            .with_read_timeout(self.options.transport.read_timeout);

        // 先登记再启动，任务结束时的移除不会早于插入
        self.listeners.insert(conn.clone());
        info!(
            id = conn.id(),
            peer = ?conn.peer_addr(),
            "Accepted connection ({} active)",
            self.listeners.len()
        );

        let listeners = Arc::clone(&self.listeners);
        tasks.spawn(async move {
            match listener.run().await {
                Ok(()) => info!(id = conn.id(), peer = ?conn.peer_addr(), "Connection closed"),
                Err(e) => warn!(
                    id = conn.id(),
                    peer = ?conn.peer_addr(),
                    "Connection terminated: {}",
                    e
                ),
            }
            listeners.remove(conn.id());
        });
    }
}

fn report_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Listener task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameReader, ReadFrame};
    use crate::listener::{Discard, Echo};
    use std::time::Duration;
    use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpStream;

    /// 轮询直到条件成立，最多 5 秒
    async fn eventually(mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn duplex_connection(config: &Arc<WireConfig>) -> (Connection, DuplexStream) {
        let (local, remote) = duplex(1024);
        let (reader, writer) = split(local);
        let (conn, _frames) = Connection::from_parts(reader, writer, None, Arc::clone(config));
        (conn, remote)
    }

    #[tokio::test]
    async fn test_acceptor_starts_and_stops() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, Arc::new(WireConfig::new()), |_: &Connection| Echo)
            .await
            .unwrap();
        assert!(acceptor.is_listening());
        assert!(acceptor.local_addr().port() > 0);
        assert_eq!(acceptor.connection_count(), 0);

        acceptor.stop().await;
        assert!(!acceptor.is_listening());

        // 监听套接字已关闭
        assert!(TcpStream::connect(acceptor.local_addr()).await.is_err());
        acceptor.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = Acceptor::bind("127.0.0.1", 0, Arc::new(WireConfig::new()), |_: &Connection| Echo)
            .await
            .unwrap();
        let port = first.local_addr().port();

        let second = Acceptor::bind("127.0.0.1", port, Arc::new(WireConfig::new()), |_: &Connection| Echo).await;
        assert!(matches!(second, Err(WireError::Io(_))));
        first.stop().await;
    }

    #[tokio::test]
    async fn test_max_clients_gate() {
        let options = AcceptorOptions {
            max_clients: 2,
            ..AcceptorOptions::default()
        };
        let acceptor = Acceptor::bind_with(
            "127.0.0.1",
            0,
            Arc::new(WireConfig::new()),
            options,
            |_: &Connection| Echo,
        )
        .await
        .unwrap();
        let addr = acceptor.local_addr();

        let first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        eventually(|| acceptor.connection_count() == 2).await;

        // 第三个连接停在 backlog 中，不会被计数
        let mut third = TcpStream::connect(addr).await.unwrap();
        third.write_all(b"waiting\n").await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(acceptor.connection_count(), 2);

        // 释放一个名额后第三个连接被接受并得到回显
        drop(first);
        let mut echoed = [0u8; 8];
        timeout(Duration::from_secs(5), third.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"waiting\n");
        assert_eq!(acceptor.connection_count(), 2);

        acceptor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_live_connections() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, Arc::new(WireConfig::new()), |_: &Connection| Discard)
            .await
            .unwrap();

        let mut client = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        eventually(|| acceptor.connection_count() == 1).await;

        acceptor.stop().await;
        assert_eq!(acceptor.connection_count(), 0);

        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_broadcast_partial_failure() {
        let config = Arc::new(WireConfig::new());
        let set = ListenerSet::new();

        let (first, first_peer) = duplex_connection(&config);
        let (second, _second_peer) = duplex_connection(&config);
        let (third, third_peer) = duplex_connection(&config);
        set.insert(first);
        set.insert(second.clone());
        set.insert(third);

        // 第二个连接已关闭，发送会失败
        second.stop().await;

        let mut failed = Vec::new();
        let delivered = set
            .broadcast_frame(b"news", |conn, _err| failed.push(conn.id()))
            .await;

        assert_eq!(delivered, 2);
        assert_eq!(failed, vec![second.id()]);

        for peer in [first_peer, third_peer] {
            let mut reader = FrameReader::new(peer);
            assert_eq!(
                reader.read_frame(b"\n").await.unwrap(),
                ReadFrame::Complete(b"news".to_vec())
            );
        }
    }

    #[tokio::test]
    async fn test_listener_set_snapshot_and_drain() {
        let config = Arc::new(WireConfig::new());
        let set = ListenerSet::new();
        let (a, _pa) = duplex_connection(&config);
        let (b, _pb) = duplex_connection(&config);
        set.insert(a.clone());
        set.insert(b.clone());

        let ids: Vec<u64> = set.snapshot().iter().map(Connection::id).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);

        assert!(set.remove(a.id()).is_some());
        assert!(set.remove(a.id()).is_none());
        assert_eq!(set.drain().len(), 1);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_stop_with_stalled_peers_returns_promptly() {
        let acceptor = Acceptor::bind("127.0.0.1", 0, Arc::new(WireConfig::new()), |_: &Connection| Echo)
            .await
            .unwrap();

        // 对端持续写入但从不读取，服务端的回显最终阻塞在写入上
        let mut idle_halves = Vec::new();
        let mut writers = Vec::new();
        for _ in 0..3 {
            let stream = TcpStream::connect(acceptor.local_addr()).await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            idle_halves.push(read_half);
            writers.push(tokio::spawn(async move {
                let line = [b'z'; 1023];
                loop {
                    if write_half.write_all(&line).await.is_err()
                        || write_half.write_all(b"\n").await.is_err()
                    {
                        break;
                    }
                }
            }));
        }
        eventually(|| acceptor.connection_count() == 3).await;
        sleep(Duration::from_secs(1)).await;

        let started = tokio::time::Instant::now();
        timeout(Duration::from_secs(3), acceptor.stop())
            .await
            .expect("stop blocked on stalled writes");
        assert!(started.elapsed() < SHUTDOWN_GRACE);
        assert_eq!(acceptor.connection_count(), 0);

        for writer in writers {
            writer.abort();
        }
    }
}
