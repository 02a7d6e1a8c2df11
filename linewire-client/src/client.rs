//! 演示客户端实现

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use linewire::{CommandDispatcher, Connection, Connector, Inbox, LatencyProbe, WireConfig};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

/// 等待回复的超时时间
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// 客户端运行模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// 逐行发送标准输入并打印回显
    Echo,
    /// 发送 Ping 并统计往返延迟
    Probe,
}

/// 延迟统计
#[derive(Debug, Default, Clone)]
pub struct ProbeStats {
    pub sent: u32,
    pub samples: Vec<Duration>,
}

impl ProbeStats {
    pub fn lost(&self) -> u32 {
        self.sent.saturating_sub(self.samples.len() as u32)
    }

    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}

impl fmt::Display for ProbeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {}, received {}, lost {}",
            self.sent,
            self.samples.len(),
            self.lost()
        )?;
        if let (Some(min), Some(avg), Some(max)) = (self.min(), self.average(), self.max()) {
            write!(
                f,
                ", rtt min/avg/max = {:.3}/{:.3}/{:.3} ms",
                millis(min),
                millis(avg),
                millis(max)
            )?;
        }
        Ok(())
    }
}

/// 演示客户端
pub struct DemoClient {
    addr: SocketAddr,
    config: Arc<WireConfig>,
}

impl DemoClient {
    pub fn new(addr: SocketAddr, config: WireConfig) -> Self {
        config.register(LatencyProbe::PONG);
        Self {
            addr,
            config: Arc::new(config),
        }
    }

    /// 逐行发送输入，等待每行的回显并写到输出，返回回显行数
    pub async fn run_echo<R, W>(&self, input: R, output: &mut W) -> anyhow::Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let connector = self.connect(|_: &Connection| Inbox).await?;
        let mut lines = input.lines();
        let mut echoed = 0;

        while let Some(line) = lines.next_line().await? {
            connector.write_line(&line).await?;
            let reply = match timeout(RESPONSE_TIMEOUT, connector.read_line()).await {
                Ok(reply) => reply?,
                Err(_) => {
                    warn!("No echo for {:?} within {:?}", line, RESPONSE_TIMEOUT);
                    continue;
                }
            };
            output
                .write_all(format!("[{}] < {}\n", timestamp(), reply).as_bytes())
                .await?;
            output.flush().await?;
            echoed += 1;
        }

        debug!("Input finished after {} lines", echoed);
        connector.stop().await?;
        Ok(echoed)
    }

    /// 按间隔发送 `count` 个 Ping 并统计延迟
    pub async fn run_probe(&self, count: u32, every: Duration) -> anyhow::Result<ProbeStats> {
        let (pong_tx, mut pongs) = mpsc::unbounded_channel();
        let connector = self
            .connect(move |_: &Connection| {
                CommandDispatcher::from_fn(move |probe: LatencyProbe| {
                    // 在收到时计算往返时间
                    let _ = pong_tx.send((probe.clone(), probe.round_trip()));
                    Ok(None)
                })
            })
            .await?;

        let mut stats = ProbeStats::default();
        let mut ticker = interval(every);

        for seq in 1..=count {
            ticker.tick().await;

            let ping = LatencyProbe::ping();
            let sent_at = ping.sent_at();
            connector.send(&ping).await?;
            stats.sent += 1;

            match timeout(RESPONSE_TIMEOUT, wait_for_pong(&mut pongs, sent_at)).await {
                Ok(Some(rtt)) => {
                    println!("[{}] seq={} rtt={:.3} ms", timestamp(), seq, millis(rtt));
                    stats.samples.push(rtt);
                }
                Ok(None) => {
                    warn!("Connection closed while waiting for pong");
                    break;
                }
                Err(_) => warn!("seq={} timed out", seq),
            }
        }

        connector.stop().await?;
        Ok(stats)
    }

    async fn connect<F, H>(&self, factory: F) -> linewire::Result<Connector>
    where
        F: FnOnce(&Connection) -> H + Send,
        H: linewire::FrameHandler,
    {
        let connector = Connector::connect(
            &self.addr.ip().to_string(),
            self.addr.port(),
            Arc::clone(&self.config),
            factory,
        )
        .await?;
        info!("Connected to {}", self.addr);
        Ok(connector)
    }
}

/// 等待与指定 Ping 对应的 Pong，丢弃迟到的旧回复
async fn wait_for_pong(
    pongs: &mut mpsc::UnboundedReceiver<(LatencyProbe, Option<Duration>)>,
    sent_at: u64,
) -> Option<Duration> {
    while let Some((probe, rtt)) = pongs.recv().await {
        match probe {
            LatencyProbe::Pong { ping_sent_at, .. } if ping_sent_at == sent_at => return rtt,
            other => debug!("Ignoring stale reply: {:?}", other),
        }
    }
    None
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
