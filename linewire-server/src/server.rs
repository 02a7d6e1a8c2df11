//! 演示服务端实现

use std::net::SocketAddr;
use std::sync::Arc;

use clap::ValueEnum;
use linewire::{
    Acceptor, AcceptorOptions, CommandDispatcher, CommandHandler, Connection, Echo, LatencyProbe,
    WireConfig,
};
use tracing::{debug, info};

/// 服务端处理模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// 原样回写每一帧
    Echo,
    /// 对 Ping 回复 Pong
    Probe,
}

/// 演示服务器
pub struct DemoServer {
    mode: Mode,
    config: Arc<WireConfig>,
    options: AcceptorOptions,
}

impl DemoServer {
    pub fn new(mode: Mode, config: WireConfig, options: AcceptorOptions) -> Self {
        if mode == Mode::Probe {
            config.register(LatencyProbe::PING);
        }
        Self {
            mode,
            config: Arc::new(config),
            options,
        }
    }

    /// 启动并运行到 Ctrl+C
    pub async fn run(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let acceptor = self.bind(addr).await?;
        info!(
            "Server running in {:?} mode on {}, press Ctrl+C to stop",
            self.mode,
            acceptor.local_addr()
        );

        tokio::signal::ctrl_c().await?;
        info!(
            "Received shutdown signal, closing {} connections...",
            acceptor.connection_count()
        );
        acceptor.stop().await;
        info!("Server shutdown complete");

        Ok(())
    }

    /// 按模式绑定 Acceptor
    pub async fn bind(&self, addr: SocketAddr) -> linewire::Result<Acceptor> {
        let host = addr.ip().to_string();
        let config = Arc::clone(&self.config);
        let options = self.options.clone();

        match self.mode {
            Mode::Echo => {
                Acceptor::bind_with(&host, addr.port(), config, options, |_: &Connection| Echo)
                    .await
            }
            Mode::Probe => {
                Acceptor::bind_with(&host, addr.port(), config, options, |conn: &Connection| {
                    CommandDispatcher::<LatencyProbe, _>::new(ProbeResponder {
                        peer: conn.peer_addr(),
                    })
                })
                .await
            }
        }
    }
}

/// 探测模式的命令处理器
struct ProbeResponder {
    peer: Option<SocketAddr>,
}

impl CommandHandler<LatencyProbe> for ProbeResponder {
    fn on_command(&mut self, probe: LatencyProbe) -> anyhow::Result<Option<LatencyProbe>> {
        debug!(peer = ?self.peer, "Probe received: {:?}", probe);
        Ok(probe.reply())
    }
}
