//! linewire 演示服务端
//!
//! 回显模式原样返回每一帧；探测模式对 Ping 回复 Pong。

mod server;

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use linewire::{parse_delimiter, AcceptorOptions, WireConfig, UNLIMITED_CLIENTS};
use server::{DemoServer, Mode};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Parser, Debug)]
#[command(name = "linewire-server", version, about = "Delimiter-framed TCP demo server")]
struct Cli {
    /// 监听地址
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: SocketAddr,

    /// 处理模式
    #[arg(long, value_enum, default_value_t = Mode::Echo)]
    mode: Mode,

    /// 最大并发连接数，0 表示不限制
    #[arg(long, default_value_t = UNLIMITED_CLIENTS)]
    max_clients: usize,

    /// 帧分隔符，支持 \n、\r、\t、\xHH 转义
    #[arg(long, default_value = "\\n")]
    delimiter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("linewire_server=debug".parse()?)
                .add_directive("linewire=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = WireConfig::new();
    config.set_delimiter(parse_delimiter(&cli.delimiter)?)?;
    let options = AcceptorOptions {
        max_clients: cli.max_clients,
        ..AcceptorOptions::default()
    };

    let server = DemoServer::new(cli.mode, config, options);
    server.run(cli.addr).await?;

    Ok(())
}
