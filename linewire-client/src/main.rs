//! linewire 演示客户端
//!
//! 回显模式逐行发送标准输入；探测模式发送 Ping 并打印往返延迟。

mod client;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use client::{DemoClient, Mode};
use linewire::{parse_delimiter, WireConfig};
use tokio::io::{stdin, stdout, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Parser, Debug)]
#[command(name = "linewire-client", version, about = "Delimiter-framed TCP demo client")]
struct Cli {
    /// 服务器地址
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: SocketAddr,

    /// 运行模式
    #[arg(long, value_enum, default_value_t = Mode::Echo)]
    mode: Mode,

    /// 探测模式下发送的 Ping 数量
    #[arg(long, default_value_t = 5)]
    count: u32,

    /// 探测模式下两次 Ping 的间隔（毫秒）
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: u64,

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
                .add_directive("linewire_client=debug".parse()?)
                .add_directive("linewire=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = WireConfig::new();
    config.set_delimiter(parse_delimiter(&cli.delimiter)?)?;
    let client = DemoClient::new(cli.addr, config);

    let run = async {
        match cli.mode {
            Mode::Echo => {
                let echoed = client
                    .run_echo(BufReader::new(stdin()), &mut stdout())
                    .await?;
                info!("Echoed {} lines", echoed);
            }
            Mode::Probe => {
                let stats = client
                    .run_probe(cli.count, Duration::from_millis(cli.interval_ms))
                    .await?;
                println!("{}", stats);
            }
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = run => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["linewire-client"]).unwrap();
        assert_eq!(cli.addr, DEFAULT_ADDR.parse::<SocketAddr>().unwrap());
        assert_eq!(cli.mode, Mode::Echo);
        assert_eq!(cli.count, 5);
    }

    #[test]
    fn test_probe_args() {
        let cli = Cli::try_parse_from([
            "linewire-client",
            "--mode",
            "probe",
            "--count",
            "10",
            "--interval-ms",
            "50",
            "--delimiter",
            "||",
        ])
        .unwrap();
        assert_eq!(cli.mode, Mode::Probe);
        assert_eq!(cli.count, 10);
        assert_eq!(cli.interval_ms, 50);
        assert_eq!(parse_delimiter(&cli.delimiter).unwrap(), b"||");
    }

    #[test]
    fn test_rejects_zero_interval() {
        assert!(Cli::try_parse_from(["linewire-client", "--interval-ms", "0"]).is_err());
    }
}
