//! 基于分隔符分帧的 TCP 消息库
//!
//! 包含:
//! - 帧编解码 (FrameReader, FrameWriter)
//! - 共享配置：分隔符与命令白名单 (WireConfig)
//! - 传输层抽象 (Transport trait)
//! - 连接封装与监听循环 (Connection, ConnectionListener)
//! - 类型化命令分发 (Command, CommandDispatcher)
//! - 服务端与客户端 (Acceptor, Connector)

mod acceptor;
mod codec;
mod command;
mod config;
mod connection;
mod connector;
mod constants;
mod dispatcher;
mod error;
mod listener;
mod transport;

pub use acceptor::{Acceptor, AcceptorOptions, ListenerSet};
pub use codec::{FrameReader, FrameWriter, ReadFrame};
pub use command::{encode_command, Command, Envelope, LatencyProbe};
pub use config::{parse_delimiter, WireConfig};
pub use connection::{BoxedReader, BoxedWriter, Connection, ConnectionState};
pub use connector::Connector;
pub use constants::*;
pub use dispatcher::{CommandDispatcher, CommandHandler};
pub use error::{Result, WireError};
pub use listener::{ConnectionListener, Discard, Echo, FrameHandler, Inbox};
pub use transport::{TcpListener, TcpTransport, Transport, TransportConfig, TransportListener};
