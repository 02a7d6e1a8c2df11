//! 命令分发
//!
//! [`CommandDispatcher`] 把帧解码为命令，经白名单检查后交给用户处理器，
//! 处理器返回的命令作为回复帧写回同一连接。

use std::marker::PhantomData;

use tracing::{debug, error, warn};

use crate::command::{Command, Envelope};
use crate::connection::Connection;
use crate::error::{Result, WireError};
use crate::listener::FrameHandler;

/// 用户命令处理器
///
/// 返回 `Some` 发送回复，返回 `None` 不回复。返回错误会关闭该连接，
/// 需要容错的处理器应自行处理错误。
pub trait CommandHandler<C: Command>: Send + 'static {
    fn on_command(&mut self, command: C) -> anyhow::Result<Option<C>>;
}

impl<C, F> CommandHandler<C> for F
where
    C: Command,
    F: FnMut(C) -> anyhow::Result<Option<C>> + Send + 'static,
{
    fn on_command(&mut self, command: C) -> anyhow::Result<Option<C>> {
        self(command)
    }
}

/// 类型化命令的帧处理器
pub struct CommandDispatcher<C, H> {
    handler: H,
    _command: PhantomData<fn() -> C>,
}

impl<C: Command, H: CommandHandler<C>> CommandDispatcher<C, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _command: PhantomData,
        }
    }
}

impl<C, F> CommandDispatcher<C, F>
where
    C: Command,
    F: FnMut(C) -> anyhow::Result<Option<C>> + Send + 'static,
{
    /// 从闭包创建
    pub fn from_fn(handler: F) -> Self {
        Self::new(handler)
    }
}

impl<C: Command, H: CommandHandler<C>> FrameHandler for CommandDispatcher<C, H> {
    async fn on_frame(&mut self, frame: Vec<u8>, conn: &Connection) -> Result<()> {
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(id = conn.id(), "Dropping undecodable frame: {}", e);
                return Ok(());
            }
        };

        if !conn.config().is_registered(&envelope.tag) {
            let rejected = WireError::UnregisteredCommand {
                tag: envelope.tag,
            };
            warn!(id = conn.id(), "Rejected command: {}", rejected);
            return Ok(());
        }

        let command: C = match envelope.open() {
            Ok(command) => command,
            Err(e) => {
                warn!(id = conn.id(), tag = %envelope.tag, "Rejected malformed command: {}", e);
                return Ok(());
            }
        };
        debug!(id = conn.id(), "Command received: {:?}", command);

        let reply = self.handler.on_command(command).map_err(|e| {
            error!(id = conn.id(), peer = ?conn.peer_addr(), "Command handler failed: {:#}", e);
            WireError::Handler(e)
        })?;

        match reply {
            Some(reply) => conn.send(&reply).await,
            None => Ok(()),
        }
    }
}
