//! 命令类型定义
//!
//! 线路上的命令负载:
//! ```text
//! hex( bincode( Envelope { tag, body: bincode(command) } ) )
//! ```
//! 十六进制文本只包含 `0-9a-f`，含有其他字节的分隔符（例如默认的 `\n`）
//! 不会出现在命令帧内部。

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Result, WireError};

/// 可以在连接上收发的命令
///
/// 通常由一个枚举实现，每个变体对应一个类型标签。只有标签在
/// [`WireConfig`](crate::WireConfig) 白名单中的命令才会交给处理器。
pub trait Command: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// 类型标签
    fn tag(&self) -> &'static str;
}

/// 命令信封：类型标签 + 序列化后的命令
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub tag: String,
    body: Vec<u8>,
}

impl Envelope {
    /// 封装命令
    pub fn seal<C: Command>(command: &C) -> Result<Self> {
        Ok(Self {
            tag: command.tag().to_string(),
            body: bincode::serialize(command)?,
        })
    }

    /// 编码为帧负载
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        Ok(hex::encode(bytes).into_bytes())
    }

    /// 从帧负载解码
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let bytes = hex::decode(frame)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// 还原为具体命令，并确认命令自身的标签与信封一致
    pub fn open<C: Command>(&self) -> Result<C> {
        let command: C = bincode::deserialize(&self.body)?;
        if command.tag() != self.tag {
            return Err(WireError::UnexpectedCommand {
                declared: self.tag.clone(),
                actual: command.tag().to_string(),
            });
        }
        Ok(command)
    }
}

/// 将命令编码为帧负载
pub fn encode_command<C: Command>(command: &C) -> Result<Vec<u8>> {
    Envelope::seal(command)?.encode()
}

/// 延迟探测命令
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LatencyProbe {
    /// 请求，携带发送时间（Unix 时间戳，微秒）
    Ping { sent_at: u64 },
    /// 响应，原样带回请求的发送时间
    Pong { ping_sent_at: u64, sent_at: u64 },
}

impl LatencyProbe {
    pub const PING: &'static str = "probe.ping";
    pub const PONG: &'static str = "probe.pong";

    /// 两个标签，便于一次注册
    pub const TAGS: [&'static str; 2] = [Self::PING, Self::PONG];

    pub fn ping() -> Self {
        LatencyProbe::Ping {
            sent_at: unix_micros(),
        }
    }

    /// 对 Ping 生成 Pong，其他命令返回 None
    pub fn reply(&self) -> Option<Self> {
        match self {
            LatencyProbe::Ping { sent_at } => Some(LatencyProbe::Pong {
                ping_sent_at: *sent_at,
                sent_at: unix_micros(),
            }),
            LatencyProbe::Pong { .. } => None,
        }
    }

    /// 本条命令的发送时间（Unix 时间戳，微秒）
    pub fn sent_at(&self) -> u64 {
        match self {
            LatencyProbe::Ping { sent_at } | LatencyProbe::Pong { sent_at, .. } => *sent_at,
        }
    }

    /// 从 Ping 发出到现在经过的时间（仅对 Pong 有意义）
    pub fn round_trip(&self) -> Option<Duration> {
        match self {
            LatencyProbe::Pong { ping_sent_at, .. } => Some(Duration::from_micros(
                unix_micros().saturating_sub(*ping_sent_at),
            )),
            LatencyProbe::Ping { .. } => None,
        }
    }
}

impl Command for LatencyProbe {
    fn tag(&self) -> &'static str {
        match self {
            LatencyProbe::Ping { .. } => Self::PING,
            LatencyProbe::Pong { .. } => Self::PONG,
        }
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    enum Other {
        Note(String),
    }

    impl Command for Other {
        fn tag(&self) -> &'static str {
            "other.note"
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let ping = LatencyProbe::Ping { sent_at: 42 };
        let frame = encode_command(&ping).unwrap();
        assert!(frame.iter().all(|b| b.is_ascii_hexdigit()));

        let envelope = Envelope::decode(&frame).unwrap();
        assert_eq!(envelope.tag, LatencyProbe::PING);
        assert_eq!(envelope.open::<LatencyProbe>().unwrap(), ping);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            Envelope::decode(b"not hex at all"),
            Err(WireError::Encoding(_))
        ));
        assert!(matches!(
            Envelope::decode(b"ff"),
            Err(WireError::Serialization(_))
        ));
    }

    #[test]
    fn test_open_rejects_mismatched_tag() {
        // 标签声称是 pong，内容却是 ping
        let mut envelope = Envelope::seal(&LatencyProbe::Ping { sent_at: 1 }).unwrap();
        envelope.tag = LatencyProbe::PONG.to_string();

        let err = envelope.open::<LatencyProbe>().unwrap_err();
        assert!(matches!(err, WireError::UnexpectedCommand { .. }));
    }

    #[test]
    fn test_open_rejects_wrong_shape() {
        let envelope = Envelope::seal(&Other::Note("hi".to_string())).unwrap();
        assert!(envelope.open::<LatencyProbe>().is_err());
        assert_eq!(
            envelope.open::<Other>().unwrap(),
            Other::Note("hi".to_string())
        );
    }

    #[test]
    fn test_probe_reply() {
        let ping = LatencyProbe::ping();
        let pong = ping.reply().unwrap();
        assert_eq!(pong.tag(), LatencyProbe::PONG);
        assert!(pong.reply().is_none());
        assert!(ping.round_trip().is_none());
        assert!(pong.round_trip().is_some());
        assert!(pong.sent_at() >= ping.sent_at());
    }
}
