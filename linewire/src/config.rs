//! 连接共享配置
//!
//! 一个 [`WireConfig`] 由 `Arc` 在 Acceptor、Connector 和所有连接之间共享。
//! 分隔符在每次读写时读取，修改它会影响所有正在进行的连接，
//! 在连接活跃时修改由调用方负责。

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::constants::{DEFAULT_DELIMITER, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{Result, WireError};

/// 分隔符、命令白名单和帧大小上限
#[derive(Debug)]
pub struct WireConfig {
    delimiter: RwLock<Arc<[u8]>>,
    whitelist: RwLock<HashSet<String>>,
    max_frame_size: usize,
}

impl WireConfig {
    pub fn new() -> Self {
        Self {
            delimiter: RwLock::new(Arc::from(DEFAULT_DELIMITER)),
            whitelist: RwLock::new(HashSet::new()),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// 设置单帧负载上限
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// 将命令类型加入白名单
    pub fn register(&self, tag: impl Into<String>) {
        self.whitelist.write().insert(tag.into());
    }

    /// 批量注册命令类型
    pub fn register_all<I, T>(&self, tags: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut whitelist = self.whitelist.write();
        whitelist.extend(tags.into_iter().map(Into::into));
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.whitelist.read().contains(tag)
    }

    /// 替换分隔符，空分隔符会被拒绝
    pub fn set_delimiter(&self, delimiter: impl Into<Vec<u8>>) -> Result<()> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(WireError::EmptyDelimiter);
        }
        *self.delimiter.write() = Arc::from(delimiter);
        Ok(())
    }

    /// 当前分隔符
    pub fn delimiter(&self) -> Arc<[u8]> {
        Arc::clone(&self.delimiter.read())
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for WireConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 解析命令行形式的分隔符，支持 `\n`、`\r`、`\t`、`\0`、`\\` 和 `\xHH` 转义
pub fn parse_delimiter(text: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut utf8 = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => bytes.push(b'\n'),
            Some('r') => bytes.push(b'\r'),
            Some('t') => bytes.push(b'\t'),
            Some('0') => bytes.push(0),
            Some('x') => {
                let digits: String = chars.clone().take(2).collect();
                match u8::from_str_radix(&digits, 16) {
                    Ok(byte) if digits.len() == 2 && digits.chars().all(|c| c.is_ascii_hexdigit()) => {
                        bytes.push(byte);
                        chars.nth(1);
                    }
                    // 不完整的 \x 按字面保留
                    _ => bytes.extend_from_slice(b"\\x"),
                }
            }
            Some(other) => {
                let mut utf8 = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
            }
            None => bytes.push(b'\\'),
        }
    }

    if bytes.is_empty() {
        return Err(WireError::EmptyDelimiter);
    }
    Ok(bytes)
}
