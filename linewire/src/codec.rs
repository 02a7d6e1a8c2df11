//! 帧编解码
//!
//! 帧格式:
//! ```text
//! ┌────────────────────────────────┬──────────────────────┐
//! │        Payload (任意字节)       │  Delimiter (≥ 1 字节) │
//! └────────────────────────────────┴──────────────────────┘
//! ```
//!
//! 帧长度不写入线路，读取端逐字节扫描直到完整匹配分隔符。

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::constants::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{Result, WireError};

/// 一次读取的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFrame {
    /// 完整的一帧（不含分隔符），可以为空
    Complete(Vec<u8>),
    /// 对端在分隔符之前关闭了流，携带已读到的字节
    Eof(Vec<u8>),
}

/// 分隔符匹配状态
///
/// 用前缀函数处理多字节分隔符：部分匹配被打断时，不可能再成为分隔符开头的
/// 那部分字节会被写回负载，而不是丢弃。
#[derive(Debug, Default)]
struct DelimiterMatcher {
    delimiter: Vec<u8>,
    fallback: Vec<usize>,
}

impl DelimiterMatcher {
    fn prepare(&mut self, delimiter: &[u8]) {
        if self.delimiter == delimiter {
            return;
        }
        let mut fallback = vec![0; delimiter.len()];
        let mut k = 0;
        for i in 1..delimiter.len() {
            while k > 0 && delimiter[i] != delimiter[k] {
                k = fallback[k - 1];
            }
            if delimiter[i] == delimiter[k] {
                k += 1;
            }
            fallback[i] = k;
        }
        self.delimiter = delimiter.to_vec();
        self.fallback = fallback;
    }

    /// 推进一个字节，返回新的匹配长度
    fn advance(&self, mut matched: usize, byte: u8, payload: &mut Vec<u8>) -> usize {
        loop {
            if byte == self.delimiter[matched] {
                return matched + 1;
            }
            if matched == 0 {
                payload.push(byte);
                return 0;
            }
            let keep = self.fallback[matched - 1];
            payload.extend_from_slice(&self.delimiter[..matched - keep]);
            matched = keep;
        }
    }
}

/// 帧读取器
pub struct FrameReader<R> {
    reader: BufReader<R>,
    matcher: DelimiterMatcher,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// 创建新的帧读取器
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            matcher: DelimiterMatcher::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// 设置单帧负载上限
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// 读取一帧，直到完整匹配 `delimiter`
    ///
    /// 流在分隔符之前结束时返回 [`ReadFrame::Eof`]，这不是错误。
    /// 该方法不是取消安全的：中途取消会丢失已消费的字节。
    pub async fn read_frame(&mut self, delimiter: &[u8]) -> Result<ReadFrame> {
        if delimiter.is_empty() {
            return Err(WireError::EmptyDelimiter);
        }
        self.matcher.prepare(delimiter);

        let mut payload = Vec::new();
        let mut matched = 0;
        loop {
            let chunk = self.reader.fill_buf().await?;
            if chunk.is_empty() {
                payload.extend_from_slice(&delimiter[..matched]);
                return Ok(ReadFrame::Eof(payload));
            }

            let mut consumed = 0;
            let mut complete = false;
            for &byte in chunk {
                consumed += 1;
                matched = self.matcher.advance(matched, byte, &mut payload);
                if payload.len() > self.max_frame_size {
                    return Err(WireError::FrameTooLarge {
                        max: self.max_frame_size,
                    });
                }
                if matched == delimiter.len() {
                    complete = true;
                    break;
                }
            }
            self.reader.consume(consumed);

            if complete {
                return Ok(ReadFrame::Complete(payload));
            }
        }
    }
}

/// 帧写入器
pub struct FrameWriter<W> {
    writer: W,
    buffer: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// 创建新的帧写入器
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buffer: Vec::new(),
        }
    }

    /// 写入负载和分隔符，然后 flush
    pub async fn write_frame(&mut self, payload: &[u8], delimiter: &[u8]) -> Result<()> {
        if delimiter.is_empty() {
            return Err(WireError::EmptyDelimiter);
        }

        // 负载和分隔符合并为一次写入
        self.buffer.clear();
        self.buffer.extend_from_slice(payload);
        self.buffer.extend_from_slice(delimiter);

        // 分隔符第一次出现的位置必须正好在负载末尾，否则对端会切出另一帧
        if first_match(&self.buffer, delimiter) != Some(payload.len()) {
            return Err(WireError::DelimiterInPayload { len: payload.len() });
        }

        self.writer.write_all(&self.buffer).await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// 关闭写入端
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn first_match(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
