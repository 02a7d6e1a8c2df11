//! 协议常量定义

use std::time::Duration;

/// 默认帧分隔符（单个换行符）
pub const DEFAULT_DELIMITER: &[u8] = b"\n";

/// 单帧负载最大大小（不含分隔符）
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// 接收队列容量（帧数），队列满时监听循环暂停读取
pub const INBOX_CAPACITY: usize = 1024;

/// 服务端最大连接数默认值（0 表示不限制）
pub const UNLIMITED_CLIENTS: usize = 0;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 达到连接上限或 accept 失败后的退避时间（毫秒）
pub const ACCEPT_BACKOFF_MILLIS: u64 = 20;

/// 关闭时等待连接任务退出的时间（秒）
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);

/// accept 退避 Duration
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(ACCEPT_BACKOFF_MILLIS);

/// 关闭等待 Duration
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(SHUTDOWN_GRACE_SECS);
