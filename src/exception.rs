// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了服务器在事件循环、连接处理以及请求生命周期中可能出现的各类异常情况。
//!
//! ## 设计意图
//! - **错误分类**：涵盖协议解析错误、连接状态错误、编程错误（如响应已开始后修改元数据）以及 I/O 错误。
//! - **语义映射**：协议相关的变体可以通过 [`Exception::status_code`] 直接转换为 HTTP 状态码。
//! - **缺失不是错误**：查询参数或表单字段不存在时返回 `None`，不会产生 `Exception`。

use std::{fmt, io};

/// 服务器处理请求过程中发生的异常类型。
///
/// 该枚举通常作为 `Result` 的 `Err` 部分返回，用于指示处理失败的具体原因。
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Exception {
    /// 客户端发送的请求头无法解析为合法的 UTF-8 字符串。
    RequestIsNotUtf8,
    /// 请求行或请求头的格式不合法（缺少字段、非法的 Content-Length 等）。
    MalformedRequest,
    /// 客户端使用了服务器不支持的 HTTP 方法。
    UnSupportedRequestMethod,
    /// 客户端使用了服务器不支持的 HTTP 协议版本（例如 HTTP/2.0）。
    UnsupportedHttpVersion,
    /// 请求头超出了 `max_header_size` 限制。
    HeaderTooLarge,
    /// 请求体超出了 `max_body_size` 限制。
    PayloadTooLarge,
    /// 输出流已经创建，响应码、Content-Type 与响应头均不可再修改。
    ResponseAlreadyStarted,
    /// 同一连接上已经排队了一个响应。
    ResponseAlreadyQueued,
    /// 指定的连接不存在（可能已被对端关闭或超时回收）。
    ConnectionNotFound,
    /// 配置文件不存在或无法读取。
    ConfigNotFound,
    /// 底层 I/O 错误。
    Io(io::ErrorKind),
}

use Exception::*;

impl Exception {
    /// 协议层异常对应的 HTTP 状态码，非协议异常统一映射为 500
    pub fn status_code(&self) -> u16 {
        match self {
            RequestIsNotUtf8 | MalformedRequest => 400,
            UnSupportedRequestMethod => 405,
            UnsupportedHttpVersion => 505,
            HeaderTooLarge => 431,
            PayloadTooLarge => 413,
            _ => 500,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIsNotUtf8 => write!(f, "Request head can't be parsed in UTF-8"),
            MalformedRequest => write!(f, "Malformed request"),
            UnSupportedRequestMethod => write!(f, "Unsupported request method"),
            UnsupportedHttpVersion => write!(f, "Unsupported HTTP version"),
            HeaderTooLarge => write!(f, "Request header fields too large (431)"),
            PayloadTooLarge => write!(f, "Payload too large (413)"),
            ResponseAlreadyStarted => {
                write!(f, "Response metadata changed after the output stream was created")
            }
            ResponseAlreadyQueued => write!(f, "A response is already queued on this connection"),
            ConnectionNotFound => write!(f, "Connection not found"),
            ConfigNotFound => write!(f, "Config file not found"),
            Io(kind) => write!(f, "I/O error: {}", kind),
        }
    }
}

impl std::error::Error for Exception {}

impl From<io::Error> for Exception {
    fn from(e: io::Error) -> Self {
        Io(e.kind())
    }
}
