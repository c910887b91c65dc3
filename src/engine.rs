// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 引擎接口
//!
//! 事件循环并不直接处理 socket 与 HTTP 报文，而是通过下面几个 trait 与“引擎”协作：
//!
//! - [`Engine`]：每轮循环先调用 [`Engine::prepare`] 让引擎把自己的 socket 注册进
//!   `mio::Registry` 并给出引擎希望的等待超时；等待结束后调用 [`Engine::service`]
//!   把就绪事件交还给引擎，由引擎驱动连接回调；停机时通过 [`Engine::pending_writes`]
//!   询问是否还有未发完的响应。
//! - [`ConnectionControl`]：挂起/恢复单个连接、为连接排队响应。
//! - [`ConnectionHandler`]：引擎回调的接收方（即请求分发器），
//!   先收到一次请求头，随后零到多次请求体分片（空分片表示请求体结束），最后一次完成通知。
//!
//! 任何具体引擎（内置的 [`crate::tcp::TcpEngine`]，或其他自带 socket 与解析器的实现）
//! 只要满足这些 trait 即可接入。

use mio::{event::Events, Registry, Token};
use std::fmt;
use std::io;
use std::time::Duration;

use crate::{exception::Exception, parser::RequestHead, response::Response};

/// 事件循环唤醒信号占用的 token，引擎不得使用
pub const WAKE_TOKEN: Token = Token(0);

/// 引擎内的连接标识，同时用于日志中的 `[ID..]` 前缀
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// [`Engine::service`] 的返回值
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Flow {
    Continue,
    Stop,
}

/// 请求分发完成后引擎对该连接的处理方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disposition {
    /// 挂起连接，直到请求被最终释放后恢复
    Suspend,
    /// 没有可分发的请求，直接关闭连接
    Close,
}

#[cfg_attr(test, mockall::automock)]
pub trait ConnectionControl {
    /// 暂停该连接的 I/O 事件投递
    fn suspend(&mut self, conn: ConnectionId);

    /// 恢复该连接的 I/O 事件投递
    fn resume(&mut self, conn: ConnectionId);

    /// 为连接排队一个响应；每个连接只允许排队一次
    fn queue_response(
        &mut self,
        conn: ConnectionId,
        status: u16,
        response: Response,
    ) -> Result<(), Exception>;
}

pub trait Engine: ConnectionControl {
    /// 把需要关注的 socket（重新）注册到 `registry`，返回引擎要求的最长等待时间
    fn prepare(&mut self, registry: &Registry) -> io::Result<Option<Duration>>;

    /// 处理一次等待返回的就绪事件，期间会回调 `handler`
    fn service(&mut self, events: &Events, handler: &mut dyn ConnectionHandler) -> Flow;

    /// 响应尚未完全发出的连接数。停机时事件循环会等它归零（受宽限期约束）后才退出
    fn pending_writes(&self) -> usize;
}

pub trait ConnectionHandler {
    /// 请求头解析完成
    fn on_headers(&mut self, conn: ConnectionId, head: RequestHead);

    /// 请求体分片，空分片表示请求体结束
    fn on_body(&mut self, conn: ConnectionId, chunk: &[u8]);

    /// 请求已完整到达，应执行分发
    fn on_complete(&mut self, conn: ConnectionId) -> Disposition;

    /// 连接在分发前被关闭（对端断开、超时或解析失败）
    fn on_closed(&mut self, conn: ConnectionId);
}
