// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 内置 TCP 引擎
//!
//! 基于 `mio` 的非阻塞 HTTP/1.x 引擎，实现 [`Engine`] 与 [`ConnectionControl`]。
//!
//! 每个连接只承载一次请求/响应交换，响应总是带 `Connection: close`，
//! 响应体发送完毕后关闭连接。连接状态：
//!
//! ```text
//! ReadingHead ──► ReadingBody ──► Suspended ──(resume)──► Writing ──► 关闭
//!      │                                                     ▲
//!      └──────────(请求头非法 / 过大，直接回错误页)─────────┘
//! ```

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{event::Events, Interest, Registry, Token};

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use crate::{
    config::Config,
    engine::{
        ConnectionControl, ConnectionHandler, ConnectionId, Disposition, Engine, Flow, WAKE_TOKEN,
    },
    exception::Exception,
    param::*,
    parser::RequestHead,
    response::{Body, BodyChunk, BodyReader, Response},
};

const LISTENER: Token = Token(1);
/// 连接 token 从这里开始编号，0 与 1 分别留给唤醒信号与监听 socket
const FIRST_CONNECTION: usize = 2;
const READ_CHUNK: usize = 4096;
const CONTINUE_LINE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    ReadingHead,
    ReadingBody { remaining: u64 },
    Suspended,
    Writing,
}

impl State {
    fn is_reading(&self) -> bool {
        matches!(self, State::ReadingHead | State::ReadingBody { .. })
    }
}

struct Connection {
    stream: TcpStream,
    state: State,
    registered: Option<Interest>,
    inbuf: BytesMut,
    outbuf: BytesMut,
    body: Option<BodyReader>,
    queued: bool,
    head_only: bool,
    last_activity: Instant,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            state: State::ReadingHead,
            registered: None,
            inbuf: BytesMut::with_capacity(READ_CHUNK),
            outbuf: BytesMut::new(),
            body: None,
            queued: false,
            head_only: false,
            last_activity: Instant::now(),
        }
    }

    fn desired_interest(&self) -> Option<Interest> {
        match self.state {
            State::ReadingHead | State::ReadingBody { .. } => Some(Interest::READABLE),
            State::Writing if !self.outbuf.is_empty() => Some(Interest::WRITABLE),
            _ => None,
        }
    }

    /// 把响应头与定长响应体放进发送缓冲，流式响应体留待 [`Connection::flush`] 读取
    fn load(&mut self, status: u16, mut response: Response) {
        self.outbuf.extend_from_slice(&response.head_bytes(status));
        match response.take_body() {
            Some(Body::Fixed(content)) => {
                if !self.head_only {
                    self.outbuf.extend_from_slice(&content);
                }
            }
            Some(Body::Stream(reader)) => self.body = Some(reader),
            None => {}
        }
        self.queued = true;
    }

    /// 立即发送临时响应；socket 暂时写不下的部分留在发送缓冲里，排在最终响应之前发出
    fn send_interim(&mut self, line: &[u8]) -> io::Result<()> {
        let written = match self.stream.write(line) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                0
            }
            Err(e) => return Err(e),
        };
        self.outbuf.extend_from_slice(&line[written..]);
        Ok(())
    }

    /// 尽可能多地发送数据，响应全部发送完毕时返回 `true`
    fn flush(&mut self) -> io::Result<bool> {
        loop {
            if self.outbuf.is_empty() {
                match self.body.as_ref().map(|b| b.poll_chunk()) {
                    Some(BodyChunk::Data(data)) => {
                        if !self.head_only {
                            self.outbuf.extend_from_slice(&data);
                        }
                        continue;
                    }
                    Some(BodyChunk::Pending) => return Ok(false),
                    Some(BodyChunk::Finished) | None => {
                        self.body = None;
                        return Ok(true);
                    }
                }
            }
            match self.stream.write(&self.outbuf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbuf.advance(n);
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// 输入缓冲推进一步的结果
enum Step {
    Wait,
    Headers(RequestHead),
    Body(Bytes),
    Complete,
    Reject(Exception),
}

pub struct TcpEngine {
    listener: TcpListener,
    listener_registered: bool,
    connections: HashMap<ConnectionId, Connection>,
    /// 已关闭、等待在下一次 `prepare` 中注销的连接
    retired: Vec<Connection>,
    /// 注册失败、等待在下一次 `service` 中关闭的连接
    broken: Vec<ConnectionId>,
    next_id: u64,
    max_header_size: usize,
    max_body_size: u64,
    max_connections: usize,
    idle_timeout: Option<Duration>,
}

impl TcpEngine {
    /// 按配置绑定监听地址：`local = true` 时只监听回环地址
    pub fn bind(config: &Config) -> Result<Self, Exception> {
        let address = match config.local() {
            true => Ipv4Addr::LOCALHOST,
            false => Ipv4Addr::UNSPECIFIED,
        };
        let listener = match TcpListener::bind(SocketAddr::from((address, config.port()))) {
            Ok(listener) => listener,
            Err(e) => {
                error!("无法绑定端口：{}，错误：{}", config.port(), e);
                return Err(e.into());
            }
        };
        info!("服务端将在{}上监听Socket连接", listener.local_addr()?);

        Ok(Self {
            listener,
            listener_registered: false,
            connections: HashMap::new(),
            retired: Vec::new(),
            broken: Vec::new(),
            next_id: 0,
            max_header_size: config.max_header_size(),
            max_body_size: config.max_body_size(),
            max_connections: config.max_connections(),
            idle_timeout: match config.connection_timeout_ms() {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Exception> {
        Ok(self.listener.local_addr()?)
    }

    /// 当前打开的连接数
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= self.max_connections {
                        warn!(
                            "连接数已达上限{}，拒绝来自{}的连接",
                            self.max_connections, peer
                        );
                        continue;
                    }
                    let id = ConnectionId(self.next_id);
                    self.next_id += 1;
                    debug!("[ID{}]新的连接：{}", id, peer);
                    self.connections.insert(id, Connection::new(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("接受连接失败：{}", e);
                    break;
                }
            }
        }
    }

    fn read_ready(&mut self, id: ConnectionId, handler: &mut dyn ConnectionHandler) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let conn = match self.connections.get_mut(&id) {
                Some(c) if c.state.is_reading() => c,
                _ => return,
            };
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    self.drop_connection(id, handler, "对端关闭连接");
                    return;
                }
                Ok(n) => {
                    conn.inbuf.extend_from_slice(&buf[..n]);
                    conn.last_activity = Instant::now();
                    self.process_input(id, handler);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("[ID{}]读取请求失败：{}", id, e);
                    self.drop_connection(id, handler, "读取失败");
                    return;
                }
            }
        }
    }

    fn process_input(&mut self, id: ConnectionId, handler: &mut dyn ConnectionHandler) {
        loop {
            match self.step(id) {
                Step::Wait => return,
                Step::Headers(head) => handler.on_headers(id, head),
                Step::Body(chunk) => handler.on_body(id, &chunk),
                Step::Complete => {
                    handler.on_body(id, &[]);
                    match handler.on_complete(id) {
                        Disposition::Suspend => self.suspend(id),
                        Disposition::Close => self.close(id),
                    }
                    return;
                }
                Step::Reject(e) => {
                    self.reject(id, e);
                    return;
                }
            }
        }
    }

    fn step(&mut self, id: ConnectionId) -> Step {
        let max_header_size = self.max_header_size;
        let max_body_size = self.max_body_size;
        let conn = match self.connections.get_mut(&id) {
            Some(c) => c,
            None => return Step::Wait,
        };

        match conn.state {
            State::ReadingHead => {
                let end = match find_subsequence(&conn.inbuf, HEAD_TERMINATOR) {
                    Some(end) => end,
                    None if conn.inbuf.len() > max_header_size => {
                        return Step::Reject(Exception::HeaderTooLarge)
                    }
                    None => return Step::Wait,
                };
                if end > max_header_size {
                    return Step::Reject(Exception::HeaderTooLarge);
                }
                let raw = conn.inbuf.split_to(end + HEAD_TERMINATOR.len());
                let head = match RequestHead::try_from(&raw[..end], id) {
                    Ok(head) => head,
                    Err(e) => return Step::Reject(e),
                };
                if head.content_length() > max_body_size {
                    return Step::Reject(Exception::PayloadTooLarge);
                }
                if head
                    .header("expect")
                    .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
                {
                    if let Err(e) = conn.send_interim(CONTINUE_LINE) {
                        warn!("[ID{}]发送100 Continue失败：{}", id, e);
                    }
                }
                conn.head_only = head.method() == HttpRequestMethod::Head;
                conn.state = State::ReadingBody {
                    remaining: head.content_length(),
                };
                Step::Headers(head)
            }
            State::ReadingBody { remaining } if remaining > 0 => {
                if conn.inbuf.is_empty() {
                    return Step::Wait;
                }
                let take = remaining.min(conn.inbuf.len() as u64);
                conn.state = State::ReadingBody {
                    remaining: remaining - take,
                };
                Step::Body(conn.inbuf.split_to(take as usize).freeze())
            }
            State::ReadingBody { .. } => {
                if !conn.inbuf.is_empty() {
                    debug!("[ID{}]忽略请求体之后的{}字节", id, conn.inbuf.len());
                    conn.inbuf.clear();
                }
                Step::Complete
            }
            State::Suspended | State::Writing => Step::Wait,
        }
    }

    /// 请求在分发前就被判定为非法，引擎直接回复错误页并关闭连接
    fn reject(&mut self, id: ConnectionId, e: Exception) {
        let status = e.status_code();
        warn!("[ID{}]拒绝请求：{}，返回{}", id, e, status);
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.inbuf.clear();
            conn.load(status, Response::error_page(status));
            conn.state = State::Writing;
        }
        self.pump(id);
    }

    fn pump(&mut self, id: ConnectionId) {
        let conn = match self.connections.get_mut(&id) {
            Some(c) if c.state == State::Writing => c,
            _ => return,
        };
        match conn.flush() {
            Ok(true) => {
                debug!("[ID{}]响应发送完毕", id);
                self.close(id);
            }
            Ok(false) => {}
            Err(e) => {
                warn!("[ID{}]发送响应失败：{}", id, e);
                self.close(id);
            }
        }
    }

    /// 关闭分发前的连接时通知分发器丢弃未完成的请求
    fn drop_connection(
        &mut self,
        id: ConnectionId,
        handler: &mut dyn ConnectionHandler,
        reason: &str,
    ) {
        let before_dispatch = self
            .connections
            .get(&id)
            .is_some_and(|c| c.state.is_reading());
        debug!("[ID{}]{}，关闭连接", id, reason);
        if before_dispatch {
            handler.on_closed(id);
        }
        self.close(id);
    }

    fn close(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.remove(&id) {
            let _ = conn.stream.shutdown(Shutdown::Write);
            self.retired.push(conn);
            debug!("[ID{}]连接已关闭", id);
        }
    }

    fn reap_idle(&mut self, handler: &mut dyn ConnectionHandler) {
        let timeout = match self.idle_timeout {
            Some(t) => t,
            None => return,
        };
        let now = Instant::now();
        let expired: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| {
                c.state != State::Suspended && now.duration_since(c.last_activity) >= timeout
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            info!("[ID{}]连接空闲超过{}ms", id, timeout.as_millis());
            self.drop_connection(id, handler, "连接空闲超时");
        }
    }

    /// 最早一个空闲连接到期的剩余时间
    fn next_idle_deadline(&self, now: Instant) -> Option<Duration> {
        let timeout = self.idle_timeout?;
        self.connections
            .values()
            .filter(|c| c.state != State::Suspended)
            .map(|c| (c.last_activity + timeout).saturating_duration_since(now))
            .min()
    }
}

impl ConnectionControl for TcpEngine {
    fn suspend(&mut self, conn: ConnectionId) {
        if let Some(c) = self.connections.get_mut(&conn) {
            if c.state.is_reading() {
                c.state = State::Suspended;
                debug!("[ID{}]连接已挂起", conn);
            }
        }
    }

    fn resume(&mut self, conn: ConnectionId) {
        let c = match self.connections.get_mut(&conn) {
            Some(c) => c,
            None => {
                debug!("[ID{}]要恢复的连接已不存在", conn);
                return;
            }
        };
        if c.state != State::Suspended {
            return;
        }
        if !c.queued {
            warn!("[ID{}]连接恢复时没有排队的响应，直接关闭", conn);
            self.close(conn);
            return;
        }
        c.state = State::Writing;
        c.last_activity = Instant::now();
        debug!("[ID{}]连接已恢复", conn);
        self.pump(conn);
    }

    fn queue_response(
        &mut self,
        conn: ConnectionId,
        status: u16,
        response: Response,
    ) -> Result<(), Exception> {
        let c = self
            .connections
            .get_mut(&conn)
            .ok_or(Exception::ConnectionNotFound)?;
        if c.queued {
            return Err(Exception::ResponseAlreadyQueued);
        }
        debug!("[ID{}]响应已排队，状态码：{}", conn, status);
        c.load(status, response);
        Ok(())
    }
}

impl Engine for TcpEngine {
    fn prepare(&mut self, registry: &Registry) -> io::Result<Option<Duration>> {
        if !self.listener_registered {
            registry.register(&mut self.listener, LISTENER, Interest::READABLE)?;
            self.listener_registered = true;
        }

        for mut conn in self.retired.drain(..) {
            if conn.registered.is_some() {
                let _ = registry.deregister(&mut conn.stream);
            }
        }

        for (id, conn) in self.connections.iter_mut() {
            let desired = conn.desired_interest();
            if desired == conn.registered {
                continue;
            }
            let token = token_of(*id);
            let result = match (conn.registered, desired) {
                (None, Some(interest)) => registry.register(&mut conn.stream, token, interest),
                (Some(_), Some(interest)) => {
                    registry.reregister(&mut conn.stream, token, interest)
                }
                (Some(_), None) => registry.deregister(&mut conn.stream),
                (None, None) => Ok(()),
            };
            match result {
                Ok(()) => conn.registered = desired,
                Err(e) => {
                    warn!("[ID{}]注册连接事件失败：{}", id, e);
                    self.broken.push(*id);
                }
            }
        }

        Ok(self.next_idle_deadline(Instant::now()))
    }

    fn service(&mut self, events: &Events, handler: &mut dyn ConnectionHandler) -> Flow {
        for id in std::mem::take(&mut self.broken) {
            self.drop_connection(id, handler, "事件注册失败");
        }

        for event in events.iter() {
            match event.token() {
                WAKE_TOKEN => {}
                LISTENER => self.accept_all(),
                token => {
                    let id = match id_of(token) {
                        Some(id) => id,
                        None => continue,
                    };
                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        self.read_ready(id, handler);
                    }
                    if event.is_writable() {
                        self.pump(id);
                    }
                }
            }
        }

        // 流式响应体的新数据不会产生 socket 事件，每轮都检查一遍
        let writing: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state == State::Writing)
            .map(|(id, _)| *id)
            .collect();
        for id in writing {
            self.pump(id);
        }

        self.reap_idle(handler);
        Flow::Continue
    }

    fn pending_writes(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state == State::Writing)
            .count()
    }
}

fn token_of(id: ConnectionId) -> Token {
    Token(id.0 as usize + FIRST_CONNECTION)
}

fn id_of(token: Token) -> Option<ConnectionId> {
    token
        .0
        .checked_sub(FIRST_CONNECTION)
        .map(|n| ConnectionId(n as u64))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
