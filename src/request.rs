// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求对象
//!
//! 一个 [`Request`] 对应一个连接上的一次请求/响应交换。它由分发器创建，
//! 以 `Arc<Request>` 的形式在分发器与异步处理器之间共享。
//!
//! ## 生命周期
//! 1. 分发器在收到请求头时创建请求，POST 请求体随后被解析进表单累加器。
//! 2. 处理器第一次调用 [`Request::output_stream`] 时创建流式响应并排队到连接上，
//!    此后响应码、Content-Type 与响应头均不可再修改。
//! 3. 最后一个持有者释放请求时（`Drop`）关闭输出流，恢复被挂起的连接并唤醒事件循环。
//!    若此时仍未产生任何响应，会补发一个 500 诊断页，保证连接不会被永久挂起。

use log::{debug, error, warn};

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::{
    engine::ConnectionId,
    exception::Exception,
    param::*,
    parser::RequestHead,
    post::PostData,
    reactor::{Command, ReactorHandle},
    response::{body_pipe, OutputStream, Response},
    util::{lock, HtmlBuilder},
};

struct ResponseState {
    status: u16,
    content_type: String,
    headers: Vec<(String, String)>,
    stream: Option<OutputStream>,
}

pub struct Request {
    id: ConnectionId,
    head: RequestHead,
    post: Mutex<PostData>,
    response: Mutex<ResponseState>,
    dispatched: AtomicBool,
    reactor: ReactorHandle,
}

impl Request {
    pub(crate) fn new(id: ConnectionId, head: RequestHead, reactor: ReactorHandle) -> Self {
        reactor.request_started();
        Self {
            id,
            head,
            post: Mutex::new(PostData::new()),
            response: Mutex::new(ResponseState {
                status: 200,
                content_type: DEFAULT_CONTENT_TYPE.to_string(),
                headers: Vec::new(),
                stream: None,
            }),
            dispatched: AtomicBool::new(false),
            reactor,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// 解码后的请求路径，不含查询字符串
    pub fn url(&self) -> &str {
        self.head.url()
    }

    pub fn method(&self) -> HttpRequestMethod {
        self.head.method()
    }

    pub fn version(&self) -> HttpVersion {
        self.head.version()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    /// 查找参数：先查 URL 查询参数，再查 POST 表单字段，都没有时返回 `None`
    pub fn arg(&self, key: &str) -> Option<String> {
        if let Some((_, v)) = self.head.query().iter().find(|(k, _)| k == key) {
            return Some(v.clone());
        }
        lock(&self.post).get(key)
    }

    /// 获取输出流，第一次调用时创建响应并排队到连接上
    pub fn output_stream(&self) -> OutputStream {
        let mut state = lock(&self.response);
        start_stream(self.id, &self.reactor, &mut state)
    }

    /// 向响应体写入内容，写入失败只记录日志
    pub fn send(&self, body: impl AsRef<[u8]>) {
        if let Err(e) = self.output_stream().write_all(body.as_ref()) {
            warn!("[ID{}]写入响应体失败：{}", self.id, e);
        }
    }

    pub fn set_status(&self, code: u16) -> Result<(), Exception> {
        let mut state = self.mutable_state("响应码")?;
        state.status = code;
        Ok(())
    }

    pub fn set_content_type(&self, content_type: &str) -> Result<(), Exception> {
        let mut state = self.mutable_state("Content-Type")?;
        state.content_type = content_type.to_string();
        Ok(())
    }

    /// 追加一个额外的响应头
    pub fn set_header(&self, name: &str, value: &str) -> Result<(), Exception> {
        let mut state = self.mutable_state("响应头")?;
        state.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    pub fn status(&self) -> u16 {
        lock(&self.response).status
    }

    pub fn content_type(&self) -> String {
        lock(&self.response).content_type.clone()
    }

    /// 输出流是否已经创建
    pub fn response_started(&self) -> bool {
        lock(&self.response).stream.is_some()
    }

    pub(crate) fn accept_post(&self, key: &str, offset: u64, data: &[u8]) {
        lock(&self.post).accept(key, offset, data);
    }

    pub(crate) fn mark_dispatched(&self) {
        self.dispatched.store(true, Ordering::Release);
    }

    fn mutable_state(
        &self,
        what: &str,
    ) -> Result<std::sync::MutexGuard<'_, ResponseState>, Exception> {
        let state = lock(&self.response);
        if state.stream.is_some() {
            error!(
                "[ID{}]输出流已创建后试图修改{}，这说明处理器代码存在错误",
                self.id, what
            );
            return Err(Exception::ResponseAlreadyStarted);
        }
        Ok(state)
    }
}

/// 创建（或复用）输出流；第一次创建时把流式响应排队到连接上
fn start_stream(
    id: ConnectionId,
    reactor: &ReactorHandle,
    state: &mut ResponseState,
) -> OutputStream {
    if let Some(stream) = &state.stream {
        return stream.clone();
    }
    let (stream, reader) = body_pipe(Some(reactor.wake_signal()));
    let mut response = Response::streaming(reader);
    response.set_header("Content-Type", &state.content_type);
    for (name, value) in &state.headers {
        response.set_header(name, value);
    }
    debug!("[ID{}]创建流式响应，状态码：{}", id, state.status);
    reactor.post(Command::Respond {
        conn: id,
        status: state.status,
        response,
    });
    state.stream = Some(stream.clone());
    stream
}

impl Drop for Request {
    fn drop(&mut self) {
        let dispatched = *self.dispatched.get_mut();
        let state = match self.response.get_mut() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };

        if dispatched {
            if state.stream.is_none() {
                error!(
                    "[ID{}]请求{}在未产生任何响应的情况下被释放，返回500诊断页",
                    self.id,
                    self.head.url()
                );
                state.status = 500;
                state.content_type = "text/html;charset=utf-8".to_string();
                let mut stream = start_stream(self.id, &self.reactor, state);
                let page = HtmlBuilder::from_status_code(
                    500,
                    Some("The request handlers finished without producing a response."),
                )
                .build();
                let _ = stream.write_all(page.as_bytes());
            }
            if let Some(stream) = &state.stream {
                stream.close();
            }
            self.reactor.post(Command::Resume(self.id));
            debug!("[ID{}]请求已释放，连接恢复", self.id);
        } else {
            debug!("[ID{}]请求在分发前被丢弃", self.id);
        }
        self.reactor.request_finished();
    }
}
