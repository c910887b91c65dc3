// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 响应与输出管道
//!
//! - [`body_pipe`] 创建一对内存管道：处理器持有 [`OutputStream`] 写入响应体，
//!   引擎持有 [`BodyReader`] 在连接可写时把数据发送出去。
//! - [`Response`] 是交给引擎排队的响应对象，包含状态码、响应头与响应体来源。
//!   响应对象被丢弃时（`Drop`）管道的读端随之释放。

use bytes::{Bytes, BytesMut};
use chrono::prelude::*;
use log::debug;

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::{param::*, util::lock, wake::WakeSignal};

#[derive(Default)]
struct Pipe {
    buf: BytesMut,
    closed: bool,
}

/// 响应体写入端，可跨线程使用，写入时会唤醒事件循环
#[derive(Clone)]
pub struct OutputStream {
    pipe: Arc<Mutex<Pipe>>,
    wake: Option<WakeSignal>,
}

/// 响应体读取端，由引擎持有
pub struct BodyReader {
    pipe: Arc<Mutex<Pipe>>,
}

/// 从读取端取数据的结果
#[derive(Debug, PartialEq)]
pub enum BodyChunk {
    /// 新到达的数据
    Data(Bytes),
    /// 暂无数据，但写入端尚未关闭
    Pending,
    /// 写入端已关闭且数据已全部取走
    Finished,
}

/// 创建一条响应体管道，`wake` 用于在写入后通知事件循环
pub fn body_pipe(wake: Option<WakeSignal>) -> (OutputStream, BodyReader) {
    let pipe = Arc::new(Mutex::new(Pipe::default()));
    (
        OutputStream {
            pipe: Arc::clone(&pipe),
            wake,
        },
        BodyReader { pipe },
    )
}

impl OutputStream {
    /// 关闭写入端，之后的写入返回 `BrokenPipe`
    pub fn close(&self) {
        lock(&self.pipe).closed = true;
        if let Some(wake) = &self.wake {
            wake.signal();
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.pipe).closed
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut pipe = lock(&self.pipe);
            if pipe.closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "response body already finished",
                ));
            }
            pipe.buf.extend_from_slice(buf);
        }
        if let Some(wake) = &self.wake {
            wake.signal();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BodyReader {
    /// 取出当前缓冲的全部数据
    pub fn poll_chunk(&self) -> BodyChunk {
        let mut pipe = lock(&self.pipe);
        if !pipe.buf.is_empty() {
            BodyChunk::Data(pipe.buf.split().freeze())
        } else if pipe.closed {
            BodyChunk::Finished
        } else {
            BodyChunk::Pending
        }
    }
}

/// 响应体来源
pub enum Body {
    /// 长度已知的响应体，会附带 `Content-Length`
    Fixed(Bytes),
    /// 流式响应体，以关闭连接作为结束标志
    Stream(BodyReader),
}

pub struct Response {
    headers: Vec<(String, String)>,
    body: Option<Body>,
    date: DateTime<Utc>,
}

impl Response {
    /// 以管道读取端创建流式响应
    pub fn streaming(reader: BodyReader) -> Self {
        Self {
            headers: Vec::new(),
            body: Some(Body::Stream(reader)),
            date: Utc::now(),
        }
    }

    /// 创建长度已知的响应
    pub fn fixed(content: impl Into<Bytes>) -> Self {
        Self {
            headers: Vec::new(),
            body: Some(Body::Fixed(content.into())),
            date: Utc::now(),
        }
    }

    /// 引擎自身生成的错误页（解析失败、请求过大等）
    pub fn error_page(code: u16) -> Self {
        let html = crate::util::HtmlBuilder::from_status_code(code, None).build();
        let mut response = Self::fixed(html);
        response.set_header("Content-Type", "text/html;charset=utf-8");
        response
    }

    /// 添加响应头，同名响应头会被覆盖
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 取走响应体，之后由引擎负责发送
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// 序列化状态行与响应头
    pub fn head_bytes(&self, status_code: u16) -> Vec<u8> {
        let status_code_str: &str = &status_code.to_string();
        let date: &str = &format_date(&self.date);

        let mut head = [
            "HTTP/1.1 ",
            status_code_str,
            " ",
            reason_phrase(status_code),
            CRLF,
            "Date: ",
            date,
            CRLF,
            "Server: ",
            SERVER_NAME,
            CRLF,
            "Connection: close",
            CRLF,
        ]
        .concat();
        if let Some(Body::Fixed(content)) = &self.body {
            head.push_str(&["Content-Length: ", &content.len().to_string(), CRLF].concat());
        }
        for (name, value) in &self.headers {
            head.push_str(&[name.as_str(), ": ", value.as_str(), CRLF].concat());
        }
        head.push_str(CRLF);
        debug!("响应头构建完成，长度：{}", head.len());
        head.into_bytes()
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
