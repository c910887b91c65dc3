// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 增量表单解析器
//!
//! 请求体按网络到达的节奏一段段喂给解析器，解析器每解出一段字段值就回调
//! `(字段名, 偏移量, 字节)`，偏移量是该段在解码后字段值中的位置。
//! 跨分片被截断的百分号转义（如 `%E`）会暂存到下一次 `feed`。

use log::warn;
use percent_encoding::percent_decode;

use crate::{
    engine::ConnectionId,
    param::{HttpRequestMethod, FORM_URLENCODED},
    parser::RequestHead,
};

/// 字段分片回调：`(字段名, 偏移量, 字节)`
pub type FieldSink<'a> = dyn FnMut(&str, u64, &[u8]) + 'a;

pub trait FormParser: Send {
    /// 喂入一段请求体
    fn feed(&mut self, data: &[u8], sink: &mut FieldSink<'_>);

    /// 请求体结束，吐出剩余的全部字段
    fn finish(&mut self, sink: &mut FieldSink<'_>);
}

/// 按请求头选择解析器，不支持的请求体类型返回 `None`
pub fn create_form_parser(
    head: &RequestHead,
    buffer_size: usize,
    id: ConnectionId,
) -> Option<Box<dyn FormParser>> {
    if head.method() != HttpRequestMethod::Post {
        return None;
    }
    match head.content_type() {
        Some(t) if t.eq_ignore_ascii_case(FORM_URLENCODED) => {
            Some(Box::new(UrlEncodedParser::new(buffer_size)))
        }
        // 很多客户端发送表单时不带 Content-Type，按表单处理
        None => Some(Box::new(UrlEncodedParser::new(buffer_size))),
        Some(other) => {
            warn!("[ID{}]不支持解析的请求体类型：{}，请求体将被忽略", id, other);
            None
        }
    }
}

/// `application/x-www-form-urlencoded` 增量解析器
pub struct UrlEncodedParser {
    buffer_size: usize,
    key: Vec<u8>,
    decoded_key: String,
    in_value: bool,
    pending: Vec<u8>,
    offset: u64,
    emitted: bool,
}

impl UrlEncodedParser {
    /// `buffer_size` 为未解码字节的最大暂存量，超过后立即吐出
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(4),
            key: Vec::new(),
            decoded_key: String::new(),
            in_value: false,
            pending: Vec::new(),
            offset: 0,
            emitted: false,
        }
    }

    fn reset(&mut self) {
        self.key.clear();
        self.decoded_key.clear();
        self.in_value = false;
        self.pending.clear();
        self.offset = 0;
        self.emitted = false;
    }

    /// 解码并吐出暂存的字段值；`complete` 为假时保留尾部不完整的转义序列
    fn flush(&mut self, complete: bool, sink: &mut FieldSink<'_>) {
        let keep = if complete {
            0
        } else {
            incomplete_escape_len(&self.pending)
        };
        let split = self.pending.len() - keep;
        if split > 0 {
            let decoded = decode(&self.pending[..split]);
            sink(&self.decoded_key, self.offset, &decoded);
            self.offset += decoded.len() as u64;
            self.emitted = true;
            self.pending.drain(..split);
        }
        if complete && !self.emitted {
            // 空值字段（如 `flag=` 或 `flag`）也要建立条目
            sink(&self.decoded_key, 0, b"");
            self.emitted = true;
        }
    }

    fn end_field(&mut self, sink: &mut FieldSink<'_>) {
        if !self.in_value {
            if self.key.is_empty() {
                return;
            }
            self.decoded_key = String::from_utf8_lossy(&decode(&self.key)).into_owned();
        }
        self.flush(true, sink);
        self.reset();
    }
}

impl FormParser for UrlEncodedParser {
    fn feed(&mut self, data: &[u8], sink: &mut FieldSink<'_>) {
        for &b in data {
            match (self.in_value, b) {
                (_, b'&') => self.end_field(sink),
                (false, b'=') => {
                    self.decoded_key = String::from_utf8_lossy(&decode(&self.key)).into_owned();
                    self.in_value = true;
                }
                (false, _) => self.key.push(b),
                (true, _) => {
                    self.pending.push(b);
                    if self.pending.len() >= self.buffer_size {
                        self.flush(false, sink);
                    }
                }
            }
        }
        if self.in_value {
            self.flush(false, sink);
        }
    }

    fn finish(&mut self, sink: &mut FieldSink<'_>) {
        self.end_field(sink);
    }
}

/// 末尾不完整的 `%X` / `%` 转义长度
fn incomplete_escape_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    if len >= 1 && bytes[len - 1] == b'%' {
        1
    } else if len >= 2 && bytes[len - 2] == b'%' {
        2
    } else {
        0
    }
}

fn decode(raw: &[u8]) -> Vec<u8> {
    let replaced: Vec<u8> = raw
        .iter()
        .map(|&b| if b == b'+' { b' ' } else { b })
        .collect();
    percent_decode(&replaced).collect()
}
