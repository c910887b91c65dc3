// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求分发器
//!
//! 实现引擎的连接回调，维护每个连接上唯一的活动请求，并驱动请求的状态机：
//!
//! ```text
//! Created ─┬─(POST)──► AwaitingBody ──(空分片)──► BodyComplete ──► Dispatching ──► Suspended
//!          └─(其他)──────────────────────────────► BodyComplete
//! ```
//!
//! 分发结束后分发器立即放弃对请求的持有；最后一个持有者释放请求时（见 [`Request`] 的
//! `Drop`）才会完成响应并恢复连接。

use log::{debug, warn};

use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    engine::{ConnectionHandler, ConnectionId, Disposition},
    form::{create_form_parser, FormParser},
    param::HttpRequestMethod,
    parser::RequestHead,
    pipeline::Pipeline,
    reactor::ReactorHandle,
    request::Request,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    AwaitingBody,
    BodyComplete,
}

struct Slot {
    request: Arc<Request>,
    parser: Option<Box<dyn FormParser>>,
    phase: Phase,
}

impl Slot {
    /// 请求体结束：吐出解析器剩余字段并释放解析器
    fn finish_body(&mut self) {
        if let Some(mut parser) = self.parser.take() {
            let request = &self.request;
            parser.finish(&mut |key: &str, offset: u64, data: &[u8]| {
                request.accept_post(key, offset, data)
            });
        }
        self.phase = Phase::BodyComplete;
    }
}

pub struct Dispatcher {
    pipeline: Pipeline,
    slots: HashMap<ConnectionId, Slot>,
    reactor: ReactorHandle,
    post_buffer_size: usize,
}

impl Dispatcher {
    pub fn new(reactor: ReactorHandle, post_buffer_size: usize) -> Self {
        Self {
            pipeline: Pipeline::new(),
            slots: HashMap::new(),
            reactor,
            post_buffer_size,
        }
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// 正在接收请求体、尚未分发的连接数
    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

impl ConnectionHandler for Dispatcher {
    fn on_headers(&mut self, conn: ConnectionId, head: RequestHead) {
        let is_post = head.method() == HttpRequestMethod::Post;
        let parser = if is_post {
            create_form_parser(&head, self.post_buffer_size, conn)
        } else {
            None
        };
        debug!("[ID{}]创建请求：{} {}", conn, head.method(), head.url());
        let slot = Slot {
            request: Arc::new(Request::new(conn, head, self.reactor.clone())),
            parser,
            phase: if is_post {
                Phase::AwaitingBody
            } else {
                Phase::BodyComplete
            },
        };
        if self.slots.insert(conn, slot).is_some() {
            warn!("[ID{}]连接上已有未分发的请求，旧请求被丢弃", conn);
        }
    }

    fn on_body(&mut self, conn: ConnectionId, chunk: &[u8]) {
        let slot = match self.slots.get_mut(&conn) {
            Some(s) => s,
            None => {
                warn!("[ID{}]收到请求体，但连接上没有请求", conn);
                return;
            }
        };
        if slot.phase != Phase::AwaitingBody {
            return;
        }
        if chunk.is_empty() {
            slot.finish_body();
            debug!("[ID{}]请求体接收完毕", conn);
            return;
        }
        if let Some(parser) = slot.parser.as_mut() {
            let request = &slot.request;
            parser.feed(chunk, &mut |key: &str, offset: u64, data: &[u8]| {
                request.accept_post(key, offset, data)
            });
        }
    }

    fn on_complete(&mut self, conn: ConnectionId) -> Disposition {
        let mut slot = match self.slots.remove(&conn) {
            Some(s) => s,
            None => {
                warn!("[ID{}]请求完成通知到达，但连接上没有请求", conn);
                return Disposition::Close;
            }
        };
        if slot.phase == Phase::AwaitingBody {
            slot.finish_body();
        }

        slot.request.mark_dispatched();
        self.pipeline.dispatch(&slot.request);
        debug!(
            "[ID{}]分发完成，请求持有者数量：{}",
            conn,
            Arc::strong_count(&slot.request)
        );
        // 分发器放弃持有；若没有异步持有者，请求在此处被释放
        drop(slot);
        Disposition::Suspend
    }

    fn on_closed(&mut self, conn: ConnectionId) {
        if self.slots.remove(&conn).is_some() {
            debug!("[ID{}]连接在请求分发前关闭", conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Middleware;
    use crate::reactor::tests::test_handle;
    use crate::reactor::Command;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn head(raw: &str) -> RequestHead {
        RequestHead::try_from(raw.as_bytes(), ConnectionId(0)).unwrap()
    }

    fn capture_args(dispatcher: &mut Dispatcher, keys: &'static [&'static str]) -> Rc<RefCell<Vec<Option<String>>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let cloned = Rc::clone(&seen);
        dispatcher.pipeline_mut().add(Middleware::sync(move |req: &Request| {
            for key in keys {
                cloned.borrow_mut().push(req.arg(key));
            }
            req.send("ok");
            true
        }));
        seen
    }

    #[test]
    fn test_get_dispatches_once_and_completes() {
        let (handle, _poll) = test_handle();
        let mut dispatcher = Dispatcher::new(handle.clone(), 4096);
        let seen = capture_args(&mut dispatcher, &["key"]);
        let conn = ConnectionId(1);

        dispatcher.on_headers(conn, head("GET /get?key=k1 HTTP/1.1"));
        dispatcher.on_body(conn, &[]);
        assert_eq!(dispatcher.on_complete(conn), Disposition::Suspend);

        assert_eq!(*seen.borrow(), vec![Some("k1".to_string())]);
        assert_eq!(dispatcher.pending(), 0);
        let commands = handle.take_commands();
        assert!(matches!(commands[0], Command::Respond { status: 200, .. }));
        assert!(matches!(commands[1], Command::Resume(c) if c == conn));
    }

    #[test]
    fn test_post_body_in_chunks() {
        let (handle, _poll) = test_handle();
        let mut dispatcher = Dispatcher::new(handle, 4096);
        let seen = capture_args(&mut dispatcher, &["key", "val", "missing"]);
        let conn = ConnectionId(2);

        dispatcher.on_headers(
            conn,
            head("POST /put?key=q HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 17"),
        );
        dispatcher.on_body(conn, b"key=f&va");
        dispatcher.on_body(conn, b"l=v1%2");
        dispatcher.on_body(conn, b"1");
        dispatcher.on_body(conn, &[]);
        dispatcher.on_complete(conn);

        assert_eq!(
            *seen.borrow(),
            vec![Some("q".to_string()), Some("v1!".to_string()), None]
        );
    }

    #[test]
    fn test_post_without_end_marker_still_finishes_body() {
        let (handle, _poll) = test_handle();
        let mut dispatcher = Dispatcher::new(handle, 4096);
        let seen = capture_args(&mut dispatcher, &["a"]);
        let conn = ConnectionId(3);

        dispatcher.on_headers(conn, head("POST / HTTP/1.1\r\nContent-Length: 3"));
        dispatcher.on_body(conn, b"a=1");
        dispatcher.on_complete(conn);

        assert_eq!(*seen.borrow(), vec![Some("1".to_string())]);
    }

    #[test]
    fn test_non_post_body_is_ignored() {
        let (handle, _poll) = test_handle();
        let mut dispatcher = Dispatcher::new(handle, 4096);
        let seen = capture_args(&mut dispatcher, &["a"]);
        let conn = ConnectionId(4);

        dispatcher.on_headers(conn, head("PUT / HTTP/1.1\r\nContent-Length: 3"));
        dispatcher.on_body(conn, b"a=1");
        dispatcher.on_body(conn, &[]);
        dispatcher.on_complete(conn);

        assert_eq!(*seen.borrow(), vec![None]);
    }

    #[test]
    fn test_closed_before_dispatch_drops_silently() {
        let (handle, _poll) = test_handle();
        let mut dispatcher = Dispatcher::new(handle.clone(), 4096);
        let conn = ConnectionId(5);

        dispatcher.on_headers(conn, head("POST / HTTP/1.1\r\nContent-Length: 100"));
        dispatcher.on_body(conn, b"a=");
        dispatcher.on_closed(conn);

        assert_eq!(dispatcher.pending(), 0);
        assert!(handle.take_commands().is_empty());
        assert_eq!(handle.stats().outstanding_requests, 0);
    }

    #[test]
    fn test_complete_without_request_closes() {
        let (handle, _poll) = test_handle();
        let mut dispatcher = Dispatcher::new(handle, 4096);
        assert_eq!(dispatcher.on_complete(ConnectionId(9)), Disposition::Close);
    }

    #[test]
    fn test_deferred_holder_delays_completion() {
        let (handle, _poll) = test_handle();
        let mut dispatcher = Dispatcher::new(handle.clone(), 4096);
        let kept: Rc<RefCell<Option<Arc<Request>>>> = Rc::new(RefCell::new(None));
        let cloned = Rc::clone(&kept);
        dispatcher
            .pipeline_mut()
            .add(Middleware::deferred(move |req: Arc<Request>| {
                *cloned.borrow_mut() = Some(req);
                true
            }));
        let conn = ConnectionId(6);

        dispatcher.on_headers(conn, head("GET /delay HTTP/1.1"));
        dispatcher.on_complete(conn);
        assert!(handle.take_commands().is_empty());

        let req = kept.borrow_mut().take().unwrap();
        req.send("delayed response!\n");
        drop(req);
        let commands = handle.take_commands();
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[1], Command::Resume(c) if c == conn));
    }
}
