// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 中间件管道
//!
//! 中间件按注册顺序保存，每个完整到达的请求都会依次经过全部中间件。
//!
//! - 同步中间件（[`Middleware::sync`]）拿到 `&Request`，在返回前完成全部工作；
//! - 延迟中间件（[`Middleware::deferred`]）拿到 `Arc<Request>`，可以把请求交给定时器
//!   或其他线程，稍后再写响应。
//!
//! 处理器返回的 `bool` 只记录日志，不会中断后续中间件：管道总是完整执行。

use log::{debug, error};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::request::Request;

pub type SyncHandler = Box<dyn Fn(&Request) -> bool>;
pub type DeferredHandler = Box<dyn Fn(Arc<Request>) -> bool>;

pub enum Middleware {
    Sync(SyncHandler),
    Deferred(DeferredHandler),
}

impl Middleware {
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> bool + 'static,
    {
        Middleware::Sync(Box::new(handler))
    }

    pub fn deferred<F>(handler: F) -> Self
    where
        F: Fn(Arc<Request>) -> bool + 'static,
    {
        Middleware::Deferred(Box::new(handler))
    }

    /// 包装为只在 `request.url() == path` 时执行的中间件，不匹配时视为“继续”
    fn guarded(self, path: &str) -> Self {
        let path = path.to_string();
        match self {
            Middleware::Sync(h) => Middleware::Sync(Box::new(move |req: &Request| {
                if req.url() == path {
                    h(req)
                } else {
                    true
                }
            })),
            Middleware::Deferred(h) => Middleware::Deferred(Box::new(move |req: Arc<Request>| {
                if req.url() == path {
                    h(req)
                } else {
                    true
                }
            })),
        }
    }
}

#[derive(Default)]
pub struct Pipeline {
    handlers: Vec<Middleware>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个对所有请求生效的中间件
    pub fn add(&mut self, middleware: Middleware) -> &mut Self {
        self.handlers.push(middleware);
        self
    }

    /// 追加一个只对路径 `path` 精确匹配的请求生效的中间件
    pub fn route(&mut self, path: &str, middleware: Middleware) -> &mut Self {
        self.handlers.push(middleware.guarded(path));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// 按注册顺序执行全部中间件。单个中间件 panic 时记录日志并继续执行后续中间件
    pub fn dispatch(&self, request: &Arc<Request>) {
        for (index, handler) in self.handlers.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| match handler {
                Middleware::Sync(h) => h(request),
                Middleware::Deferred(h) => h(Arc::clone(request)),
            }));
            match result {
                Ok(true) => {}
                Ok(false) => debug!(
                    "[ID{}]第{}个中间件返回false，后续中间件照常执行",
                    request.id(),
                    index
                ),
                Err(_) => error!(
                    "[ID{}]第{}个中间件发生panic，已跳过",
                    request.id(),
                    index
                ),
            }
        }
    }
}
