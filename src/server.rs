// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 服务器门面
//!
//! 把 [`TcpEngine`]、[`Reactor`] 与中间件注册组合在一起，对外提供 express 风格的接口：
//!
//! ```no_run
//! use evhttpd::{Config, Httpd, Middleware, Request};
//!
//! let mut httpd = Httpd::start(&Config::new()).unwrap();
//! httpd.route("/", Middleware::sync(|req: &Request| {
//!     req.send("response");
//!     true
//! }));
//! httpd.run().unwrap();
//! ```

use log::info;

use std::net::SocketAddr;
use std::time::Duration;

use crate::{
    config::Config,
    exception::Exception,
    pipeline::Middleware,
    reactor::{Reactor, ReactorHandle},
    tcp::TcpEngine,
};

pub struct Httpd {
    reactor: Reactor<TcpEngine>,
}

impl Httpd {
    /// 绑定监听端口并构建事件循环，此时尚未开始处理连接
    pub fn start(config: &Config) -> Result<Self, Exception> {
        let engine = TcpEngine::bind(config)?;
        let reactor = Reactor::new(
            engine,
            config.post_buffer_size(),
            Duration::from_millis(config.shutdown_grace_ms()),
        )?;
        info!("服务器初始化完成");
        Ok(Self { reactor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Exception> {
        self.reactor.engine().local_addr()
    }

    /// 注册对所有请求生效的中间件
    pub fn add(&mut self, middleware: Middleware) -> &mut Self {
        self.reactor.pipeline_mut().add(middleware);
        self
    }

    /// 注册只对路径精确等于 `path` 的请求生效的中间件
    pub fn route(&mut self, path: &str, middleware: Middleware) -> &mut Self {
        self.reactor.pipeline_mut().route(path, middleware);
        self
    }

    /// 事件循环句柄，可用于注册定时器、唤醒或停机
    pub fn event_loop(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    /// 运行事件循环直到停机
    pub fn run(&mut self) -> Result<(), Exception> {
        self.reactor.run()
    }
}
