// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 示例服务器
//!
//! 演示 `evhttpd` 的用法：
//! - 记录每个请求的日志中间件
//! - `/`：同步响应
//! - `/delay`：延迟 1 秒后由定时器写出响应
//! - `/put`、`/get`：基于内存的键值存储
//! - 启动后的两个定时器（立即触发与 3 秒后触发）
//! - 后台管理控制台（`stop`、`status`、`help`）

use evhttpd::{Config, Httpd, Middleware, ReactorHandle, Request};

use log::{error, info, warn};

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::BufRead;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    // 1. 初始化日志系统，通过外部 YAML 配置级别与输出目的地
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法初始化日志系统：{}", e);
    }

    // 2. 加载配置
    let config = match Config::from_toml("config/development.toml") {
        Ok(config) => {
            info!("配置文件已载入");
            config
        }
        Err(e) => {
            warn!("{}，使用默认配置", e);
            Config::new()
        }
    };

    // 3. 绑定端口并注册中间件
    let mut httpd = match Httpd::start(&config) {
        Ok(httpd) => httpd,
        Err(e) => {
            error!("服务器启动失败：{}", e);
            std::process::exit(1);
        }
    };
    register_handlers(&mut httpd);

    // 4. 启动定时器与管理控制台
    let event_loop = httpd.event_loop();
    event_loop.schedule(Duration::from_millis(3000), || {
        info!("hello from 3s callback land");
    });
    event_loop.schedule(Duration::ZERO, || {
        info!("hello from immediate callback land");
    });
    spawn_console(event_loop);

    info!("running...");
    if let Err(e) = httpd.run() {
        error!("事件循环异常退出：{}", e);
        std::process::exit(1);
    }
    info!("服务器已停止");
}

fn register_handlers(httpd: &mut Httpd) {
    let store: Rc<RefCell<HashMap<String, String>>> = Rc::new(RefCell::new(HashMap::new()));

    httpd.add(Middleware::sync(|req: &Request| {
        info!(
            "[ID{}]{} {}，User-Agent：{}",
            req.id(),
            req.method(),
            req.url(),
            req.header("user-agent").unwrap_or("")
        );
        true
    }));

    httpd.route(
        "/",
        Middleware::sync(|req: &Request| {
            req.send("response\n");
            true
        }),
    );

    let timers = httpd.event_loop();
    httpd.route(
        "/delay",
        Middleware::deferred(move |req: Arc<Request>| {
            timers.schedule(Duration::from_millis(1000), move || {
                req.send("delayed response!\n");
            });
            true
        }),
    );

    let put_store = Rc::clone(&store);
    httpd.route(
        "/put",
        Middleware::sync(move |req: &Request| {
            let key = req.arg("key");
            let val = req.arg("val");
            req.send(format!(
                "This is the <b>best</b> httpd class ever.\n<p/>\nkey = {}<br/>\nval = {}<br/>\n",
                key.as_deref().unwrap_or(""),
                val.as_deref().unwrap_or("")
            ));
            if let (Some(key), Some(val)) = (key, val) {
                put_store.borrow_mut().insert(key, val);
            }
            true
        }),
    );

    let get_store = store;
    httpd.route(
        "/get",
        Middleware::sync(move |req: &Request| {
            let found = req
                .arg("key")
                .and_then(|key| get_store.borrow().get(&key).cloned());
            match found {
                Some(val) => {
                    let _ = req.set_content_type("text/plain");
                    req.send(val);
                }
                None => {
                    let _ = req.set_status(404);
                    req.send("Not found\n");
                }
            }
            true
        }),
    );
}

/// 后台管理控制台，只通过 [`ReactorHandle`] 与事件循环交互
fn spawn_console(handle: ReactorHandle) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let input = match line {
                Ok(input) => input,
                Err(_) => break,
            };
            match input.trim() {
                "stop" => {
                    println!("停机指令已激活，服务器将在处理完未完成的请求后关闭...");
                    handle.shutdown();
                    break;
                }
                "help" => {
                    println!("== evhttpd Help ==");
                    println!("stop   - 发出停机信号");
                    println!("status - 查看当前服务器运行状态");
                    println!("help   - 显示此帮助信息");
                    println!("==================");
                }
                "status" => {
                    let stats = handle.stats();
                    println!("== evhttpd 状态 ==");
                    println!("未完成的请求数: {}", stats.outstanding_requests);
                    println!("等待中的定时器: {}", stats.pending_timers);
                    println!("==================");
                }
                "" => {}
                cmd => println!("无效的命令：{}", cmd),
            }
        }
    });
}
