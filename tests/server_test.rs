use evhttpd::{Config, Httpd, Middleware, ReactorHandle, Request};

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

struct TestServer {
    addr: SocketAddr,
    handle: ReactorHandle,
    join: Option<JoinHandle<()>>,
}

impl TestServer {
    /// 在独立线程上启动服务器，`setup` 在事件循环线程上注册中间件
    fn spawn<F>(setup: F) -> Self
    where
        F: FnOnce(&mut Httpd) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let join = thread::spawn(move || {
            let config = Config::new().with_port(0);
            let mut httpd = Httpd::start(&config).unwrap();
            setup(&mut httpd);
            tx.send((httpd.local_addr().unwrap(), httpd.event_loop()))
                .unwrap();
            httpd.run().unwrap();
        });
        let (addr, handle) = rx.recv().unwrap();
        Self {
            addr,
            handle,
            join: Some(join),
        }
    }

    async fn send(&self, raw: &str) -> (u16, String, String) {
        let exchange = async {
            let mut stream = TcpStream::connect(self.addr).await.unwrap();
            stream.write_all(raw.as_bytes()).await.unwrap();
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            String::from_utf8_lossy(&out).into_owned()
        };
        let response = timeout(Duration::from_secs(5), exchange)
            .await
            .expect("server did not answer in time");
        parse_response(&response)
    }

    async fn get(&self, target: &str) -> (u16, String, String) {
        self.send(&format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", target))
            .await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// 拆分为 (状态码, 响应头, 响应体)
fn parse_response(response: &str) -> (u16, String, String) {
    let (head, body) = response.split_once("\r\n\r\n").unwrap_or((response, ""));
    let status_code = head
        .split_whitespace()
        .nth(1)
        .unwrap_or("0")
        .parse::<u16>()
        .unwrap_or(0);
    (status_code, head.to_string(), body.to_string())
}

fn sample_server() -> TestServer {
    TestServer::spawn(|httpd| {
        use std::cell::RefCell;
        use std::collections::HashMap;
        use std::rc::Rc;

        let store: Rc<RefCell<HashMap<String, String>>> = Rc::new(RefCell::new(HashMap::new()));
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
                if let (Some(key), Some(val)) = (req.arg("key"), req.arg("val")) {
                    put_store.borrow_mut().insert(key, val);
                }
                req.send("stored\n");
                true
            }),
        );

        httpd.route(
            "/get",
            Middleware::sync(move |req: &Request| {
                match req.arg("key").and_then(|k| store.borrow().get(&k).cloned()) {
                    Some(val) => {
                        req.set_content_type("text/plain").unwrap();
                        req.send(val);
                    }
                    None => {
                        req.set_status(404).unwrap();
                        req.send("Not found\n");
                    }
                }
                true
            }),
        );
    })
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    async fn test_root_response() {
        let server = sample_server();
        let (status, head, body) = server.get("/").await;

        assert_eq!(status, 200);
        assert!(head.contains("Content-Type: text/html"));
        assert!(head.contains("Server: evhttpd"));
        assert_eq!(body, "response\n");
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let server = sample_server();

        let (status, _, body) = server.get("/get?key=k1").await;
        assert_eq!(status, 404);
        assert_eq!(body, "Not found\n");

        let (status, _, _) = server.get("/put?key=k1&val=v1").await;
        assert_eq!(status, 200);

        let (status, head, body) = server.get("/get?key=k1").await;
        assert_eq!(status, 200);
        assert!(head.contains("Content-Type: text/plain"));
        assert_eq!(body, "v1");
    }

    #[tokio::test]
    async fn test_post_form_is_accumulated() {
        let server = sample_server();
        let form = "key=k2&val=hello%20world%21";
        let raw = format!(
            "POST /put HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            form.len(),
            form
        );
        let (status, _, _) = server.send(&raw).await;
        assert_eq!(status, 200);

        let (_, _, body) = server.get("/get?key=k2").await;
        assert_eq!(body, "hello world!");
    }

    #[tokio::test]
    async fn test_delayed_response() {
        let server = sample_server();
        let start = Instant::now();
        let (status, _, body) = server.get("/delay").await;

        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(status, 200);
        assert_eq!(body, "delayed response!\n");
    }

    #[tokio::test]
    async fn test_delays_overlap_on_single_thread() {
        let server = sample_server();
        let start = Instant::now();
        let (a, b, c) = tokio::join!(server.get("/delay"), server.get("/delay"), server.get("/"));

        // 延迟请求挂起期间事件循环仍在处理其他连接
        assert!(start.elapsed() < Duration::from_millis(1900));
        assert_eq!(a.2, "delayed response!\n");
        assert_eq!(b.2, "delayed response!\n");
        assert_eq!(c.2, "response\n");
    }

    #[tokio::test]
    async fn test_query_takes_precedence_over_form() {
        let server = TestServer::spawn(|httpd| {
            httpd.route(
                "/echo",
                Middleware::sync(|req: &Request| {
                    req.send(format!(
                        "{} {} {}",
                        req.arg("a").unwrap_or_default(),
                        req.arg("b").unwrap_or_default(),
                        req.arg("c").is_none()
                    ));
                    true
                }),
            );
        });
        let raw = "POST /echo?a=query HTTP/1.1\r\nContent-Length: 13\r\n\r\na=form&b=form";
        let (_, _, body) = server.send(raw).await;
        assert_eq!(body, "query form true");
    }

    #[tokio::test]
    async fn test_request_without_response_gets_500() {
        let server = TestServer::spawn(|httpd| {
            httpd.add(Middleware::sync(|_req: &Request| true));
        });
        let (status, _, body) = server.get("/nobody-home").await;
        assert_eq!(status, 500);
        assert!(body.contains("500"));
    }

    #[tokio::test]
    async fn test_every_handler_runs_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let server = TestServer::spawn(move |httpd| {
            let first = Arc::clone(&seen);
            httpd.add(Middleware::sync(move |_req: &Request| {
                first.lock().unwrap().push("first");
                false
            }));
            let second = Arc::clone(&seen);
            httpd.route(
                "/",
                Middleware::sync(move |req: &Request| {
                    second.lock().unwrap().push("route");
                    req.send("ok");
                    true
                }),
            );
            let third = Arc::clone(&seen);
            httpd.add(Middleware::sync(move |_req: &Request| {
                third.lock().unwrap().push("last");
                true
            }));
        });

        let (status, _, body) = server.get("/").await;
        assert_eq!(status, 200);
        assert_eq!(body, "ok");
        assert_eq!(*order.lock().unwrap(), vec!["first", "route", "last"]);
    }

    #[tokio::test]
    async fn test_response_from_another_thread() {
        let server = TestServer::spawn(|httpd| {
            httpd.add(Middleware::deferred(|req: Arc<Request>| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(50));
                    req.set_status(202).unwrap();
                    req.send("from worker");
                });
                true
            }));
        });
        let (status, _, body) = server.get("/work").await;
        assert_eq!(status, 202);
        assert_eq!(body, "from worker");
    }

    #[tokio::test]
    async fn test_timer_scheduled_from_another_thread() {
        let server = sample_server();
        let (tx, rx) = mpsc::channel();
        let handle = server.handle.clone();
        thread::spawn(move || {
            handle.schedule(Duration::from_millis(10), move || tx.send(()).unwrap());
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let server = sample_server();
        let (status, _, _) = server.send("NONSENSE\r\n\r\n").await;
        assert_eq!(status, 400);

        let (status, _, _) = server.send("BREW /pot HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 405);

        // 服务器仍可正常工作
        let (status, _, _) = server.get("/").await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_delayed_request() {
        let server = sample_server();
        let pending = {
            let addr = server.addr;
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                stream
                    .write_all(b"GET /delay HTTP/1.1\r\n\r\n")
                    .await
                    .unwrap();
                let mut out = Vec::new();
                stream.read_to_end(&mut out).await.unwrap();
                String::from_utf8_lossy(&out).into_owned()
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.handle.stats().outstanding_requests, 1);
        server.handle.shutdown();

        let response = timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(response.ends_with("delayed response!\n"));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_large_response() {
        const SIZE: usize = 16 << 20;
        let mut server = TestServer::spawn(|httpd| {
            httpd.route(
                "/big",
                Middleware::sync(|req: &Request| {
                    req.send(vec![b'x'; SIZE]);
                    true
                }),
            );
        });
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        stream
            .write_all(b"GET /big HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        // 客户端暂不读取，响应停留在引擎的发送缓冲里时发起停机
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.handle.stats().outstanding_requests, 0);
        server.handle.shutdown();

        let mut out = Vec::new();
        timeout(Duration::from_secs(10), stream.read_to_end(&mut out))
            .await
            .expect("response was not flushed in time")
            .unwrap();
        let body_start = out
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        assert_eq!(out.len() - body_start, SIZE);

        // 响应发完后事件循环才退出
        let join = server.join.take().unwrap();
        tokio::task::spawn_blocking(move || join.join().unwrap())
            .await
            .unwrap();
    }
}
