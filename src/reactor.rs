// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 单线程事件循环
//!
//! 事件循环把三类事件源合并到同一次阻塞等待中：
//! - 引擎注册的 socket 就绪事件；
//! - 定时器队列中最早的截止时间；
//! - 跨线程唤醒信号（[`WakeSignal`]）。
//!
//! 每一轮循环的步骤：
//! 1. 让引擎注册 socket 并取得引擎要求的超时；
//! 2. 计算有效超时 `min(最早定时器剩余时间, 引擎超时)`，两者都没有时无限等待；
//! 3. 阻塞等待，被信号打断（EINTR）时原样重试，其他错误视为致命错误直接 abort；
//! 4. 若唤醒信号触发则确认；
//! 5. 先把到期定时器从队列移除，再依次执行回调；
//! 6. 把就绪事件交还引擎，由引擎驱动连接回调（请求分发在这里发生）；
//! 7. 处理其他线程投递的命令（排队响应、恢复连接）。
//!
//! 所有中间件与定时器回调都只在事件循环线程上执行。其他线程只能通过
//! [`ReactorHandle`] 注册定时器、唤醒循环，或者释放持有的请求。

use log::{debug, error, info, warn};
use mio::{Events, Poll};

use std::collections::VecDeque;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::{
    dispatch::Dispatcher,
    engine::{ConnectionControl, ConnectionId, Engine, Flow, WAKE_TOKEN},
    exception::Exception,
    pipeline::Pipeline,
    response::Response,
    timer::{TimerCallback, TimerId, TimerQueue},
    util::lock,
    wake::WakeSignal,
};

/// 其他线程投递给事件循环的命令，按投递顺序执行
pub(crate) enum Command {
    /// 为连接排队响应
    Respond {
        conn: ConnectionId,
        status: u16,
        response: Response,
    },
    /// 恢复被挂起的连接
    Resume(ConnectionId),
}

struct Shared {
    timers: Mutex<TimerQueue>,
    mailbox: Mutex<VecDeque<Command>>,
    wake: WakeSignal,
    stopping: AtomicBool,
    outstanding: AtomicUsize,
}

/// 事件循环运行状态快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReactorStats {
    /// 已创建但尚未释放的请求数
    pub outstanding_requests: usize,
    /// 尚未触发的定时器数
    pub pending_timers: usize,
}

/// 事件循环的线程安全句柄
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    pub(crate) fn new(wake: WakeSignal) -> Self {
        Self {
            shared: Arc::new(Shared {
                timers: Mutex::new(TimerQueue::new()),
                mailbox: Mutex::new(VecDeque::new()),
                wake,
                stopping: AtomicBool::new(false),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// 在 `delay` 之后于事件循环线程上执行 `callback`，可从任意线程调用。
    ///
    /// 即使 `delay` 为零，回调也会在下一轮循环中执行，而不是在注册时同步执行。
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let id = lock(&self.shared.timers).push(deadline, Box::new(callback));
        self.shared.wake.signal();
        id
    }

    /// 取消尚未触发的定时器
    pub fn cancel(&self, id: TimerId) -> bool {
        lock(&self.shared.timers).cancel(id)
    }

    /// 打断事件循环当前的阻塞等待
    pub fn wake(&self) {
        self.shared.wake.signal();
    }

    /// 请求事件循环停止。未完成的请求会在宽限期内继续处理
    pub fn shutdown(&self) {
        info!("收到停机请求");
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.wake.signal();
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ReactorStats {
        ReactorStats {
            outstanding_requests: self.shared.outstanding.load(Ordering::Acquire),
            pending_timers: lock(&self.shared.timers).len(),
        }
    }

    pub(crate) fn post(&self, command: Command) {
        lock(&self.shared.mailbox).push_back(command);
        self.shared.wake.signal();
    }

    pub(crate) fn take_commands(&self) -> Vec<Command> {
        lock(&self.shared.mailbox).drain(..).collect()
    }

    pub(crate) fn wake_signal(&self) -> WakeSignal {
        self.shared.wake.clone()
    }

    pub(crate) fn request_started(&self) {
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn request_finished(&self) {
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn time_until_next_timer(&self, now: Instant) -> Option<Duration> {
        lock(&self.shared.timers).time_until_next(now)
    }

    fn fire_due(&self, now: Instant) -> Vec<TimerCallback> {
        lock(&self.shared.timers).fire_due(now)
    }
}

/// 合并定时器、引擎与额外上限给出的超时，全部缺省时表示无限等待
pub fn effective_timeout(
    timer: Option<Duration>,
    engine: Option<Duration>,
    limit: Option<Duration>,
) -> Option<Duration> {
    [timer, engine, limit].into_iter().flatten().min()
}

/// 按顺序把命令应用到引擎上
pub(crate) fn apply_commands(commands: Vec<Command>, control: &mut dyn ConnectionControl) {
    for command in commands {
        match command {
            Command::Respond {
                conn,
                status,
                response,
            } => {
                if let Err(e) = control.queue_response(conn, status, response) {
                    warn!("[ID{}]无法排队响应：{}", conn, e);
                }
            }
            Command::Resume(conn) => control.resume(conn),
        }
    }
}

pub struct Reactor<E: Engine> {
    poll: Poll,
    events: Events,
    engine: E,
    dispatcher: Dispatcher,
    handle: ReactorHandle,
    shutdown_grace: Duration,
}

impl<E: Engine> Reactor<E> {
    pub fn new(engine: E, post_buffer_size: usize, shutdown_grace: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let wake = WakeSignal::new(poll.registry(), WAKE_TOKEN)?;
        let handle = ReactorHandle::new(wake);
        let dispatcher = Dispatcher::new(handle.clone(), post_buffer_size);
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            engine,
            dispatcher,
            handle,
            shutdown_grace,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        self.dispatcher.pipeline_mut()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// 运行事件循环，直到引擎要求停止或停机请求完成。
    ///
    /// 停机后循环继续运转，直到所有请求被释放且引擎中的响应全部发出，或宽限期耗尽。
    pub fn run(&mut self) -> Result<(), Exception> {
        info!("事件循环启动");
        let mut drain_deadline: Option<Instant> = None;
        loop {
            let mut limit = None;
            if self.handle.is_stopping() {
                let outstanding = self.handle.stats().outstanding_requests;
                let writing = self.engine.pending_writes();
                if outstanding == 0 && writing == 0 {
                    info!("所有请求均已完成，事件循环退出");
                    break;
                }
                let now = Instant::now();
                let deadline = *drain_deadline.get_or_insert_with(|| {
                    info!(
                        "等待{}个未完成的请求、{}个未发完的响应结束...",
                        outstanding, writing
                    );
                    now + self.shutdown_grace
                });
                if now >= deadline {
                    warn!(
                        "宽限期已过，仍有{}个请求未完成、{}个响应未发完，事件循环强制退出",
                        outstanding, writing
                    );
                    break;
                }
                limit = Some(deadline - now);
            }

            if self.turn(limit)? == Flow::Stop {
                info!("引擎要求停止，事件循环退出");
                break;
            }
        }
        Ok(())
    }

    /// 执行一轮循环
    pub fn run_once(&mut self) -> Result<Flow, Exception> {
        self.turn(None)
    }

    fn turn(&mut self, limit: Option<Duration>) -> Result<Flow, Exception> {
        // 1. 引擎注册 socket 并给出自己的超时
        let engine_timeout = self.engine.prepare(self.poll.registry())?;

        // 2. 计算有效超时
        let timer_timeout = self.handle.time_until_next_timer(Instant::now());
        let timeout = effective_timeout(timer_timeout, engine_timeout, limit);

        // 3. 阻塞等待
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("等待被信号中断，重试");
                    continue;
                }
                Err(e) => {
                    error!("等待就绪事件失败，无法恢复：{}", e);
                    std::process::abort();
                }
            }
        }

        // 4. 确认唤醒信号
        if self.events.iter().any(|e| e.token() == WAKE_TOKEN) {
            self.handle.wake_signal().acknowledge();
        }

        // 5. 先移除再执行到期定时器
        for callback in self.handle.fire_due(Instant::now()) {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("定时器回调发生panic，已忽略");
            }
        }
        apply_commands(self.handle.take_commands(), &mut self.engine);

        // 6. 交还就绪事件
        let flow = self.engine.service(&self.events, &mut self.dispatcher);

        // 7. 分发过程中产生的命令
        apply_commands(self.handle.take_commands(), &mut self.engine);
        Ok(flow)
    }
}
