// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 跨线程唤醒信号
//!
//! 基于 `mio::Waker`（Linux 下为 eventfd）实现，可从任意线程打断事件循环的阻塞等待。
//! 在事件循环确认（acknowledge）之前的多次 `signal()` 会被合并为一次唤醒。

use log::error;
use mio::{Registry, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct WakeSignal {
    waker: Arc<Waker>,
    pending: Arc<AtomicBool>,
}

impl WakeSignal {
    /// 在 `registry` 上以 `token` 注册唤醒源
    pub fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        Ok(Self {
            waker: Arc::new(Waker::new(registry, token)?),
            pending: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 唤醒事件循环。已有未确认的信号时不再重复写入
    pub fn signal(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.waker.wake() {
                // 写入失败时恢复标志位，保证下一次 signal 仍会尝试唤醒
                self.pending.store(false, Ordering::Release);
                error!("唤醒事件循环失败：{}", e);
            }
        }
    }

    /// 事件循环确认收到唤醒，返回在此之前是否有未处理的信号
    pub fn acknowledge(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
