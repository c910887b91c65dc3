// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 定时器队列
//!
//! 保存所有尚未触发的一次性定时器（deadline + 回调）。
//!
//! 目标场景下定时器数量不多，因此使用线性扫描而不是优先队列：
//! - [`TimerQueue::earliest`] 以 O(n) 找出最早的截止时间；
//! - [`TimerQueue::fire_due`] 取出所有已到期的条目并按 (deadline, 插入顺序) 排序返回。
//!
//! 队列本身从不调用回调，回调由事件循环在条目移除之后执行，
//! 这样回调内部重新注册定时器时不会看到自己的旧条目。

use std::time::{Duration, Instant};

/// 定时器回调，可能由任意线程注册，因此要求 `Send`
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// 定时器句柄，用于取消尚未触发的定时器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    callback: TimerCallback,
}

#[derive(Default)]
pub struct TimerQueue {
    entries: Vec<TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个在 `deadline` 触发的定时器
    pub fn push(&mut self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.push(TimerEntry {
            deadline,
            id,
            callback,
        });
        id
    }

    /// 取消定时器，返回该定时器是否仍在队列中
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(index) => {
                self.entries.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// 最早的截止时间，队列为空时返回 `None`
    pub fn earliest(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// 距离最早截止时间的剩余时长，已过期的定时器返回零
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.earliest()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// 移除并返回所有 `deadline <= now` 的回调，按截止时间升序，同一时刻按注册顺序
    pub fn fire_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].deadline <= now {
                due.push(self.entries.swap_remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|e| (e.deadline, e.id.0));
        due.into_iter().map(|e| e.callback).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
