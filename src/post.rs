// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # POST 表单累加器
//!
//! 表单解析器会把每个字段拆成若干 `(字段名, 偏移量, 字节)` 片段交给累加器，
//! 片段可能乱序到达。累加器按偏移量覆盖写入，因此最终结果与片段到达顺序无关。

use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct PostData {
    fields: BTreeMap<String, Vec<u8>>,
}

impl PostData {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在字段 `key` 的 `offset` 处写入 `data`，必要时扩展字段长度
    pub fn accept(&mut self, key: &str, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        let value = self.fields.entry(key.to_string()).or_default();
        let end = offset + data.len();
        if value.len() < end {
            value.resize(end, 0);
        }
        value[offset..end].copy_from_slice(data);
    }

    /// 获取字段值，非法 UTF-8 会被替换为 U+FFFD
    pub fn get(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
