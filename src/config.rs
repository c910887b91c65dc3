use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::{error, warn};
use std::fs::File;
use std::io::prelude::*;

use crate::exception::Exception;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_local")]
    local: bool,
    #[serde(default = "default_post_buffer_size")]
    post_buffer_size: usize,
    #[serde(default = "default_max_header_size")]
    max_header_size: usize,
    #[serde(default = "default_max_body_size")]
    max_body_size: u64,
    #[serde(default = "default_connection_timeout_ms")]
    connection_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    max_connections: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    shutdown_grace_ms: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_local() -> bool {
    true
}

fn default_post_buffer_size() -> usize {
    4096
}

fn default_max_header_size() -> usize {
    8192 // 8KB
}

fn default_max_body_size() -> u64 {
    1048576 // 1MB
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_max_connections() -> usize {
    1024
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            port: default_port(),
            local: default_local(),
            post_buffer_size: default_post_buffer_size(),
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_connections: default_max_connections(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }

    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let mut file = match File::open(filename) {
            Ok(f) => f,
            Err(e) => {
                error!("无法打开配置文件{}：{}", filename, e);
                return Err(Exception::ConfigNotFound);
            }
        };
        let mut str_val = String::new();
        file.read_to_string(&mut str_val)?;
        Ok(Self::from_toml_str(&str_val))
    }

    /// 从 TOML 文本构建配置，解析失败时回退到默认配置
    pub fn from_toml_str(s: &str) -> Self {
        let mut raw_config: Config = match toml::from_str(s) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象，使用默认配置：{}", e);
                Config::new()
            }
        };
        if raw_config.post_buffer_size == 0 {
            warn!("post_buffer_size被设置为0，该值将被改为{}。", default_post_buffer_size());
            raw_config.post_buffer_size = default_post_buffer_size();
        }
        if raw_config.max_connections == 0 {
            warn!("max_connections被设置为0，服务器将无法接受任何连接，该值将被改为{}。", default_max_connections());
            raw_config.max_connections = default_max_connections();
        }
        raw_config
    }

    /// 覆盖监听端口，0 表示由操作系统分配
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connection_timeout_ms(mut self, ms: u64) -> Self {
        self.connection_timeout_ms = ms;
        self
    }

    pub fn with_max_body_size(mut self, size: u64) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn post_buffer_size(&self) -> usize {
        self.post_buffer_size
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }

    pub fn max_body_size(&self) -> u64 {
        self.max_body_size
    }

    /// 0 表示不回收空闲连接
    pub fn connection_timeout_ms(&self) -> u64 {
        self.connection_timeout_ms
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn shutdown_grace_ms(&self) -> u64 {
        self.shutdown_grace_ms
    }
}
