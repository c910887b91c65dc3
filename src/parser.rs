// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求头解析
//!
//! 引擎在收到完整的请求头（以 `\r\n\r\n` 结尾）后，用本模块把原始字节解析为
//! 强类型的 [`RequestHead`]。涵盖：
//! 1. 请求行（Request-Line）的解析（方法、路径、版本）。
//! 2. 查询字符串（Query String）的解码。
//! 3. 常用 HTTP 标头的提取（`Content-Length`、`Content-Type`、`User-Agent`）。

use log::error;
use percent_encoding::percent_decode_str;

use crate::{engine::ConnectionId, exception::Exception, param::*};

/// 表示一个完整的 HTTP 请求头。
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// HTTP 请求方法（GET, POST 等）
    method: HttpRequestMethod,
    /// 解码后的请求路径（不含查询字符串）
    url: String,
    /// 解码后的查询参数，保持出现顺序
    query: Vec<(String, String)>,
    /// HTTP 协议版本
    version: HttpVersion,
    /// 全部请求头，名称保持原样
    headers: Vec<(String, String)>,
    /// 请求体长度，缺省为 0
    content_length: u64,
}

impl RequestHead {
    /// 从请求头字节尝试构建 `RequestHead`。
    ///
    /// # 逻辑步骤
    /// 1. 验证编码：确保请求头是合法的 UTF-8 字符串。
    /// 2. 解析请求行：提取方法、路径和协议版本。
    /// 3. 拆分路径与查询字符串，分别解码。
    /// 4. 迭代解析标头，识别 `Content-Length`。
    pub fn try_from(buffer: &[u8], id: ConnectionId) -> Result<Self, Exception> {
        // 1. 将字节流转换为字符串，失败则判定为非法的 HTTP 请求
        let request_string = match std::str::from_utf8(buffer) {
            Ok(string) => string,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let mut request_lines = request_string.split(CRLF);

        // 2. 解析请求行 (e.g., "GET /index.html HTTP/1.1")
        let request_line = request_lines.next().unwrap_or("");
        let first_line_parts: Vec<&str> = request_line.split(' ').collect();

        if first_line_parts.len() != 3 || first_line_parts[1].is_empty() {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, request_line);
            return Err(Exception::MalformedRequest);
        }

        let method = match HttpRequestMethod::parse(first_line_parts[0]) {
            Some(m) => m,
            None => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, first_line_parts[0]);
                return Err(Exception::UnSupportedRequestMethod);
            }
        };

        let version_str = first_line_parts[2].to_uppercase();
        let version = match version_str.as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            _ => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, &version_str);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        // 3. 拆分路径与查询字符串
        let target = first_line_parts[1];
        let (raw_path, raw_query) = match target.split_once('?') {
            Some((p, q)) => (p, q),
            None => (target, ""),
        };
        let url = percent_decode_str(raw_path).decode_utf8_lossy().into_owned();
        let query = form_urlencoded::parse(raw_query.as_bytes())
            .into_owned()
            .collect();

        // 4. 迭代各行解析 Headers
        let mut headers = Vec::new();
        let mut content_length = 0;
        for line in request_lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = match line.split_once(':') {
                Some((n, v)) => (n.trim(), v.trim()),
                None => {
                    error!("[ID{}]无法解析的请求头：{}", id, line);
                    return Err(Exception::MalformedRequest);
                }
            };
            if name.eq_ignore_ascii_case("content-length") {
                content_length = match value.parse::<u64>() {
                    Ok(len) => len,
                    Err(_) => {
                        error!("[ID{}]非法的Content-Length：{}", id, value);
                        return Err(Exception::MalformedRequest);
                    }
                };
            }
            headers.push((name.to_string(), value.to_string()));
        }

        Ok(Self {
            method,
            url,
            query,
            version,
            headers,
            content_length,
        })
    }
}

// --- Getter 访问器实现 ---

impl RequestHead {
    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    /// 获取解码后的请求路径（不含查询参数）
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// 查找请求头，名称大小写不敏感
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// `Content-Type` 的媒体类型部分（去掉 `; charset=...` 等参数）
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|v| v.split(';').next().unwrap_or("").trim())
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<RequestHead, Exception> {
        RequestHead::try_from(s.as_bytes(), ConnectionId(0))
    }

    /// 验证常规 GET 请求的解析，包括 Path 和 Headers
    #[test]
    fn test_parse_get_request() {
        let head = parse("GET / HTTP/1.1\r\nHost: localhost:8080\r\nUser-Agent: Test-Browser").unwrap();

        assert_eq!(head.method(), HttpRequestMethod::Get);
        assert_eq!(head.url(), "/");
        assert_eq!(head.version(), HttpVersion::V1_1);
        assert_eq!(head.user_agent(), "Test-Browser");
        assert_eq!(head.content_length(), 0);
    }

    /// 查询字符串与路径分离并解码
    #[test]
    fn test_query_is_split_and_decoded() {
        let head = parse("GET /put?key=k%201&val=a+b&empty HTTP/1.1\r\nHost: x").unwrap();

        assert_eq!(head.url(), "/put");
        assert_eq!(
            head.query(),
            &[
                ("key".to_string(), "k 1".to_string()),
                ("val".to_string(), "a b".to_string()),
                ("empty".to_string(), "".to_string()),
            ]
        );
    }

    #[test]
    fn test_path_is_percent_decoded() {
        let head = parse("GET /a%20b HTTP/1.0").unwrap();
        assert_eq!(head.url(), "/a b");
        assert_eq!(head.version(), HttpVersion::V1_0);
    }

    #[test]
    fn test_post_headers() {
        let head = parse(
            "POST /submit HTTP/1.1\r\nContent-Length: 10\r\nContent-Type: application/x-www-form-urlencoded; charset=utf-8",
        )
        .unwrap();

        assert_eq!(head.method(), HttpRequestMethod::Post);
        assert_eq!(head.content_length(), 10);
        assert_eq!(head.content_type(), Some(FORM_URLENCODED));
    }

    /// 验证 Header 字段名是否大小写不敏感
    #[test]
    fn test_case_insensitive_headers() {
        let head = parse("GET / HTTP/1.1\r\nuser-agent: Test\r\ncontent-length: 3").unwrap();
        assert_eq!(head.user_agent(), "Test");
        assert_eq!(head.header("Content-Length"), Some("3"));
        assert_eq!(head.content_length(), 3);
    }

    /// 验证请求方法的小写兼容性处理
    #[test]
    fn test_lowercase_method() {
        let head = parse("get / HTTP/1.1").unwrap();
        assert_eq!(head.method(), HttpRequestMethod::Get);
    }

    #[test]
    fn test_unsupported_method() {
        assert_eq!(
            parse("BREW /pot HTTP/1.1").unwrap_err(),
            Exception::UnSupportedRequestMethod
        );
    }

    #[test]
    fn test_unsupported_http_version() {
        assert_eq!(
            parse("GET / HTTP/2.0").unwrap_err(),
            Exception::UnsupportedHttpVersion
        );
    }

    #[test]
    fn test_malformed_request_line() {
        assert_eq!(parse("GET /").unwrap_err(), Exception::MalformedRequest);
        assert_eq!(
            parse("GET / HTTP/1.1\r\nBrokenHeader").unwrap_err(),
            Exception::MalformedRequest
        );
        assert_eq!(
            parse("POST / HTTP/1.1\r\nContent-Length: ten").unwrap_err(),
            Exception::MalformedRequest
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let result = RequestHead::try_from(&[0xFF, 0xFE, 0xFD], ConnectionId(0));
        assert_eq!(result.unwrap_err(), Exception::RequestIsNotUtf8);
    }
}
