//! 中继会话选项
//!
//! 请求体中的目标选项在这里校验并规范化，校验失败返回 ValidationError（HTTP 400）

use super::error::RelayError;
use crate::config::UrlValidator;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// multipart 表单默认字段名
pub const DEFAULT_FIELD_NAME: &str = "files[]";
/// 未提供文件名时的前缀
pub const FILE_NAME_PREFIX: &str = "uppy-file";

/// 上传协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// tus 断点续传
    Resumable,
    /// 对象存储分段上传
    ObjectStoreMultipart,
    /// 普通 HTTP（multipart 表单或原始请求体）
    SimpleHttp,
}

impl Protocol {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tus" => Some(Protocol::Resumable),
            "s3-multipart" => Some(Protocol::ObjectStoreMultipart),
            "multipart" => Some(Protocol::SimpleHttp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Resumable => "tus",
            Protocol::ObjectStoreMultipart => "s3-multipart",
            Protocol::SimpleHttp => "multipart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        }
    }
}

/// 元数据：扁平的 key → 基本类型
pub type Metadata = BTreeMap<String, Value>;

/// 元数据值的字符串形式
pub fn metadata_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 禁止转发的请求头
const HEADER_DENYLIST: &[&str] = &[
    "accept-charset",
    "accept-encoding",
    "access-control-request-headers",
    "access-control-request-method",
    "connection",
    "content-length",
    "cookie",
    "cookie2",
    "date",
    "dnt",
    "expect",
    "host",
    "keep-alive",
    "origin",
    "referer",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "via",
];

/// 请求头是否允许转发到目标
pub fn is_forwardable_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !(HEADER_DENYLIST.contains(&lower.as_str())
        || lower.starts_with("proxy-")
        || lower.starts_with("sec-"))
}

/// 校验后的会话选项
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// 指定 token 时沿用（重试时保持同一身份）
    pub token: Option<String>,
    pub protocol: Protocol,
    pub endpoint: Option<String>,
    pub upload_url: Option<String>,
    /// 声明的文件大小
    pub size: u64,
    pub fieldname: String,
    pub metadata: Metadata,
    /// 已过滤的请求头
    pub headers: BTreeMap<String, String>,
    pub http_method: HttpMethod,
    pub use_form_data: bool,
}

fn invalid(message: &str) -> RelayError {
    RelayError::Validation(message.to_string())
}

impl SessionOptions {
    /// 从请求体构造并校验
    pub fn from_request(body: &Value, size: u64, validator: &UrlValidator) -> Result<Self, RelayError> {
        let empty = Map::new();
        let body = match body {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(invalid("request body must be an object")),
        };

        let http_method = match body.get("httpMethod") {
            None | Some(Value::Null) => HttpMethod::Post,
            Some(Value::String(m)) => match m.to_ascii_lowercase().as_str() {
                "post" => HttpMethod::Post,
                "put" => HttpMethod::Put,
                _ => return Err(invalid("unsupported HTTP METHOD specified")),
            },
            Some(_) => return Err(invalid("unsupported HTTP METHOD specified")),
        };

        let fieldname = match body.get("fieldname") {
            None | Some(Value::Null) => DEFAULT_FIELD_NAME.to_string(),
            Some(Value::String(f)) if f.is_empty() => DEFAULT_FIELD_NAME.to_string(),
            Some(Value::String(f)) => f.clone(),
            Some(_) => return Err(invalid("fieldname must be a string")),
        };

        let metadata = match body.get("metadata") {
            None | Some(Value::Null) => Metadata::new(),
            Some(Value::Object(map)) => {
                if map.values().any(|v| v.is_object() || v.is_array()) {
                    return Err(invalid("metadata values must be primitives"));
                }
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            Some(_) => return Err(invalid("metadata must be an object")),
        };

        let headers = match body.get("headers") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => {
                let mut headers = BTreeMap::new();
                for (name, value) in map {
                    let value = value
                        .as_str()
                        .ok_or_else(|| invalid("header values must be strings"))?;
                    if is_forwardable_header(name) {
                        headers.insert(name.clone(), value.to_string());
                    }
                }
                headers
            }
            Some(_) => return Err(invalid("headers must be an object")),
        };

        let protocol = match body.get("protocol") {
            None | Some(Value::Null) => Protocol::SimpleHttp,
            Some(Value::String(p)) => {
                Protocol::parse(p).ok_or_else(|| invalid("unsupported protocol specified"))?
            }
            Some(_) => return Err(invalid("unsupported protocol specified")),
        };

        let use_form_data = match body.get("useFormData") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(invalid("useFormData must be a boolean")),
        };

        let endpoint = optional_string(body, "endpoint")?;
        let upload_url = optional_string(body, "uploadUrl")?;

        let options = Self {
            token: None,
            protocol,
            endpoint,
            upload_url,
            size,
            fieldname,
            metadata,
            headers,
            http_method,
            use_form_data,
        };
        options.validate_destination(validator)?;

        Ok(options)
    }

    fn validate_destination(&self, validator: &UrlValidator) -> Result<(), RelayError> {
        // 对象存储的目标由服务端配置决定
        if self.protocol == Protocol::ObjectStoreMultipart {
            return Ok(());
        }

        if self.endpoint.is_none() && self.upload_url.is_none() {
            return Err(invalid("no destination specified"));
        }
        if self.protocol == Protocol::SimpleHttp && self.endpoint.is_none() {
            return Err(invalid("no destination specified"));
        }

        for url in [&self.endpoint, &self.upload_url].into_iter().flatten() {
            if !validator.is_valid_url(url) {
                return Err(invalid("invalid destination url"));
            }
            if !validator.is_allowed(url) {
                return Err(invalid(
                    "upload destination does not match any allowed destinations",
                ));
            }
        }

        Ok(())
    }

    /// 指定 token（重试时沿用上一次会话的身份）
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// 租户 ID（metadata.tenantId）
    pub fn tenant_id(&self) -> Option<String> {
        self.metadata
            .get("tenantId")
            .map(metadata_string)
            .filter(|s| !s.is_empty())
    }

    /// 上传文件名：metadata.name 或 `uppy-file-<token>`
    pub fn file_name(&self, token: &str) -> String {
        self.metadata
            .get("name")
            .map(metadata_string)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{}-{}", FILE_NAME_PREFIX, token))
    }

    /// MIME 类型（metadata.type）
    pub fn content_type(&self) -> Option<String> {
        self.metadata
            .get("type")
            .map(metadata_string)
            .filter(|s| !s.is_empty())
    }
}

fn optional_string(body: &Map<String, Value>, key: &str) -> Result<Option<String>, RelayError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid("invalid destination url")),
    }
}
