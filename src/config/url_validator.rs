//! 目标地址校验
//!
//! - 必须是带主机名的 http/https URL
//! - 非调试模式下主机必须是 IP 或带有效顶级域名的域名
//! - 配置了白名单时，地址必须等于某一项或匹配该项正则

use anyhow::{Context, Result};
use regex::Regex;
use std::net::IpAddr;

/// 目标地址校验器
#[derive(Debug, Clone)]
pub struct UrlValidator {
    debug: bool,
    allow_list: Vec<(String, Regex)>,
}

impl UrlValidator {
    pub fn new(debug: bool, patterns: &[String]) -> Result<Self> {
        let allow_list = patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .with_context(|| format!("无效的白名单正则: {}", p))
                    .map(|re| (p.clone(), re))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { debug, allow_list })
    }

    /// 是否是合法的目标 URL
    pub fn is_valid_url(&self, raw: &str) -> bool {
        let url = match reqwest::Url::parse(raw) {
            Ok(url) => url,
            Err(_) => return false,
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            return false;
        }
        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h,
            _ => return false,
        };
        if self.debug {
            return true;
        }

        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if bare.parse::<IpAddr>().is_ok() {
            return true;
        }
        Self::has_valid_tld(host)
    }

    fn has_valid_tld(host: &str) -> bool {
        let host = host.trim_end_matches('.');
        match host.rsplit_once('.') {
            Some((name, tld)) => {
                !name.is_empty() && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
            }
            None => false,
        }
    }

    /// 是否在白名单内（未配置白名单时总是允许）
    pub fn is_allowed(&self, url: &str) -> bool {
        if self.allow_list.is_empty() {
            return true;
        }
        self.allow_list
            .iter()
            .any(|(raw, re)| raw == url || re.is_match(url))
    }
}
