//! 来源地址限制
//!
//! 非调试模式下，URL 来源只能访问公网地址：
//! - 请求前解析域名，拒绝回环 / 私有 / 链路本地 / 未指定等地址
//! - 客户端使用 [`PublicOnlyResolver`]，连接时再过滤一次，防止 DNS 重绑定
//! - 重定向到非公网 IP 时中止

use hyper::client::connect::dns::Name;
use reqwest::dns::{Addrs, Resolve, Resolving};
use reqwest::redirect::{Attempt, Policy};
use reqwest::Url;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::warn;

/// 最多跟随的重定向次数
const MAX_REDIRECTS: usize = 10;

/// 是否为公网地址
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        // 0.0.0.0/8
        || a == 0
        // 100.64.0.0/10 运营商级 NAT
        || (a == 100 && (64..128).contains(&b)))
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 唯一本地地址
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 链路本地
        || (first & 0xffc0) == 0xfe80)
}

/// URL 主机（IPv6 去掉方括号）
fn host(url: &Url) -> Option<&str> {
    url.host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
}

/// URL 的主机是否为非公网 IP 字面量
pub(crate) fn is_private_ip_literal(url: &Url) -> bool {
    host(url)
        .and_then(|host| host.parse::<IpAddr>().ok())
        .map_or(false, |ip| !is_public_ip(ip))
}

/// 解析 URL 主机并确认全部地址都是公网地址
pub(crate) async fn resolves_to_public(url: &Url) -> io::Result<bool> {
    let host = match host(url) {
        Some(host) => host,
        None => return Ok(false),
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(is_public_ip(ip));
    }
    let port = url.port_or_known_default().unwrap_or(80);
    let mut resolved = false;
    for addr in tokio::net::lookup_host((host, port)).await? {
        resolved = true;
        if !is_public_ip(addr.ip()) {
            return Ok(false);
        }
    }
    Ok(resolved)
}

/// 解析主机，只保留公网地址
async fn public_addrs(host: &str) -> io::Result<Vec<SocketAddr>> {
    Ok(tokio::net::lookup_host((host, 0))
        .await?
        .filter(|addr| is_public_ip(addr.ip()))
        .collect())
}

/// 只返回公网地址的 DNS 解析器
#[derive(Debug, Default, Clone)]
pub struct PublicOnlyResolver;

impl Resolve for PublicOnlyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let addrs = public_addrs(&host).await?;
            if addrs.is_empty() {
                warn!("拒绝解析到非公网地址的主机: {}", host);
                return Err(format!("{} does not resolve to a public address", host).into());
            }
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}

/// 重定向策略：最多 10 次，目标为非公网 IP 时中止
pub fn public_redirect_policy() -> Policy {
    Policy::custom(|attempt: Attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if is_private_ip_literal(attempt.url()) {
            attempt.error("redirect to a private address is not allowed")
        } else {
            attempt.follow()
        }
    })
}
