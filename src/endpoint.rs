//! 连接 URL 构造：在基础 URL 上依次追加客户端标识与凭证

use tracing::debug;
use url::form_urlencoded::byte_serialize;
use url::Url;

/// 客户端标识的查询参数名
pub const IDENTITY_QUERY_KEY: &str = "uid";

/// 凭证查询参数的默认名
pub const DEFAULT_CREDENTIAL_QUERY_KEY: &str = "authToken";

/// 构造最终的流 URL：`<base>[?|&]uid=<identity>&<key>=<credential>`
///
/// 标识参数总在凭证参数之前。相对路径或无法解析的基础 URL
/// 会走字符串拼接的兜底路径，顺序保证不变。
pub fn build_stream_url(base: &str, identity: &str, credential_key: &str, credential: &str) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            if let Some(query) = url.query().filter(|q| q.ends_with('&')) {
                let trimmed = query.trim_end_matches('&').to_string();
                url.set_query(Some(&trimmed));
            }
            url.query_pairs_mut()
                .append_pair(IDENTITY_QUERY_KEY, identity)
                .append_pair(credential_key, credential);
            url.into()
        }
        Err(e) => {
            debug!(url = %base, error = %e, "Base URL not absolute, appending query manually");
            append_query_manually(base, identity, credential_key, credential)
        }
    }
}

fn append_query_manually(base: &str, identity: &str, credential_key: &str, credential: &str) -> String {
    let (head, fragment) = match base.split_once('#') {
        Some((head, fragment)) => (head, Some(fragment)),
        None => (base, None),
    };

    let separator = match head.find('?') {
        None => "?",
        Some(idx) if idx + 1 == head.len() || head.ends_with('&') => "",
        Some(_) => "&",
    };

    let mut out = format!(
        "{head}{separator}{IDENTITY_QUERY_KEY}={}&{}={}",
        encode(identity),
        encode(credential_key),
        encode(credential),
    );
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}
