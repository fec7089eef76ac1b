// src/context.rs
// Per-request context extraction: geo, device, OS, browser, bot and query
// parameters derived from one inbound request. Pure functions, no state.

use percent_encoding::percent_decode_str;
use spin_sdk::http::Request;
use std::collections::HashMap;

/// Crawler signatures matched (case-insensitively) against the User-Agent.
const BOT_SIGNATURES: &[&str] = &[
    "googlebot",
    "bingbot",
    "yandexbot",
    "baiduspider",
    "duckduckbot",
    "slurp",
    "facebookexternalhit",
    "twitterbot",
    "linkedinbot",
    "telegrambot",
    "whatsapp",
    "applebot",
    "semrushbot",
    "ahrefsbot",
    "mj12bot",
    "dotbot",
    "petalbot",
    "bytespider",
    "gptbot",
    "headlesschrome",
    "phantomjs",
    "python-requests",
    "python-urllib",
    "aiohttp",
    "go-http-client",
    "okhttp",
    "curl/",
    "wget/",
    "scrapy",
    "crawler",
    "spider",
];

/// Everything the decision engine needs to know about one request.
/// Ephemeral; never persisted.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub url: String,
    pub hostname: String,
    pub path: String,
    pub country: Option<String>,
    pub device: &'static str,
    pub os: Option<String>,
    pub browser: Option<String>,
    pub is_bot: bool,
    pub ip: String,
    pub user_agent: String,
    pub params: HashMap<String, String>,
    pub referrer: Option<String>,
}

impl RequestContext {
    pub fn from_request(req: &Request) -> Self {
        let user_agent = header_str(req, "user-agent").unwrap_or_default().to_string();
        let hostname = extract_hostname(req);
        let path = req.path().to_string();
        let url = if req.uri().starts_with("http://") || req.uri().starts_with("https://") {
            req.uri().to_string()
        } else {
            format!("https://{}{}", hostname, req.uri())
        };

        RequestContext {
            url,
            hostname,
            path,
            country: extract_country(req),
            device: classify_device(req, &user_agent),
            os: classify_os(req, &user_agent),
            browser: classify_browser(req, &user_agent),
            is_bot: is_known_bot(&user_agent),
            ip: extract_client_ip(req),
            params: parse_query_params(req.query()),
            referrer: header_str(req, "referer").map(str::to_string),
            user_agent,
        }
    }
}

fn header_str<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.header(name).and_then(|v| v.as_str())
}

fn extract_hostname(req: &Request) -> String {
    let from_header = header_str(req, "host").unwrap_or("");
    let raw = if !from_header.is_empty() {
        from_header
    } else {
        // Absolute-form request line: take the authority out of the URI.
        req.uri()
            .split_once("://")
            .map(|(_, rest)| rest.split('/').next().unwrap_or(""))
            .unwrap_or("")
    };
    raw.split(':').next().unwrap_or("").to_ascii_lowercase()
}

/// Country from the edge-provided geo header, normalized to two-letter
/// uppercase ISO form.
fn extract_country(req: &Request) -> Option<String> {
    let raw = header_str(req, "x-geo-country")?.trim();
    if raw.len() != 2 || !raw.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(raw.to_ascii_uppercase())
}

/// Extract the best available client IP from the request.
pub(crate) fn extract_client_ip(req: &Request) -> String {
    if let Some(forwarded) = header_str(req, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() && first != "unknown" {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = header_str(req, "x-real-ip") {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() && real_ip != "unknown" {
            return real_ip.to_string();
        }
    }
    "unknown".to_string()
}

/// Device class: "mobile", "tablet" or "desktop". Prefers the low-entropy
/// client hint when present; tablets are never reported as mobile.
fn classify_device(req: &Request, ua: &str) -> &'static str {
    let ua_lower = ua.to_ascii_lowercase();
    if ua_lower.contains("ipad") || ua_lower.contains("tablet") {
        return "tablet";
    }
    if let Some(hint) = header_str(req, "sec-ch-ua-mobile") {
        return if hint.trim() == "?1" { "mobile" } else { "desktop" };
    }
    // Android tablets carry "Android" without "Mobile".
    if ua_lower.contains("android") && !ua_lower.contains("mobile") {
        return "tablet";
    }
    if ua_lower.contains("mobile") || ua_lower.contains("iphone") || ua_lower.contains("android") {
        return "mobile";
    }
    "desktop"
}

fn classify_os(req: &Request, ua: &str) -> Option<String> {
    if let Some(platform) = header_str(req, "sec-ch-ua-platform") {
        let platform = platform.trim().trim_matches('"');
        if !platform.is_empty() {
            return Some(platform.to_ascii_lowercase());
        }
    }
    let ua_lower = ua.to_ascii_lowercase();
    let os = if ua_lower.contains("windows") {
        "windows"
    } else if ua_lower.contains("iphone") || ua_lower.contains("ipad") || ua_lower.contains("ios") {
        "ios"
    } else if ua_lower.contains("mac os") || ua_lower.contains("macintosh") {
        "macos"
    } else if ua_lower.contains("android") {
        "android"
    } else if ua_lower.contains("linux") {
        "linux"
    } else {
        return None;
    };
    Some(os.to_string())
}

fn classify_browser(req: &Request, ua: &str) -> Option<String> {
    if let Some(brands) = header_str(req, "sec-ch-ua") {
        let brands_lower = brands.to_ascii_lowercase();
        // Brand list order is randomized by browsers; test specific names first.
        for (needle, name) in [
            ("edge", "edge"),
            ("opera", "opera"),
            ("chrome", "chrome"),
            ("firefox", "firefox"),
            ("safari", "safari"),
        ] {
            if brands_lower.contains(needle) {
                return Some(name.to_string());
            }
        }
    }
    let ua_lower = ua.to_ascii_lowercase();
    // Order matters: Edge and Opera embed "chrome", Chrome embeds "safari".
    let browser = if ua_lower.contains("edg/") || ua_lower.contains("edge/") {
        "edge"
    } else if ua_lower.contains("opr/") || ua_lower.contains("opera") {
        "opera"
    } else if ua_lower.contains("firefox/") {
        "firefox"
    } else if ua_lower.contains("chrome/") || ua_lower.contains("crios/") {
        "chrome"
    } else if ua_lower.contains("safari/") {
        "safari"
    } else {
        return None;
    };
    Some(browser.to_string())
}

fn is_known_bot(ua: &str) -> bool {
    if ua.is_empty() {
        return false;
    }
    let ua_lower = ua.to_ascii_lowercase();
    BOT_SIGNATURES.iter().any(|sig| ua_lower.contains(sig))
}

/// Parse a raw query string into a decoded key/value map. The first
/// occurrence of a key wins.
pub fn parse_query_params(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.trim_start_matches('?').split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let Some(key) = parts.next() else { continue };
        if key.is_empty() {
            continue;
        }
        let key = percent_decode_str(key).decode_utf8_lossy().to_string();
        let value = percent_decode_str(parts.next().unwrap_or(""))
            .decode_utf8_lossy()
            .to_string();
        params.entry(key).or_insert(value);
    }
    params
}
