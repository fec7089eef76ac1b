// src/action.rs
// Response construction for the three terminal actions, plus the anti-loop
// sentinel and redirect cacheability policy.

use spin_sdk::http::Response;

use crate::context::RequestContext;
use crate::rules::{Rule, RuleAction};

/// Loop-guard marker appended to every built redirect target. Inbound
/// requests already carrying it pass through without matching.
pub const LOOP_GUARD_PARAM: &str = "_sentinel";

/// Shared-cache lifetime for redirects that depend on nothing per-request.
const SHARED_CACHE_TTL_SECONDS: u64 = 300;

/// Client-hint opt-in advertised on passthrough responses so follow-up
/// requests can carry cheap device signals.
const ACCEPT_CH: &str = "Sec-CH-UA, Sec-CH-UA-Mobile, Sec-CH-UA-Platform";

/// Substitute template placeholders into a target URL.
pub fn substitute_placeholders(url: &str, ctx: &RequestContext) -> String {
    url.replace("{country}", ctx.country.as_deref().unwrap_or(""))
        .replace("{device}", ctx.device)
        .replace("{path}", &ctx.path)
        .replace("{host}", &ctx.hostname)
}

/// Append the loop-guard parameter unless the target already carries it.
pub fn append_loop_guard(url: &str) -> String {
    if has_query_param(url, LOOP_GUARD_PARAM) {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}=1", url, separator, LOOP_GUARD_PARAM)
}

fn has_query_param(url: &str, name: &str) -> bool {
    url.split_once('?')
        .map(|(_, query)| {
            query
                .split('&')
                .any(|pair| pair.splitn(2, '=').next() == Some(name))
        })
        .unwrap_or(false)
}

/// A redirect may be publicly cacheable only when none of its conditions
/// depend on per-request signals and it is not bandit-selected.
pub fn is_publicly_cacheable(rule: &Rule) -> bool {
    rule.action != RuleAction::MabRedirect && !rule.conditions.depends_on_request_signals()
}

pub fn redirect_response(location: &str, status: u16, cacheable: bool) -> Response {
    let cache_control = if cacheable {
        format!("public, max-age={}", SHARED_CACHE_TTL_SECONDS)
    } else {
        "private, no-cache".to_string()
    };
    Response::builder()
        .status(status)
        .header("Location", location)
        .header("Cache-Control", cache_control.as_str())
        .body(Vec::new())
        .build()
}

pub fn block_response() -> Response {
    Response::builder()
        .status(403)
        .header("Cache-Control", "no-store")
        .header("Content-Type", "text/plain; charset=utf-8")
        .body("Forbidden")
        .build()
}

pub fn pass_response() -> Response {
    Response::builder()
        .status(200)
        .header("Accept-CH", ACCEPT_CH)
        .body("OK")
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{MabAlgorithm, RuleConditions};
    use crate::test_support::header_value;
    use std::collections::HashMap;

    fn ctx() -> RequestContext {
        RequestContext {
            url: "https://example.com/promo/summer".to_string(),
            hostname: "example.com".to_string(),
            path: "/promo/summer".to_string(),
            country: Some("RU".to_string()),
            device: "mobile",
            os: Some("android".to_string()),
            browser: Some("chrome".to_string()),
            is_bot: false,
            ip: "203.0.113.9".to_string(),
            user_agent: "test".to_string(),
            params: HashMap::new(),
            referrer: None,
        }
    }

    fn rule(action: RuleAction, conditions: RuleConditions) -> Rule {
        Rule {
            id: "r1".to_string(),
            domain: "example.com".to_string(),
            priority: 0,
            conditions,
            action,
            action_url: Some("https://offer.example/".to_string()),
            status_code: None,
            variants: Vec::new(),
            algorithm: MabAlgorithm::default(),
        }
    }

    #[test]
    fn substitutes_all_placeholders() {
        let built = substitute_placeholders(
            "https://offer.example/{country}/{device}?from={host}&p={path}",
            &ctx(),
        );
        assert_eq!(
            built,
            "https://offer.example/RU/mobile?from=example.com&p=/promo/summer"
        );
    }

    #[test]
    fn missing_country_substitutes_empty() {
        let mut anonymous = ctx();
        anonymous.country = None;
        assert_eq!(
            substitute_placeholders("https://offer.example/?c={country}", &anonymous),
            "https://offer.example/?c="
        );
    }

    #[test]
    fn loop_guard_appended_once() {
        assert_eq!(
            append_loop_guard("https://offer.example/RU"),
            "https://offer.example/RU?_sentinel=1"
        );
        assert_eq!(
            append_loop_guard("https://offer.example/?x=1"),
            "https://offer.example/?x=1&_sentinel=1"
        );
        // Already guarded targets are never modified.
        let guarded = "https://offer.example/?_sentinel=1&x=2";
        assert_eq!(append_loop_guard(guarded), guarded);
    }

    #[test]
    fn cacheability_requires_static_conditions() {
        let static_rule = rule(RuleAction::Redirect, RuleConditions::default());
        assert!(is_publicly_cacheable(&static_rule));

        let geo_rule = rule(
            RuleAction::Redirect,
            RuleConditions {
                geo: Some(vec!["RU".to_string()]),
                ..Default::default()
            },
        );
        assert!(!is_publicly_cacheable(&geo_rule));

        let bandit_rule = rule(RuleAction::MabRedirect, RuleConditions::default());
        assert!(!is_publicly_cacheable(&bandit_rule));

        // Parameter and path conditions are request-URL-derived, not
        // per-visitor, so they keep shared cacheability.
        let param_rule = rule(
            RuleAction::Redirect,
            RuleConditions {
                match_params: Some(vec!["fbclid".to_string()]),
                path: Some("^/promo".to_string()),
                ..Default::default()
            },
        );
        assert!(is_publicly_cacheable(&param_rule));
    }

    #[test]
    fn redirect_cache_headers() {
        let public = redirect_response("https://offer.example/?_sentinel=1", 301, true);
        assert_eq!(*public.status(), 301u16);
        assert_eq!(
            header_value(&public, "cache-control").as_deref(),
            Some("public, max-age=300")
        );

        let private = redirect_response("https://offer.example/?_sentinel=1", 302, false);
        assert_eq!(
            header_value(&private, "cache-control").as_deref(),
            Some("private, no-cache")
        );
    }

    #[test]
    fn block_is_403_and_uncacheable() {
        let resp = block_response();
        assert_eq!(*resp.status(), 403u16);
        assert_eq!(header_value(&resp, "cache-control").as_deref(), Some("no-store"));
    }

    #[test]
    fn pass_advertises_client_hints() {
        let resp = pass_response();
        assert_eq!(*resp.status(), 200u16);
        assert_eq!(header_value(&resp, "accept-ch").as_deref(), Some(ACCEPT_CH));
    }
}
