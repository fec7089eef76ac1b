// src/matcher.rs
// Ordered rule evaluation against a request context. First fully-satisfied
// rule wins; conditions are checked cheapest-first and short-circuit on the
// first failure.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::context::RequestContext;
use crate::rules::{Rule, RuleConditions};

// Compiled patterns are cached process-wide so the hot path never recompiles.
// A None entry records a pattern that failed to compile.
static REGEX_CACHE: Lazy<Mutex<HashMap<String, Option<Regex>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Walk the priority-ordered rules and return the first match.
pub fn first_match<'a>(rules: &[&'a Rule], ctx: &RequestContext) -> Option<&'a Rule> {
    rules.iter().copied().find(|rule| rule_matches(rule, ctx))
}

pub fn rule_matches(rule: &Rule, ctx: &RequestContext) -> bool {
    let c = &rule.conditions;

    if let Some(geo) = nonempty(&c.geo) {
        match ctx.country.as_deref() {
            Some(country) if contains_ignore_case(geo, country) => {}
            _ => return false,
        }
    }
    if let Some(excluded) = nonempty(&c.geo_exclude) {
        if let Some(country) = ctx.country.as_deref() {
            if contains_ignore_case(excluded, country) {
                return false;
            }
        }
    }
    if let Some(device) = c.device.as_deref() {
        if !device.eq_ignore_ascii_case("any") && !device.eq_ignore_ascii_case(ctx.device) {
            return false;
        }
    }
    if let Some(os_list) = nonempty(&c.os) {
        match ctx.os.as_deref() {
            Some(os) if contains_ignore_case(os_list, os) => {}
            _ => return false,
        }
    }
    if let Some(browsers) = nonempty(&c.browser) {
        match ctx.browser.as_deref() {
            Some(browser) if contains_ignore_case(browsers, browser) => {}
            _ => return false,
        }
    }
    if let Some(wants_bot) = c.bot {
        if ctx.is_bot != wants_bot {
            return false;
        }
    }
    if !params_match(c, ctx) {
        return false;
    }
    if let Some(pattern) = c.path.as_deref() {
        if !regex_matches(pattern, &ctx.path) {
            return false;
        }
    }
    if let Some(pattern) = c.referrer.as_deref() {
        if !regex_matches(pattern, ctx.referrer.as_deref().unwrap_or("")) {
            return false;
        }
    }
    true
}

/// Combined parameter check. `match_params` is OR-logic over query keys; when
/// it is defined and satisfied the `utm_source` check is skipped. When it is
/// defined and unsatisfied, a defined `utm_source` list gets to rescue the
/// rule; otherwise the rule fails. `utm_campaign` is always enforced when
/// defined.
fn params_match(c: &RuleConditions, ctx: &RequestContext) -> bool {
    let mut skip_utm_source = false;
    if let Some(keys) = nonempty(&c.match_params) {
        if keys.iter().any(|key| ctx.params.contains_key(key)) {
            skip_utm_source = true;
        } else if nonempty(&c.utm_source).is_none() {
            return false;
        }
    }
    if !skip_utm_source {
        if let Some(sources) = nonempty(&c.utm_source) {
            match ctx.params.get("utm_source") {
                Some(value) if contains_ignore_case(sources, value) => {}
                _ => return false,
            }
        }
    }
    if let Some(campaigns) = nonempty(&c.utm_campaign) {
        match ctx.params.get("utm_campaign") {
            Some(value) if contains_ignore_case(campaigns, value) => {}
            _ => return false,
        }
    }
    true
}

fn nonempty(list: &Option<Vec<String>>) -> Option<&[String]> {
    list.as_deref().filter(|l| !l.is_empty())
}

fn contains_ignore_case(list: &[String], value: &str) -> bool {
    list.iter().any(|item| item.eq_ignore_ascii_case(value))
}

/// Evaluate a stored regex condition. A malformed pattern never excludes: it
/// is logged once and treated as always-matching.
fn regex_matches(pattern: &str, value: &str) -> bool {
    let mut cache = REGEX_CACHE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let compiled = cache.entry(pattern.to_string()).or_insert_with(|| {
        match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(err) => {
                crate::log_line(&format!(
                    "[matcher] malformed pattern {:?} treated as match-all: {}",
                    pattern, err
                ));
                None
            }
        }
    });
    match compiled {
        Some(re) => re.is_match(value),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{MabAlgorithm, RuleAction};
    use std::collections::HashMap;

    fn ctx() -> RequestContext {
        RequestContext {
            url: "https://example.com/landing".to_string(),
            hostname: "example.com".to_string(),
            path: "/landing".to_string(),
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

    fn rule(conditions: RuleConditions) -> Rule {
        Rule {
            id: "r1".to_string(),
            domain: "example.com".to_string(),
            priority: 0,
            conditions,
            action: RuleAction::Pass,
            action_url: None,
            status_code: None,
            variants: Vec::new(),
            algorithm: MabAlgorithm::default(),
        }
    }

    fn list(items: &[&str]) -> Option<Vec<String>> {
        Some(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn empty_conditions_match_everything() {
        assert!(rule_matches(&rule(RuleConditions::default()), &ctx()));
    }

    #[test]
    fn geo_allow_and_exclude() {
        let allow = rule(RuleConditions {
            geo: list(&["RU", "KZ"]),
            ..Default::default()
        });
        assert!(rule_matches(&allow, &ctx()));

        let mut other = ctx();
        other.country = Some("DE".to_string());
        assert!(!rule_matches(&allow, &other));

        let mut unknown = ctx();
        unknown.country = None;
        assert!(!rule_matches(&allow, &unknown));

        let exclude = rule(RuleConditions {
            geo_exclude: list(&["RU"]),
            ..Default::default()
        });
        assert!(!rule_matches(&exclude, &ctx()));
        assert!(rule_matches(&exclude, &other));
        // Unknown country is not excludable.
        assert!(rule_matches(&exclude, &unknown));
    }

    #[test]
    fn device_any_is_ignored() {
        let any = rule(RuleConditions {
            device: Some("any".to_string()),
            ..Default::default()
        });
        assert!(rule_matches(&any, &ctx()));

        let desktop = rule(RuleConditions {
            device: Some("desktop".to_string()),
            ..Default::default()
        });
        assert!(!rule_matches(&desktop, &ctx()));
    }

    #[test]
    fn bot_condition_is_exact() {
        let bots_only = rule(RuleConditions {
            bot: Some(true),
            ..Default::default()
        });
        assert!(!rule_matches(&bots_only, &ctx()));
        let mut bot_ctx = ctx();
        bot_ctx.is_bot = true;
        assert!(rule_matches(&bots_only, &bot_ctx));
    }

    #[test]
    fn match_params_or_logic_with_utm_rescue() {
        let combined = rule(RuleConditions {
            match_params: list(&["fbclid"]),
            utm_source: list(&["facebook"]),
            ..Default::default()
        });

        let mut fbclid_only = ctx();
        fbclid_only.params.insert("fbclid".to_string(), "x".to_string());
        assert!(rule_matches(&combined, &fbclid_only));

        let mut utm_only = ctx();
        utm_only
            .params
            .insert("utm_source".to_string(), "facebook".to_string());
        assert!(rule_matches(&combined, &utm_only));

        let mut both = fbclid_only.clone();
        both.params
            .insert("utm_source".to_string(), "facebook".to_string());
        assert!(rule_matches(&combined, &both));

        assert!(!rule_matches(&combined, &ctx()));
    }

    #[test]
    fn match_params_alone_excludes_when_absent() {
        let only_params = rule(RuleConditions {
            match_params: list(&["gclid"]),
            ..Default::default()
        });
        assert!(!rule_matches(&only_params, &ctx()));
    }

    #[test]
    fn satisfied_match_params_skips_utm_source_but_not_campaign() {
        let with_campaign = rule(RuleConditions {
            match_params: list(&["fbclid"]),
            utm_source: list(&["facebook"]),
            utm_campaign: list(&["summer"]),
            ..Default::default()
        });
        let mut c = ctx();
        c.params.insert("fbclid".to_string(), "x".to_string());
        // utm_campaign still required.
        assert!(!rule_matches(&with_campaign, &c));
        c.params
            .insert("utm_campaign".to_string(), "summer".to_string());
        assert!(rule_matches(&with_campaign, &c));
    }

    #[test]
    fn path_regex_and_malformed_pattern_policy() {
        let path_rule = rule(RuleConditions {
            path: Some("^/landing".to_string()),
            ..Default::default()
        });
        assert!(rule_matches(&path_rule, &ctx()));

        let mut elsewhere = ctx();
        elsewhere.path = "/checkout".to_string();
        assert!(!rule_matches(&path_rule, &elsewhere));

        // A malformed pattern never excludes.
        let broken = rule(RuleConditions {
            path: Some("([unclosed".to_string()),
            ..Default::default()
        });
        assert!(rule_matches(&broken, &ctx()));
    }

    #[test]
    fn referrer_regex_against_absent_referrer() {
        let referred = rule(RuleConditions {
            referrer: Some("facebook\\.com".to_string()),
            ..Default::default()
        });
        assert!(!rule_matches(&referred, &ctx()));

        let mut from_fb = ctx();
        from_fb.referrer = Some("https://m.facebook.com/feed".to_string());
        assert!(rule_matches(&referred, &from_fb));
    }

    #[test]
    fn first_match_respects_order() {
        let broad = rule(RuleConditions::default());
        let mut geo_rule = rule(RuleConditions {
            geo: list(&["RU"]),
            ..Default::default()
        });
        geo_rule.id = "geo".to_string();
        let ordered = vec![&geo_rule, &broad];
        assert_eq!(first_match(&ordered, &ctx()).unwrap().id, "geo");
    }
}
