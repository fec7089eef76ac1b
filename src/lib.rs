// src/lib.rs
// Entry point for the Switchyard edge traffic-distribution engine.
// Every request is classified, matched against the synced rule set, and
// answered with a redirect, block, or passthrough; every decision feeds the
// stats pipeline. The engine itself must never fail a request: store or
// sync trouble always degrades to passthrough.

use spin_sdk::http::{Request, Response};
use spin_sdk::http_component;
use spin_sdk::key_value::Store;

pub mod action;    // Response building, sentinel, cacheability
pub mod bandit;    // MAB variant selection
pub mod config;    // Operational env settings
pub mod context;   // Per-request signal extraction
pub mod matcher;   // Ordered rule evaluation
pub mod ops;       // Status / force-sync endpoints
pub mod rules;     // Rule and domain-config data model
pub mod stats;     // Three-channel stats pipeline
pub mod store;     // Key-value store abstraction
pub mod sync;      // Versioned snapshot sync

#[cfg(test)]
mod test_support;

use rules::{FallbackAction, Rule, RuleAction, Snapshot};
use stats::{DecisionEvent, DecisionKind};
use store::KeyValueStore;

pub(crate) fn log_line(message: &str) {
    println!("{}", message);
}

/// Main handler logic, testable as a plain Rust function.
pub fn handle_traffic_impl(req: &Request) -> Response {
    // Kill switch: pure passthrough, no matching, no stats.
    if config::kill_switch_engaged() {
        return action::pass_response();
    }

    let kv = match Store::open_default() {
        Ok(store) => store,
        Err(_) => {
            // Fail open: our infrastructure trouble is never the client's.
            log_line("[engine] key-value store unavailable, passing through");
            return action::pass_response();
        }
    };

    let Some(snapshot) = sync::current_snapshot(&kv) else {
        return action::pass_response();
    };

    decide_request(req, &kv, &snapshot)
}

/// Decide one request against a snapshot. Exactly one stats event is
/// recorded per rule evaluation (matched or not); requests that never reach
/// evaluation (sentinel bypass, unknown or disabled domain) record nothing.
pub fn decide_request<S: KeyValueStore>(req: &Request, kv: &S, snapshot: &Snapshot) -> Response {
    let ctx = context::RequestContext::from_request(req);

    // Anti-loop: a request already carrying the sentinel passes straight
    // through, otherwise a redirect chain could bounce forever.
    if ctx.params.contains_key(action::LOOP_GUARD_PARAM) {
        return action::pass_response();
    }

    let Some(domain_cfg) = snapshot.config_for(&ctx.hostname) else {
        return action::pass_response();
    };
    if !domain_cfg.tds_enabled {
        return action::pass_response();
    }

    // Smartshield: bot traffic is dispatched ahead of generic matching.
    if domain_cfg.smartshield_enabled && ctx.is_bot {
        let (response, kind) = fallback_outcome(
            domain_cfg.bot_action,
            domain_cfg.bot_redirect_url.as_deref(),
            &ctx,
        );
        record(kv, &ctx, None, kind, None);
        return response;
    }

    let domain_rules = snapshot.rules_for_domain(&ctx.hostname);
    if let Some(rule) = matcher::first_match(&domain_rules, &ctx) {
        return execute_rule(kv, rule, &ctx);
    }

    let (response, kind) = fallback_outcome(
        domain_cfg.default_action,
        domain_cfg.default_url.as_deref(),
        &ctx,
    );
    record(kv, &ctx, None, kind, None);
    response
}

fn execute_rule<S: KeyValueStore>(
    kv: &S,
    rule: &Rule,
    ctx: &context::RequestContext,
) -> Response {
    match rule.action {
        RuleAction::Block => {
            record(kv, ctx, Some(&rule.id), DecisionKind::Block, None);
            action::block_response()
        }
        RuleAction::Pass => {
            record(kv, ctx, Some(&rule.id), DecisionKind::Pass, None);
            action::pass_response()
        }
        RuleAction::Redirect => {
            match rule.action_url.as_deref().filter(|u| !u.trim().is_empty()) {
                Some(url) => {
                    let target = action::append_loop_guard(&action::substitute_placeholders(url, ctx));
                    record(kv, ctx, Some(&rule.id), DecisionKind::Redirect, None);
                    action::redirect_response(
                        &target,
                        rule.redirect_status(),
                        action::is_publicly_cacheable(rule),
                    )
                }
                // Ingest validation rejects these; if one slips through the
                // client still gets a working page, not an error.
                None => {
                    record(kv, ctx, Some(&rule.id), DecisionKind::Pass, None);
                    action::pass_response()
                }
            }
        }
        RuleAction::MabRedirect => {
            let mut rng = rand::thread_rng();
            match bandit::select_variant(&rule.variants, rule.algorithm, &mut rng) {
                Some(index) => {
                    let variant = &rule.variants[index];
                    stats::record_variant_impression(kv, &rule.id, index);
                    let target = action::append_loop_guard(&action::substitute_placeholders(
                        &variant.url,
                        ctx,
                    ));
                    record(
                        kv,
                        ctx,
                        Some(&rule.id),
                        DecisionKind::Redirect,
                        Some(variant.url.clone()),
                    );
                    // Bandit picks differ per request; never shared-cacheable.
                    action::redirect_response(&target, rule.redirect_status(), false)
                }
                None => {
                    record(kv, ctx, Some(&rule.id), DecisionKind::Pass, None);
                    action::pass_response()
                }
            }
        }
    }
}

/// Resolve a domain-level fallback (bot action or default action) into a
/// response. A redirect fallback without a usable URL degrades to pass.
fn fallback_outcome(
    fallback: FallbackAction,
    url: Option<&str>,
    ctx: &context::RequestContext,
) -> (Response, DecisionKind) {
    match fallback {
        FallbackAction::Block => (action::block_response(), DecisionKind::Block),
        FallbackAction::Redirect => match url.filter(|u| !u.trim().is_empty()) {
            Some(url) => {
                let target = action::append_loop_guard(&action::substitute_placeholders(url, ctx));
                (
                    action::redirect_response(&target, rules::DEFAULT_REDIRECT_CODE, false),
                    DecisionKind::Redirect,
                )
            }
            None => (action::pass_response(), DecisionKind::Pass),
        },
        FallbackAction::Pass => (action::pass_response(), DecisionKind::Pass),
    }
}

fn record<S: KeyValueStore>(
    kv: &S,
    ctx: &context::RequestContext,
    rule_id: Option<&str>,
    action: DecisionKind,
    variant: Option<String>,
) {
    let event = DecisionEvent {
        ts: stats::now_ts(),
        domain: ctx.hostname.clone(),
        rule_id: rule_id.map(str::to_string),
        action,
        country: ctx.country.clone(),
        device: ctx.device,
        variant,
    };
    stats::record_decision(kv, &event);
}

#[http_component]
async fn spin_entrypoint(req: Request) -> Response {
    let path = req.path().to_string();
    if let Some(response) = ops::maybe_handle_ops_route(&req, &path).await {
        return response;
    }

    let response = handle_traffic_impl(&req);

    // The decision above is final before the sync check runs; a slow or
    // failing source can only affect later requests.
    sync::maybe_refresh_after_response().await;

    response
}
