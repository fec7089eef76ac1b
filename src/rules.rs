// src/rules.rs
// Rule and domain-config data model. Rules arrive only through the sync
// snapshot and are replaced wholesale; nothing in here mutates a rule after
// ingest except the out-of-band variant counters.

use serde::{Deserialize, Serialize};

pub const VALID_REDIRECT_CODES: [u16; 3] = [301, 302, 307];
pub const DEFAULT_REDIRECT_CODE: u16 = 302;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Redirect,
    Block,
    Pass,
    MabRedirect,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MabAlgorithm {
    ThompsonSampling,
    Ucb,
    EpsilonGreedy,
}

impl Default for MabAlgorithm {
    fn default() -> Self {
        MabAlgorithm::ThompsonSampling
    }
}

/// One arm of a multi-variant redirect. alpha/beta are the Beta posterior
/// parameters maintained by the conversion-postback path upstream.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Variant {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default = "default_beta_param")]
    pub alpha: f64,
    #[serde(default = "default_beta_param")]
    pub beta: f64,
    #[serde(default)]
    pub impressions: u64,
    #[serde(default)]
    pub conversions: u64,
}

fn default_beta_param() -> f64 {
    1.0
}

/// The closed set of matching dimensions. Absent fields never constrain.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RuleConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_exclude: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_params: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

impl RuleConditions {
    /// True when the rule depends on any per-request signal, which makes a
    /// redirect built from it unsafe for shared caches.
    pub fn depends_on_request_signals(&self) -> bool {
        self.geo.is_some()
            || self.geo_exclude.is_some()
            || self.device.is_some()
            || self.os.is_some()
            || self.browser.is_some()
            || self.bot.is_some()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub domain: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub algorithm: MabAlgorithm,
}

impl Rule {
    pub fn redirect_status(&self) -> u16 {
        self.status_code.unwrap_or(DEFAULT_REDIRECT_CODE)
    }
}

/// What to do with bot traffic and with requests no rule matched.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    Pass,
    Redirect,
    Block,
}

impl Default for FallbackAction {
    fn default() -> Self {
        FallbackAction::Pass
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DomainConfig {
    pub domain: String,
    #[serde(default)]
    pub tds_enabled: bool,
    #[serde(default)]
    pub default_action: FallbackAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_url: Option<String>,
    #[serde(default)]
    pub smartshield_enabled: bool,
    #[serde(default)]
    pub bot_action: FallbackAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_redirect_url: Option<String>,
}

/// A complete versioned rule set. This is the unit of wholesale replacement:
/// it is stored as a single KV value and swapped atomically by sync.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Snapshot {
    pub version: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub configs: Vec<DomainConfig>,
}

impl Snapshot {
    pub fn config_for(&self, hostname: &str) -> Option<&DomainConfig> {
        self.configs
            .iter()
            .find(|c| c.domain.eq_ignore_ascii_case(hostname))
    }

    /// Rules for one domain, sorted by priority descending. Equal priorities
    /// keep their snapshot order.
    pub fn rules_for_domain(&self, hostname: &str) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|r| r.domain.eq_ignore_ascii_case(hostname))
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        rules
    }
}

/// Write-time validation: drop rules that violate structural invariants and
/// normalize the rest. Returns warnings for the operator log.
pub fn validate_snapshot(snapshot: &mut Snapshot) -> Vec<String> {
    let mut warnings = Vec::new();

    snapshot.rules.retain(|rule| {
        match rule.action {
            RuleAction::Redirect => {
                if rule.action_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    warnings.push(format!("rule {}: redirect without action_url, dropped", rule.id));
                    return false;
                }
            }
            RuleAction::MabRedirect => {
                if rule.variants.len() < 2 {
                    warnings.push(format!(
                        "rule {}: mab_redirect with {} variant(s), dropped",
                        rule.id,
                        rule.variants.len()
                    ));
                    return false;
                }
            }
            RuleAction::Block | RuleAction::Pass => {}
        }
        true
    });

    for rule in &mut snapshot.rules {
        if let Some(code) = rule.status_code {
            if !VALID_REDIRECT_CODES.contains(&code) {
                warnings.push(format!(
                    "rule {}: status_code {} replaced with {}",
                    rule.id, code, DEFAULT_REDIRECT_CODE
                ));
                rule.status_code = Some(DEFAULT_REDIRECT_CODE);
            }
        }
        if let Some(geo) = rule.conditions.geo.as_mut() {
            normalize_country_list(geo);
        }
        if let Some(geo) = rule.conditions.geo_exclude.as_mut() {
            normalize_country_list(geo);
        }
        for pattern_field in [&rule.conditions.path, &rule.conditions.referrer] {
            if let Some(pattern) = pattern_field {
                if regex::Regex::new(pattern).is_err() {
                    warnings.push(format!(
                        "rule {}: malformed pattern {:?} will match everything",
                        rule.id, pattern
                    ));
                }
            }
        }
    }

    warnings
}

fn normalize_country_list(list: &mut Vec<String>) {
    for code in list.iter_mut() {
        *code = code.trim().to_ascii_uppercase();
    }
    list.retain(|code| code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()));
}
