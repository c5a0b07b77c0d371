//! Cloudflare API client and CDN mitigation backend.
//!
//! Mitigations become zone firewall rules whose filter is a single
//! boolean-OR expression over ASNs, countries or source addresses.

use std::collections::BTreeSet;
use std::str::FromStr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use log::info;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::core::dispatcher::{AdapterOutcome, DispatchContext, MitigationBackend, MitigationError};
use crate::models::{CdnConfig, MitigationRequest, Scope};

/// Errors that can occur during Cloudflare API operations
#[derive(Debug, Error)]
pub enum CdnError {
    #[error("API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("missing credentials: {0}")]
    MissingCredentials(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    #[error("invalid filter value: {0}")]
    InvalidValue(String),
}

impl From<CdnError> for MitigationError {
    fn from(err: CdnError) -> Self {
        match err {
            CdnError::MissingCredentials(_) | CdnError::InvalidValue(_) => {
                MitigationError::Configuration(err.to_string())
            }
            CdnError::Api { status: 401, .. } | CdnError::Api { status: 403, .. } => {
                MitigationError::Configuration(err.to_string())
            }
            CdnError::RateLimited(_) => MitigationError::RateLimited(err.to_string()),
            CdnError::Request(_) | CdnError::InvalidResponse(_) | CdnError::Api { .. } => {
                MitigationError::TransientProvider(err.to_string())
            }
        }
    }
}

/// `{success, result, errors}` response envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    result: Option<T>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

/// Paging details of list responses
#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    total_pages: u32,
}

const RULES_PER_PAGE: u32 = 100;
const MAX_RULE_PAGES: u32 = 50;

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: Option<i64>,
    message: String,
}

fn describe_errors(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "unknown error".to_string();
    }
    errors
        .iter()
        .map(|e| match e.code {
            Some(code) => format!("{} ({})", e.message, code),
            None => e.message.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cloudflare zone information
#[derive(Debug, Deserialize)]
pub struct Zone {
    /// Zone ID
    pub id: String,
    /// Zone name
    pub name: String,
    /// Zone status
    #[serde(default)]
    pub status: String,
}

/// Filter attached to a firewall rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub paused: bool,
}

/// Zone firewall rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub filter: RuleFilter,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Cloudflare API client
pub struct CloudflareClient {
    /// HTTP client
    client: Client,
    /// API token
    api_token: String,
    /// API base URL
    base_url: String,
    /// Preconfigured zone ID
    zone_id: Option<String>,
}

impl CloudflareClient {
    pub fn new(client: Client, api_token: String, base_url: &str, zone_id: Option<String>) -> Self {
        Self {
            client,
            api_token,
            base_url: base_url.trim_end_matches('/').to_string(),
            zone_id,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CdnError> {
        self.send_page(request).await.map(|(result, _)| result)
    }

    async fn send_page<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<(T, Option<ResultInfo>), CdnError> {
        let response = request.bearer_auth(&self.api_token).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CdnError::RateLimited(format!("HTTP {}", status.as_u16())));
        }

        let envelope: Envelope<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(CdnError::InvalidResponse(e.to_string()));
            }
            Err(_) => {
                return Err(CdnError::Api {
                    status: status.as_u16(),
                    message: body.chars().take(200).collect(),
                });
            }
        };

        if !status.is_success() || !envelope.success {
            return Err(CdnError::Api {
                status: status.as_u16(),
                message: describe_errors(&envelope.errors),
            });
        }
        let result = envelope
            .result
            .ok_or_else(|| CdnError::InvalidResponse("missing result".to_string()))?;
        Ok((result, envelope.result_info))
    }

    /// Get the zone ID for a domain
    ///
    /// A configured zone ID is returned as is; otherwise it is looked up
    /// by name.
    ///
    /// # Arguments
    ///
    /// * `domain` - Domain name
    ///
    /// # Returns
    ///
    /// Zone ID
    pub async fn get_zone_id(&self, domain: &str) -> Result<String, CdnError> {
        if let Some(zone_id) = &self.zone_id {
            return Ok(zone_id.clone());
        }

        let url = format!("{}/zones", self.base_url);
        let zones: Vec<Zone> = self
            .send(self.client.get(url).query(&[("name", domain)]))
            .await?;

        zones
            .into_iter()
            .find(|z| z.name == domain)
            .map(|z| z.id)
            .ok_or_else(|| CdnError::InvalidResponse(format!("no zone named {domain}")))
    }

    /// List every firewall rule of a zone, following result pages
    pub async fn list_firewall_rules(&self, zone_id: &str) -> Result<Vec<FirewallRule>, CdnError> {
        let url = format!("{}/zones/{}/firewall/rules", self.base_url, zone_id);
        let mut rules = Vec::new();
        let mut page = 1;
        loop {
            let query = [("page", page.to_string()), ("per_page", RULES_PER_PAGE.to_string())];
            let (batch, info): (Vec<FirewallRule>, _) =
                self.send_page(self.client.get(&url).query(&query)).await?;
            rules.extend(batch);

            let total_pages = info.map_or(1, |i| i.total_pages);
            if page >= total_pages || page >= MAX_RULE_PAGES {
                break;
            }
            page += 1;
        }
        Ok(rules)
    }

    pub async fn create_firewall_rule(
        &self,
        zone_id: &str,
        rule: &FirewallRule,
    ) -> Result<Vec<FirewallRule>, CdnError> {
        let url = format!("{}/zones/{}/firewall/rules", self.base_url, zone_id);
        self.send(self.client.post(url).json(&[rule])).await
    }
}

/// Values a CDN rule filters on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValues {
    Asn(Vec<String>),
    Country(Vec<String>),
    Ip(Vec<String>),
}

impl FilterValues {
    fn label(&self) -> &'static str {
        match self {
            FilterValues::Asn(_) => "asn",
            FilterValues::Country(_) => "country",
            FilterValues::Ip(_) => "ip",
        }
    }

    fn len(&self) -> usize {
        match self {
            FilterValues::Asn(v) | FilterValues::Country(v) | FilterValues::Ip(v) => v.len(),
        }
    }
}

fn parse_asn(raw: &str) -> Result<u32, CdnError> {
    let trimmed = raw.trim();
    let digits = match trimmed.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("as") => &trimmed[2..],
        _ => trimmed,
    };
    digits
        .parse()
        .map_err(|_| CdnError::InvalidValue(format!("ASN '{raw}'")))
}

fn parse_country(raw: &str) -> Result<String, CdnError> {
    let code = raw.trim();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(CdnError::InvalidValue(format!("country code '{raw}'")));
    }
    Ok(code.to_ascii_uppercase())
}

/// Parse an address or network, masking host bits
fn parse_network(raw: &str) -> Result<IpNetwork, CdnError> {
    let invalid = || CdnError::InvalidValue(format!("address '{raw}'"));
    let network = IpNetwork::from_str(raw.trim()).map_err(|_| invalid())?;
    IpNetwork::new(network.network(), network.prefix()).map_err(|_| invalid())
}

fn ip_clause(network: &IpNetwork) -> String {
    let full = if network.is_ipv4() { 32 } else { 128 };
    if network.prefix() == full {
        format!("ip.src eq {}", network.ip())
    } else {
        format!("ip.src in {{{network}}}")
    }
}

/// Build one OR-joined filter expression, one clause per distinct value.
///
/// Values are canonicalized and sorted (ASNs numerically, country codes
/// upper-cased, networks by address then prefix), so any permutation of
/// the same value set yields the same expression.
pub fn build_filter_expression(values: &FilterValues) -> Result<String, CdnError> {
    if values.len() == 0 {
        return Err(CdnError::InvalidValue(format!("no {} values", values.label())));
    }
    let clauses: Vec<String> = match values {
        FilterValues::Asn(v) => {
            let mut asns = v.iter().map(|a| parse_asn(a)).collect::<Result<Vec<_>, _>>()?;
            asns.sort_unstable();
            asns.dedup();
            asns.iter().map(|a| format!("ip.geoip.asnum eq {a}")).collect()
        }
        FilterValues::Country(v) => {
            let mut codes = v
                .iter()
                .map(|c| parse_country(c))
                .collect::<Result<Vec<_>, _>>()?;
            codes.sort_unstable();
            codes.dedup();
            codes
                .iter()
                .map(|c| format!("ip.geoip.country eq \"{c}\""))
                .collect()
        }
        FilterValues::Ip(v) => {
            let mut networks = v
                .iter()
                .map(|i| parse_network(i))
                .collect::<Result<Vec<_>, _>>()?;
            networks.sort_by_key(|n| (n.ip(), n.prefix()));
            networks.dedup();
            networks.iter().map(ip_clause).collect()
        }
    };
    Ok(clauses.join(" or "))
}

/// Order-insensitive view of an expression's OR clauses
fn clause_set(expression: &str) -> BTreeSet<&str> {
    expression.split(" or ").map(str::trim).collect()
}

fn string_list(params: &Map<String, Value>, key: &str) -> Vec<String> {
    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
    match params.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(scalar).collect(),
        Some(value) => scalar(value).into_iter().collect(),
        None => Vec::new(),
    }
}

fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

/// CDN firewall backend
pub struct CdnAdapter {
    config: CdnConfig,
    client: Client,
    fallback_token: Option<String>,
}

impl CdnAdapter {
    /// Adapter whose last-resort token comes from `CLOUDFLARE_API_TOKEN`
    pub fn new(config: CdnConfig, client: Client) -> Self {
        let fallback = std::env::var("CLOUDFLARE_API_TOKEN").ok();
        Self::with_fallback_token(config, client, fallback)
    }

    pub fn with_fallback_token(config: CdnConfig, client: Client, fallback_token: Option<String>) -> Self {
        Self {
            config,
            client,
            fallback_token: fallback_token.filter(|t| !t.trim().is_empty()),
        }
    }

    fn canonical_action(action: &str) -> &str {
        match action {
            "cf_asn_block" => "asn_block",
            "cf_country_block" => "country_block",
            "cf_ip_block" => "ip_block",
            other => other,
        }
    }

    fn token(&self, params: &Map<String, Value>) -> Result<String, CdnError> {
        param_str(params, "api_token")
            .map(|s| s.to_string())
            .or_else(|| self.config.api_token.clone().filter(|t| !t.trim().is_empty()))
            .or_else(|| self.fallback_token.clone())
            .ok_or_else(|| CdnError::MissingCredentials("no Cloudflare API token".to_string()))
    }

    fn zone_hint(&self, params: &Map<String, Value>) -> Option<String> {
        param_str(params, "zone_id")
            .map(|s| s.to_string())
            .or_else(|| self.config.zone_id.clone())
    }

    fn filter_values(request: &MitigationRequest) -> Result<FilterValues, MitigationError> {
        let params = &request.params;
        match Self::canonical_action(&request.action) {
            "asn_block" => Ok(FilterValues::Asn(string_list(params, "asn"))),
            "country_block" => Ok(FilterValues::Country(string_list(params, "countries"))),
            "ip_block" => Ok(FilterValues::Ip(string_list(params, "ips"))),
            other => Err(MitigationError::UnsupportedAction {
                scope: Scope::Cdn,
                action: other.to_string(),
            }),
        }
    }

    async fn create_rule(
        &self,
        request: &MitigationRequest,
        values: FilterValues,
    ) -> Result<AdapterOutcome, CdnError> {
        let expression = build_filter_expression(&values)?;
        let token = self.token(&request.params)?;

        let zone_hint = self.zone_hint(&request.params);
        let client = CloudflareClient::new(
            self.client.clone(),
            token,
            &self.config.base_url,
            zone_hint.clone(),
        );
        let zone_id = match (zone_hint, param_str(&request.params, "domain")) {
            (Some(zone_id), _) => zone_id,
            (None, Some(domain)) => client.get_zone_id(domain).await?,
            (None, None) => {
                return Err(CdnError::MissingCredentials("no zone_id configured".to_string()))
            }
        };

        let wanted = clause_set(&expression);
        let existing = client.list_firewall_rules(&zone_id).await?;
        if existing
            .iter()
            .any(|r| clause_set(&r.filter.expression) == wanted)
        {
            info!("CDN rule already present in zone {}", zone_id);
            return Ok(AdapterOutcome {
                applied: false,
                detail: json!({
                    "provider": "cloudflare",
                    "already_present": true,
                    "expression": expression,
                }),
            });
        }

        let rule = FirewallRule {
            id: None,
            filter: RuleFilter {
                id: None,
                expression: expression.clone(),
                paused: false,
            },
            action: self.config.rule_action.clone(),
            description: Some(format!("tms {} block ({})", values.label(), values.len())),
        };
        let created = client.create_firewall_rule(&zone_id, &rule).await?;
        info!(
            "CDN {} block created in zone {} ({} values)",
            values.label(),
            zone_id,
            values.len()
        );

        Ok(AdapterOutcome {
            applied: true,
            detail: json!({
                "provider": "cloudflare",
                "rules_created": created.len().max(1),
                "expression": expression,
            }),
        })
    }
}

#[async_trait]
impl MitigationBackend for CdnAdapter {
    fn scope(&self) -> Scope {
        Scope::Cdn
    }

    fn resource_key(&self, request: &MitigationRequest) -> String {
        let zone = self
            .zone_hint(&request.params)
            .or_else(|| param_str(&request.params, "domain").map(|s| s.to_string()))
            .unwrap_or_default();
        format!("cdn:{zone}")
    }

    async fn apply(
        &self,
        request: &MitigationRequest,
        _ctx: &DispatchContext,
    ) -> Result<AdapterOutcome, MitigationError> {
        let values = Self::filter_values(request)?;
        Ok(self.create_rule(request, values).await?)
    }
}
