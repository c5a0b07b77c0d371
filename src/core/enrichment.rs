//! Reputation enrichment for candidate addresses.
//!
//! Every address is checked against a fixed list of DNS blacklist zones and
//! one GeoIP/ASN provider. Lookups share a bounded pool of in-flight slots
//! and each one carries its own timeout. A failed or inconclusive lookup
//! reads as "not listed".

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};
use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::models::{EnrichmentConfig, FailureKind};

/// Zones queried when none are configured
pub const DEFAULT_ZONES: &[&str] = &[
    "zen.spamhaus.org",
    "bl.spamcop.net",
    "b.barracudacentral.org",
    "dnsbl.sorbs.net",
    "cbl.abuseat.org",
];

/// Errors that can occur during enrichment
#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error("provider reported failure: {0}")]
    Provider(String),
    #[error("resolver setup failed: {0}")]
    Resolver(String),
}

impl EnrichmentError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EnrichmentError::Resolver(_) => FailureKind::Configuration,
            _ => FailureKind::TransientProvider,
        }
    }
}

/// Outcome of a single blacklist A lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsLookupError {
    /// NXDOMAIN or no A records: the address is not listed
    NotFound,
    /// Anything else; inconclusive
    Failed(String),
}

/// Resolves A records for blacklist query names
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReputationResolver: Send + Sync {
    async fn lookup_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsLookupError>;
}

/// Resolver backed by the system DNS configuration
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn from_system_conf() -> Result<Self, EnrichmentError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| EnrichmentError::Resolver(e.to_string()))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl ReputationResolver for HickoryResolver {
    async fn lookup_a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsLookupError> {
        // Fully qualified so search domains never apply
        let fqdn = format!("{name}.");
        match self.inner.ipv4_lookup(fqdn.as_str()).await {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(DnsLookupError::NotFound),
                _ => Err(DnsLookupError::Failed(e.to_string())),
            },
        }
    }
}

/// GeoIP attributes of an address
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub asn: Option<u32>,
    pub org: Option<String>,
}

/// GeoIP/ASN lookup provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn lookup(&self, address: IpAddr) -> Result<GeoInfo, EnrichmentError>;
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    message: Option<String>,
    country: Option<String>,
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    #[serde(rename = "as")]
    as_name: Option<String>,
    org: Option<String>,
}

/// Extract the number from `"AS15169 Google LLC"` or `"15169"`
pub fn parse_asn(value: &str) -> Option<u32> {
    let trimmed = value.trim();
    let digits = if trimmed.len() >= 2 && trimmed[..2].eq_ignore_ascii_case("as") {
        &trimmed[2..]
    } else {
        trimmed
    };
    let number: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
    number.parse().ok()
}

/// ip-api.com style JSON provider
pub struct IpApiProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl IpApiProvider {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    async fn lookup(&self, address: IpAddr) -> Result<GeoInfo, EnrichmentError> {
        let url = format!(
            "{}/{}?fields=status,message,country,countryCode,as,org,query",
            self.endpoint, address
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(EnrichmentError::Status(response.status().as_u16()));
        }
        let body: IpApiResponse = response.json().await?;
        if body.status != "success" {
            return Err(EnrichmentError::Provider(
                body.message.unwrap_or_else(|| "lookup failed".to_string()),
            ));
        }
        Ok(GeoInfo {
            country: body.country,
            country_code: body.country_code,
            asn: body.as_name.as_deref().and_then(parse_asn),
            org: body.org,
        })
    }
}

/// Verdict of one blacklist zone
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZoneVerdict {
    pub zone: String,
    pub listed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub returned: Vec<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Enrichment of one address for the current cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichmentResult {
    pub address: IpAddr,
    pub geo: Option<GeoInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_error: Option<String>,
    pub zones: Vec<ZoneVerdict>,
}

impl EnrichmentResult {
    /// Number of zones reporting the address as listed
    pub fn hits(&self) -> usize {
        self.zones.iter().filter(|z| z.listed).count()
    }

    pub fn listed_zones(&self) -> Vec<String> {
        self.zones
            .iter()
            .filter(|z| z.listed)
            .map(|z| z.zone.clone())
            .collect()
    }
}

/// Blacklist query name: reversed octets (IPv4) or nibbles (IPv6) + zone
pub fn reverse_query_name(address: IpAddr, zone: &str) -> String {
    let reversed = match address {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .rev()
            .flat_map(|b| [b & 0x0f, b >> 4])
            .map(|n| format!("{n:x}"))
            .collect::<Vec<_>>()
            .join("."),
    };
    format!("{reversed}.{zone}")
}

/// Bounded-concurrency reputation lookups
pub struct EnrichmentService {
    resolver: Arc<dyn ReputationResolver>,
    geo: Option<Arc<dyn GeoProvider>>,
    zones: Vec<String>,
    lookup_timeout: Duration,
    permits: Arc<Semaphore>,
}

/// Interpret a DNSBL answer.
///
/// Only loopback-range codes outside `127.255.255.0/24` are listings.
/// Codes in that block are zone error returns (public resolver, rate
/// limit, bad query) and anything outside `127.0.0.0/8` is not a DNSBL
/// answer at all; both are inconclusive.
pub fn classify_answer(addrs: &[Ipv4Addr]) -> Result<bool, String> {
    if let Some(code) = addrs
        .iter()
        .find(|a| a.octets()[0] != 127 || a.octets()[..3] == [127, 255, 255])
    {
        return Err(format!("zone returned error code {}", code));
    }
    Ok(!addrs.is_empty())
}

impl EnrichmentService {
    pub fn new(
        resolver: Arc<dyn ReputationResolver>,
        geo: Option<Arc<dyn GeoProvider>>,
        config: &EnrichmentConfig,
    ) -> Self {
        Self {
            resolver,
            geo,
            zones: config.zones.clone(),
            lookup_timeout: Duration::from_millis(config.lookup_timeout_ms.max(1)),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        }
    }

    /// Enrich `addresses`, returning results in input order.
    ///
    /// Duplicate addresses are looked up once; the first occurrence keeps
    /// its position.
    pub async fn enrich(&self, addresses: &[IpAddr]) -> Vec<EnrichmentResult> {
        let mut seen = HashSet::new();
        let unique: Vec<IpAddr> = addresses
            .iter()
            .copied()
            .filter(|a| seen.insert(*a))
            .collect();

        join_all(unique.into_iter().map(|a| self.enrich_one(a))).await
    }

    async fn enrich_one(&self, address: IpAddr) -> EnrichmentResult {
        let zone_checks = join_all(self.zones.iter().map(|z| self.check_zone(address, z)));
        let (zones, geo) = tokio::join!(zone_checks, self.lookup_geo(address));
        let (geo, geo_error) = match geo {
            Some(Ok(info)) => (Some(info), None),
            Some(Err(e)) => (None, Some(e)),
            None => (None, None),
        };
        EnrichmentResult {
            address,
            geo,
            geo_error,
            zones,
        }
    }

    async fn check_zone(&self, address: IpAddr, zone: &str) -> ZoneVerdict {
        let name = reverse_query_name(address, zone);
        let _permit = self.permits.acquire().await.ok();

        let (listed, returned, error) =
            match timeout(self.lookup_timeout, self.resolver.lookup_a(&name)).await {
                Ok(Ok(addrs)) => match classify_answer(&addrs) {
                    Ok(listed) => (listed, addrs, None),
                    Err(msg) => (false, addrs, Some(msg)),
                },
                Ok(Err(DnsLookupError::NotFound)) => (false, Vec::new(), None),
                Ok(Err(DnsLookupError::Failed(msg))) => (false, Vec::new(), Some(msg)),
                Err(_) => (false, Vec::new(), Some("lookup timed out".to_string())),
            };

        if let Some(err) = &error {
            debug!("Blacklist lookup {} inconclusive: {}", name, err);
            increment_counter!("enrichment_lookup_failures_total", "provider" => "dnsbl");
        }

        ZoneVerdict {
            zone: zone.to_string(),
            listed,
            returned,
            error,
        }
    }

    async fn lookup_geo(&self, address: IpAddr) -> Option<Result<GeoInfo, String>> {
        let provider = self.geo.as_ref()?;
        let _permit = self.permits.acquire().await.ok();
        let result = match timeout(self.lookup_timeout, provider.lookup(address)).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("lookup timed out".to_string()),
        };
        if let Err(e) = &result {
            warn!("GeoIP lookup for {} failed: {}", address, e);
            increment_counter!("enrichment_lookup_failures_total", "provider" => "geoip");
        }
        Some(result)
    }
}
