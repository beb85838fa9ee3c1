//! DNS propagation checking for DNS-01 challenges
//!
//! Verifies that a TXT record is served by every authoritative nameserver
//! before the authority is asked to validate it.

use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::Resolver;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::provider::{txt_value_matches, DnsProviderError, DnsResult};

/// Default port for nameservers given without one
const DNS_PORT: u16 = 53;

/// Configuration for propagation checking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationConfig {
    /// Authoritative nameservers, `host[:port]`
    pub nameservers: Vec<String>,
    /// Shared deadline for all nameservers
    pub timeout: Duration,
    /// Delay between queries to one nameserver
    pub check_interval: Duration,
    /// Hold time after every nameserver served the record
    pub settle_delay: Duration,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            timeout: Duration::from_secs(60),
            check_interval: Duration::from_millis(100),
            settle_delay: Duration::from_secs(10),
        }
    }
}

impl From<&autocert_config::PropagationSettings> for PropagationConfig {
    fn from(settings: &autocert_config::PropagationSettings) -> Self {
        Self {
            nameservers: settings.nameservers.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            check_interval: Duration::from_millis(settings.check_interval_ms),
            settle_delay: Duration::from_secs(settings.settle_delay_secs),
        }
    }
}

/// TXT queries against one specific nameserver
#[async_trait]
pub trait TxtLookup: Send + Sync + Debug {
    /// Query `nameserver` for the TXT values of `name`
    async fn lookup_txt(&self, nameserver: &str, name: &str) -> DnsResult<Vec<String>>;
}

/// [`TxtLookup`] using hickory, bypassing any cache
#[derive(Debug, Clone)]
pub struct HickoryTxtLookup {
    query_timeout: Duration,
}

impl HickoryTxtLookup {
    /// Create a lookup with the given per-query timeout
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }
}

impl Default for HickoryTxtLookup {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl TxtLookup for HickoryTxtLookup {
    async fn lookup_txt(&self, nameserver: &str, name: &str) -> DnsResult<Vec<String>> {
        let addrs = resolve_nameserver(nameserver).await?;

        let mut resolver_config = ResolverConfig::new();
        for addr in addrs {
            resolver_config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
        }

        let mut opts = ResolverOpts::default();
        opts.timeout = self.query_timeout;
        opts.attempts = 1;
        opts.cache_size = 0;

        let resolver =
            Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        let fqdn = format!("{}.", name.trim_end_matches('.'));
        let lookup = resolver.txt_lookup(fqdn).await.map_err(|e| {
            DnsProviderError::ApiRequest(format!(
                "TXT lookup for '{}' at {} failed: {}",
                name, nameserver, e
            ))
        })?;

        Ok(lookup
            .iter()
            .map(|record| {
                // A TXT record may be split into several strings
                record
                    .txt_data()
                    .iter()
                    .map(|data| String::from_utf8_lossy(data))
                    .collect::<String>()
            })
            .collect())
    }
}

/// Resolve `host[:port]` to socket addresses, defaulting to port 53
async fn resolve_nameserver(nameserver: &str) -> DnsResult<Vec<SocketAddr>> {
    if let Ok(addr) = nameserver.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }
    if let Ok(ip) = nameserver.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, DNS_PORT)]);
    }

    let (host, port) = match nameserver.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                DnsProviderError::Configuration(format!("Invalid nameserver '{}'", nameserver))
            })?;
            (host, port)
        }
        None => (nameserver, DNS_PORT),
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            DnsProviderError::ApiRequest(format!(
                "Failed to resolve nameserver '{}': {}",
                nameserver, e
            ))
        })?
        .collect();

    if addrs.is_empty() {
        return Err(DnsProviderError::ApiRequest(format!(
            "Nameserver '{}' resolved to no addresses",
            nameserver
        )));
    }
    Ok(addrs)
}

/// Concurrent multi-nameserver propagation verifier
///
/// Every nameserver is polled independently until it serves the expected
/// value or the shared deadline passes. The first failing nameserver cancels
/// all others.
#[derive(Debug, Clone)]
pub struct PropagationVerifier {
    config: PropagationConfig,
    lookup: Arc<dyn TxtLookup>,
}

impl PropagationVerifier {
    /// Create a verifier querying through hickory
    pub fn new(config: PropagationConfig) -> Self {
        Self::with_lookup(config, Arc::new(HickoryTxtLookup::default()))
    }

    /// Create a verifier with a custom lookup
    pub fn with_lookup(config: PropagationConfig, lookup: Arc<dyn TxtLookup>) -> Self {
        Self { config, lookup }
    }

    /// Get the configuration
    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Wait until every nameserver serves `expected` for `record`
    pub async fn verify(
        &self,
        record: &str,
        expected: &str,
        cancel: &CancellationToken,
    ) -> DnsResult<()> {
        if self.config.nameservers.is_empty() {
            return Err(DnsProviderError::Configuration(
                "no nameservers configured for propagation checking".to_string(),
            ));
        }

        let start = Instant::now();
        let deadline = start + self.config.timeout;
        let token = cancel.child_token();

        debug!(
            record = %record,
            nameservers = ?self.config.nameservers,
            timeout_secs = self.config.timeout.as_secs(),
            "Waiting for DNS propagation"
        );

        let mut checks = JoinSet::new();
        for nameserver in &self.config.nameservers {
            checks.spawn(poll_nameserver(
                Arc::clone(&self.lookup),
                nameserver.clone(),
                record.to_string(),
                expected.to_string(),
                self.config.check_interval,
                start,
                deadline,
                token.clone(),
            ));
        }

        while let Some(joined) = checks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(DnsProviderError::ApiRequest(format!(
                    "propagation check task failed: {}",
                    e
                )))
            });

            if let Err(e) = outcome {
                token.cancel();
                checks.abort_all();
                return Err(e);
            }
        }

        info!(
            record = %record,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "DNS propagation confirmed on all nameservers"
        );

        if !self.config.settle_delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DnsProviderError::Cancelled),
                _ = tokio::time::sleep(self.config.settle_delay) => {}
            }
        }

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_nameserver(
    lookup: Arc<dyn TxtLookup>,
    nameserver: String,
    record: String,
    expected: String,
    interval: Duration,
    start: Instant,
    deadline: Instant,
    token: CancellationToken,
) -> DnsResult<()> {
    let timed_out = || DnsProviderError::PropagationTimeout {
        record: record.clone(),
        nameservers: vec![nameserver.clone()],
        elapsed: start.elapsed(),
    };

    loop {
        let attempt = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DnsProviderError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(timed_out()),
            result = lookup.lookup_txt(&nameserver, &record) => result,
        };

        match attempt {
            Ok(values) if values.iter().any(|v| txt_value_matches(v, &expected)) => {
                debug!(
                    record = %record,
                    nameserver = %nameserver,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Nameserver serves challenge record"
                );
                return Ok(());
            }
            Ok(values) => {
                trace!(
                    record = %record,
                    nameserver = %nameserver,
                    found = ?values,
                    "Record not yet propagated"
                );
            }
            Err(e) => {
                trace!(
                    record = %record,
                    nameserver = %nameserver,
                    error = %e,
                    "TXT lookup failed, retrying"
                );
            }
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DnsProviderError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(timed_out()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted nameservers: each serves its value once `ready_after` queries have been made
    #[derive(Debug, Default)]
    struct ScriptedLookup {
        answers: HashMap<String, (usize, Option<String>)>,
        queries: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedLookup {
        fn serve(mut self, nameserver: &str, ready_after: usize, value: Option<&str>) -> Self {
            self.answers.insert(
                nameserver.to_string(),
                (ready_after, value.map(|v| v.to_string())),
            );
            self
        }

        fn queries(&self, nameserver: &str) -> usize {
            self.queries.lock().get(nameserver).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl TxtLookup for ScriptedLookup {
        async fn lookup_txt(&self, nameserver: &str, _name: &str) -> DnsResult<Vec<String>> {
            let count = {
                let mut queries = self.queries.lock();
                let count = queries.entry(nameserver.to_string()).or_insert(0);
                *count += 1;
                *count
            };

            match self.answers.get(nameserver) {
                Some((ready_after, Some(value))) if count > *ready_after => {
                    Ok(vec![format!("\"{}\"", value)])
                }
                Some(_) => Err(DnsProviderError::ApiRequest("SERVFAIL".to_string())),
                None => Ok(Vec::new()),
            }
        }
    }

    fn config(nameservers: &[&str]) -> PropagationConfig {
        PropagationConfig {
            nameservers: nameservers.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(60),
            check_interval: Duration::from_millis(100),
            settle_delay: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_nameservers_converge() {
        let lookup = Arc::new(
            ScriptedLookup::default()
                .serve("a", 0, Some("token"))
                .serve("b", 3, Some("token")),
        );
        let verifier = PropagationVerifier::with_lookup(config(&["a", "b"]), lookup.clone());

        verifier
            .verify("_acme-challenge.example.com", "token", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(lookup.queries("a"), 1);
        // Transport errors are retried
        assert_eq!(lookup.queries("b"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_lagging_nameserver_fails_all() {
        let lookup = Arc::new(
            ScriptedLookup::default()
                .serve("a", 0, Some("token"))
                .serve("b", 0, Some("token")),
        );
        let verifier = PropagationVerifier::with_lookup(config(&["a", "b", "c"]), lookup.clone());

        let start = Instant::now();
        let err = verifier
            .verify("_acme-challenge.example.com", "token", &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            DnsProviderError::PropagationTimeout {
                record,
                nameservers,
                ..
            } => {
                assert_eq!(record, "_acme-challenge.example.com");
                assert_eq!(nameservers, vec!["c".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(lookup.queries("c") > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_value_never_matches() {
        let lookup = Arc::new(ScriptedLookup::default().serve("a", 0, Some("stale")));
        let verifier = PropagationVerifier::with_lookup(config(&["a"]), lookup);

        let err = verifier
            .verify("_acme-challenge.example.com", "token", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProviderError::PropagationTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_checks() {
        let lookup = Arc::new(ScriptedLookup::default());
        let verifier = PropagationVerifier::with_lookup(config(&["a", "b"]), lookup);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = verifier
            .verify("_acme-challenge.example.com", "token", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProviderError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_applied() {
        let lookup = Arc::new(ScriptedLookup::default().serve("a", 0, Some("token")));
        let mut cfg = config(&["a"]);
        cfg.settle_delay = Duration::from_secs(10);
        let verifier = PropagationVerifier::with_lookup(cfg, lookup);

        let start = Instant::now();
        verifier
            .verify("_acme-challenge.example.com", "token", &CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_no_nameservers() {
        let verifier =
            PropagationVerifier::with_lookup(config(&[]), Arc::new(ScriptedLookup::default()));
        let err = verifier
            .verify("_acme-challenge.example.com", "token", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProviderError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_resolve_nameserver_literals() {
        assert_eq!(
            resolve_nameserver("192.0.2.1").await.unwrap(),
            vec!["192.0.2.1:53".parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(
            resolve_nameserver("192.0.2.1:5353").await.unwrap(),
            vec!["192.0.2.1:5353".parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(
            resolve_nameserver("[2001:db8::1]:53").await.unwrap(),
            vec!["[2001:db8::1]:53".parse::<SocketAddr>().unwrap()]
        );
        assert!(matches!(
            resolve_nameserver("ns1.example.com:dns").await,
            Err(DnsProviderError::Configuration(_))
        ));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = autocert_config::PropagationSettings {
            nameservers: vec!["ns1.example.com".to_string()],
            ..Default::default()
        };
        let config = PropagationConfig::from(&settings);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.check_interval, Duration::from_millis(100));
        assert_eq!(config.settle_delay, Duration::from_secs(10));
        assert_eq!(config.nameservers, vec!["ns1.example.com".to_string()]);
    }
}
