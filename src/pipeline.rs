//! Reputation check pipeline.
//!
//! Decides ALLOW/DENY for a connecting principal without blocking the caller.
//! Exemption and outcome-cache checks run synchronously in memory; everything
//! else (persistent cache, external lookup, cache population) is offloaded.
//! At most one external query is issued per cache miss, but side effects are
//! re-applied on every hit of the top-level cache: repeated connections from
//! the same flagged address must each be handled.

use crate::cache::TtlCache;
use crate::config::Config;
use crate::deferred::DeferredActionQueue;
use crate::error::PersistenceError;
use crate::exempt::ExemptionStore;
use crate::lookup::{ReputationLookup, ReputationResult};
use crate::runtime::{HostRuntime, HostTask};
use crate::storage::PersistentBackend;
use crate::webhook::WebhookNotifier;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

const OUTCOME_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const OUTCOME_CACHE_CAPACITY: usize = 2000;

/// A connecting account: stable identifier plus its transient network identity.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: Uuid,
    pub name: String,
    pub addr: Ipv4Addr,
}

/// Final classification of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Exempt,
    DeniedCountry,
    DeniedProxy,
    /// The external lookup failed. Explicitly non-blocking: a failed
    /// reputation query must not add friction for the connecting user. This
    /// is a documented policy choice, not a default to change casually.
    LookupFailed,
    /// Handed back while the real classification completes asynchronously.
    Pending,
}

impl Verdict {
    /// Only denials block the connection.
    pub fn should_block(self) -> bool {
        matches!(self, Verdict::DeniedCountry | Verdict::DeniedProxy)
    }
}

/// A verdict together with the reputation data it was derived from.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub verdict: Verdict,
    pub reputation: Option<ReputationResult>,
}

impl CheckOutcome {
    pub fn of(verdict: Verdict, reputation: Option<ReputationResult>) -> Self {
        Self { verdict, reputation }
    }

    pub fn exempt() -> Self {
        Self::of(Verdict::Exempt, None)
    }

    pub fn pending() -> Self {
        Self::of(Verdict::Pending, None)
    }
}

/// A check request: the principal plus any host-side bypass decision (for
/// example an administrative override permission).
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub principal: Principal,
    pub has_bypass: bool,
}

/// The immediate answer plus a completion that resolves with the final one.
///
/// Callers that need a non-optimistic answer await `completion`, accepting
/// added latency; callers that can act after the fact rely on the pipeline's
/// side effects instead.
pub struct CheckHandle {
    pub immediate: CheckOutcome,
    pub completion: oneshot::Receiver<CheckOutcome>,
}

impl CheckHandle {
    fn resolved(outcome: CheckOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome.clone());
        Self {
            immediate: outcome,
            completion: rx,
        }
    }
}

/// The deduplicating, cache-first check pipeline.
pub struct CheckPipeline {
    config: RwLock<Arc<Config>>,
    store: Arc<ExemptionStore>,
    backend: Option<Arc<dyn PersistentBackend>>,
    lookup: Arc<dyn ReputationLookup>,
    runtime: Arc<dyn HostRuntime>,
    deferred: Arc<DeferredActionQueue>,
    webhook: WebhookNotifier,
    outcomes: TtlCache<Ipv4Addr, CheckOutcome>,
    checks_performed: AtomicU64,
}

impl CheckPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: Arc<ExemptionStore>,
        backend: Option<Arc<dyn PersistentBackend>>,
        lookup: Arc<dyn ReputationLookup>,
        runtime: Arc<dyn HostRuntime>,
        deferred: Arc<DeferredActionQueue>,
    ) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            store,
            backend,
            lookup,
            runtime,
            deferred,
            webhook: WebhookNotifier::new(),
            outcomes: TtlCache::new(OUTCOME_CACHE_TTL, OUTCOME_CACHE_CAPACITY),
            checks_performed: AtomicU64::new(0),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config
            .read()
            .map(|c| Arc::clone(&c))
            .unwrap_or_default()
    }

    /// Swap in a freshly loaded configuration.
    pub fn reload(&self, config: Config) {
        if let Ok(mut current) = self.config.write() {
            *current = Arc::new(config);
            info!("configuration reloaded");
        }
    }

    /// Total checks classified since startup.
    pub fn checks_performed(&self) -> u64 {
        self.checks_performed.load(Ordering::Relaxed)
    }

    /// Drop both cache layers.
    pub fn clear_response_cache(&self) -> Result<(), PersistenceError> {
        self.outcomes.clear();
        if let Some(backend) = &self.backend {
            backend.clear_cached_responses()?;
        }
        Ok(())
    }

    /// Screen a connecting principal. Never blocks the caller: the synchronous
    /// work is limited to the exemption check and the top-level cache lookup.
    pub fn check(self: &Arc<Self>, request: CheckRequest) -> CheckHandle {
        let config = self.config();
        let principal = request.principal;

        if !config.settings.enabled {
            return CheckHandle::resolved(CheckOutcome::of(Verdict::Allowed, None));
        }

        // Bypass predicates short-circuit before any cache or network work.
        if self.is_bypassed(&config, &principal, request.has_bypass) {
            debug!(ip = %principal.addr, principal = %principal.id, "exempt, skipping check");
            return CheckHandle::resolved(CheckOutcome::exempt());
        }

        if let Some(outcome) = self.outcomes.get(&principal.addr) {
            debug!(ip = %principal.addr, verdict = ?outcome.verdict, "outcome cache hit");
            if outcome.verdict.should_block() {
                self.webhook.notify(&config.webhook, &principal, &outcome);
                self.handle_blocking(&config, &principal, &outcome);
            }
            return CheckHandle::resolved(outcome);
        }

        let (tx, rx) = oneshot::channel();
        let pipeline = Arc::clone(self);

        tokio::spawn(async move {
            let outcome = pipeline.resolve(config, principal).await;
            let _ = tx.send(outcome);
        });

        CheckHandle {
            immediate: CheckOutcome::pending(),
            completion: rx,
        }
    }

    fn is_bypassed(&self, config: &Config, principal: &Principal, has_bypass: bool) -> bool {
        has_bypass
            || self.store.is_principal_exempt(&principal.id)
            || self.store.is_address_exempt(principal.addr)
            || config
                .exemptions
                .name_prefixes
                .iter()
                .any(|prefix| principal.name.starts_with(prefix))
    }

    /// Full-miss path: persistent cache, then the external collaborator
    /// exactly once, then classification and side effects.
    async fn resolve(&self, config: Arc<Config>, principal: Principal) -> CheckOutcome {
        let result = self.fetch_reputation(&config, principal.addr).await;
        let outcome = self.classify(&config, &principal, result);

        debug!(ip = %principal.addr, verdict = ?outcome.verdict, "check classified");

        self.outcomes.insert(principal.addr, outcome.clone());
        self.checks_performed.fetch_add(1, Ordering::Relaxed);

        if outcome.verdict.should_block() {
            self.webhook.notify(&config.webhook, &principal, &outcome);
            self.handle_blocking(&config, &principal, &outcome);
        }

        outcome
    }

    async fn fetch_reputation(&self, config: &Config, addr: Ipv4Addr) -> ReputationResult {
        // Persistent cache first. Read failures degrade to the external
        // lookup rather than failing the check.
        if let Some(backend) = &self.backend {
            let backend = Arc::clone(backend);
            match tokio::task::spawn_blocking(move || backend.cached_response(addr)).await {
                Ok(Ok(Some(result))) => {
                    debug!(ip = %addr, "persistent cache hit");
                    return result;
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(ip = %addr, error = %e, "persistent cache read failed"),
                Err(e) => warn!(ip = %addr, error = %e, "persistent cache task failed"),
            }
        }

        let result = match self.lookup.lookup(addr).await {
            Ok(result) => result,
            Err(e) => {
                warn!(ip = %addr, error = %e, "reputation lookup failed");
                ReputationResult::failed(&addr.to_string(), &e.to_string())
            }
        };

        if !result.success {
            if let Some(reason) = &result.failure_reason {
                warn!(ip = %addr, reason = %reason, "reputation query was not a success");
            }
            return result;
        }

        // Cache population is best-effort: a write failure never fails the
        // check.
        if config.settings.cache_results {
            if let Some(backend) = &self.backend {
                let backend = Arc::clone(backend);
                let to_store = result.clone();
                match tokio::task::spawn_blocking(move || backend.put_cached_response(&to_store))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(ip = %addr, error = %e, "could not persist response"),
                    Err(e) => warn!(ip = %addr, error = %e, "response persist task failed"),
                }
            }
        }

        result
    }

    /// Classification precedence: lookup failure, then the country policy,
    /// then the proxy flag. The country check re-tests exemption so a
    /// principal exempted mid-flight is not denied; this ordering matches the
    /// observed product behavior.
    fn classify(
        &self,
        config: &Config,
        principal: &Principal,
        result: ReputationResult,
    ) -> CheckOutcome {
        if !result.success {
            return CheckOutcome::of(Verdict::LookupFailed, Some(result));
        }

        let exempt_midflight = self.store.is_principal_exempt(&principal.id)
            || self.store.is_address_exempt(principal.addr);

        let country_listed = config
            .countries
            .list
            .iter()
            .any(|code| code == &result.country_code);

        if !config.countries.list.is_empty()
            && !exempt_midflight
            && country_listed != config.countries.whitelist_mode
        {
            CheckOutcome::of(Verdict::DeniedCountry, Some(result))
        } else if result.is_proxy {
            CheckOutcome::of(Verdict::DeniedProxy, Some(result))
        } else {
            CheckOutcome::of(Verdict::Allowed, Some(result))
        }
    }

    /// Side effects for a blocking outcome: alert subscribed staff, kick the
    /// principal (directly or deferred until addressable) and dispatch any
    /// configured reactive commands. All host-bound work is marshalled onto
    /// the host execution context.
    fn handle_blocking(&self, config: &Config, principal: &Principal, outcome: &CheckOutcome) {
        let reputation = outcome.reputation.as_ref();

        if config.alerts.enabled {
            let text = render_template(&config.alerts.message, principal, reputation);
            for recipient in self.runtime.alert_recipients() {
                let runtime = Arc::clone(&self.runtime);
                let text = text.clone();
                self.runtime
                    .run_on_host_context(Box::new(move || runtime.send_message(&recipient, &text)));
            }
        }

        if config.settings.kick_blocked {
            let template = match outcome.verdict {
                Verdict::DeniedCountry => &config.countries.kick_reason,
                _ => &config.settings.kick_message,
            };
            let reason = render_template(template, principal, reputation);
            let id = principal.id;
            let runtime = Arc::clone(&self.runtime);
            let kick: HostTask = Box::new(move || runtime.disconnect(&id, &reason));

            if self.runtime.is_addressable(&id) {
                info!(principal = %id, ip = %principal.addr, "kicking blocked principal");
                self.runtime.run_on_host_context(kick);
            } else if !self.deferred.enqueue(id, kick) {
                warn!(principal = %id, "could not defer kick, queue is full");
            }
        }

        if config.commands.enabled {
            let commands = match outcome.verdict {
                Verdict::DeniedCountry => &config.countries.commands,
                _ => &config.commands.on_proxy,
            };
            for command in commands {
                let line = render_template(command, principal, reputation);
                let runtime = Arc::clone(&self.runtime);
                self.runtime
                    .run_on_host_context(Box::new(move || runtime.dispatch_command(&line)));
            }
        }
    }
}

/// Substitute `%player%`-style variables into a configured message template.
pub(crate) fn render_template(
    template: &str,
    principal: &Principal,
    reputation: Option<&ReputationResult>,
) -> String {
    let mut text = template
        .replace("%player%", &principal.name)
        .replace("%ip%", &principal.addr.to_string());

    if let Some(r) = reputation {
        text = text
            .replace("%country%", &r.country_name)
            .replace("%countrycode%", &r.country_code)
            .replace("%city%", &r.city)
            .replace("%isp%", &r.isp)
            .replace("%reason%", if r.is_proxy { "VPN/proxy" } else { "country" });
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LookupError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct MockLookup {
        country: &'static str,
        proxy: bool,
        fail: bool,
        calls: AtomicUsize,
    }

    impl MockLookup {
        fn new(country: &'static str, proxy: bool) -> Arc<Self> {
            Arc::new(Self {
                country,
                proxy,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                country: "",
                proxy: false,
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReputationLookup for MockLookup {
        async fn lookup(&self, addr: Ipv4Addr) -> Result<ReputationResult, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail {
                return Err(LookupError::Timeout);
            }

            Ok(ReputationResult {
                address: addr.to_string(),
                country_code: self.country.to_string(),
                country_name: self.country.to_string(),
                city: "Testville".to_string(),
                isp: "TestNet".to_string(),
                asn: "AS64512".to_string(),
                is_proxy: self.proxy,
                success: true,
                failure_reason: None,
                observed_at_ms: 0,
            })
        }
    }

    #[derive(Default)]
    struct RecordingRuntime {
        addressable: Mutex<HashSet<Uuid>>,
        disconnects: Mutex<Vec<(Uuid, String)>>,
        messages: Mutex<Vec<(Uuid, String)>>,
        subscribers: Mutex<Vec<Uuid>>,
    }

    impl HostRuntime for RecordingRuntime {
        fn is_addressable(&self, principal: &Uuid) -> bool {
            self.addressable.lock().unwrap().contains(principal)
        }

        fn run_on_host_context(&self, task: HostTask) {
            task();
        }

        fn send_message(&self, principal: &Uuid, text: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((*principal, text.to_string()));
        }

        fn disconnect(&self, principal: &Uuid, reason: &str) {
            self.disconnects
                .lock()
                .unwrap()
                .push((*principal, reason.to_string()));
        }

        fn dispatch_command(&self, _command: &str) {}

        fn alert_recipients(&self) -> Vec<Uuid> {
            self.subscribers.lock().unwrap().clone()
        }
    }

    struct Fixture {
        pipeline: Arc<CheckPipeline>,
        store: Arc<ExemptionStore>,
        runtime: Arc<RecordingRuntime>,
        deferred: Arc<DeferredActionQueue>,
    }

    fn fixture(config: Config, lookup: Arc<MockLookup>) -> Fixture {
        let store = Arc::new(ExemptionStore::in_memory());
        let runtime = Arc::new(RecordingRuntime::default());
        let deferred = Arc::new(DeferredActionQueue::default());

        let pipeline = Arc::new(CheckPipeline::new(
            config,
            Arc::clone(&store),
            None,
            lookup,
            runtime.clone(),
            Arc::clone(&deferred),
        ));

        Fixture {
            pipeline,
            store,
            runtime,
            deferred,
        }
    }

    fn principal(addr: &str) -> Principal {
        Principal {
            id: Uuid::new_v4(),
            name: "steve".to_string(),
            addr: addr.parse().unwrap(),
        }
    }

    fn request(addr: &str) -> CheckRequest {
        CheckRequest {
            principal: principal(addr),
            has_bypass: false,
        }
    }

    fn country_config(codes: &[&str], whitelist_mode: bool) -> Config {
        let mut config = Config::default();
        config.countries.list = codes.iter().map(|c| c.to_string()).collect();
        config.countries.whitelist_mode = whitelist_mode;
        config
    }

    #[tokio::test]
    async fn test_exempt_principal_short_circuits() {
        let lookup = MockLookup::new("US", true);
        let f = fixture(Config::default(), lookup.clone());

        let mut req = request("1.2.3.4");
        f.store.add_principal(req.principal.id).unwrap();

        let handle = f.pipeline.check(req.clone());
        assert_eq!(handle.immediate.verdict, Verdict::Exempt);
        assert_eq!(handle.completion.await.unwrap().verdict, Verdict::Exempt);

        // The external collaborator is never invoked for exempt principals.
        assert_eq!(lookup.calls(), 0);

        // Same for an exempt address range.
        req.principal.id = Uuid::new_v4();
        f.store
            .add_range(crate::cidr::AddressRange::parse("1.2.3.0/24").unwrap())
            .unwrap();
        let handle = f.pipeline.check(req);
        assert_eq!(handle.immediate.verdict, Verdict::Exempt);
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn test_bypass_flag_short_circuits() {
        let lookup = MockLookup::new("US", true);
        let f = fixture(Config::default(), lookup.clone());

        let handle = f.pipeline.check(CheckRequest {
            principal: principal("1.2.3.4"),
            has_bypass: true,
        });

        assert_eq!(handle.immediate.verdict, Verdict::Exempt);
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn test_name_prefix_exemption() {
        let lookup = MockLookup::new("US", true);
        let mut config = Config::default();
        config.exemptions.name_prefixes = vec![".".to_string()];
        let f = fixture(config, lookup.clone());

        let mut p = principal("1.2.3.4");
        p.name = ".bedrock_user".to_string();
        let handle = f.pipeline.check(CheckRequest {
            principal: p,
            has_bypass: false,
        });

        assert_eq!(handle.immediate.verdict, Verdict::Exempt);
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn test_second_check_is_served_from_cache() {
        let lookup = MockLookup::new("US", false);
        let f = fixture(Config::default(), lookup.clone());

        let first = f.pipeline.check(request("1.2.3.4"));
        assert_eq!(first.immediate.verdict, Verdict::Pending);
        assert_eq!(first.completion.await.unwrap().verdict, Verdict::Allowed);
        assert_eq!(lookup.calls(), 1);

        // Issued strictly after the first completed: zero additional calls.
        let second = f.pipeline.check(request("1.2.3.4"));
        assert_eq!(second.immediate.verdict, Verdict::Allowed);
        assert_eq!(lookup.calls(), 1);
    }

    #[tokio::test]
    async fn test_proxy_is_denied() {
        let lookup = MockLookup::new("US", true);
        let f = fixture(Config::default(), lookup);

        let handle = f.pipeline.check(request("1.2.3.4"));
        let outcome = handle.completion.await.unwrap();

        assert_eq!(outcome.verdict, Verdict::DeniedProxy);
        assert!(outcome.verdict.should_block());
    }

    #[tokio::test]
    async fn test_country_whitelist_mode_allows_listed() {
        let lookup = MockLookup::new("US", false);
        let f = fixture(country_config(&["US"], true), lookup);

        let outcome = f.pipeline.check(request("1.2.3.4")).completion.await.unwrap();
        assert_eq!(outcome.verdict, Verdict::Allowed);
    }

    #[tokio::test]
    async fn test_country_whitelist_mode_denies_unlisted() {
        let lookup = MockLookup::new("FR", false);
        let f = fixture(country_config(&["US"], true), lookup);

        let outcome = f.pipeline.check(request("1.2.3.4")).completion.await.unwrap();
        assert_eq!(outcome.verdict, Verdict::DeniedCountry);
    }

    #[tokio::test]
    async fn test_country_denylist_mode_denies_listed() {
        let lookup = MockLookup::new("US", false);
        let f = fixture(country_config(&["US"], false), lookup);

        let outcome = f.pipeline.check(request("1.2.3.4")).completion.await.unwrap();
        assert_eq!(outcome.verdict, Verdict::DeniedCountry);
    }

    #[tokio::test]
    async fn test_country_denylist_mode_allows_unlisted() {
        let lookup = MockLookup::new("FR", false);
        let f = fixture(country_config(&["US"], false), lookup);

        let outcome = f.pipeline.check(request("1.2.3.4")).completion.await.unwrap();
        assert_eq!(outcome.verdict, Verdict::Allowed);
    }

    #[tokio::test]
    async fn test_country_denial_takes_precedence_over_proxy() {
        let lookup = MockLookup::new("FR", true);
        let f = fixture(country_config(&["US"], true), lookup);

        let outcome = f.pipeline.check(request("1.2.3.4")).completion.await.unwrap();
        assert_eq!(outcome.verdict, Verdict::DeniedCountry);
    }

    #[tokio::test]
    async fn test_lookup_failure_never_blocks() {
        let lookup = MockLookup::failing();
        let f = fixture(Config::default(), lookup);

        let outcome = f.pipeline.check(request("1.2.3.4")).completion.await.unwrap();
        assert_eq!(outcome.verdict, Verdict::LookupFailed);
        assert!(!outcome.verdict.should_block());
        assert!(f.runtime.disconnects.lock().unwrap().is_empty());
        assert!(f.deferred.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_outcome_defers_kick_until_addressable() {
        let lookup = MockLookup::new("US", true);
        let f = fixture(Config::default(), lookup);

        let outcome = f.pipeline.check(request("1.2.3.4")).completion.await.unwrap();
        assert_eq!(outcome.verdict, Verdict::DeniedProxy);

        // Not yet addressable, so the kick is queued instead of delivered.
        assert!(f.runtime.disconnects.lock().unwrap().is_empty());
        assert_eq!(f.deferred.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_outcome_kicks_addressable_principal() {
        let lookup = MockLookup::new("US", true);
        let f = fixture(Config::default(), lookup);

        let req = request("1.2.3.4");
        f.runtime
            .addressable
            .lock()
            .unwrap()
            .insert(req.principal.id);

        f.pipeline.check(req).completion.await.unwrap();

        let disconnects = f.runtime.disconnects.lock().unwrap();
        assert_eq!(disconnects.len(), 1);
        assert!(f.deferred.is_empty());
    }

    #[tokio::test]
    async fn test_cache_hit_reapplies_side_effects() {
        let lookup = MockLookup::new("US", true);
        let f = fixture(Config::default(), lookup.clone());

        f.pipeline.check(request("1.2.3.4")).completion.await.unwrap();
        assert_eq!(f.deferred.len(), 1);

        // A repeated connection from the flagged address is handled again,
        // with no additional external query.
        let handle = f.pipeline.check(request("1.2.3.4"));
        assert_eq!(handle.immediate.verdict, Verdict::DeniedProxy);
        assert_eq!(f.deferred.len(), 2);
        assert_eq!(lookup.calls(), 1);
    }

    #[tokio::test]
    async fn test_alerts_go_to_subscribers() {
        let lookup = MockLookup::new("US", true);
        let f = fixture(Config::default(), lookup);

        let staff = Uuid::new_v4();
        f.runtime.subscribers.lock().unwrap().push(staff);

        f.pipeline.check(request("1.2.3.4")).completion.await.unwrap();

        let messages = f.runtime.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, staff);
        assert!(messages[0].1.contains("steve"));
    }

    #[tokio::test]
    async fn test_disabled_engine_allows_everything() {
        let lookup = MockLookup::new("US", true);
        let mut config = Config::default();
        config.settings.enabled = false;
        let f = fixture(config, lookup.clone());

        let handle = f.pipeline.check(request("1.2.3.4"));
        assert_eq!(handle.immediate.verdict, Verdict::Allowed);
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn test_reload_swaps_configuration() {
        let lookup = MockLookup::new("US", false);
        let f = fixture(Config::default(), lookup);

        let mut updated = Config::default();
        updated.settings.enabled = false;
        f.pipeline.reload(updated);

        assert!(!f.pipeline.config().settings.enabled);
    }

    #[test]
    fn test_render_template() {
        let p = principal("1.2.3.4");
        let reputation = ReputationResult {
            address: "1.2.3.4".to_string(),
            country_code: "US".to_string(),
            country_name: "United States".to_string(),
            city: "Dallas".to_string(),
            isp: "ExampleNet".to_string(),
            asn: "AS1".to_string(),
            is_proxy: true,
            success: true,
            failure_reason: None,
            observed_at_ms: 0,
        };

        let text = render_template(
            "%player% from %city%, %country% (%ip%): %reason%",
            &p,
            Some(&reputation),
        );
        assert_eq!(text, "steve from Dallas, United States (1.2.3.4): VPN/proxy");
    }
}
