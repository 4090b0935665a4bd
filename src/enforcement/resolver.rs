//! Domain name resolution for the site block list.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::policy::PolicyStore;

/// Host name lookup.
pub trait Resolver: Send + Sync {
    fn resolve_host(&self, domain: &str) -> EngineResult<BTreeSet<IpAddr>>;
}

/// Resolver backed by the operating system's lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve_host(&self, domain: &str) -> EngineResult<BTreeSet<IpAddr>> {
        let addrs = (domain, 0u16)
            .to_socket_addrs()
            .map_err(|e| EngineError::Resolution {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

        let ips: BTreeSet<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        if ips.is_empty() {
            return Err(EngineError::Resolution {
                domain: domain.to_string(),
                reason: "no addresses returned".into(),
            });
        }
        Ok(ips)
    }
}

/// Destination addresses to drop, keyed back to the domain that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    by_ip: HashMap<IpAddr, String>,
    unresolved: Vec<String>,
}

impl BlockTable {
    pub fn domain_for(&self, ip: &IpAddr) -> Option<&str> {
        self.by_ip.get(ip).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }

    /// Domains that failed to resolve this cycle.
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }
}

/// Resolves blocked domains and keeps the store's resolved-IP cache current.
pub struct DomainResolver {
    resolver: Arc<dyn Resolver>,
}

impl DomainResolver {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    pub fn resolve(&self, domain: &str) -> EngineResult<BTreeSet<IpAddr>> {
        self.resolver.resolve_host(domain)
    }

    /// Re-resolve every domain in `sites`.
    ///
    /// A domain that fails to resolve stays in policy but contributes no
    /// addresses to the returned table.
    pub fn refresh(&self, store: &PolicyStore, sites: &BTreeSet<String>) -> BlockTable {
        let mut table = BlockTable::default();

        for domain in sites {
            match self.resolve(domain) {
                Ok(ips) => {
                    debug!("{} resolved to {:?}", domain, ips);
                    for ip in &ips {
                        table.by_ip.insert(*ip, domain.clone());
                    }
                    store.set_resolved(domain, ips);
                }
                Err(e) => {
                    warn!("Skipping blocked site this cycle: {}", e);
                    store.set_resolved(domain, BTreeSet::new());
                    table.unresolved.push(domain.clone());
                }
            }
        }

        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockResolver;
    use std::net::Ipv4Addr;

    #[test]
    fn refresh_maps_ips_to_domains() {
        let resolver = MockResolver::new();
        resolver.insert("example.com", &[IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);
        let domains = DomainResolver::new(Arc::new(resolver));
        let store = PolicyStore::default();

        let sites = BTreeSet::from(["example.com".to_string()]);
        let table = domains.refresh(&store, &sites);

        let ip = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(table.domain_for(&ip), Some("example.com"));
        assert_eq!(store.resolved("example.com").unwrap().len(), 1);
    }

    #[test]
    fn failed_resolution_contributes_nothing() {
        let resolver = MockResolver::new();
        resolver.insert("good.com", &[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);
        let domains = DomainResolver::new(Arc::new(resolver));
        let store = PolicyStore::default();
        store.add_site(None, "example.com").unwrap();
        store.add_site(None, "good.com").unwrap();

        let table = domains.refresh(&store, &store.snapshot().sites);

        assert_eq!(table.len(), 1);
        assert_eq!(table.unresolved(), &["example.com".to_string()]);
        assert!(store.snapshot().sites.contains("example.com"));
        assert!(store.resolved("example.com").unwrap().is_empty());
    }

    #[test]
    fn refresh_drops_addresses_that_stop_resolving() {
        let resolver = Arc::new(MockResolver::new());
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        resolver.insert("games.example", &[ip]);
        let domains = DomainResolver::new(resolver.clone());
        let store = PolicyStore::default();
        let sites = BTreeSet::from(["games.example".to_string()]);

        assert_eq!(domains.refresh(&store, &sites).domain_for(&ip), Some("games.example"));

        resolver.remove("games.example");
        let table = domains.refresh(&store, &sites);
        assert!(table.is_empty());
        assert_eq!(table.unresolved(), &["games.example".to_string()]);
        assert!(store.resolved("games.example").unwrap().is_empty());
    }

    #[test]
    fn system_resolver_handles_ip_literals() {
        let ips = SystemResolver.resolve_host("127.0.0.1").unwrap();
        assert!(ips.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }
}
