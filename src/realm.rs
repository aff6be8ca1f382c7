use crate::cell::CellDescriptor;
use crate::error::AklogError;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, error, trace};

/// Maps cell database servers to Kerberos realms.
#[derive(Debug, Clone, Default)]
pub struct RealmResolver {
    domain_realm: BTreeMap<String, String>,
}

impl RealmResolver {
    pub fn new(domain_realm: BTreeMap<String, String>) -> Self {
        let domain_realm = domain_realm
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        RealmResolver { domain_realm }
    }

    /// Build from the `[domain_realm]` section of a krb5.conf, with `overrides`
    /// taking precedence. A missing krb5.conf is not an error.
    pub fn from_krb5_conf<P: AsRef<Path>>(
        path: P,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self, AklogError> {
        let mut domain_realm = match fs::read_to_string(&path) {
            Ok(contents) => parse_domain_realm(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.as_ref().display(), "no krb5 configuration");
                BTreeMap::new()
            }
            Err(err) => {
                error!(?err, path = %path.as_ref().display(), "unable to read krb5 configuration");
                return Err(AklogError::IoError);
            }
        };
        domain_realm.extend(
            overrides
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone())),
        );
        Ok(RealmResolver { domain_realm })
    }

    /// The exact host first, then every enclosing `.domain`.
    pub fn host_realm(&self, host: &str) -> Option<&str> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(realm) = self.domain_realm.get(&host) {
            return Some(realm.as_str());
        }
        host.match_indices('.')
            .find_map(|(idx, _)| self.domain_realm.get(&host[idx..]))
            .map(String::as_str)
    }

    /// The realm for `cell`, derived from its first database server.
    ///
    /// An empty result means no mapping exists and the caller should rely on
    /// referrals. With `fallback` set, a missing mapping is instead replaced by
    /// the upper-cased domain of the server.
    pub fn realm_of_cell(
        &self,
        cell: &CellDescriptor,
        fallback: bool,
    ) -> Result<String, AklogError> {
        let Some(host) = cell.hosts.first() else {
            error!(cell = %cell.name, "Couldn't figure out realm for cell, no database servers");
            return Err(AklogError::RealmUnknown);
        };

        if let Some(realm) = self.host_realm(host) {
            trace!(%host, %realm, "mapped host to realm");
            return Ok(realm.to_string());
        }

        if !fallback {
            return Ok(String::new());
        }

        let realm = match host.split_once('.') {
            Some((_, domain)) if !domain.is_empty() => domain.trim_end_matches('.'),
            _ => cell.name.as_str(),
        }
        .to_ascii_uppercase();
        trace!(%host, %realm, "derived realm from host domain");
        Ok(realm)
    }
}

/// Pull `[domain_realm]` out of a krb5.conf.
fn parse_domain_realm(contents: &str) -> BTreeMap<String, String> {
    let mut in_section = false;
    let mut map = BTreeMap::new();

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            in_section = line == "[domain_realm]";
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let (key, value) = (key.trim(), value.trim());
            if !key.is_empty() && !value.is_empty() {
                map.insert(key.to_ascii_lowercase(), value.to_string());
            }
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(name: &str, hosts: &[&str]) -> CellDescriptor {
        CellDescriptor {
            name: name.to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            linked_cell: None,
        }
    }

    const KRB5_CONF: &str = r#"
[libdefaults]
    default_realm = EXAMPLE.ORG
[domain_realm]
    # comment
    .example.org = EXAMPLE.ORG
    special.example.org = SPECIAL.ORG
    .Example.NET = NET.EXAMPLE
[realms]
    .not.here = NOPE
"#;

    #[test]
    fn test_parse_domain_realm() {
        let map = parse_domain_realm(KRB5_CONF);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(".example.net").map(String::as_str), Some("NET.EXAMPLE"));
        assert!(!map.contains_key(".not.here"));
    }

    #[test]
    fn test_host_realm_lookup_order() {
        let resolver = RealmResolver::new(parse_domain_realm(KRB5_CONF));
        assert_eq!(resolver.host_realm("special.example.org"), Some("SPECIAL.ORG"));
        assert_eq!(resolver.host_realm("afsdb1.EXAMPLE.org"), Some("EXAMPLE.ORG"));
        assert_eq!(resolver.host_realm("a.b.example.net"), Some("NET.EXAMPLE"));
        assert_eq!(resolver.host_realm("example.com"), None);
    }

    #[test]
    fn test_realm_of_cell() {
        let resolver = RealmResolver::new(parse_domain_realm(KRB5_CONF));

        let mapped = cell("example.org", &["afsdb1.example.org"]);
        assert_eq!(resolver.realm_of_cell(&mapped, false).ok().as_deref(), Some("EXAMPLE.ORG"));

        let unmapped = cell("example.com", &["afsdb.corp.example.com"]);
        assert_eq!(resolver.realm_of_cell(&unmapped, false).ok().as_deref(), Some(""));
        assert_eq!(
            resolver.realm_of_cell(&unmapped, true).ok().as_deref(),
            Some("CORP.EXAMPLE.COM")
        );

        let dotless = cell("lab.example", &["afsdb"]);
        assert_eq!(resolver.realm_of_cell(&dotless, true).ok().as_deref(), Some("LAB.EXAMPLE"));

        let hostless = cell("empty.example", &[]);
        assert!(matches!(
            resolver.realm_of_cell(&hostless, false),
            Err(AklogError::RealmUnknown)
        ));
    }

    #[test]
    fn test_overrides_win() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join("krb5.conf");
        std::fs::write(&conf, KRB5_CONF).expect("write");

        let mut overrides = BTreeMap::new();
        overrides.insert(".EXAMPLE.ORG".to_string(), "OVERRIDE.ORG".to_string());
        let resolver = RealmResolver::from_krb5_conf(&conf, &overrides).expect("resolver");
        assert_eq!(resolver.host_realm("afsdb1.example.org"), Some("OVERRIDE.ORG"));
        assert_eq!(resolver.host_realm("special.example.org"), Some("SPECIAL.ORG"));

        let missing = RealmResolver::from_krb5_conf(dir.path().join("nope"), &overrides)
            .expect("missing krb5.conf is fine");
        assert_eq!(missing.host_realm("x.example.org"), Some("OVERRIDE.ORG"));
    }
}
