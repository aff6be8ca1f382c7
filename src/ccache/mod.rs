mod cc_dir;
mod cc_file;

use crate::error::AklogError;
use crate::proto::{from_epoch_secs, Principal, ServiceTicket};
use binrw::binread;
use std::env;
use std::time::SystemTime;
use tracing::{error, trace};
use uzers::get_current_uid;

/// Realm used by MIT for cache configuration entries. These are not tickets.
const CONF_REALM: &[u8] = b"X-CACHECONF:";

#[binread]
#[br(big)]
struct DataComponent {
    #[br(temp)]
    value_len: u32,
    #[br(count = value_len)]
    value: Vec<u8>,
}

impl DataComponent {
    fn lossy(&self) -> String {
        String::from_utf8_lossy(self.value.as_slice()).to_string()
    }
}

#[binread]
#[br(big)]
struct PrincipalV4 {
    _name_type: u32,
    #[br(temp)]
    components_count: u32,
    realm: DataComponent,
    #[br(count = components_count)]
    components: Vec<DataComponent>,
}

impl From<&PrincipalV4> for Principal {
    fn from(p: &PrincipalV4) -> Self {
        Principal {
            components: p.components.iter().map(DataComponent::lossy).collect(),
            realm: p.realm.lossy(),
        }
    }
}

#[binread]
#[br(big)]
struct KeyBlockV4 {
    enc_type: u16,
    data: DataComponent,
}

#[binread]
#[br(big)]
struct Address {
    _addr_type: u16,
    _data: DataComponent,
}

#[binread]
#[br(big)]
struct Addresses {
    #[br(temp)]
    count: u32,
    #[br(count = count)]
    _addresses: Vec<Address>,
}

#[binread]
#[br(big)]
struct AuthDataComponent {
    _ad_type: u16,
    _data: DataComponent,
}

#[binread]
#[br(big)]
struct AuthData {
    #[br(temp)]
    count: u32,
    #[br(count = count)]
    _auth_data: Vec<AuthDataComponent>,
}

#[binread]
#[br(big)]
struct CredentialV4 {
    client: PrincipalV4,
    server: PrincipalV4,
    keyblock: KeyBlockV4,
    authtime: u32,
    starttime: u32,
    endtime: u32,
    _renew_till: u32,
    _is_skey: u8,
    _ticket_flags: u32,
    _addresses: Addresses,
    _authdata: AuthData,
    ticket: DataComponent,
    _second_ticket: DataComponent,
}

impl CredentialV4 {
    fn is_config(&self) -> bool {
        self.server.realm.value == CONF_REALM
    }
}

impl From<&CredentialV4> for ServiceTicket {
    fn from(cred: &CredentialV4) -> Self {
        ServiceTicket {
            client: (&cred.client).into(),
            server: (&cred.server).into(),
            enctype: cred.keyblock.enc_type as i32,
            session_key: cred.keyblock.data.value.clone(),
            auth_time: from_epoch_secs(cred.authtime),
            start_time: (cred.starttime != 0).then(|| from_epoch_secs(cred.starttime)),
            end_time: from_epoch_secs(cred.endtime),
            ticket: cred.ticket.value.clone(),
        }
    }
}

/// What a credential cache holds once read: the default principal and every
/// ticket in it, configuration entries removed.
#[derive(Debug, Clone)]
pub struct CredentialCacheContents {
    pub default_principal: Principal,
    pub credentials: Vec<ServiceTicket>,
}

impl CredentialCacheContents {
    /// Find a ticket `client` holds for `server` that has not expired at `now`
    /// and whose session key is one of `enctypes`. An empty server realm
    /// matches any realm, since that is what a referral lookup ends up storing.
    pub fn find(
        &self,
        client: &Principal,
        server: &Principal,
        now: SystemTime,
        enctypes: &[i32],
    ) -> Option<&ServiceTicket> {
        self.credentials.iter().find(|cred| {
            cred.client == *client
                && cred.server.same_name(server)
                && (server.realm.is_empty() || cred.server.realm == server.realm)
                && cred.end_time > now
                && enctypes.contains(&cred.enctype)
        })
    }
}

pub trait CredentialCache {
    fn name(&self) -> String;

    fn load(&self) -> Result<CredentialCacheContents, AklogError>;

    /// The identity the user authenticated as.
    fn default_principal(&self) -> Result<Principal, AklogError> {
        self.load().map(|c| c.default_principal)
    }
}

fn parse_ccache_name(ccache: Option<&str>) -> String {
    let uid = get_current_uid().to_string();

    match ccache {
        Some(c) => c.to_string(),
        None => match env::var("KRB5CCNAME") {
            Ok(val) => val,
            _ => "FILE:/tmp/krb5cc_%{uid}".to_string(),
        },
    }
    .replace("%{uid}", uid.as_str())
}

pub fn resolve(ccache_name: Option<&str>) -> Result<Box<dyn CredentialCache>, AklogError> {
    let ccache_name = parse_ccache_name(ccache_name);
    trace!(?ccache_name, "Resolving credential cache");

    if ccache_name.starts_with("FILE:") || ccache_name.starts_with('/') {
        return cc_file::resolve(&ccache_name);
    }

    if ccache_name.starts_with("DIR:") {
        return cc_dir::resolve(&ccache_name);
    }

    error!(?ccache_name, "Unsupported credential cache type");
    Err(AklogError::UnsupportedCredentialCacheType)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proto::DES_ENCTYPES;

    /// Write a v4 FILE ccache holding `creds` for the default principal `client`.
    /// The writer side only exists for tests, aklog never modifies a ccache.
    pub(crate) fn ccache_bytes(
        client: &Principal,
        creds: &[(Principal, Vec<u8>, u32, Vec<u8>)],
    ) -> Vec<u8> {
        fn data(buf: &mut Vec<u8>, v: &[u8]) {
            buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
            buf.extend_from_slice(v);
        }
        fn principal(buf: &mut Vec<u8>, p: &Principal) {
            buf.extend_from_slice(&1u32.to_be_bytes());
            buf.extend_from_slice(&(p.components.len() as u32).to_be_bytes());
            data(buf, p.realm.as_bytes());
            for c in p.components.iter() {
                data(buf, c.as_bytes());
            }
        }

        let mut buf = vec![0x05, 0x04, 0x00, 0x00];
        principal(&mut buf, client);
        for (server, key, endtime, ticket) in creds {
            principal(&mut buf, client);
            principal(&mut buf, server);
            buf.extend_from_slice(&(if key.len() == 8 { 3u16 } else { 18u16 }).to_be_bytes());
            data(&mut buf, key);
            // authtime, starttime, endtime, renew_till
            buf.extend_from_slice(&1_000u32.to_be_bytes());
            buf.extend_from_slice(&1_000u32.to_be_bytes());
            buf.extend_from_slice(&endtime.to_be_bytes());
            buf.extend_from_slice(&0u32.to_be_bytes());
            // is_skey, flags, addresses, authdata
            buf.push(0);
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&0u32.to_be_bytes());
            data(&mut buf, ticket);
            data(&mut buf, &[]);
        }
        buf
    }

    #[test]
    fn test_parse_ccache_name() {
        assert_eq!(parse_ccache_name(Some("FILE:/tmp/x")), "FILE:/tmp/x");
        let uid = get_current_uid().to_string();
        assert_eq!(
            parse_ccache_name(Some("FILE:/tmp/krb5cc_%{uid}")),
            format!("FILE:/tmp/krb5cc_{uid}")
        );
    }

    #[test]
    fn test_unsupported_type() {
        assert!(matches!(
            resolve(Some("KEYRING:session:foo")),
            Err(AklogError::UnsupportedCredentialCacheType)
        ));
        assert!(matches!(
            resolve(Some("MEMORY:foo")),
            Err(AklogError::UnsupportedCredentialCacheType)
        ));
    }

    #[test]
    fn test_find_matches_referral_realm() {
        let client = Principal::user("jdoe", "EXAMPLE.ORG");
        let service = Principal::afs_service(Some("example.org"), "EXAMPLE.ORG");
        let contents = CredentialCacheContents {
            default_principal: client.clone(),
            credentials: vec![ServiceTicket {
                client: client.clone(),
                server: service.clone(),
                enctype: 18,
                session_key: vec![1; 32],
                auth_time: from_epoch_secs(1_000),
                start_time: None,
                end_time: from_epoch_secs(5_000),
                ticket: vec![],
            }],
        };

        let now = from_epoch_secs(2_000);
        let aes = [18];
        assert!(contents.find(&client, &service, now, &aes).is_some());
        let referral = Principal::afs_service(Some("example.org"), "");
        assert!(contents.find(&client, &referral, now, &aes).is_some());
        let other = Principal::afs_service(Some("example.org"), "OTHER.ORG");
        assert!(contents.find(&client, &other, now, &aes).is_none());
        // Expired
        assert!(contents
            .find(&client, &service, from_epoch_secs(6_000), &aes)
            .is_none());
        // Wrong session key type
        assert!(contents
            .find(&client, &service, now, &DES_ENCTYPES)
            .is_none());
    }
}
