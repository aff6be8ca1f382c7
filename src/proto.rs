use crate::asn1::tagged_ticket::TaggedTicket;
use crate::error::AklogError;
use der::Decode;
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::error;

/// The AFS service name. The instance, if present, is the cell name.
pub const AFS_SERVICE: &str = "afs";

/// `des-cbc-crc`, the session key type asked for on every AFS ticket request.
pub const ENCTYPE_DES_CBC_CRC: i32 = 1;
/// Session key types an rxkad token can carry.
pub const DES_ENCTYPES: [i32; 3] = [ENCTYPE_DES_CBC_CRC, 2, 3];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Principal {
    pub components: Vec<String>,
    pub realm: String,
}

impl Principal {
    pub fn new(components: Vec<String>, realm: &str) -> Self {
        Principal {
            components,
            realm: realm.to_string(),
        }
    }

    pub fn user(name: &str, realm: &str) -> Self {
        Self::new(vec![name.to_string()], realm)
    }

    /// `afs/<cell>@<realm>`, or plain `afs@<realm>` when there is no instance.
    pub fn afs_service(instance: Option<&str>, realm: &str) -> Self {
        let mut components = vec![AFS_SERVICE.to_string()];
        if let Some(inst) = instance.filter(|i| !i.is_empty()) {
            components.push(inst.to_string());
        }
        Self::new(components, realm)
    }

    pub fn primary(&self) -> &str {
        self.components.first().map(String::as_str).unwrap_or("")
    }

    pub fn instance(&self) -> Option<&str> {
        self.components.get(1).map(String::as_str)
    }

    /// The name without the realm, `a/b`.
    pub fn name_string(&self) -> String {
        self.components.join("/")
    }

    pub fn same_name(&self, other: &Principal) -> bool {
        self.components == other.components
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name_string(), self.realm)
    }
}

/// A Kerberos 5 service ticket, as handed out by the negotiation transport.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceTicket {
    pub client: Principal,
    pub server: Principal,
    pub enctype: i32,
    pub session_key: Vec<u8>,
    pub auth_time: SystemTime,
    pub start_time: Option<SystemTime>,
    pub end_time: SystemTime,
    /// The DER encoded `Ticket`.
    pub ticket: Vec<u8>,
}

impl ServiceTicket {
    /// The realm of the service, as asserted by the encoded ticket itself.
    pub fn ticket_realm(&self) -> Result<String, AklogError> {
        let tagged = TaggedTicket::from_der(&self.ticket).map_err(|err| {
            error!(?err, "unable to decode service ticket");
            AklogError::DerError
        })?;
        Ok(tagged.realm().to_string())
    }

    /// Start of validity, falling back to the authentication time like the
    /// Kerberos libraries do.
    pub fn effective_start(&self) -> SystemTime {
        self.start_time.unwrap_or(self.auth_time)
    }
}

impl fmt::Debug for ServiceTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTicket")
            .field("client", &self.client.to_string())
            .field("server", &self.server.to_string())
            .field("enctype", &self.enctype)
            .field("session_key", &"<redacted>")
            .field("end_time", &self.end_time)
            .field("ticket_len", &self.ticket.len())
            .finish()
    }
}

pub(crate) fn epoch_secs(t: SystemTime) -> Result<u32, AklogError> {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|_| AklogError::DoYouHaveATimeMachine)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

pub(crate) fn from_epoch_secs(secs: u32) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
}
