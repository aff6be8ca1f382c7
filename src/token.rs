use crate::error::AklogError;
use crate::proto::AFS_SERVICE;
use std::fmt;
use std::time::SystemTime;

/// The largest ticket the AFS token cache accepts.
pub const MAXKTCTICKETLEN: usize = 12000;
/// Size of the name fields of a token cache principal, terminator included.
pub const MAXKTCNAMELEN: usize = 64;
/// The protection server's id for users it does not know.
pub const ANONYMOUSID: i32 = 32766;

/// The service a token is for, `afs@<cell>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub name: String,
    pub instance: String,
    pub cell: String,
}

impl ServerIdentity {
    pub fn afs(cell: &str) -> Self {
        ServerIdentity {
            name: AFS_SERVICE.to_string(),
            instance: String::new(),
            cell: cell.to_string(),
        }
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instance.is_empty() {
            write!(f, "{}@{}", self.name, self.cell)
        } else {
            write!(f, "{}.{}@{}", self.name, self.instance, self.cell)
        }
    }
}

/// Who the token says the holder is. For the token cache the name is either
/// the account name or `AFS ID <n>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub name: String,
    pub instance: String,
    pub cell: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub server: ServerIdentity,
    /// Key version, or `RXKAD_TKT_TYPE_KERBEROS_V5` for a native ticket.
    pub kvno: i32,
    pub session_key: Vec<u8>,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub ticket: Vec<u8>,
}

impl Token {
    /// Two tokens carry the same credential when the kvno, the session key and
    /// the ticket all agree. Validity times are not compared.
    pub fn same_credential(&self, other: &Token) -> bool {
        self.kvno == other.kvno
            && self.ticket.len() == other.ticket.len()
            && self.session_key == other.session_key
            && self.ticket == other.ticket
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("server", &self.server.to_string())
            .field("kvno", &self.kvno)
            .field("session_key", &"<redacted>")
            .field("start_time", &self.start_time)
            .field("end_time", &self.end_time)
            .field("ticket_len", &self.ticket.len())
            .finish()
    }
}

/// The kernel token cache.
pub trait TokenCache {
    /// The token installed for `server`, if any.
    fn get_token(
        &self,
        server: &ServerIdentity,
    ) -> Result<Option<(Token, ClientIdentity)>, AklogError>;

    /// Install `token`. With `setpag` the caller's parent is moved into a new
    /// process authentication group first.
    fn set_token(
        &self,
        token: &Token,
        client: &ClientIdentity,
        setpag: bool,
    ) -> Result<(), AklogError>;
}
