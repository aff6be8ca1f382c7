use crate::config::DEFAULT_KRB524_PORT;
use crate::error::AklogError;
use crate::proto::ServiceTicket;
use crate::token::{ServerIdentity, Token, MAXKTCNAMELEN, MAXKTCTICKETLEN};
use binrw::{binread, BinReaderExt};
use bytes::BytesMut;
use futures::future::LocalBoxFuture;
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};
use tokio::net::UdpSocket;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::udp::UdpFramed;
use tracing::{debug, error, trace};

/// Marks a token as carrying a full Kerberos 5 ticket rather than a kvno.
pub const RXKAD_TKT_TYPE_KERBEROS_V5: i32 = 256;

/// Name and instance fields of a v4 principal, terminator included.
const ANAME_SZ: usize = 40;
/// Fixed size of the v4 ticket area in a krb524 reply.
const MAX_KTXT_LEN: usize = 1250;

/// A Kerberos 4 credential produced by a ticket conversion service.
#[derive(Clone, PartialEq, Eq)]
pub struct LegacyCredential {
    pub pname: String,
    pub pinst: String,
    pub kvno: i32,
    pub issue_date: SystemTime,
    pub session: [u8; 8],
    pub ticket: Vec<u8>,
}

impl std::fmt::Debug for LegacyCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyCredential")
            .field("pname", &self.pname)
            .field("pinst", &self.pinst)
            .field("kvno", &self.kvno)
            .field("ticket_len", &self.ticket.len())
            .finish()
    }
}

pub trait LegacyConverter {
    fn downgrade<'a>(
        &'a self,
        ticket: &'a ServiceTicket,
    ) -> LocalBoxFuture<'a, Result<LegacyCredential, AklogError>>;
}

/// How a service ticket is turned into a token. Chosen once from configuration.
pub enum TokenFormat {
    Native,
    Krb524(Box<dyn LegacyConverter>),
}

/// A token plus the account name it was issued to.
#[derive(Debug, Clone)]
pub struct ConvertedToken {
    pub token: Token,
    pub username: String,
}

impl TokenFormat {
    pub async fn convert(
        &self,
        ticket: &ServiceTicket,
        cell: &str,
    ) -> Result<ConvertedToken, AklogError> {
        let converted = match self {
            TokenFormat::Native => {
                debug!("Using Kerberos V5 ticket natively");
                native_token(ticket, cell)
            }
            TokenFormat::Krb524(converter) => {
                debug!("Using Kerberos 524 translator service");
                let legacy = converter.downgrade(ticket).await.map_err(|err| {
                    error!(?err, "while converting tickets to Kerberos V4 format");
                    AklogError::ConversionFailed
                })?;
                legacy_token(ticket, &legacy, cell)
            }
        };

        if converted.token.ticket.len() > MAXKTCTICKETLEN {
            error!(
                len = converted.token.ticket.len(),
                max = MAXKTCTICKETLEN,
                "ticket too long for the token cache"
            );
            return Err(AklogError::ConversionFailed);
        }

        Ok(converted)
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `primary[.instance]`, short enough to fit a token cache name field.
fn native_username(ticket: &ServiceTicket) -> String {
    let primary = ticket.client.primary();
    let second = ticket.client.instance();

    let limit = if second.is_some() {
        MAXKTCNAMELEN - 2
    } else {
        MAXKTCNAMELEN - 1
    };
    let mut username = truncate_bytes(primary, limit).to_string();

    if let Some(second) = second {
        username.push('.');
        let remaining = (MAXKTCNAMELEN - 1).saturating_sub(username.len());
        username.push_str(truncate_bytes(second, remaining));
    }
    username
}

fn native_token(ticket: &ServiceTicket, cell: &str) -> ConvertedToken {
    ConvertedToken {
        token: Token {
            server: ServerIdentity::afs(cell),
            kvno: RXKAD_TKT_TYPE_KERBEROS_V5,
            session_key: ticket.session_key.clone(),
            start_time: ticket.effective_start(),
            end_time: ticket.end_time,
            ticket: ticket.ticket.clone(),
        },
        username: native_username(ticket),
    }
}

fn legacy_token(ticket: &ServiceTicket, legacy: &LegacyCredential, cell: &str) -> ConvertedToken {
    let mut username = legacy.pname.clone();
    if !legacy.pinst.is_empty() {
        username.push('.');
        username.push_str(&legacy.pinst);
    }

    ConvertedToken {
        token: Token {
            server: ServerIdentity::afs(cell),
            kvno: legacy.kvno,
            session_key: legacy.session.to_vec(),
            start_time: legacy.issue_date,
            // The v4 lifetime encoding is coarse. The server reads the real
            // expiry from the encrypted ticket anyway.
            end_time: ticket.end_time,
            ticket: legacy.ticket.clone(),
        },
        username,
    }
}

#[binread]
#[br(big)]
#[derive(Debug)]
struct V4Ticket {
    #[br(temp, assert(length as usize <= MAX_KTXT_LEN))]
    length: u32,
    #[br(count = MAX_KTXT_LEN, map = |v: Vec<u8>| v[..length as usize].to_vec())]
    data: Vec<u8>,
    _mbz: u32,
}

#[binread]
#[br(big)]
#[derive(Debug)]
pub struct Krb524Reply {
    status: i32,
    #[br(if(status == 0))]
    ticket: Option<V4Ticket>,
    #[br(if(status == 0))]
    kvno: Option<u32>,
}

impl Krb524Reply {
    fn into_parts(self) -> Result<(Vec<u8>, i32), AklogError> {
        match (self.status, self.ticket, self.kvno) {
            (0, Some(ticket), Some(kvno)) => Ok((ticket.data, kvno as i32)),
            (status, _, _) => {
                error!(?status, "krb524 conversion refused");
                Err(AklogError::ConversionFailed)
            }
        }
    }
}

/// One datagram each way. The request is the DER encoded Kerberos 5 ticket.
#[derive(Debug, Default)]
pub struct Krb524Codec;

impl Decoder for Krb524Codec {
    type Item = Krb524Reply;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut reader = binrw::io::Cursor::new(&buf[..]);
        let reply: Krb524Reply = reader
            .read_type(binrw::Endian::Big)
            .map_err(|x| io::Error::new(io::ErrorKind::InvalidData, x.to_string()))?;

        buf.clear();
        Ok(Some(reply))
    }
}

impl Encoder<Vec<u8>> for Krb524Codec {
    type Error = io::Error;

    fn encode(&mut self, msg: Vec<u8>, buf: &mut BytesMut) -> io::Result<()> {
        buf.clear();
        buf.extend_from_slice(&msg);
        Ok(())
    }
}

/// Converts tickets through the krb524 service of the ticket's realm.
pub struct Krb524Client {
    servers: BTreeMap<String, String>,
    timeout: Duration,
}

impl Krb524Client {
    pub fn new(servers: BTreeMap<String, String>, timeout: Duration) -> Self {
        Krb524Client { servers, timeout }
    }

    async fn server_for(&self, realm: &str) -> Result<SocketAddr, AklogError> {
        let Some(server) = self.servers.get(realm) else {
            error!(%realm, "no krb524 server configured for realm");
            return Err(AklogError::ConversionFailed);
        };
        let server = if server.contains(':') {
            server.clone()
        } else {
            format!("{server}:{DEFAULT_KRB524_PORT}")
        };

        let addr = tokio::net::lookup_host(&server)
            .await
            .map_err(|err| {
                error!(?err, %server, "unable to resolve krb524 server");
                AklogError::ConversionFailed
            })?
            .next()
            .ok_or_else(|| {
                error!(%server, "krb524 server has no addresses");
                AklogError::ConversionFailed
            });
        addr
    }

    async fn exchange(&self, addr: SocketAddr, der: Vec<u8>) -> Result<Krb524Reply, AklogError> {
        let bind: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await.map_err(|err| {
            error!(?err, "unable to bind udp socket");
            AklogError::IoError
        })?;
        let mut framed = UdpFramed::new(socket, Krb524Codec);

        framed.send((der, addr)).await.map_err(|err| {
            error!(?err, %addr, "unable to send krb524 request");
            AklogError::ConversionFailed
        })?;

        loop {
            let next = tokio::time::timeout(self.timeout, framed.next())
                .await
                .map_err(|_| {
                    error!(%addr, "krb524 server did not answer");
                    AklogError::ConversionFailed
                })?;
            match next {
                Some(Ok((reply, from))) if from == addr => return Ok(reply),
                Some(Ok((_, from))) => {
                    trace!(%from, "ignoring datagram from unexpected peer");
                }
                Some(Err(err)) => {
                    error!(?err, "invalid krb524 reply");
                    return Err(AklogError::ConversionFailed);
                }
                None => {
                    error!("krb524 socket closed");
                    return Err(AklogError::ConversionFailed);
                }
            }
        }
    }

    async fn convert(&self, ticket: &ServiceTicket) -> Result<LegacyCredential, AklogError> {
        let realm = if ticket.server.realm.is_empty() {
            ticket.ticket_realm()?
        } else {
            ticket.server.realm.clone()
        };
        let addr = self.server_for(&realm).await?;
        debug!(%realm, %addr, "asking krb524 server for a v4 ticket");

        let (v4ticket, kvno) = self.exchange(addr, ticket.ticket.clone()).await?.into_parts()?;

        let mut session = [0u8; 8];
        let Some(key) = ticket.session_key.get(..8) else {
            error!(len = ticket.session_key.len(), "session key too short for a v4 credential");
            return Err(AklogError::ConversionFailed);
        };
        session.copy_from_slice(key);

        let client = &ticket.client;
        Ok(LegacyCredential {
            pname: truncate_bytes(client.primary(), ANAME_SZ - 1).to_string(),
            pinst: truncate_bytes(client.instance().unwrap_or(""), ANAME_SZ - 1).to_string(),
            kvno,
            issue_date: ticket.effective_start(),
            session,
            ticket: v4ticket,
        })
    }
}

impl LegacyConverter for Krb524Client {
    fn downgrade<'a>(
        &'a self,
        ticket: &'a ServiceTicket,
    ) -> LocalBoxFuture<'a, Result<LegacyCredential, AklogError>> {
        Box::pin(self.convert(ticket))
    }
}
