//! Buffers exchanged with the cache manager's token calls. Everything is in
//! host byte order.

use crate::error::AklogError;
use crate::proto::{epoch_secs, from_epoch_secs};
use crate::token::{ClientIdentity, ServerIdentity, Token, MAXKTCTICKETLEN};
use binrw::io::Cursor;
use binrw::{binrw, BinRead, BinWrite, NullString};
use bitmask_enum::bitmask;
use tracing::{error, trace};

/// Returned by the token cache for malformed arguments.
pub const KTC_INVAL: i32 = 11862786;

const AFS_ID_PREFIX: &str = "AFS ID ";
const UNIX_UID_PREFIX: &str = "Unix UID ";
const HANDSHAKE_KEY_LEN: usize = 8;

#[bitmask(u32)]
pub enum SetTokenFlags {
    Primary = 0x1,
    SetPag = 0x8000,
}

#[binrw]
#[brw(is_little = cfg!(target_endian = "little"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearToken {
    /// The key version number of the ticket.
    pub auth_handle: i32,
    pub handshake_key: [u8; HANDSHAKE_KEY_LEN],
    pub vice_id: i32,
    pub begin: i32,
    pub end: i32,
}

/// The in-buffer of a set-token call and the out-buffer of a get-token call.
#[binrw]
#[brw(is_little = cfg!(target_endian = "little"))]
#[derive(Debug)]
pub struct TokenBuffer {
    #[br(temp)]
    #[bw(try_calc(u32::try_from(ticket.len())))]
    ticket_len: u32,
    #[br(count = ticket_len)]
    pub ticket: Vec<u8>,
    #[br(temp, assert(clear_token_len == CLEAR_TOKEN_LEN))]
    #[bw(calc = CLEAR_TOKEN_LEN)]
    clear_token_len: u32,
    pub clear_token: ClearToken,
    flags: u32,
    pub cell: NullString,
}

const CLEAR_TOKEN_LEN: u32 = 24;

impl TokenBuffer {
    pub fn to_bytes(&self) -> Result<Vec<u8>, AklogError> {
        let mut c = Cursor::new(Vec::new());
        self.write(&mut c).map_err(|err| {
            error!(?err, "unable to encode token buffer");
            AklogError::BinRWError
        })?;
        Ok(c.into_inner())
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, AklogError> {
        TokenBuffer::read(&mut Cursor::new(buf)).map_err(|err| {
            error!(?err, "unable to decode token buffer");
            AklogError::BinRWError
        })
    }
}

/// Leading decimal digits of `s`, `0` when there are none.
fn atoi(s: &str) -> i32 {
    let s = s.trim_start();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i32, |acc, d| acc.wrapping_mul(10).wrapping_add(i32::from(d - b'0')));
    if neg {
        value.wrapping_neg()
    } else {
        value
    }
}

fn clamp_secs(t: std::time::SystemTime) -> Result<i32, AklogError> {
    epoch_secs(t).map(|s| i32::try_from(s).unwrap_or(i32::MAX))
}

/// Build the clear half of a token.
///
/// The cache manager tells `AFS ID <n>` holders from Unix uid holders by the
/// parity of the lifetime: odd for an AFS id, even otherwise. The start time
/// is nudged by a second to get the right parity.
pub fn clear_token(
    token: &Token,
    client: &ClientIdentity,
    uid: u32,
) -> Result<ClearToken, AklogError> {
    let handshake_key: [u8; HANDSHAKE_KEY_LEN] =
        token.session_key.as_slice().try_into().map_err(|_| {
            error!(
                key_len = token.session_key.len(),
                "session key does not fit an rxkad token"
            );
            AklogError::TokenInstallFailed(KTC_INVAL)
        })?;

    let mut begin = clamp_secs(token.start_time)?;
    let end = clamp_secs(token.end_time)?;
    if begin == 0 {
        begin = 1;
    }

    let afs_id = client.instance.is_empty()
        && client.name.len() > AFS_ID_PREFIX.len()
        && client.name.starts_with(AFS_ID_PREFIX);

    let vice_id = if afs_id {
        if (end.wrapping_sub(begin)) & 1 == 0 {
            begin += 1;
        }
        atoi(&client.name[AFS_ID_PREFIX.len()..])
    } else {
        if (end.wrapping_sub(begin)) & 1 == 1 {
            begin += 1;
        }
        i32::try_from(uid).unwrap_or(i32::MAX)
    };

    trace!(vice_id, begin, end, "built clear token");
    Ok(ClearToken {
        auth_handle: token.kvno,
        handshake_key,
        vice_id,
        begin,
        end,
    })
}

/// The set-token buffer for `token`.
pub fn encode_set_token(
    token: &Token,
    client: &ClientIdentity,
    uid: u32,
    flags: SetTokenFlags,
) -> Result<Vec<u8>, AklogError> {
    if token.ticket.len() > MAXKTCTICKETLEN {
        error!(len = token.ticket.len(), "ticket too long for the token cache");
        return Err(AklogError::TokenInstallFailed(KTC_INVAL));
    }
    let buffer = TokenBuffer {
        ticket: token.ticket.clone(),
        clear_token: clear_token(token, client, uid)?,
        flags: flags.bits(),
        cell: NullString::from(token.server.cell.as_str()),
    };
    buffer.to_bytes()
}

/// Decode one get-token reply into the token and the identity it was set for.
pub fn decode_get_token(buf: &[u8]) -> Result<(Token, ClientIdentity), AklogError> {
    let reply = TokenBuffer::from_bytes(buf)?;
    let cell = reply.cell.to_string();
    let ct = &reply.clear_token;

    let from_secs = |v: i32| from_epoch_secs(u32::try_from(v).unwrap_or(0));
    let name = if (ct.end.wrapping_sub(ct.begin)) & 1 == 1 {
        format!("{AFS_ID_PREFIX}{}", ct.vice_id)
    } else {
        format!("{UNIX_UID_PREFIX}{}", ct.vice_id)
    };

    let token = Token {
        server: ServerIdentity::afs(&cell),
        kvno: ct.auth_handle,
        session_key: ct.handshake_key.to_vec(),
        start_time: from_secs(ct.begin),
        end_time: from_secs(ct.end),
        ticket: reply.ticket,
    };
    let client = ClientIdentity {
        name,
        instance: String::new(),
        cell,
    };
    Ok((token, client))
}
