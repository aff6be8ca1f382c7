use crate::ccache::CredentialCache;
use crate::cell::CellDescriptor;
use crate::error::AklogError;
use crate::proto::{Principal, ServiceTicket, DES_ENCTYPES};
use crate::realm::RealmResolver;
use futures::future::LocalBoxFuture;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tracing::{debug, error, info, trace, warn};

/// `kvno -e` name of the session key type rxkad needs.
const KVNO_DES_ENCTYPE: &str = "des-cbc-crc";

/// Why a single service ticket request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationFailure {
    PrincipalUnknown,
    Generic,
    /// The caller should move on to the next candidate principal.
    TryAgain,
    TimedOut,
    /// Some Kerberos libraries answer the first request of a process with this.
    MessageType,
    Other(String),
}

impl NegotiationFailure {
    /// Classify the diagnostic text printed by the MIT tools.
    pub fn from_message(msg: &str) -> Self {
        let lower = msg.to_ascii_lowercase();
        if lower.contains("not found in kerberos database") {
            NegotiationFailure::PrincipalUnknown
        } else if lower.contains("generic error") {
            NegotiationFailure::Generic
        } else if lower.contains("message type") {
            NegotiationFailure::MessageType
        } else {
            NegotiationFailure::Other(msg.trim().to_string())
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NegotiationFailure::PrincipalUnknown
                | NegotiationFailure::Generic
                | NegotiationFailure::TryAgain
                | NegotiationFailure::TimedOut
        )
    }
}

/// Which candidate principal is being tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// `afs/<cell>@<realm given by the caller>`
    ExplicitRealm,
    /// `afs/<cell>@<realm of the user>`
    UserRealm,
    /// `afs/<cell>@<realm mapped from the database server>`, possibly empty.
    DeducedRealm,
    /// `afs/<cell>@<upper-cased domain of the database server>`
    UppercaseDomain,
    /// `afs@<realm>`, only when the cell and realm names agree.
    NoInstance,
    Done,
}

/// Decide which principal to try after `failure` in `state`. `realm` is the
/// realm the failed attempt used.
pub fn next_state(
    state: NegotiationState,
    cell: &str,
    realm: &str,
    failure: &NegotiationFailure,
) -> NegotiationState {
    if !failure.is_retryable() {
        return NegotiationState::Done;
    }

    let same_name = || {
        if cell.eq_ignore_ascii_case(realm) {
            NegotiationState::NoInstance
        } else {
            NegotiationState::Done
        }
    };

    match state {
        NegotiationState::ExplicitRealm => same_name(),
        NegotiationState::UserRealm => NegotiationState::DeducedRealm,
        NegotiationState::DeducedRealm if realm.is_empty() => NegotiationState::UppercaseDomain,
        NegotiationState::DeducedRealm | NegotiationState::UppercaseDomain => same_name(),
        NegotiationState::NoInstance | NegotiationState::Done => NegotiationState::Done,
    }
}

/// The state of one round of negotiation for one cell.
#[derive(Debug)]
pub struct AuthAttemptState {
    pub state: NegotiationState,
    pub realm: String,
    attempted: Vec<(Principal, NegotiationFailure)>,
}

impl AuthAttemptState {
    pub fn new(explicit_realm: Option<&str>, user_realm: &str) -> Self {
        let (state, realm) = match explicit_realm.filter(|r| !r.is_empty()) {
            Some(realm) => (NegotiationState::ExplicitRealm, realm),
            None => (NegotiationState::UserRealm, user_realm),
        };
        AuthAttemptState {
            state,
            realm: realm.to_string(),
            attempted: Vec::new(),
        }
    }

    pub fn service(&self, cell: &str) -> Principal {
        match self.state {
            NegotiationState::NoInstance => Principal::afs_service(None, &self.realm),
            _ => Principal::afs_service(Some(cell), &self.realm),
        }
    }

    fn previous(&self, service: &Principal) -> Option<NegotiationFailure> {
        self.attempted
            .iter()
            .find(|(p, _)| p == service)
            .map(|(_, f)| f.clone())
    }

    fn record(&mut self, service: Principal, failure: NegotiationFailure) {
        self.attempted.push((service, failure));
    }
}

/// Obtains service tickets.
pub trait TicketSource {
    fn request_service_ticket<'a>(
        &'a self,
        client: &'a Principal,
        service: &'a Principal,
    ) -> LocalBoxFuture<'a, Result<ServiceTicket, NegotiationFailure>>;
}

pub struct Negotiator<'a> {
    source: &'a dyn TicketSource,
    resolver: &'a RealmResolver,
    attempt_timeout: Duration,
}

impl<'a> Negotiator<'a> {
    pub fn new(
        source: &'a dyn TicketSource,
        resolver: &'a RealmResolver,
        attempt_timeout: Duration,
    ) -> Self {
        Negotiator {
            source,
            resolver,
            attempt_timeout,
        }
    }

    /// Get an AFS service ticket for `cell`, returning it with the realm that
    /// worked.
    pub async fn negotiate(
        &self,
        client: &Principal,
        cell: &CellDescriptor,
        explicit_realm: Option<&str>,
    ) -> Result<(ServiceTicket, String), AklogError> {
        let mut round = 1;
        let (ticket, mut realm) = loop {
            match self.run_round(client, cell, explicit_realm).await {
                Err(AklogError::AuthenticationFailed(NegotiationFailure::MessageType))
                    if round == 1 =>
                {
                    warn!(
                        cell = %cell.name,
                        "wrong message type on first round, retrying once"
                    );
                    round += 1;
                }
                other => break other?,
            }
        };

        if realm.is_empty() {
            match ticket.ticket_realm() {
                Ok(ticket_realm) => {
                    debug!(%ticket_realm, "realm taken from the service ticket");
                    realm = ticket_realm;
                }
                Err(_) => {
                    error!(
                        cell = %cell.name,
                        "Couldn't decode ticket to determine realm for cell"
                    );
                }
            }
        }

        Ok((ticket, realm))
    }

    async fn run_round(
        &self,
        client: &Principal,
        cell: &CellDescriptor,
        explicit_realm: Option<&str>,
    ) -> Result<(ServiceTicket, String), AklogError> {
        let mut attempt = AuthAttemptState::new(explicit_realm, &client.realm);

        loop {
            let service = attempt.service(&cell.name);
            let result = match attempt.previous(&service) {
                Some(failure) => {
                    trace!(%service, "already tried in this round");
                    Err(failure)
                }
                None => self.request(client, &service).await,
            };

            let failure = match result {
                Ok(ticket) => {
                    info!(%service, "obtained service ticket");
                    return Ok((ticket, attempt.realm));
                }
                Err(failure) => failure,
            };

            debug!(%service, ?failure, "service ticket request failed");
            let next = next_state(attempt.state, &cell.name, &attempt.realm, &failure);
            attempt.record(service, failure.clone());

            match next {
                NegotiationState::Done => {
                    return Err(AklogError::AuthenticationFailed(failure));
                }
                NegotiationState::DeducedRealm => {
                    attempt.realm = self.resolver.realm_of_cell(cell, false)?;
                    if attempt.realm.is_empty() {
                        debug!("We've deduced that we need to authenticate using referrals");
                    } else {
                        debug!(
                            realm = %attempt.realm,
                            "We've deduced that we need to authenticate to realm"
                        );
                    }
                }
                NegotiationState::UppercaseDomain => {
                    attempt.realm = self.resolver.realm_of_cell(cell, true)?;
                    debug!(
                        realm = %attempt.realm,
                        "We've deduced that we need to authenticate to realm"
                    );
                }
                _ => {}
            }
            attempt.state = next;
        }
    }

    async fn request(
        &self,
        client: &Principal,
        service: &Principal,
    ) -> Result<ServiceTicket, NegotiationFailure> {
        debug!(%service, "Getting tickets");
        tokio::time::timeout(
            self.attempt_timeout,
            self.source.request_service_ticket(client, service),
        )
        .await
        .unwrap_or_else(|_| {
            warn!(%service, "service ticket request timed out");
            Err(NegotiationFailure::TimedOut)
        })
    }
}

/// Serves tickets out of the credential cache. Missing tickets are obtained
/// with the MIT `kvno` tool, which stores them into the same cache. Only
/// tickets with a DES session key count, anything else is treated as missing.
pub struct CachedTicketSource {
    ccache: Box<dyn CredentialCache>,
    kvno_command: Option<String>,
}

impl CachedTicketSource {
    pub fn new(ccache: Box<dyn CredentialCache>, kvno_command: Option<String>) -> Self {
        CachedTicketSource {
            ccache,
            kvno_command: kvno_command.filter(|c| !c.is_empty()),
        }
    }

    fn lookup(
        &self,
        client: &Principal,
        service: &Principal,
    ) -> Result<Option<ServiceTicket>, NegotiationFailure> {
        let contents = self.ccache.load().map_err(|err| {
            error!(?err, ccache = %self.ccache.name(), "unable to read credential cache");
            NegotiationFailure::Other("unable to read credential cache".to_string())
        })?;
        Ok(contents
            .find(client, service, SystemTime::now(), &DES_ENCTYPES)
            .cloned())
    }

    async fn fetch(&self, command: &str, service: &Principal) -> Result<(), NegotiationFailure> {
        let output = Command::new(command)
            .arg("-e")
            .arg(KVNO_DES_ENCTYPE)
            .arg(service.to_string())
            .env("KRB5CCNAME", self.ccache.name())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                error!(?err, %command, "unable to run ticket fetch command");
                NegotiationFailure::Other(format!("unable to run {command}"))
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(%service, status = ?output.status, %stderr, "ticket fetch failed");
        Err(NegotiationFailure::from_message(&stderr))
    }
}

impl TicketSource for CachedTicketSource {
    fn request_service_ticket<'a>(
        &'a self,
        client: &'a Principal,
        service: &'a Principal,
    ) -> LocalBoxFuture<'a, Result<ServiceTicket, NegotiationFailure>> {
        Box::pin(async move {
            if let Some(ticket) = self.lookup(client, service)? {
                trace!(%service, "service ticket found in credential cache");
                return Ok(ticket);
            }

            let Some(command) = self.kvno_command.as_deref() else {
                return Err(NegotiationFailure::PrincipalUnknown);
            };
            self.fetch(command, service).await?;

            self.lookup(client, service)?
                .ok_or(NegotiationFailure::PrincipalUnknown)
        })
    }
}
