//! In-memory stand-ins for every collaborator, used by the unit tests.

use crate::ccache::{CredentialCache, CredentialCacheContents};
use crate::cell::{CellConfig, CellDescriptor};
use crate::convert::{LegacyConverter, LegacyCredential};
use crate::error::AklogError;
use crate::hostname::HostNames;
use crate::install::PrincipalDatabase;
use crate::negotiate::{NegotiationFailure, TicketSource};
use crate::path::FilesystemProbe;
use crate::proto::{from_epoch_secs, Principal, ServiceTicket};
use crate::token::{ClientIdentity, ServerIdentity, Token, TokenCache, ANONYMOUSID};
use futures::future::{self, FutureExt, LocalBoxFuture};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

pub fn cell(name: &str, hosts: &[&str]) -> CellDescriptor {
    CellDescriptor {
        name: name.to_string(),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        linked_cell: None,
    }
}

/// A ticket issued at 1000 and valid until `end_secs`.
pub fn ticket_for(client: &Principal, server: &Principal, end_secs: u32) -> ServiceTicket {
    let components: Vec<&str> = server.components.iter().map(String::as_str).collect();
    ServiceTicket {
        client: client.clone(),
        server: server.clone(),
        enctype: 3,
        session_key: vec![0x5a; 8],
        auth_time: from_epoch_secs(1_000),
        start_time: None,
        end_time: from_epoch_secs(end_secs),
        ticket: crate::asn1::tagged_ticket::tests::encode_ticket(&components, &server.realm, 2),
    }
}

/// Hands out the tickets it was built with, and fails every other request.
pub struct MockTicketSource {
    tickets: Vec<ServiceTicket>,
    failure: NegotiationFailure,
    hang: Option<String>,
    attempts: RefCell<Vec<String>>,
}

impl MockTicketSource {
    pub fn succeed_on(tickets: &[ServiceTicket]) -> Self {
        MockTicketSource {
            tickets: tickets.to_vec(),
            failure: NegotiationFailure::PrincipalUnknown,
            hang: None,
            attempts: RefCell::new(Vec::new()),
        }
    }

    pub fn fail_with(mut self, failure: NegotiationFailure) -> Self {
        self.failure = failure;
        self
    }

    /// Never answer requests for `service`.
    pub fn hang_on(mut self, service: &str) -> Self {
        self.hang = Some(service.to_string());
        self
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.borrow().clone()
    }
}

impl TicketSource for MockTicketSource {
    fn request_service_ticket<'a>(
        &'a self,
        client: &'a Principal,
        service: &'a Principal,
    ) -> LocalBoxFuture<'a, Result<ServiceTicket, NegotiationFailure>> {
        let name = service.to_string();
        self.attempts.borrow_mut().push(name.clone());

        if self.hang.as_deref() == Some(name.as_str()) {
            return future::pending().boxed_local();
        }

        let found = self
            .tickets
            .iter()
            .find(|t| t.server == *service && t.client == *client)
            .cloned()
            .ok_or_else(|| self.failure.clone());
        future::ready(found).boxed_local()
    }
}

pub struct MockConverter {
    credential: Option<LegacyCredential>,
}

impl MockConverter {
    pub fn new(credential: LegacyCredential) -> Self {
        MockConverter {
            credential: Some(credential),
        }
    }

    pub fn failing() -> Self {
        MockConverter { credential: None }
    }
}

impl LegacyConverter for MockConverter {
    fn downgrade<'a>(
        &'a self,
        _ticket: &'a ServiceTicket,
    ) -> LocalBoxFuture<'a, Result<LegacyCredential, AklogError>> {
        let result = self.credential.clone().ok_or(AklogError::ConversionFailed);
        future::ready(result).boxed_local()
    }
}

#[derive(Default)]
pub struct MockTokenCache {
    tokens: RefCell<Vec<(Token, ClientIdentity)>>,
    set_calls: Cell<usize>,
    failure: Option<i32>,
}

impl MockTokenCache {
    /// Refuse every install with `code`.
    pub fn failing(mut self, code: i32) -> Self {
        self.failure = Some(code);
        self
    }

    pub fn preload(&self, token: Token) {
        let client = ClientIdentity {
            name: "Unix UID 1000".to_string(),
            instance: String::new(),
            cell: token.server.cell.clone(),
        };
        self.tokens.borrow_mut().push((token, client));
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.get()
    }

    pub fn installed(&self, cell: &str) -> Option<(Token, ClientIdentity)> {
        self.tokens
            .borrow()
            .iter()
            .find(|(t, _)| t.server.cell == cell)
            .cloned()
    }

    pub fn cells(&self) -> Vec<String> {
        self.tokens
            .borrow()
            .iter()
            .map(|(t, _)| t.server.cell.clone())
            .collect()
    }
}

impl TokenCache for MockTokenCache {
    fn get_token(
        &self,
        server: &ServerIdentity,
    ) -> Result<Option<(Token, ClientIdentity)>, AklogError> {
        Ok(self.installed(&server.cell))
    }

    fn set_token(
        &self,
        token: &Token,
        client: &ClientIdentity,
        _setpag: bool,
    ) -> Result<(), AklogError> {
        self.set_calls.set(self.set_calls.get() + 1);
        if let Some(code) = self.failure {
            return Err(AklogError::TokenInstallFailed(code));
        }
        let mut tokens = self.tokens.borrow_mut();
        tokens.retain(|(t, _)| t.server.cell != token.server.cell);
        tokens.push((token.clone(), client.clone()));
        Ok(())
    }
}

/// Unknown names resolve to the anonymous id.
#[derive(Default)]
pub struct MockPrincipalDatabase {
    users: BTreeMap<String, i32>,
    next_id: Option<i32>,
    lookups: RefCell<Vec<String>>,
    created: RefCell<Vec<String>>,
}

impl MockPrincipalDatabase {
    pub fn with_user(mut self, name: &str, id: i32) -> Self {
        self.users.insert(name.to_string(), id);
        self
    }

    /// The id handed out by the next registration. Without it registration fails.
    pub fn with_next_id(mut self, id: i32) -> Self {
        self.next_id = Some(id);
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.borrow().clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.created.borrow().clone()
    }
}

impl PrincipalDatabase for MockPrincipalDatabase {
    fn name_to_id<'a>(
        &'a self,
        _cell: &'a str,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<i32, AklogError>> {
        self.lookups.borrow_mut().push(name.to_string());
        let id = self.users.get(name).copied().unwrap_or(ANONYMOUSID);
        future::ready(Ok(id)).boxed_local()
    }

    fn create_user<'a>(
        &'a self,
        _cell: &'a str,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<i32, AklogError>> {
        self.created.borrow_mut().push(name.to_string());
        let result = self.next_id.ok_or(AklogError::PrincipalDatabase);
        future::ready(result).boxed_local()
    }
}

/// Mount points, owning cells and volume servers, keyed on the full path.
#[derive(Default)]
pub struct MockFilesystem {
    mount_points: BTreeMap<String, String>,
    cells: BTreeMap<String, String>,
    hosts: BTreeMap<String, Vec<Ipv4Addr>>,
}

impl MockFilesystem {
    pub fn with_mount_point(mut self, path: &str, mp: &str) -> Self {
        self.mount_points.insert(path.to_string(), mp.to_string());
        self
    }

    pub fn with_owning_cell(mut self, path: &str, cell: &str) -> Self {
        self.cells.insert(path.to_string(), cell.to_string());
        self
    }

    pub fn with_hosts(mut self, path: &str, hosts: &[Ipv4Addr]) -> Self {
        self.hosts.insert(path.to_string(), hosts.to_vec());
        self
    }
}

impl FilesystemProbe for MockFilesystem {
    fn stat_mount_point(&self, dir: &Path, last: &str) -> Option<String> {
        let full = dir.join(last);
        self.mount_points.get(&*full.to_string_lossy()).cloned()
    }

    fn owning_cell(&self, path: &Path) -> Option<String> {
        self.cells.get(&*path.to_string_lossy()).cloned()
    }

    fn volume_hosts(&self, path: &Path) -> Vec<Ipv4Addr> {
        self.hosts
            .get(&*path.to_string_lossy())
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct MockHostNames {
    names: BTreeMap<Ipv4Addr, String>,
}

impl MockHostNames {
    pub fn with_name(mut self, addr: Ipv4Addr, name: &str) -> Self {
        self.names.insert(addr, name.to_string());
        self
    }
}

impl HostNames for MockHostNames {
    fn host_name(&self, addr: Ipv4Addr) -> Option<String> {
        self.names.get(&addr).cloned()
    }
}

pub struct MockCellConfig {
    local: String,
    cells: Vec<CellDescriptor>,
}

impl MockCellConfig {
    pub fn new(local: &str, cells: Vec<CellDescriptor>) -> Self {
        MockCellConfig {
            local: local.to_string(),
            cells,
        }
    }
}

impl CellConfig for MockCellConfig {
    fn local_cell(&self) -> Result<String, AklogError> {
        Ok(self.local.clone())
    }

    fn load_cell(&self, name: &str) -> Result<CellDescriptor, AklogError> {
        self.cells
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or(AklogError::CellNotFound)
    }
}

/// A ccache that only knows its default principal.
pub struct MockCredentialCache {
    principal: Option<Principal>,
    loads: Cell<usize>,
}

impl MockCredentialCache {
    pub fn new(principal: Principal) -> Self {
        MockCredentialCache {
            principal: Some(principal),
            loads: Cell::new(0),
        }
    }

    pub fn empty() -> Self {
        MockCredentialCache {
            principal: None,
            loads: Cell::new(0),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.get()
    }
}

impl CredentialCache for MockCredentialCache {
    fn name(&self) -> String {
        "MEMORY:test".to_string()
    }

    fn load(&self) -> Result<CredentialCacheContents, AklogError> {
        self.loads.set(self.loads.get() + 1);
        let default_principal = self.principal.clone().ok_or(AklogError::NoCredentials)?;
        Ok(CredentialCacheContents {
            default_principal,
            credentials: Vec::new(),
        })
    }
}
