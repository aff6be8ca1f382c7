//! One aklog run: the cells and paths asked for, and everything authenticated
//! on the way.

use crate::ccache::CredentialCache;
use crate::cell::{CellConfig, CellDescriptor};
use crate::convert::TokenFormat;
use crate::error::{AklogError, Status};
use crate::hostname::HostNames;
use crate::install::{InstallOptions, InstallOutcome, PrincipalDatabase, TokenInstaller};
use crate::negotiate::{Negotiator, TicketSource};
use crate::path::{
    absolute_path, check_directory, mount_point, mount_point_cell, mount_point_target,
    FilesystemProbe, PathWalker,
};
use crate::proto::Principal;
use crate::realm::RealmResolver;
use crate::token::TokenCache;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uzers::os::unix::UserExt;

const XLOG_FILE: &str = ".xlog";

#[derive(Debug, Clone)]
pub struct Options {
    pub zsubs: bool,
    pub hosts: bool,
    pub noauth: bool,
    pub linked: bool,
    pub install: InstallOptions,
    pub max_symlinks: usize,
    pub attempt_timeout: Duration,
    /// Extra cells read when no target is given.
    pub xlog: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            zsubs: false,
            hosts: false,
            noauth: false,
            linked: false,
            install: InstallOptions::default(),
            max_symlinks: 20,
            attempt_timeout: Duration::from_secs(30),
            xlog: None,
        }
    }
}

/// `~/.xlog` of the calling user.
pub fn xlog_path() -> Option<PathBuf> {
    let user = uzers::get_user_by_uid(uzers::get_current_uid())?;
    Some(user.home_dir().join(XLOG_FILE))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellTarget {
    pub cell: String,
    /// Realm given with `-k`.
    pub realm: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub cells: Vec<CellTarget>,
    pub paths: Vec<String>,
}

impl Request {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.paths.is_empty()
    }

    fn len(&self) -> usize {
        self.cells.len() + self.paths.len()
    }
}

/// Keeps the first occurrence of each entry, in insertion order.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticList(Vec<String>);

impl DiagnosticList {
    pub fn add(&mut self, item: &str) {
        if !self.0.iter().any(|i| i == item) {
            self.0.push(item.to_string());
        }
    }

    pub fn items(&self) -> &[String] {
        &self.0
    }
}

/// The services a session talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub cells: &'a dyn CellConfig,
    pub ccache: &'a dyn CredentialCache,
    pub tickets: &'a dyn TicketSource,
    pub format: &'a TokenFormat,
    pub tokens: &'a dyn TokenCache,
    pub prdb: &'a dyn PrincipalDatabase,
    pub probe: &'a dyn FilesystemProbe,
    pub hostnames: &'a dyn HostNames,
    pub resolver: &'a RealmResolver,
}

pub struct Session<'a> {
    options: Options,
    with: Collaborators<'a>,
    /// Cells already tried, successfully or not.
    authed: BTreeSet<String>,
    zsubs: DiagnosticList,
    hosts: DiagnosticList,
    identity: Option<Principal>,
}

impl<'a> Session<'a> {
    pub fn new(options: Options, with: Collaborators<'a>) -> Self {
        Session {
            options,
            with,
            authed: BTreeSet::new(),
            zsubs: DiagnosticList::default(),
            hosts: DiagnosticList::default(),
            identity: None,
        }
    }

    fn identity(&mut self) -> Result<Principal, AklogError> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }
        let identity = self.with.ccache.default_principal().map_err(|err| {
            error!(?err, ccache = %self.with.ccache.name(), "Couldn't determine realm of user");
            err
        })?;
        debug!(%identity, "authenticated user");
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Get a token for `cell`, or the local cell when it is empty. Returns the
    /// status for this cell and its linked cell. Only fatal errors are `Err`.
    #[instrument(level = "info", skip(self))]
    pub async fn auth_to_cell(
        &mut self,
        cell: &str,
        realm: Option<&str>,
    ) -> Result<(Status, Option<String>), AklogError> {
        let local_cell = self.with.cells.local_cell()?;
        let name = if cell.is_empty() { local_cell.as_str() } else { cell };

        let descriptor = match self.with.cells.load_cell(name) {
            Ok(d) => d,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                error!(?err, cell = %name, "Can't get information about cell");
                return Ok((err.status(), None));
            }
        };
        let linked = descriptor.linked_cell.clone();

        if !self.authed.insert(descriptor.name.clone()) {
            debug!(cell = %descriptor.name, "Already authenticated (or tried to)");
            return Ok((Status::Success, linked));
        }

        self.zsubs.add(&descriptor.name);
        self.zsubs.add(&local_cell);

        if self.options.noauth {
            return Ok((Status::Success, linked));
        }

        debug!(
            cell = %descriptor.name,
            server = descriptor.hosts.first().map(String::as_str).unwrap_or(""),
            "Authenticating to cell"
        );
        match self.authenticate(&descriptor, realm).await {
            Ok(()) => Ok((Status::Success, linked)),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => Ok((err.status(), linked)),
        }
    }

    async fn authenticate(
        &mut self,
        cell: &CellDescriptor,
        realm: Option<&str>,
    ) -> Result<(), AklogError> {
        let client = self.identity()?;

        let negotiator = Negotiator::new(
            self.with.tickets,
            self.with.resolver,
            self.options.attempt_timeout,
        );
        let (ticket, cell_realm) = negotiator.negotiate(&client, cell, realm).await?;

        let converted = self.with.format.convert(&ticket, &cell.name).await?;

        let installer = TokenInstaller::new(self.with.tokens, self.with.prdb, self.options.install);
        match installer.install(&converted, &client.realm, &cell_realm).await? {
            InstallOutcome::Installed { client: holder } => {
                info!(
                    cell = %cell.name,
                    realm = %cell_realm,
                    holder = %holder.name,
                    "token installed"
                );
            }
            InstallOutcome::Unchanged => {}
        }
        Ok(())
    }

    /// Get tokens for every cell `path` crosses.
    #[instrument(level = "info", skip(self))]
    pub async fn auth_to_path(&mut self, path: &str) -> Result<Status, AklogError> {
        let path = absolute_path(path)?;
        let mut status = Status::Success;

        for step in PathWalker::new(&path, self.options.max_symlinks) {
            let dir = step?;
            debug!(%dir, "Checking directory");

            let Some(mp) = mount_point(self.with.probe, &dir) else {
                if let Err(err) = check_directory(&dir) {
                    return Ok(err.status());
                }
                continue;
            };

            let target = mount_point_target(&mp).to_string();
            if self.options.zsubs {
                self.zsubs.add(&target);
            }
            if self.options.zsubs || self.options.hosts {
                self.add_hosts(Path::new(&dir));
            }
            if let Some(cell) = mount_point_cell(&target) {
                let (cell_status, _) = self.auth_to_cell(cell, None).await?;
                status = status.merge(cell_status);
            }
        }
        Ok(status)
    }

    /// Record the server of a volume, only when there is exactly one.
    fn add_hosts(&mut self, dir: &Path) {
        debug!(dir = %dir.display(), "Getting list of hosts");
        let servers = self.with.probe.volume_hosts(dir);
        if servers.len() != 1 {
            return;
        }
        for server in servers {
            if self.options.hosts {
                debug!(%server, "Got host");
                self.hosts.add(&server.to_string());
            }
            if self.options.zsubs {
                if let Some(name) = self.with.hostnames.host_name(server) {
                    debug!(%name, "Got host");
                    self.zsubs.add(&name);
                }
            }
        }
    }

    fn xlog_cells(&self) -> Vec<String> {
        let Some(path) = &self.options.xlog else {
            return Vec::new();
        };
        match fs::read_to_string(path) {
            Ok(contents) => {
                debug!(path = %path.display(), "Reading for cells to authenticate to");
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!(?err, path = %path.display(), "unable to read cell list");
                Vec::new()
            }
        }
    }

    /// Authenticate to everything `request` names, or to the local cell and the
    /// `.xlog` cells when it names nothing.
    pub async fn run(&mut self, request: &Request) -> Result<Status, AklogError> {
        if request.is_empty() {
            return self.run_default().await;
        }

        let mut status = Status::Success;
        let mut failed = false;

        for target in &request.cells {
            let realm = target.realm.as_deref();
            let (cell_status, linked) = self.auth_to_cell(&target.cell, realm).await?;
            status = cell_status;
            if !status.is_success() {
                failed = true;
                continue;
            }
            if let Some(linked) = linked.filter(|_| self.options.linked) {
                debug!(%linked, "Linked cell");
                let (linked_status, _) = self.auth_to_cell(&linked, realm).await?;
                status = linked_status;
                failed |= !status.is_success();
            }
        }

        for path in &request.paths {
            status = self.auth_to_path(path).await?;
            failed |= !status.is_success();
        }

        if failed && request.len() > 1 {
            status = Status::SomethingsWrong;
        }
        Ok(status)
    }

    async fn run_default(&mut self) -> Result<Status, AklogError> {
        let (mut status, linked) = self.auth_to_cell("", None).await?;

        if status.is_success() {
            if let Some(linked) = linked.filter(|_| self.options.linked) {
                debug!(%linked, "Linked cell");
                status = self.auth_to_cell(&linked, None).await?.0;
            }
        }

        for cell in self.xlog_cells() {
            debug!(%cell, "Found cell in cell list");
            let (cell_status, _) = self.auth_to_cell(&cell, None).await?;
            status = if status.is_success() {
                cell_status
            } else {
                Status::SomethingsWrong
            };
        }
        Ok(status)
    }

    /// The diagnostic lines to print, zsubs first.
    pub fn report(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.options.zsubs {
            lines.extend(self.zsubs.items().iter().map(|z| format!("zsub: {z}")));
        }
        if self.options.hosts {
            lines.extend(self.hosts.items().iter().map(|h| format!("host: {h}")));
        }
        lines
    }
}
