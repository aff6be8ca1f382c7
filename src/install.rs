use crate::convert::ConvertedToken;
use crate::error::AklogError;
use crate::token::{ClientIdentity, TokenCache, ANONYMOUSID};
use futures::future::LocalBoxFuture;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Maps account names to protection server ids.
pub trait PrincipalDatabase {
    fn name_to_id<'a>(
        &'a self,
        cell: &'a str,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<i32, AklogError>>;

    fn create_user<'a>(
        &'a self,
        cell: &'a str,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<i32, AklogError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub force: bool,
    pub noprdb: bool,
    pub allow_register: bool,
    pub setpag: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { client: ClientIdentity },
    /// The same credential is already in the cache.
    Unchanged,
}

pub struct TokenInstaller<'a> {
    cache: &'a dyn TokenCache,
    prdb: &'a dyn PrincipalDatabase,
    options: InstallOptions,
}

impl<'a> TokenInstaller<'a> {
    pub fn new(
        cache: &'a dyn TokenCache,
        prdb: &'a dyn PrincipalDatabase,
        options: InstallOptions,
    ) -> Self {
        TokenInstaller {
            cache,
            prdb,
            options,
        }
    }

    fn already_installed(&self, converted: &ConvertedToken) -> bool {
        if self.options.force {
            return false;
        }
        match self.cache.get_token(&converted.token.server) {
            Ok(Some((existing, _))) => existing.same_credential(&converted.token),
            Ok(None) => false,
            Err(err) => {
                debug!(?err, server = %converted.token.server, "unable to read existing token");
                false
            }
        }
    }

    /// Install `converted` for the cell it names. `user_realm` is the realm of
    /// the authenticated user and `cell_realm` the realm the service ticket
    /// came from.
    pub async fn install(
        &self,
        converted: &ConvertedToken,
        user_realm: &str,
        cell_realm: &str,
    ) -> Result<InstallOutcome, AklogError> {
        if self.already_installed(converted) {
            info!(server = %converted.token.server, "Identical tokens already exist; skipping");
            return Ok(InstallOutcome::Unchanged);
        }

        let cell = converted.token.server.cell.as_str();
        let mut username = converted.username.clone();

        if self.options.noprdb {
            debug!(%username, "Not resolving name to id");
        } else {
            let foreign = user_realm != cell_realm;
            if foreign {
                username.push('@');
                username.push_str(user_realm);
            }

            debug!(%username, %cell, "About to resolve name to id");
            match self.prdb.name_to_id(cell, &username).await {
                Ok(mut vice_id) => {
                    if vice_id == ANONYMOUSID && foreign && self.options.allow_register {
                        vice_id = self.register(converted, &username, user_realm).await;
                    }
                    if vice_id != ANONYMOUSID {
                        username = format!("AFS ID {vice_id}");
                    }
                }
                Err(err) => {
                    warn!(?err, %username, %cell, "unable to resolve name to id");
                }
            }
        }

        let client = ClientIdentity {
            name: username,
            instance: String::new(),
            cell: user_realm.to_string(),
        };
        debug!(name = %client.name, cell = %client.cell, "Setting tokens");

        self.cache
            .set_token(&converted.token, &client, self.options.setpag)
            .map_err(|err| {
                error!(?err, %cell, "unable to obtain tokens for cell");
                err
            })?;

        Ok(InstallOutcome::Installed { client })
    }

    /// First-time registration of a foreign user. The token has to be in place
    /// under the plain name before the protection server will accept it.
    async fn register(&self, converted: &ConvertedToken, username: &str, user_realm: &str) -> i32 {
        let cell = converted.token.server.cell.as_str();
        info!(%username, %cell, "doing first-time registration");

        let client = ClientIdentity {
            name: username.to_string(),
            instance: String::new(),
            cell: user_realm.to_string(),
        };
        if let Err(err) = self.cache.set_token(&converted.token, &client, false) {
            error!(?err, %cell, "unable to obtain tokens for cell");
        }

        match self.prdb.create_user(cell, username).await {
            Ok(id) => {
                info!(%username, id, %cell, "created cross-cell entry");
                id
            }
            Err(err) => {
                error!(?err, %username, %cell, "unable to create remote PTS user");
                ANONYMOUSID
            }
        }
    }
}

/// The OpenAFS `pts` tool.
#[derive(Debug, Clone)]
pub struct PtsCommand {
    command: String,
}

impl PtsCommand {
    pub fn new(command: &str) -> Self {
        PtsCommand {
            command: command.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<(bool, String, String), AklogError> {
        let output = Command::new(&self.command)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                error!(?err, command = %self.command, "unable to run pts");
                AklogError::PrincipalDatabase
            })?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }

    async fn examine(&self, cell: &str, name: &str) -> Result<i32, AklogError> {
        let (ok, stdout, stderr) = self
            .run(&["examine", name, "-cell", cell, "-noauth"])
            .await?;
        if !ok {
            if stderr.contains("doesn't exist") {
                return Ok(ANONYMOUSID);
            }
            error!(%stderr, %name, %cell, "pts examine failed");
            return Err(AklogError::PrincipalDatabase);
        }
        parse_examine(&stdout).ok_or_else(|| {
            error!(%stdout, "unable to parse pts examine output");
            AklogError::PrincipalDatabase
        })
    }

    async fn createuser(&self, cell: &str, name: &str) -> Result<i32, AklogError> {
        let (ok, stdout, stderr) = self
            .run(&["createuser", "-name", name, "-cell", cell])
            .await?;
        if !ok {
            error!(%stderr, %name, %cell, "pts createuser failed");
            return Err(AklogError::PrincipalDatabase);
        }
        parse_createuser(&stdout).ok_or_else(|| {
            error!(%stdout, "unable to parse pts createuser output");
            AklogError::PrincipalDatabase
        })
    }
}

impl PrincipalDatabase for PtsCommand {
    fn name_to_id<'a>(
        &'a self,
        cell: &'a str,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<i32, AklogError>> {
        Box::pin(self.examine(cell, name))
    }

    fn create_user<'a>(
        &'a self,
        cell: &'a str,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<i32, AklogError>> {
        Box::pin(self.createuser(cell, name))
    }
}

/// `Name: jdoe, id: 1234, owner: system:administrators, ...`
fn parse_examine(out: &str) -> Option<i32> {
    let rest = &out[out.find("id: ")? + 4..];
    let end = rest.find(',').unwrap_or(rest.len());
    rest[..end].trim().parse().ok()
}

/// `User jdoe@EXAMPLE.COM has id 1234`
fn parse_createuser(out: &str) -> Option<i32> {
    let rest = &out[out.find("has id ")? + 7..];
    rest.split_whitespace().next()?.parse().ok()
}
