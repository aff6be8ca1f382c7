use aklog::ccache;
use aklog::cell::{CellConfig, CellServDb};
use aklog::config::{Config, TokenFormatKind};
use aklog::convert::{Krb524Client, TokenFormat};
use aklog::error::{AklogError, Status};
use aklog::hostname::SystemHostNames;
use aklog::install::{InstallOptions, PtsCommand};
use aklog::negotiate::CachedTicketSource;
use aklog::pioctl::Pioctl;
use aklog::realm::RealmResolver;
use aklog::session::{self, CellTarget, Collaborators, Options, Request, Session};
use clap::{ArgMatches, CommandFactory, FromArgMatches};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, Level};

#[derive(Debug, clap::Parser)]
#[clap(about = "Obtain AFS tokens from Kerberos 5 credentials")]
#[clap(after_help = "No targets means authenticate to the local cell.")]
struct Cli {
    /// Give debugging information. Twice for more.
    #[clap(short, long, action = clap::ArgAction::Count)]
    debug: u8,
    /// A cell to authenticate to.
    #[clap(short, long)]
    cell: Vec<String>,
    /// The Kerberos realm of the cell named just before it.
    #[clap(short = 'k', long = "realm")]
    realm: Vec<String>,
    /// A directory whose cells to authenticate to.
    #[clap(short, long)]
    path: Vec<String>,
    /// Cells, or paths when they contain a '/'.
    targets: Vec<String>,
    /// Print zephyr subscription information.
    #[clap(long)]
    zsubs: bool,
    /// Print host address information.
    #[clap(long)]
    hosts: bool,
    /// Do not try to get tokens.
    #[clap(long)]
    noauth: bool,
    /// Do not try to determine the AFS id.
    #[clap(long)]
    noprdb: bool,
    /// Replace identical tokens.
    #[clap(long)]
    force: bool,
    /// Set the AFS process authentication group.
    #[clap(long)]
    setpag: bool,
    /// If the cell is linked, authenticate to both.
    #[clap(long)]
    linked: bool,
    /// Use the krb524 converter instead of the v5 ticket.
    #[clap(long = "524")]
    krb524: bool,
    #[clap(long, env = "AKLOG_CONFIG")]
    config: Option<PathBuf>,
}

fn is_path(target: &str) -> bool {
    target.contains('/') || target == "." || target == ".."
}

enum Target {
    Cell(String),
    Path(String),
}

/// Targets in command line order. A realm binds to the cell right before it.
fn build_request(cli: &Cli, matches: &ArgMatches) -> Result<Request, ()> {
    let indices = |id: &str| -> Vec<usize> {
        matches
            .indices_of(id)
            .map(|i| i.collect())
            .unwrap_or_default()
    };

    let mut targets: Vec<(usize, Target)> = Vec::new();
    for (idx, cell) in indices("cell").into_iter().zip(&cli.cell) {
        targets.push((idx, Target::Cell(cell.clone())));
    }
    for (idx, path) in indices("path").into_iter().zip(&cli.path) {
        targets.push((idx, Target::Path(path.clone())));
    }
    for (idx, target) in indices("targets").into_iter().zip(&cli.targets) {
        let target = if is_path(target) {
            Target::Path(target.clone())
        } else {
            Target::Cell(target.clone())
        };
        targets.push((idx, target));
    }
    targets.sort_by_key(|(idx, _)| *idx);

    let mut realms: Vec<Option<String>> = vec![None; targets.len()];
    for (idx, realm) in indices("realm").into_iter().zip(&cli.realm) {
        let Some(pos) = targets.iter().rposition(|(t, _)| *t < idx) else {
            error!(%realm, "a realm must follow a cell");
            return Err(());
        };
        if !matches!(targets[pos].1, Target::Cell(_)) || realms[pos].is_some() {
            error!(%realm, "a realm must follow a cell");
            return Err(());
        }
        realms[pos] = Some(realm.clone());
    }

    let mut request = Request::default();
    for ((_, target), realm) in targets.into_iter().zip(realms) {
        match target {
            Target::Cell(cell) => request.cells.push(CellTarget { cell, realm }),
            Target::Path(path) => request.paths.push(path),
        }
    }
    Ok(request)
}

fn exit(status: Status) -> ExitCode {
    ExitCode::from(u8::from(status))
}

fn fail(err: &AklogError) -> ExitCode {
    debug!(?err, "aklog stopped");
    exit(err.status())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let matches = match Cli::command().try_get_matches() {
        Ok(m) => m,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                exit(Status::Usage)
            } else {
                exit(Status::Success)
            };
        }
    };
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return exit(Status::Usage);
        }
    };

    let level = match cli.debug {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let Ok(request) = build_request(&cli, &matches) else {
        return exit(Status::Usage);
    };

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(err) => return fail(&err),
    };
    debug!(?config, "configuration loaded");

    let cells = CellServDb::new(&config.afs_config_dir);
    let local_cell = match cells.local_cell() {
        Ok(c) => c,
        Err(err) => return fail(&err),
    };

    let krb5_conf = config.krb5_config_path();
    let resolver = match RealmResolver::from_krb5_conf(krb5_conf, &config.domain_realm) {
        Ok(r) => r,
        Err(err) => return fail(&err),
    };

    let (identity, ticket_cache) = match (
        ccache::resolve(config.ccache.as_deref()),
        ccache::resolve(config.ccache.as_deref()),
    ) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(err), _) | (_, Err(err)) => return fail(&err),
    };
    let tickets = CachedTicketSource::new(ticket_cache, Some(config.kvno_command.clone()));

    let format = if cli.krb524 || config.token_format == TokenFormatKind::Krb524 {
        TokenFormat::Krb524(Box::new(Krb524Client::new(
            config.krb524_servers.clone(),
            config.attempt_timeout(),
        )))
    } else {
        TokenFormat::Native
    };

    let pioctl = Pioctl::new(&local_cell);
    let prdb = PtsCommand::new(&config.pts_command);

    let options = Options {
        zsubs: cli.zsubs,
        hosts: cli.hosts,
        noauth: cli.noauth,
        linked: cli.linked,
        install: InstallOptions {
            force: cli.force,
            noprdb: cli.noprdb,
            allow_register: config.allow_register,
            setpag: cli.setpag,
        },
        max_symlinks: config.max_symlinks,
        attempt_timeout: config.attempt_timeout(),
        xlog: session::xlog_path(),
    };

    let mut session = Session::new(
        options,
        Collaborators {
            cells: &cells,
            ccache: &*identity,
            tickets: &tickets,
            format: &format,
            tokens: &pioctl,
            prdb: &prdb,
            probe: &pioctl,
            hostnames: &SystemHostNames,
            resolver: &resolver,
        },
    );

    let status = match session.run(&request).await {
        Ok(status) => status,
        Err(err) => return fail(&err),
    };

    for line in session.report() {
        println!("{line}");
    }
    exit(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Request, ()> {
        let matches = Cli::command()
            .try_get_matches_from(std::iter::once("aklog").chain(args.iter().copied()))
            .map_err(|_| ())?;
        let cli = Cli::from_arg_matches(&matches).map_err(|_| ())?;
        build_request(&cli, &matches)
    }

    #[test]
    fn test_realm_binds_to_preceding_cell() {
        let request = parse(&["-c", "a.org", "-k", "A.ORG", "b.org", "-k", "B.ORG", "c.org"])
            .expect("request");
        let cells: Vec<(&str, Option<&str>)> = request
            .cells
            .iter()
            .map(|c| (c.cell.as_str(), c.realm.as_deref()))
            .collect();
        assert_eq!(
            cells,
            vec![("a.org", Some("A.ORG")), ("b.org", Some("B.ORG")), ("c.org", None)]
        );
    }

    #[test]
    fn test_targets_split_into_cells_and_paths() {
        let request =
            parse(&["example.org", "/afs/example.org", ".", "-p", "rel"]).expect("request");
        assert_eq!(request.cells.len(), 1);
        assert_eq!(request.paths, vec!["/afs/example.org", ".", "rel"]);
    }

    #[test]
    fn test_misplaced_realm_is_usage_error() {
        assert!(parse(&["-k", "A.ORG"]).is_err());
        assert!(parse(&["-p", "/afs", "-k", "A.ORG"]).is_err());
        assert!(parse(&["-c", "a.org", "-k", "A.ORG", "-k", "B.ORG"]).is_err());
    }
}
