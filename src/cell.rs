use crate::error::AklogError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellDescriptor {
    pub name: String,
    /// Database server host names, in configuration order.
    pub hosts: Vec<String>,
    pub linked_cell: Option<String>,
}

pub trait CellConfig {
    fn local_cell(&self) -> Result<String, AklogError>;

    fn load_cell(&self, name: &str) -> Result<CellDescriptor, AklogError>;
}

/// The OpenAFS client configuration directory, `ThisCell` plus `CellServDB`.
#[derive(Debug, Clone)]
pub struct CellServDb {
    dir: PathBuf,
}

impl CellServDb {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        CellServDb {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn read(&self, file: &str) -> Result<String, AklogError> {
        let path = self.dir.join(file);
        fs::read_to_string(&path).map_err(|err| {
            error!(?err, path = %path.display(), "can't get afs configuration");
            AklogError::AfsConfigMissing
        })
    }

    fn cells(&self) -> Result<Vec<CellDescriptor>, AklogError> {
        self.read("CellServDB").map(|s| parse_cellservdb(&s))
    }
}

impl CellConfig for CellServDb {
    fn local_cell(&self) -> Result<String, AklogError> {
        let contents = self.read("ThisCell")?;
        match contents.split_whitespace().next() {
            Some(cell) => Ok(cell.to_string()),
            None => {
                error!("can't determine local cell");
                Err(AklogError::AfsConfigMissing)
            }
        }
    }

    fn load_cell(&self, name: &str) -> Result<CellDescriptor, AklogError> {
        let cells = self.cells()?;
        if let Some(cell) = cells.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
            return Ok(cell.clone());
        }

        // An unambiguous prefix is accepted as an abbreviation.
        let lname = name.to_ascii_lowercase();
        let mut candidates = cells
            .into_iter()
            .filter(|c| c.name.to_ascii_lowercase().starts_with(&lname));
        match (candidates.next(), candidates.next()) {
            (Some(cell), None) if !name.is_empty() => {
                debug!(%name, cell = %cell.name, "expanded abbreviated cell name");
                Ok(cell)
            }
            _ => {
                error!(%name, "can't get information about cell");
                Err(AklogError::CellNotFound)
            }
        }
    }
}

/// Each cell starts with `>name [linkedcell] #comment`. Each server then follows
/// on its own line as `address #hostname`.
fn parse_cellservdb(contents: &str) -> Vec<CellDescriptor> {
    let mut cells: Vec<CellDescriptor> = Vec::new();

    for line in contents.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('>') {
            let decl = rest.split('#').next().unwrap_or("");
            let mut words = decl.split_whitespace();
            let Some(name) = words.next() else {
                trace!(%line, "ignoring cell line without a name");
                continue;
            };
            cells.push(CellDescriptor {
                name: name.to_string(),
                hosts: Vec::new(),
                linked_cell: words.next().map(str::to_string),
            });
            continue;
        }

        let Some(cell) = cells.last_mut() else {
            trace!(%line, "ignoring server line outside of a cell");
            continue;
        };

        let (addr, host) = match line.split_once('#') {
            Some((addr, host)) => (addr.trim(), host.trim()),
            None => (line, ""),
        };
        let host = host.split_whitespace().next().unwrap_or(addr);
        if !host.is_empty() {
            cell.hosts.push(host.to_string());
        }
    }

    cells
}
