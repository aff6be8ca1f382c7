use super::CredentialCache;
use crate::ccache::cc_file::FileCredentialCacheContext;
use crate::error::AklogError;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{error, trace};

/// MIT names the active subsidiary cache of a collection in this file.
fn get_primary(path: &Path) -> Result<Option<PathBuf>, AklogError> {
    let primary = path.join("primary");
    match std::fs::exists(&primary) {
        Ok(true) => {
            let mut f = File::open(&primary).map_err(|e| {
                error!(?primary, ?e, "Failed to open file");
                AklogError::IoError
            })?;
            let mut buffer = String::new();
            f.read_to_string(&mut buffer).map_err(|e| {
                error!(?primary, ?e, "Failed to read file");
                AklogError::IoError
            })?;
            let primary_path = path.join(buffer.trim());
            trace!(?primary_path, "Primary credentials ccache");
            Ok(Some(primary_path))
        }
        Ok(false) => {
            trace!("No primary credentials ccache");
            Ok(None)
        }
        Err(e) => {
            error!(?e, ?primary, "Failed to read primary credentials");
            Err(AklogError::IoError)
        }
    }
}

pub(super) fn resolve(ccache_name: &str) -> Result<Box<dyn CredentialCache>, AklogError> {
    trace!(?ccache_name, "Resolving dir credential cache");

    let ccache_name = ccache_name
        .strip_prefix("DIR:")
        .ok_or(AklogError::UnsupportedCredentialCacheType)?;

    let path = if let Some(subsidiary) = ccache_name.strip_prefix(':') {
        trace!(?subsidiary, "Collection with subsidiary");
        PathBuf::from(subsidiary)
    } else {
        trace!(?ccache_name, "Collection without subsidiary");
        let collection_path = PathBuf::from(ccache_name);
        if !collection_path.is_dir() {
            error!(?collection_path, "Credential cache collection is not a directory");
            return Err(AklogError::NoCredentials);
        }

        // A collection nobody has written a primary into yet uses "tkt".
        get_primary(&collection_path)?.unwrap_or_else(|| collection_path.join("tkt"))
    };

    trace!(?path, "Resolved dir subsidiary credential cache");

    let fcc = FileCredentialCacheContext { path };
    Ok(Box::new(fcc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccache::tests::ccache_bytes;
    use crate::proto::Principal;

    #[test]
    fn test_ccache_dir_primary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = Principal::user("jdoe", "EXAMPLE.ORG");
        std::fs::write(dir.path().join("tkt7"), ccache_bytes(&client, &[])).expect("write");
        std::fs::write(dir.path().join("primary"), "tkt7\n").expect("write");

        let cc = resolve(&format!("DIR:{}", dir.path().display())).expect("resolve");
        assert!(cc.name().ends_with("tkt7"));
        assert_eq!(cc.default_principal().ok(), Some(client));
    }

    #[test]
    fn test_ccache_dir_subsidiary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = Principal::user("jdoe", "EXAMPLE.ORG");
        let sub = dir.path().join("tktX");
        std::fs::write(&sub, ccache_bytes(&client, &[])).expect("write");

        let cc = resolve(&format!("DIR::{}", sub.display())).expect("resolve");
        assert_eq!(cc.default_principal().ok(), Some(client));
    }

    #[test]
    fn test_ccache_dir_missing() {
        assert!(matches!(
            resolve("DIR:/nonexistent/aklog/cc"),
            Err(AklogError::NoCredentials)
        ));
    }
}
