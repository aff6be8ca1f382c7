use super::{CredentialCache, CredentialCacheContents, CredentialV4, PrincipalV4};
use crate::error::AklogError;
use binrw::helpers::until_eof;
use binrw::io::TakeSeekExt;
use binrw::binread;
use binrw::BinReaderExt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use tracing::{debug, error, trace};

#[binread]
#[br(big)]
#[derive(Debug)]
struct HeaderField {
    _tag: u16,
    #[br(temp)]
    value_len: u16,
    #[br(count = value_len)]
    _value: Vec<u8>,
}

#[binread]
#[br(big)]
struct FileCredentialCacheHeader {
    #[br(temp)]
    length: u16,
    #[br(map_stream = |s| s.take_seek(length as u64), parse_with = until_eof)]
    _fields: Vec<HeaderField>,
}

#[binread]
#[br(big)]
struct FileCredentialCacheV3 {
    principal: PrincipalV4,
    #[br(parse_with = until_eof)]
    credentials: Vec<CredentialV4>,
}

#[binread]
#[br(big)]
struct FileCredentialCacheV4 {
    _header: FileCredentialCacheHeader,
    principal: PrincipalV4,
    #[br(parse_with = until_eof)]
    credentials: Vec<CredentialV4>,
}

#[binread]
#[br(big, magic = 5u8)]
enum FileCredentialCache {
    #[br(magic = 3u8)]
    V3(FileCredentialCacheV3),
    #[br(magic = 4u8)]
    V4(FileCredentialCacheV4),
}

impl FileCredentialCache {
    fn read(inner: &[u8]) -> Result<Self, AklogError> {
        let mut reader = binrw::io::Cursor::new(inner);
        let ccache: FileCredentialCache = reader.read_type(binrw::Endian::Big).map_err(|e| {
            debug!(?e, "Failed to deserialize credential cache");
            AklogError::BinRWError
        })?;
        Ok(ccache)
    }

    fn into_contents(self) -> CredentialCacheContents {
        let (principal, credentials) = match self {
            FileCredentialCache::V3(v3) => (v3.principal, v3.credentials),
            FileCredentialCache::V4(v4) => (v4.principal, v4.credentials),
        };
        CredentialCacheContents {
            default_principal: (&principal).into(),
            credentials: credentials
                .iter()
                .filter(|c| !c.is_config())
                .map(Into::into)
                .collect(),
        }
    }
}

pub(super) struct FileCredentialCacheContext {
    pub path: PathBuf,
}

impl CredentialCache for FileCredentialCacheContext {
    fn name(&self) -> String {
        format!("FILE:{}", self.path.display())
    }

    fn load(&self) -> Result<CredentialCacheContents, AklogError> {
        let f = File::open(&self.path).map_err(|io_err| {
            debug!(?io_err, "Unable to open credential cache at {:#?}", &self.path);
            AklogError::NoCredentials
        })?;

        let mut reader = BufReader::new(&f);
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).map_err(|e| {
            error!(?self.path, ?e, "Failed to read credential cache");
            AklogError::CredentialCacheError
        })?;

        let contents = FileCredentialCache::read(&buffer)
            .map_err(|_| AklogError::CredentialCacheError)?
            .into_contents();
        trace!(
            principal = %contents.default_principal,
            credentials = contents.credentials.len(),
            "Loaded credential cache"
        );
        Ok(contents)
    }
}

pub(super) fn resolve(ccache_name: &str) -> Result<Box<dyn CredentialCache>, AklogError> {
    trace!(?ccache_name, "Resolving file credential cache");
    let path = ccache_name.strip_prefix("FILE:").unwrap_or(ccache_name);
    trace!(?path, "Resolved file credential cache");

    let path = PathBuf::from(&path);

    let fcc = FileCredentialCacheContext { path };
    Ok(Box::new(fcc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccache::tests::ccache_bytes;
    use crate::proto::Principal;
    use std::io::Write;

    #[test]
    fn test_ccache_file_read_mit() -> Result<(), AklogError> {
        /*
         * This is a file ccache produced by MIT's kinit
         * including cache configuration entries
         */
        let mit_buf = "0504000c00010008000000000000000000000001000000010000000b4558414d504c452e434f4d00000008746573747573657200000001000000010000000b4558414d504c452e434f4d00000008746573747573657200000001000000030000000c582d4341434845434f4e463a000000156b7262355f6363616368655f636f6e665f646174610000000a666173745f617661696c0000001e6b72627467742f4558414d504c452e434f4d404558414d504c452e434f4d0000000000000000000000000000000000000000000000000000000000000000000000000000037965730000000000000001000000010000000b4558414d504c452e434f4d00000008746573747573657200000002000000020000000b4558414d504c452e434f4d000000066b72627467740000000b4558414d504c452e434f4d001200000020de5604735e4216fdf4e7992177ac3d6b25416e6517edce48fcb8be73f9ecf46f66a7815b66a7815b66a80dfb66b0bbdb0000c100000000000000000000000001ba618201b6308201b2a003020105a10d1b0b4558414d504c452e434f4da220301ea003020102a11730151b066b72627467741b0b4558414d504c452e434f4da382017830820174a003020112a103020101a2820166048201620c0ded71bdab6134022d37fa7ea73856eb87044fa4340e36a2668c8fc74f21a9637fac7ccf2777202583b9fea5ca609cec1b1479f72a7374f2ae7e5347bcc64a66de1575bd8bc9eaa6ce96049e199d7a6f835dda18aea8b0d093d05bd4bba4fc5c2385f000297217adde3c23dff75705a4fafe58dee48774eeef2c969a8dd64ea3f754087d72c4796506ebb23fef404fbb41826483642af6f2a97680146319dd5541adbe2b6247766f36f0b5a673bffea5cc8b89e8c91359147f291e740e8f69377e88f984829d1791912c7da7cc7f6277470a91cf140b6c71da0f4e561722e0536a23af6da7a375343b6e5b72c4847f3c848d4e8b044ae313979f954db7a7210052922f587e6e5d21447aec02beaeab9371dd1ae9903dde0838b1fd9b791a4a4065565905664a62c92980053c8532586deeafd0e558df77de6e4ce2c653feff9aefc2c9b0a34ab2cc405e3bf4a8b49c9bf1c8d1c6f79be11fa71272edcfc3a5c51700000000";
        let mit_buf = hex::decode(mit_buf).expect("Invalid hex buffer");
        let contents = FileCredentialCache::read(&mit_buf)?.into_contents();

        assert_eq!(contents.default_principal.to_string(), "testuser@EXAMPLE.COM");
        // The fast_avail configuration entry is dropped.
        assert_eq!(contents.credentials.len(), 1);
        let tgt = &contents.credentials[0];
        assert_eq!(tgt.server.to_string(), "krbtgt/EXAMPLE.COM@EXAMPLE.COM");
        assert_eq!(tgt.enctype, 18);
        assert_eq!(tgt.session_key.len(), 32);
        assert_eq!(tgt.ticket_realm()?, "EXAMPLE.COM");
        Ok(())
    }

    #[test]
    fn test_ccache_file_load() {
        let client = Principal::user("jdoe", "EXAMPLE.ORG");
        let service = Principal::afs_service(Some("example.org"), "EXAMPLE.ORG");
        let buf = ccache_bytes(
            &client,
            &[(service.clone(), vec![7; 8], 4_000_000_000, vec![1, 2, 3])],
        );

        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&buf).expect("write");

        let name = format!("FILE:{}", tmp.path().display());
        let cc = resolve(&name).expect("resolve");
        assert_eq!(cc.name(), name);
        assert_eq!(cc.default_principal().ok(), Some(client.clone()));

        let contents = cc.load().expect("load");
        assert_eq!(contents.credentials.len(), 1);
        assert_eq!(contents.credentials[0].server, service);
        assert_eq!(contents.credentials[0].session_key, vec![7; 8]);
        assert_eq!(contents.credentials[0].ticket, vec![1, 2, 3]);
    }

    #[test]
    fn test_ccache_missing_is_no_credentials() {
        let cc = resolve("FILE:/nonexistent/krb5cc_aklog").expect("resolve");
        assert!(matches!(cc.load(), Err(AklogError::NoCredentials)));
    }
}
