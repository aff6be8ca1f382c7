use super::wire::{decode_get_token, encode_set_token, SetTokenFlags};
use crate::error::AklogError;
use crate::path::FilesystemProbe;
use crate::token::{ClientIdentity, ServerIdentity, Token, TokenCache};
use libc::{c_char, c_long, c_short, c_ulong};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{debug, error, trace, warn};

const PROC_IOCTL: &str = "/proc/fs/openafs/afs_ioctl";

const AFSCALL_PIOCTL: c_long = 20;

const VIOCSETTOK: u8 = 3;
const VIOCGETTOK: u8 = 8;
const VIOCWHEREIS: u8 = 14;
const VIOC_AFS_STAT_MT_PT: u8 = 29;
const VIOC_FILE_CELL_NAME: u8 = 30;

/// Out buffers must fit the `short` size field.
const TOKEN_BUF_LEN: usize = 16384;
const NAME_BUF_LEN: usize = 1024;

#[repr(C)]
struct ViceIoctl {
    input: *mut c_char,
    output: *mut c_char,
    in_size: c_short,
    out_size: c_short,
}

/// The argument block of the proc ioctl, parameters in reverse order.
#[repr(C)]
struct AfsProcData {
    param4: c_long,
    param3: c_long,
    param2: c_long,
    param1: c_long,
    syscall: c_long,
}

const fn iow(ty: u8, nr: u8, size: usize) -> c_ulong {
    (1 << 30) | (((size as c_ulong) & 0x3fff) << 16) | ((ty as c_ulong) << 8) | nr as c_ulong
}

const VIOC_SYSCALL: c_ulong = iow(b'C', 1, std::mem::size_of::<*mut libc::c_void>());

const fn vice_ioctl(nr: u8) -> c_long {
    iow(b'V', nr, std::mem::size_of::<ViceIoctl>()) as c_long
}

/// The kernel token cache and volume location queries of a running OpenAFS
/// client.
pub struct Pioctl {
    local_cell: String,
}

impl Pioctl {
    /// Tokens for `local_cell` are installed as primary.
    pub fn new(local_cell: &str) -> Self {
        Pioctl {
            local_cell: local_cell.to_string(),
        }
    }

    fn open(&self) -> Result<File, i32> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(PROC_IOCTL)
            .map_err(|err| {
                debug!(?err, "unable to open {}", PROC_IOCTL);
                err.raw_os_error().unwrap_or(libc::ENODEV)
            })
    }

    /// Issue one pioctl. Returns the errno on failure.
    fn call(
        &self,
        path: Option<&Path>,
        nr: u8,
        input: &[u8],
        output: &mut [u8],
        follow: bool,
    ) -> Result<(), i32> {
        let path = match path {
            Some(p) => Some(CString::new(p.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?),
            None => None,
        };
        let in_size = c_short::try_from(input.len()).map_err(|_| libc::E2BIG)?;
        let out_size = c_short::try_from(output.len()).map_err(|_| libc::E2BIG)?;
        let mut input = input.to_vec();

        let mut blob = ViceIoctl {
            input: input.as_mut_ptr().cast(),
            output: output.as_mut_ptr().cast(),
            in_size,
            out_size,
        };
        let mut data = AfsProcData {
            param4: c_long::from(follow),
            param3: std::ptr::addr_of_mut!(blob) as c_long,
            param2: vice_ioctl(nr),
            param1: path.as_ref().map(|p| p.as_ptr() as c_long).unwrap_or(0),
            syscall: AFSCALL_PIOCTL,
        };

        let file = self.open()?;
        trace!(nr, in_size, out_size, "pioctl");
        // SAFETY: every pointer in `data` refers to a live local buffer whose
        // size is passed alongside it.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                VIOC_SYSCALL as _,
                std::ptr::addr_of_mut!(data),
            )
        };
        if rc < 0 {
            Err(errno::errno().0)
        } else {
            Ok(())
        }
    }

    fn call_string(&self, path: &Path, nr: u8, input: &[u8], follow: bool) -> Option<String> {
        let mut out = vec![0u8; NAME_BUF_LEN];
        self.call(Some(path), nr, input, &mut out, follow).ok()?;
        let end = out.iter().position(|b| *b == 0).unwrap_or(out.len());
        Some(String::from_utf8_lossy(&out[..end]).into_owned())
    }
}

impl TokenCache for Pioctl {
    fn get_token(
        &self,
        server: &ServerIdentity,
    ) -> Result<Option<(Token, ClientIdentity)>, AklogError> {
        for index in 0..i32::MAX {
            let mut out = vec![0u8; TOKEN_BUF_LEN];
            match self.call(None, VIOCGETTOK, &index.to_ne_bytes(), &mut out, false) {
                Ok(()) => {}
                Err(libc::EDOM) => return Ok(None),
                Err(code) => {
                    debug!(code, index, "get token failed");
                    return Err(AklogError::TokenInstallFailed(code));
                }
            }
            let (token, client) = decode_get_token(&out)?;
            if token.server.cell.eq_ignore_ascii_case(&server.cell) {
                return Ok(Some((token, client)));
            }
        }
        Ok(None)
    }

    fn set_token(
        &self,
        token: &Token,
        client: &ClientIdentity,
        setpag: bool,
    ) -> Result<(), AklogError> {
        let mut flags = SetTokenFlags::none();
        if token.server.cell == self.local_cell {
            flags |= SetTokenFlags::Primary;
        }
        if setpag {
            flags |= SetTokenFlags::SetPag;
        }

        let uid = uzers::get_current_uid();
        let buf = encode_set_token(token, client, uid, flags)?;
        self.call(None, VIOCSETTOK, &buf, &mut [], false)
            .map_err(|code| {
                error!(code, server = %token.server, "kernel refused the token");
                AklogError::TokenInstallFailed(code)
            })
    }
}

impl FilesystemProbe for Pioctl {
    fn stat_mount_point(&self, dir: &Path, last: &str) -> Option<String> {
        let mut input = last.as_bytes().to_vec();
        input.push(0);
        self.call_string(dir, VIOC_AFS_STAT_MT_PT, &input, false)
    }

    fn owning_cell(&self, path: &Path) -> Option<String> {
        let cell = self.call_string(path, VIOC_FILE_CELL_NAME, &[], true);
        if cell.is_none() {
            warn!(path = %path.display(), "unable to find the cell of the path");
        }
        cell
    }

    fn volume_hosts(&self, path: &Path) -> Vec<Ipv4Addr> {
        let mut out = vec![0u8; NAME_BUF_LEN];
        if let Err(code) = self.call(Some(path), VIOCWHEREIS, &[], &mut out, true) {
            debug!(code, path = %path.display(), "whereis failed");
            return Vec::new();
        }
        out.chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .take_while(|a| *a != [0; 4])
            .map(Ipv4Addr::from)
            .collect()
    }
}
