use crate::negotiate::NegotiationFailure;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Process exit status. These values are a documented contract, scripts
/// depend on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    Usage = 1,
    SomethingsWrong = 2,
    Afs = 3,
    Kerberos = 4,
    Token = 5,
    BadPath = 6,
    Misc = 7,
}

impl Status {
    /// Fold the status of one more cell crossed while walking a single path.
    /// The first failure is kept, a second different failure becomes
    /// `SomethingsWrong`.
    pub fn merge(self, other: Status) -> Status {
        match (self, other) {
            (s, Status::Success) => s,
            (Status::Success, o) => o,
            (s, o) if s == o => s,
            _ => Status::SomethingsWrong,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

#[derive(Debug)]
pub enum AklogError {
    // =========================================================================================
    // Keep the payloads here to the minimum a caller needs to decide what to do. Anything
    // else goes to the error! macro at the raise site.
    // =========================================================================================
    /// The AFS client configuration directory or its local cell could not be read.
    AfsConfigMissing,
    /// The named cell is not listed in the cell database.
    CellNotFound,
    /// No database server hostname is configured for the cell, so no realm can be derived.
    RealmUnknown,

    NoCredentials,
    CredentialCacheError,
    UnsupportedCredentialCacheType,

    /// Every principal/realm combination was rejected. Carries the last classified failure.
    AuthenticationFailed(NegotiationFailure),
    ConversionFailed,

    /// The token cache refused the token. Carries the underlying status code.
    TokenInstallFailed(i32),
    PrincipalDatabase,

    BadPath,
    TooManySymlinks,
    NoWorkingDirectory,

    ConfigParse,
    IoError,
    BinRWError,
    DerError,

    /// No really, do you have a time machine? How did you go back to before 1970?
    DoYouHaveATimeMachine,
}

impl AklogError {
    pub fn status(&self) -> Status {
        match self {
            AklogError::AfsConfigMissing | AklogError::CellNotFound => Status::Afs,
            AklogError::NoCredentials
            | AklogError::CredentialCacheError
            | AklogError::UnsupportedCredentialCacheType
            | AklogError::AuthenticationFailed(_)
            | AklogError::ConversionFailed
            | AklogError::DerError => Status::Kerberos,
            AklogError::TokenInstallFailed(_) | AklogError::PrincipalDatabase => Status::Token,
            AklogError::BadPath | AklogError::TooManySymlinks | AklogError::NoWorkingDirectory => {
                Status::BadPath
            }
            AklogError::RealmUnknown
            | AklogError::ConfigParse
            | AklogError::IoError
            | AklogError::BinRWError
            | AklogError::DoYouHaveATimeMachine => Status::Misc,
        }
    }

    /// Fatal errors stop the whole run, not only the cell or path being processed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AklogError::AfsConfigMissing
                | AklogError::RealmUnknown
                | AklogError::TooManySymlinks
                | AklogError::NoWorkingDirectory
                | AklogError::ConfigParse
                | AklogError::DoYouHaveATimeMachine
        )
    }
}
