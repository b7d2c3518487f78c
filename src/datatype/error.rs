use base64::DecodeError as Base64Error;
use chrono::ParseError as ChronoParseError;
use hex::FromHexError;
use openssl::error::ErrorStack as OpensslErrors;
use pem::Error as PemError;
use ring::error::Unspecified as RingUnspecified;
use serde_json::Error as SerdeJsonError;
use std::convert::From;
use std::fmt::{self, Display, Formatter};
use std::io::Error as IoError;
use std::str::Utf8Error;
use std::string::FromUtf8Error;
use std::sync::PoisonError;
use toml::de::Error as TomlError;
use url::ParseError as UrlParseError;
use zip::result::ZipError;

use datatype::{RepoName, RoleName};


/// System-wide errors that are returned from `Result` type failures.
#[derive(Debug)]
pub enum Error {
    Base64(Base64Error),
    Canonical(String),
    Config(String),
    DateTime(ChronoParseError),
    FromUtf8(FromUtf8Error),
    Hex(FromHexError),
    Install(String),
    Io(IoError),
    Json(SerdeJsonError),
    KeyGen(String),
    KeyNotFound(String),
    KeySign(String),
    Openssl(OpensslErrors),
    OsTree(String),
    Parse(String),
    Pem(PemError),
    Poison(String),
    PutRootUnsupported,
    Ring(RingUnspecified),
    Socket(String),
    Storage(String),
    Toml(TomlError),
    TufKeyId(String),
    TufKeyType(String),
    TufRole(String),
    TufSigType(String),
    UptaneBadSignature(RepoName, RoleName),
    UptaneBadTargetCount(usize),
    UptaneDuplicateEcu(String),
    UptaneExpired(RepoName, RoleName),
    UptaneHashMismatch(RoleName),
    UptaneMissingKeys,
    UptaneMissingRole(RepoName, RoleName),
    UptaneMissingRoles,
    UptaneNoPendingTarget,
    UptaneTargetMismatch(String),
    UptaneThreshold(String),
    UptaneUnexpectedDelegation,
    UptaneVersionDowngrade(RepoName, RoleName),
    UptaneVersionMismatch(RoleName),
    UrlParse(UrlParseError),
    Utf8(Utf8Error),
    Wire(String),
    Zip(ZipError),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let inner: String = match *self {
            Error::Base64(ref err)      => format!("Base64 parse error: {}", err),
            Error::Canonical(ref err)   => format!("Canonical JSON error: {}", err),
            Error::Config(ref err)      => format!("Bad Config: {}", err),
            Error::DateTime(ref err)    => format!("DateTime parse error: {}", err),
            Error::FromUtf8(ref err)    => format!("From utf8 error: {}", err),
            Error::Hex(ref err)         => format!("Not valid hex data: {}", err),
            Error::Install(ref err)     => format!("Install error: {}", err),
            Error::Io(ref err)          => format!("IO error: {}", err),
            Error::Json(ref err)        => format!("JSON parse error: {}", err),
            Error::KeyGen(ref err)      => format!("Key generation error: {}", err),
            Error::KeyNotFound(ref err) => format!("Key not found: {}", err),
            Error::KeySign(ref err)     => format!("Key signing error: {}", err),
            Error::Openssl(ref err)     => format!("OpenSSL errors: {}", err),
            Error::OsTree(ref err)      => format!("OSTree error: {}", err),
            Error::Parse(ref err)       => format!("Parse error: {}", err),
            Error::Pem(ref err)         => format!("PEM parse error: {}", err),
            Error::Poison(ref err)      => format!("Poison error: {}", err),
            Error::PutRootUnsupported   => "Uptane: putRoot is not supported".into(),
            Error::Ring(ref err)        => format!("Ring error: {:?}", err),
            Error::Socket(ref err)      => format!("Socket error: {}", err),
            Error::Storage(ref err)     => format!("Storage error: {}", err),
            Error::Toml(ref err)        => format!("TOML error: {:?}", err),
            Error::TufKeyId(ref err)    => format!("Invalid TUF key id: {}", err),
            Error::TufKeyType(ref err)  => format!("Invalid TUF key type: {}", err),
            Error::TufRole(ref err)     => format!("Invalid TUF role: {}", err),
            Error::TufSigType(ref err)  => format!("Invalid TUF signature type: {}", err),

            Error::UptaneBadSignature(repo, role)   => format!("Uptane: bad signature on {} {}", repo, role),
            Error::UptaneBadTargetCount(count)      => format!("Uptane: expected exactly 1 target for this ECU, got {}", count),
            Error::UptaneDuplicateEcu(ref serial)   => format!("Uptane: ECU `{}` named by more than one target", serial),
            Error::UptaneExpired(repo, role)        => format!("Uptane: {} {} metadata has expired", repo, role),
            Error::UptaneHashMismatch(role)         => format!("Uptane: hash mismatch for {} metadata", role),
            Error::UptaneMissingKeys                => "Uptane: missing `keys` field".into(),
            Error::UptaneMissingRole(repo, role)    => format!("Uptane: no {} metadata for {} repo", role, repo),
            Error::UptaneMissingRoles               => "Uptane: missing `roles` field".into(),
            Error::UptaneNoPendingTarget            => "Uptane: no pending target".into(),
            Error::UptaneTargetMismatch(ref err)    => format!("Uptane: director and image targets do not match: {}", err),
            Error::UptaneThreshold(ref err)         => format!("Uptane: role threshold not met: {}", err),
            Error::UptaneUnexpectedDelegation       => "Uptane: director targets contains delegations".into(),
            Error::UptaneVersionDowngrade(repo, role) => format!("Uptane: version of {} {} went backwards", repo, role),
            Error::UptaneVersionMismatch(role)      => format!("Uptane: {} version does not match the declaring role", role),

            Error::UrlParse(ref err) => format!("Url parse error: {}", err),
            Error::Utf8(ref err)     => format!("Utf8 error: {}", err),
            Error::Wire(ref err)     => format!("Wire protocol error: {}", err),
            Error::Zip(ref err)      => format!("Zip archive error: {}", err),
        };
        write!(f, "{}", inner)
    }
}

impl<E> From<PoisonError<E>> for Error {
    fn from(err: PoisonError<E>) -> Error {
        Error::Poison(err.to_string())
    }
}


macro_rules! derive_from {
    ([ $( $from: ident => $to: ident ),* ]) => {
        $(impl From<$from> for Error {
            fn from(err: $from) -> Error {
                Error::$to(err)
            }
        })*
    };
}

derive_from!([
    Base64Error      => Base64,
    ChronoParseError => DateTime,
    FromHexError     => Hex,
    FromUtf8Error    => FromUtf8,
    IoError          => Io,
    OpensslErrors    => Openssl,
    PemError         => Pem,
    RingUnspecified  => Ring,
    SerdeJsonError   => Json,
    TomlError        => Toml,
    UrlParseError    => UrlParse,
    Utf8Error        => Utf8,
    ZipError         => Zip
]);
