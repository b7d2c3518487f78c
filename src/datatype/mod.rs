pub mod canonical;
pub mod config;
pub mod crypto;
pub mod error;
pub mod install;
pub mod tuf;
pub mod util;
pub mod verify;

pub use self::canonical::{canonicalize_json, canonicalize_value};
pub use self::config::{Config, NetworkConfig, PacmanConfig, StorageConfig, UptaneConfig};
pub use self::crypto::{HashMethod, KeyPair, KeyType, MultiPartHasher, PrivateKey,
                       SignatureType, sha256_hex, sha512_hex};
pub use self::error::Error;
pub use self::install::{InstallMode, InstallResult, InstalledVersion, ResultCode};
pub use self::tuf::{EcuCustom, EcuVersion, Key, KeyValue, RepoName, RoleData, RoleMeta,
                    RoleName, Signature, Target, TufCustom, TufMeta, TufSigned,
                    UNKNOWN_SHA256, extract_version_untrusted};
pub use self::util::Util;
pub use self::verify::Verifier;
