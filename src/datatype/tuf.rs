use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de::Error as SerdeError;
use serde_json as json;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use datatype::{Error, HashMethod, InstallResult, KeyType, SignatureType,
               canonicalize_value, sha256_hex};


/// The two metadata repositories of an Uptane system.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum RepoName {
    Director,
    Image,
}

impl Display for RepoName {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            RepoName::Director => write!(f, "director"),
            RepoName::Image    => write!(f, "image"),
        }
    }
}

impl FromStr for RepoName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &*s.to_lowercase() {
            "director" => Ok(RepoName::Director),
            "image" | "repo" => Ok(RepoName::Image),
            _ => Err(Error::Parse(format!("unknown repository: {}", s)))
        }
    }
}


/// The four signed roles of a repository.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum RoleName {
    Root,
    Targets,
    Snapshot,
    Timestamp,
}

impl RoleName {
    pub fn filename(&self) -> String {
        format!("{}.json", self)
    }
}

impl FromStr for RoleName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root"      | "Root"      => Ok(RoleName::Root),
            "targets"   | "Targets"   => Ok(RoleName::Targets),
            "snapshot"  | "Snapshot"  => Ok(RoleName::Snapshot),
            "timestamp" | "Timestamp" => Ok(RoleName::Timestamp),
            _ => Err(Error::TufRole(s.into()))
        }
    }
}

impl Display for RoleName {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            RoleName::Root      => write!(f, "root"),
            RoleName::Targets   => write!(f, "targets"),
            RoleName::Snapshot  => write!(f, "snapshot"),
            RoleName::Timestamp => write!(f, "timestamp"),
        }
    }
}

impl<'de> Deserialize<'de> for RoleName {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<RoleName, D::Error> {
        if let json::Value::String(ref s) = Deserialize::deserialize(de)? {
            s.parse().map_err(|err| SerdeError::custom(format!("unknown RoleName: {}", err)))
        } else {
            Err(SerdeError::custom("RoleName is not a string"))
        }
    }
}

impl Serialize for RoleName {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(match *self {
            RoleName::Root      => "Root",
            RoleName::Targets   => "Targets",
            RoleName::Snapshot  => "Snapshot",
            RoleName::Timestamp => "Timestamp",
        })
    }
}


/// A signed metadata document as received: untouched signatures plus the
/// signed value itself.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct TufSigned {
    pub signatures: Vec<Signature>,
    pub signed:     json::Value,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Signature {
    pub keyid:  String,
    pub method: SignatureType,
    pub sig:    String,
}


/// The `signed` payload common to all roles. Expiry is checked when the
/// data is queried, not when it is constructed.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct RoleData {
    pub _type:   RoleName,
    pub version: u64,
    pub expires: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys:    Option<HashMap<String, Key>>,        // root only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles:   Option<HashMap<RoleName, RoleMeta>>, // root only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targets: Option<HashMap<String, TufMeta>>,    // targets only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta:    Option<HashMap<String, TufMeta>>,    // timestamp/snapshot only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegations: Option<json::Value>,             // rejected for director targets
}

impl RoleData {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires < now
    }

    /// The key set and threshold for one of the roles this Root delegates to.
    pub fn role_meta(&self, role: RoleName) -> Result<&RoleMeta, Error> {
        let roles = self.roles.as_ref().ok_or(Error::UptaneMissingRoles)?;
        roles.get(&role).ok_or_else(|| Error::TufRole(format!("no `{}` role", role)))
    }

    /// True when a director targets document delegates to further roles.
    pub fn has_delegations(&self) -> bool {
        match self.delegations {
            Some(json::Value::Object(ref obj)) => {
                obj.get("roles").map_or(false, |roles| {
                    roles.as_array().map_or(false, |arr| !arr.is_empty())
                })
            }
            Some(_) => true,
            None => false,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct RoleMeta {
    pub keyids:    HashSet<String>,
    pub threshold: u64,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Key {
    pub keytype: KeyType,
    pub keyval:  KeyValue,
}

impl Key {
    /// The hex SHA-256 of the canonical JSON form of the public key.
    pub fn key_id(&self) -> Result<String, Error> {
        Ok(sha256_hex(&canonicalize_value(&json::to_value(self)?)?))
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct KeyValue {
    pub public: String,
}


/// Size, digests and assignment data for a named file in a repository.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct TufMeta {
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub hashes: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,  // snapshot/timestamp declarations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<TufCustom>,
}

#[allow(non_snake_case)]
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct TufCustom {
    #[serde(default)]
    pub ecuIdentifiers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targetFormat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}


/// A named installable artifact described by Uptane metadata.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Target {
    pub filepath: String,
    pub fileinfo: TufMeta,
}

impl Target {
    pub fn new(filepath: String, fileinfo: TufMeta) -> Self {
        Target { filepath: filepath, fileinfo: fileinfo }
    }

    /// The placeholder reported before anything was ever installed.
    pub fn unknown() -> Self {
        let hashes = hashmap!{ "sha256".into() => UNKNOWN_SHA256.into() };
        Target {
            filepath: "unknown".into(),
            fileinfo: TufMeta { length: 0, hashes: hashes, version: None, custom: None },
        }
    }

    pub fn length(&self) -> u64 {
        self.fileinfo.length
    }

    pub fn sha256(&self) -> Option<&str> {
        self.fileinfo.hashes.get(HashMethod::Sha256.name()).map(String::as_str)
    }

    /// The strongest declared hash this implementation understands.
    pub fn first_hash(&self) -> Option<(HashMethod, &str)> {
        for method in &[HashMethod::Sha256, HashMethod::Sha512] {
            if let Some(hash) = self.fileinfo.hashes.get(method.name()) {
                return Some((*method, hash));
            }
        }
        None
    }

    pub fn matches_hash(&self, method: HashMethod, digest: &str) -> bool {
        self.fileinfo.hashes.get(method.name()).map_or(false, |hash| hash == digest)
    }

    pub fn is_ostree(&self) -> bool {
        match self.fileinfo.custom {
            Some(ref custom) => custom.targetFormat.as_ref().map_or(false, |fmt| fmt == "OSTREE"),
            None => false,
        }
    }

    /// The hardware identifier this target assigns to the given serial.
    pub fn hw_id_for(&self, serial: &str) -> Option<&str> {
        self.fileinfo.custom.as_ref()
            .and_then(|custom| custom.ecuIdentifiers.get(serial))
            .map(String::as_str)
    }
}

pub const UNKNOWN_SHA256: &'static str =
    "0000000000000000000000000000000000000000000000000000000000000000";


/// Read the version of a signed document without verifying anything.
pub fn extract_version_untrusted(bytes: &[u8]) -> Result<u64, Error> {
    let signed = json::from_slice::<TufSigned>(bytes)?;
    signed.signed.get("version")
        .and_then(json::Value::as_u64)
        .ok_or_else(|| Error::Parse("no version field in signed metadata".into()))
}


/// The signed body of an ECU version manifest.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct EcuVersion {
    pub attacks_detected:         String,
    pub ecu_serial:               String,
    pub installed_image:          Target,
    pub previous_timeserver_time: String,
    pub timeserver_time:          String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<EcuCustom>,
}

impl EcuVersion {
    /// Describe an installed image, with fixed timeserver times so that an
    /// unchanged ECU reports a byte-identical manifest.
    pub fn from_image(ecu_serial: String, image: Target, custom: Option<EcuCustom>) -> Self {
        EcuVersion {
            attacks_detected: "".into(),
            ecu_serial: ecu_serial,
            installed_image: image,
            previous_timeserver_time: "1970-01-01T00:00:00Z".into(),
            timeserver_time: "1970-01-01T00:00:00Z".into(),
            custom: custom,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct EcuCustom {
    pub operation_result: InstallResult,
}
