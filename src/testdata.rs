use crypto::digest::Digest;
use crypto::ed25519;
use crypto::sha2::Sha256;
use hex::ToHex;
use serde_json as json;
use std::cell::RefCell;
use std::rc::Rc;

use datatype::{Error, InstallResult, Key, KeyType, KeyValue, PrivateKey, ResultCode,
               SignatureType, Target, TufSigned, UNKNOWN_SHA256, canonicalize_json,
               extract_version_untrusted, sha256_hex};
use pacman::{InstalledImageInfo, UpdateAgent};
use repository::RawMetaPack;


/// All generated metadata expires at the same fixed instant so that test
/// output is deterministic.
pub const EXPIRES: &'static str = "2038-01-19T03:14:06Z";

/// A target entry to be named by generated Targets metadata.
#[derive(Clone)]
pub struct TargetSpec {
    pub name:   String,
    pub length: u64,
    pub sha256: String,
    pub serial: String,
    pub hwid:   String,
    pub format: Option<String>,
}

impl TargetSpec {
    /// Describe a binary image with its real length and digest.
    pub fn binary(name: &str, data: &[u8], serial: &str, hwid: &str) -> TargetSpec {
        TargetSpec {
            name:   name.into(),
            length: data.len() as u64,
            sha256: sha256_hex(data),
            serial: serial.into(),
            hwid:   hwid.into(),
            format: None,
        }
    }

    /// Describe an OSTree commit, where the hash is the commit checksum.
    pub fn ostree(name: &str, commit: &str, serial: &str, hwid: &str) -> TargetSpec {
        TargetSpec {
            name:   name.into(),
            length: 0,
            sha256: commit.into(),
            serial: serial.into(),
            hwid:   hwid.into(),
            format: Some("OSTREE".into()),
        }
    }
}


/// Deterministic ed25519 signing identity for one generated repository.
pub struct Signer {
    pub privkey: PrivateKey,
    pub key:     Key,
    pub keyid:   String,
}

impl Signer {
    pub fn new(label: &str) -> Signer {
        let mut digest = Sha256::new();
        digest.input(label.as_bytes());
        let mut seed = [0u8; 32];
        digest.result(&mut seed);

        let (secret, public) = ed25519::keypair(&seed);
        let key = Key {
            keytype: KeyType::Ed25519,
            keyval:  KeyValue { public: public.to_hex() },
        };
        let keyid = key.key_id().expect("key id");
        Signer {
            privkey: PrivateKey { keyid: keyid.clone(), der_key: secret.as_ref().into() },
            key:     key,
            keyid:   keyid,
        }
    }

    pub fn sign(&self, value: json::Value) -> TufSigned {
        self.privkey.sign_data(value, SignatureType::Ed25519).expect("sign test metadata")
    }

    fn signed_bytes(&self, value: json::Value) -> Vec<u8> {
        json::to_vec(&self.sign(value)).expect("encode signed metadata")
    }

    pub fn root_value(&self, version: u64) -> json::Value {
        let role = json!({"keyids": [&self.keyid], "threshold": 1});
        let mut keys = json::Map::new();
        keys.insert(self.keyid.clone(), json::to_value(&self.key).expect("key value"));
        json!({
            "_type":   "Root",
            "version": version,
            "expires": EXPIRES,
            "keys":    keys,
            "roles":   { "Root": role, "Targets": role, "Snapshot": role, "Timestamp": role }
        })
    }

    pub fn root_data(&self, version: u64) -> ::datatype::RoleData {
        json::from_value(self.root_value(version)).expect("root data")
    }

    pub fn root_json(&self, version: u64) -> Vec<u8> {
        self.signed_bytes(self.root_value(version))
    }

    /// A Root signed by another signer as well, as required for rotation.
    pub fn root_json_rotated(&self, version: u64, previous: &Signer) -> Vec<u8> {
        let value = self.root_value(version);
        let mut signed = self.sign(value.clone());
        let prev_sig = previous.sign(value);
        signed.signatures.extend(prev_sig.signatures);
        json::to_vec(&signed).expect("encode rotated root")
    }

    fn targets_value(&self, specs: &[TargetSpec], version: u64, director: bool) -> json::Value {
        let mut targets = json::Map::new();
        for spec in specs {
            let mut entry = json::Map::new();
            entry.insert("length".into(), json!(spec.length));
            entry.insert("hashes".into(), json!({"sha256": spec.sha256}));
            if director {
                let mut ecus = json::Map::new();
                ecus.insert(spec.serial.clone(), json!(&spec.hwid));
                let mut custom = json::Map::new();
                custom.insert("ecuIdentifiers".into(), json::Value::Object(ecus));
                if let Some(ref format) = spec.format {
                    custom.insert("targetFormat".into(), json!(format));
                }
                entry.insert("custom".into(), json::Value::Object(custom));
            }
            targets.insert(spec.name.clone(), json::Value::Object(entry));
        }
        json!({
            "_type":   "Targets",
            "version": version,
            "expires": EXPIRES,
            "targets": targets
        })
    }

    pub fn sign_targets_for(&self, specs: &[(&str, u64, &str, &str, &str)], version: u64) -> TufSigned {
        let specs = specs.iter().map(|&(name, length, sha256, serial, hwid)| TargetSpec {
            name:   name.into(),
            length: length,
            sha256: sha256.into(),
            serial: serial.into(),
            hwid:   hwid.into(),
            format: None,
        }).collect::<Vec<_>>();
        self.sign(self.targets_value(&specs, version, true))
    }

    pub fn director_targets_json(&self, specs: &[TargetSpec], version: u64) -> Vec<u8> {
        self.signed_bytes(self.targets_value(specs, version, true))
    }

    pub fn image_targets_json(&self, specs: &[TargetSpec], version: u64) -> Vec<u8> {
        self.signed_bytes(self.targets_value(specs, version, false))
    }

    pub fn snapshot_json(&self, targets: &[u8], version: u64) -> Vec<u8> {
        let hash = sha256_hex(&canonicalize_json(targets).expect("canonical targets"));
        self.signed_bytes(json!({
            "_type":   "Snapshot",
            "version": version,
            "expires": EXPIRES,
            "meta": {
                "targets.json": {
                    "length":  targets.len(),
                    "hashes":  {"sha256": hash},
                    "version": extract_version_untrusted(targets).expect("targets version")
                }
            }
        }))
    }

    pub fn timestamp_json(&self, snapshot: &[u8], version: u64) -> Vec<u8> {
        let hash = sha256_hex(&canonicalize_json(snapshot).expect("canonical snapshot"));
        self.signed_bytes(json!({
            "_type":   "Timestamp",
            "version": version,
            "expires": EXPIRES,
            "meta": {
                "snapshot.json": {
                    "length":  snapshot.len(),
                    "hashes":  {"sha256": hash},
                    "version": extract_version_untrusted(snapshot).expect("snapshot version")
                }
            }
        }))
    }
}


/// Scripted update agent for driving install and reboot-finalization
/// paths without a real filesystem or OSTree sysroot.
pub struct ScriptedAgent {
    pub install_code: ResultCode,
    pub rebooted:     Rc<RefCell<bool>>,
    pub finalize_ok:  bool,
    pub applied:      Rc<RefCell<Vec<String>>>,
}

impl ScriptedAgent {
    pub fn new(install_code: ResultCode, rebooted: Rc<RefCell<bool>>) -> ScriptedAgent {
        ScriptedAgent {
            install_code: install_code,
            rebooted:     rebooted,
            finalize_ok:  true,
            applied:      Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl UpdateAgent for ScriptedAgent {
    fn is_target_supported(&self, _: &Target) -> bool { true }

    fn installed_image_info(&self) -> Result<InstalledImageInfo, Error> {
        Ok(InstalledImageInfo { name: "unknown".into(), len: 0, hash: UNKNOWN_SHA256.into() })
    }

    fn download(&mut self, _: &Target, _: &[u8]) -> ResultCode { ResultCode::Ok }

    fn receive_data(&mut self, _: &Target, _: &[u8]) -> ResultCode { ResultCode::Ok }

    fn install(&mut self, _: &Target) -> ResultCode { self.install_code }

    fn apply_pending_install(&mut self, target: &Target) -> InstallResult {
        self.applied.borrow_mut().push(target.filepath.clone());
        if self.finalize_ok {
            InstallResult::new(target.filepath.clone(), ResultCode::Ok, "".into())
        } else {
            InstallResult::new(target.filepath.clone(), ResultCode::InstallFailed, "wrong commit".into())
        }
    }

    fn complete_install(&mut self) { *self.rebooted.borrow_mut() = false; }

    fn reboot_detected(&self) -> bool { *self.rebooted.borrow() }
}


/// Generate a coherent metadata pack naming the given targets from both
/// repositories, all at version `version`.
pub fn pack_for(director: &Signer, image: &Signer, specs: &[TargetSpec], version: u64) -> RawMetaPack {
    let image_targets = image.image_targets_json(specs, version);
    let snapshot = image.snapshot_json(&image_targets, version);
    let timestamp = image.timestamp_json(&snapshot, version);
    RawMetaPack {
        director_root:    director.root_json(1),
        director_targets: director.director_targets_json(specs, version),
        image_root:       image.root_json(1),
        image_timestamp:  timestamp,
        image_snapshot:   snapshot,
        image_targets:    image_targets,
    }
}
