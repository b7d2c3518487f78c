use serde_json as json;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use datatype::{Error, InstallMode, InstallResult, InstalledVersion, KeyPair,
               RepoName, RoleName, Target, Util};


/// The CA, client certificate and private key trio used to talk to a
/// remote OSTree repository.
pub struct TlsCreds {
    pub ca:   Vec<u8>,
    pub cert: Vec<u8>,
    pub pkey: Vec<u8>,
}


/// Durable ground truth for everything the Secondary must remember across
/// restarts. Records live in a file tree under `path` and every write is
/// atomic, so a crash leaves each record either old or new.
pub struct Store {
    path: String,
}

impl Store {
    pub fn new(path: &str) -> Result<Store, Error> {
        fs::create_dir_all(path)?;
        Ok(Store { path: path.into() })
    }

    fn file(&self, rel: &str) -> String {
        format!("{}/{}", self.path, rel)
    }

    fn read_opt(path: &str) -> Result<Option<Vec<u8>>, Error> {
        match fs::metadata(path) {
            Ok(_) => Ok(Some(Util::read_file(path)?)),
            Err(ref err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::Storage(format!("couldn't stat {}: {}", path, err))),
        }
    }

    //
    // Root metadata, one file per version.
    //

    pub fn store_root(&self, repo: RepoName, version: u64, bytes: &[u8]) -> Result<(), Error> {
        Util::atomic_write(&self.file(&format!("{}/root.{}.json", repo, version)), bytes)
    }

    pub fn load_root(&self, repo: RepoName, version: u64) -> Result<Option<Vec<u8>>, Error> {
        Store::read_opt(&self.file(&format!("{}/root.{}.json", repo, version)))
    }

    pub fn latest_root_version(&self, repo: RepoName) -> Result<Option<u64>, Error> {
        let dir = self.file(&format!("{}", repo));
        if ! Path::new(&dir).exists() {
            return Ok(None);
        }
        let mut latest = None;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if ! name.starts_with("root.") || ! name.ends_with(".json") {
                continue;
            }
            if let Ok(version) = name["root.".len()..name.len()-".json".len()].parse::<u64>() {
                if latest.map_or(true, |seen| version > seen) {
                    latest = Some(version);
                }
            }
        }
        Ok(latest)
    }

    pub fn load_latest_root(&self, repo: RepoName) -> Result<Option<(u64, Vec<u8>)>, Error> {
        match self.latest_root_version(repo)? {
            Some(version) => {
                let bytes = self.load_root(repo, version)?
                    .ok_or_else(|| Error::Storage(format!("root.{}.json disappeared", version)))?;
                Ok(Some((version, bytes)))
            }
            None => Ok(None),
        }
    }

    //
    // Non-root metadata, latest only.
    //

    pub fn store_non_root(&self, repo: RepoName, role: RoleName, bytes: &[u8]) -> Result<(), Error> {
        Util::atomic_write(&self.file(&format!("{}/{}", repo, role.filename())), bytes)
    }

    pub fn load_non_root(&self, repo: RepoName, role: RoleName) -> Result<Option<Vec<u8>>, Error> {
        Store::read_opt(&self.file(&format!("{}/{}", repo, role.filename())))
    }

    /// Delete the Timestamp, Snapshot and Targets documents for a repo,
    /// as required when its Root rotates.
    pub fn clear_non_root(&self, repo: RepoName) -> Result<(), Error> {
        for role in &[RoleName::Timestamp, RoleName::Snapshot, RoleName::Targets] {
            let path = self.file(&format!("{}/{}", repo, role.filename()));
            match fs::remove_file(&path) {
                Ok(()) => (),
                Err(ref err) if err.kind() == ErrorKind::NotFound => (),
                Err(err) => return Err(Error::Storage(format!("couldn't remove {}: {}", path, err))),
            }
        }
        Ok(())
    }

    //
    // ECU identity.
    //

    /// Store the ordered serial list; element 0 is this ECU.
    pub fn store_ecu_serials(&self, serials: &[(String, String)]) -> Result<(), Error> {
        Util::atomic_write(&self.file("ecu_serials.json"), &json::to_vec(&serials)?)
    }

    pub fn load_ecu_serials(&self) -> Result<Option<Vec<(String, String)>>, Error> {
        match Store::read_opt(&self.file("ecu_serials.json"))? {
            Some(bytes) => Ok(Some(json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn store_device_id(&self, device_id: &str) -> Result<(), Error> {
        Util::atomic_write(&self.file("device_id"), device_id.as_bytes())
    }

    pub fn load_device_id(&self) -> Result<Option<String>, Error> {
        match Store::read_opt(&self.file("device_id"))? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes)?)),
            None => Ok(None),
        }
    }

    //
    // Installed versions.
    //

    /// Append to the installation history for an ECU, maintaining the
    /// invariant that at most one entry is `current` and at most one is
    /// `pending`.
    pub fn save_installed_version(&self, serial: &str, target: &Target, mode: InstallMode) -> Result<(), Error> {
        let (mut history, _, _) = self.load_installed_versions(serial)?;
        match mode {
            InstallMode::Current => {
                for entry in &mut history {
                    if entry.mode == InstallMode::Current || entry.mode == InstallMode::Pending {
                        entry.mode = InstallMode::None;
                    }
                }
            }
            InstallMode::Pending => {
                for entry in &mut history {
                    if entry.mode == InstallMode::Pending {
                        entry.mode = InstallMode::None;
                    }
                }
            }
            InstallMode::None => (),
        }

        if let Some(entry) = history.iter_mut().find(|entry| entry.target == *target) {
            entry.mode = mode;
        } else {
            history.push(InstalledVersion { target: target.clone(), mode: mode });
        }
        Util::atomic_write(&self.file(&format!("versions/{}.json", serial)), &json::to_vec(&history)?)
    }

    /// Return the full history plus the current and pending targets, if any.
    pub fn load_installed_versions(&self, serial: &str)
                                   -> Result<(Vec<InstalledVersion>, Option<Target>, Option<Target>), Error> {
        let history: Vec<InstalledVersion> = match Store::read_opt(&self.file(&format!("versions/{}.json", serial)))? {
            Some(bytes) => json::from_slice(&bytes)?,
            None => Vec::new(),
        };
        let current = history.iter().find(|entry| entry.mode == InstallMode::Current).map(|entry| entry.target.clone());
        let pending = history.iter().find(|entry| entry.mode == InstallMode::Pending).map(|entry| entry.target.clone());
        Ok((history, current, pending))
    }

    //
    // Installation results.
    //

    pub fn save_installation_result(&self, serial: &str, result: &InstallResult) -> Result<(), Error> {
        Util::atomic_write(&self.file(&format!("results/{}.json", serial)), &json::to_vec(result)?)
    }

    pub fn load_installation_result(&self, serial: &str) -> Result<Option<InstallResult>, Error> {
        match Store::read_opt(&self.file(&format!("results/{}.json", serial)))? {
            Some(bytes) => Ok(Some(json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    //
    // TLS credentials.
    //

    pub fn store_tls_creds(&self, creds: &TlsCreds) -> Result<(), Error> {
        Util::atomic_write(&self.file("tls/ca.pem"), &creds.ca)?;
        Util::atomic_write(&self.file("tls/client.pem"), &creds.cert)?;
        Util::atomic_write(&self.file("tls/pkey.pem"), &creds.pkey)
    }

    pub fn load_tls_creds(&self) -> Result<Option<TlsCreds>, Error> {
        let ca   = Store::read_opt(&self.file("tls/ca.pem"))?;
        let cert = Store::read_opt(&self.file("tls/client.pem"))?;
        let pkey = Store::read_opt(&self.file("tls/pkey.pem"))?;
        match (ca, cert, pkey) {
            (Some(ca), Some(cert), Some(pkey)) => Ok(Some(TlsCreds { ca: ca, cert: cert, pkey: pkey })),
            _ => Ok(None),
        }
    }

    //
    // Uptane keypair.
    //

    pub fn store_keypair(&self, pair: &KeyPair) -> Result<(), Error> {
        Util::atomic_write(&self.file("keys/ecu.type"), format!("{}", pair.keytype).as_bytes())?;
        Util::atomic_write(&self.file("keys/ecu.pub"), pair.public.as_bytes())?;
        Util::atomic_write(&self.file("keys/ecu.priv"), &pair.private)
    }

    pub fn load_keypair(&self) -> Result<Option<KeyPair>, Error> {
        let keytype = Store::read_opt(&self.file("keys/ecu.type"))?;
        let public  = Store::read_opt(&self.file("keys/ecu.pub"))?;
        let private = Store::read_opt(&self.file("keys/ecu.priv"))?;
        match (keytype, public, private) {
            (Some(keytype), Some(public), Some(private)) => {
                Ok(Some(KeyPair {
                    keytype: String::from_utf8(keytype)?.parse()?,
                    public:  String::from_utf8(public)?,
                    private: private,
                }))
            }
            _ => Ok(None),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use datatype::{KeyType, ResultCode, TufMeta};


    fn temp_store(name: &str) -> Store {
        let path = format!("/tmp/sota-test-store-{}-{}", name, ::std::process::id());
        let _ = fs::remove_dir_all(&path);
        Store::new(&path).expect("new store")
    }

    fn target(name: &str) -> Target {
        Target::new(name.into(), TufMeta::default())
    }

    #[test]
    fn roots_are_versioned() {
        let store = temp_store("roots");
        assert_eq!(store.load_latest_root(RepoName::Director).expect("empty"), None);

        store.store_root(RepoName::Director, 1, b"root-v1").expect("store v1");
        store.store_root(RepoName::Director, 2, b"root-v2").expect("store v2");
        assert_eq!(store.load_root(RepoName::Director, 1).expect("load v1"), Some(b"root-v1".to_vec()));
        let (version, bytes) = store.load_latest_root(RepoName::Director).expect("latest").expect("some");
        assert_eq!(version, 2);
        assert_eq!(bytes, b"root-v2".to_vec());

        // intermediate versions remain for lagging clients
        assert!(store.load_root(RepoName::Director, 1).expect("still v1").is_some());
        assert_eq!(store.load_latest_root(RepoName::Image).expect("other repo"), None);
    }

    #[test]
    fn non_root_is_latest_only() {
        let store = temp_store("non-root");
        store.store_non_root(RepoName::Image, RoleName::Targets, b"targets-v1").expect("store");
        store.store_non_root(RepoName::Image, RoleName::Targets, b"targets-v2").expect("replace");
        assert_eq!(store.load_non_root(RepoName::Image, RoleName::Targets).expect("load"),
                   Some(b"targets-v2".to_vec()));

        store.store_root(RepoName::Image, 1, b"root-v1").expect("root");
        store.clear_non_root(RepoName::Image).expect("clear");
        assert_eq!(store.load_non_root(RepoName::Image, RoleName::Targets).expect("cleared"), None);
        assert!(store.load_root(RepoName::Image, 1).expect("root survives").is_some());
    }

    #[test]
    fn at_most_one_current_and_pending() {
        let store = temp_store("versions");
        store.save_installed_version("ecu1", &target("a.img"), InstallMode::Current).expect("a current");
        store.save_installed_version("ecu1", &target("b.img"), InstallMode::Pending).expect("b pending");
        store.save_installed_version("ecu1", &target("c.img"), InstallMode::Pending).expect("c pending");

        let (history, current, pending) = store.load_installed_versions("ecu1").expect("load");
        assert_eq!(history.len(), 3);
        assert_eq!(current.expect("current").filepath, "a.img");
        assert_eq!(pending.expect("pending").filepath, "c.img");
        assert_eq!(history.iter().filter(|entry| entry.mode == InstallMode::Pending).count(), 1);

        // finalizing the pending install supersedes the old current
        store.save_installed_version("ecu1", &target("c.img"), InstallMode::Current).expect("c current");
        let (history, current, pending) = store.load_installed_versions("ecu1").expect("reload");
        assert_eq!(history.len(), 3);
        assert_eq!(current.expect("current").filepath, "c.img");
        assert_eq!(pending, None);
    }

    #[test]
    fn rollback_clears_pending() {
        let store = temp_store("rollback");
        store.save_installed_version("ecu1", &target("a.img"), InstallMode::Pending).expect("pending");
        store.save_installed_version("ecu1", &target("a.img"), InstallMode::None).expect("rollback");
        let (history, current, pending) = store.load_installed_versions("ecu1").expect("load");
        assert_eq!(history.len(), 1);
        assert_eq!(current, None);
        assert_eq!(pending, None);
    }

    #[test]
    fn serials_device_id_and_results() {
        let store = temp_store("identity");
        assert_eq!(store.load_ecu_serials().expect("empty"), None);
        let serials = vec![("serial-1".to_string(), "hw-1".to_string())];
        store.store_ecu_serials(&serials).expect("store serials");
        assert_eq!(store.load_ecu_serials().expect("load"), Some(serials));

        store.store_device_id("device-1").expect("device id");
        assert_eq!(store.load_device_id().expect("load"), Some("device-1".into()));

        let result = InstallResult::new("app.img".into(), ResultCode::Ok, "ok".into());
        store.save_installation_result("serial-1", &result).expect("save result");
        assert_eq!(store.load_installation_result("serial-1").expect("load"), Some(result));
    }

    #[test]
    fn keypair_round_trip() {
        let store = temp_store("keys");
        assert!(store.load_keypair().expect("empty").is_none());
        let pair = KeyPair { keytype: KeyType::Ed25519, public: "aabb".into(), private: vec![1, 2, 3] };
        store.store_keypair(&pair).expect("store");
        let loaded = store.load_keypair().expect("load").expect("some");
        assert_eq!(loaded.keytype, KeyType::Ed25519);
        assert_eq!(loaded.public, "aabb");
        assert_eq!(loaded.private, vec![1, 2, 3]);
    }

    #[test]
    fn tls_creds_round_trip() {
        let store = temp_store("tls");
        assert!(store.load_tls_creds().expect("empty").is_none());
        let creds = TlsCreds { ca: b"ca".to_vec(), cert: b"cert".to_vec(), pkey: b"pkey".to_vec() };
        store.store_tls_creds(&creds).expect("store");
        let loaded = store.load_tls_creds().expect("load").expect("some");
        assert_eq!(loaded.ca, b"ca");
        assert_eq!(loaded.cert, b"cert");
        assert_eq!(loaded.pkey, b"pkey");
    }
}
