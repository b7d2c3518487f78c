use chrono::{DateTime, Utc};
use serde_json as json;
use std::collections::HashSet;

use datatype::{Error, HashMethod, RepoName, RoleData, RoleName, Target, TufSigned,
               Verifier, canonicalize_json, extract_version_untrusted};
use store::Store;


/// A read-only source of raw metadata documents. On `putMetadata` this is
/// the pack just received from the Primary; at startup it is the store.
pub trait MetaSource {
    fn fetch_role(&self, repo: RepoName, role: RoleName, version: Option<u64>) -> Result<Vec<u8>, Error>;
}


/// The up-to-six documents of a v1/v2 `putMetaReq`, as received. Empty
/// entries stand for roles the Primary did not send.
#[derive(Default, Clone)]
pub struct RawMetaPack {
    pub director_root:    Vec<u8>,
    pub director_targets: Vec<u8>,
    pub image_root:       Vec<u8>,
    pub image_timestamp:  Vec<u8>,
    pub image_snapshot:   Vec<u8>,
    pub image_targets:    Vec<u8>,
}

impl RawMetaPack {
    fn role_bytes(&self, repo: RepoName, role: RoleName) -> Option<&[u8]> {
        let bytes: &Vec<u8> = match (repo, role) {
            (RepoName::Director, RoleName::Root)     => &self.director_root,
            (RepoName::Director, RoleName::Targets)  => &self.director_targets,
            (RepoName::Image, RoleName::Root)        => &self.image_root,
            (RepoName::Image, RoleName::Timestamp)   => &self.image_timestamp,
            (RepoName::Image, RoleName::Snapshot)    => &self.image_snapshot,
            (RepoName::Image, RoleName::Targets)     => &self.image_targets,
            _ => return None,
        };
        if bytes.is_empty() { None } else { Some(bytes) }
    }

    /// Set the document for `(repo, role)`, used when decoding a v2
    /// role-tagged collection.
    pub fn set_role(&mut self, repo: RepoName, role: RoleName, bytes: Vec<u8>) -> Result<(), Error> {
        match (repo, role) {
            (RepoName::Director, RoleName::Root)    => self.director_root = bytes,
            (RepoName::Director, RoleName::Targets) => self.director_targets = bytes,
            (RepoName::Image, RoleName::Root)       => self.image_root = bytes,
            (RepoName::Image, RoleName::Timestamp)  => self.image_timestamp = bytes,
            (RepoName::Image, RoleName::Snapshot)   => self.image_snapshot = bytes,
            (RepoName::Image, RoleName::Targets)    => self.image_targets = bytes,
            _ => return Err(Error::TufRole(format!("{} repo does not carry {}", repo, role))),
        }
        Ok(())
    }
}

impl MetaSource for RawMetaPack {
    fn fetch_role(&self, repo: RepoName, role: RoleName, version: Option<u64>) -> Result<Vec<u8>, Error> {
        let bytes = self.role_bytes(repo, role)
            .ok_or_else(|| Error::UptaneMissingRole(repo, role))?;
        if let (RoleName::Root, Some(version)) = (role, version) {
            // the pack carries a single Root; earlier versions would only
            // be requested by a client that is lagging behind it
            if version > extract_version_untrusted(bytes)? {
                return Err(Error::UptaneMissingRole(repo, role));
            }
        }
        Ok(bytes.into())
    }
}


/// The Persistent Store viewed as a metadata source, for the offline
/// re-verification done at startup.
pub struct StoreSource<'s> {
    pub store: &'s Store,
}

impl<'s> MetaSource for StoreSource<'s> {
    fn fetch_role(&self, repo: RepoName, role: RoleName, version: Option<u64>) -> Result<Vec<u8>, Error> {
        let found = match (role, version) {
            (RoleName::Root, Some(version)) => self.store.load_root(repo, version)?,
            (RoleName::Root, None) => self.store.load_latest_root(repo)?.map(|(_, bytes)| bytes),
            (role, _) => self.store.load_non_root(repo, role)?,
        };
        found.ok_or_else(|| Error::UptaneMissingRole(repo, role))
    }
}


/// The trusted Root of one repository and the machinery to advance it,
/// including the dual-signature rotation chain.
struct RootChain {
    repo: RepoName,
    root: Option<RoleData>,
}

impl RootChain {
    fn new(repo: RepoName) -> Self {
        RootChain { repo: repo, root: None }
    }

    /// Parse a Root document and verify it against its own `root` role.
    fn self_verified(&self, bytes: &[u8]) -> Result<RoleData, Error> {
        let signed = json::from_slice::<TufSigned>(bytes)?;
        let data = json::from_value::<RoleData>(signed.signed.clone())?;
        if data._type != RoleName::Root {
            return Err(Error::TufRole(format!("expected `root`, got `{}`", data._type)));
        }
        Verifier::from_root(&data)?.verify_signatures(self.repo, RoleName::Root, &signed)?;
        Ok(data)
    }

    fn load_from_store(&mut self, store: &Store) -> Result<(), Error> {
        if let Some((_, bytes)) = store.load_latest_root(self.repo)? {
            self.root = Some(self.self_verified(&bytes)?);
        }
        Ok(())
    }

    /// Establish an initial trusted Root, then follow the rotation chain
    /// one version at a time. Each new Root must verify under the previous
    /// Root's `root` role as well as its own, and rotating drops all
    /// non-Root metadata for the repo.
    fn update(&mut self, store: &Store, src: &MetaSource) -> Result<(), Error> {
        if self.root.is_none() {
            self.load_from_store(store)?;
        }
        if self.root.is_none() {
            let bytes = src.fetch_role(self.repo, RoleName::Root, Some(1))?;
            let data = self.self_verified(&bytes)?;
            if data.version != 1 {
                return Err(Error::UptaneVersionMismatch(RoleName::Root));
            }
            store.store_root(self.repo, 1, &bytes)?;
            self.root = Some(data);
        }

        let newest = src.fetch_role(self.repo, RoleName::Root, None)?;
        let newest_version = extract_version_untrusted(&newest)?;
        let mut version = self.root.as_ref().expect("trusted root").version;
        while version < newest_version {
            let bytes = src.fetch_role(self.repo, RoleName::Root, Some(version + 1))?;
            let signed = json::from_slice::<TufSigned>(&bytes)?;
            Verifier::from_root(self.root.as_ref().expect("trusted root"))?
                .verify_signatures(self.repo, RoleName::Root, &signed)?;
            let data = self.self_verified(&bytes)?;
            if data.version != version + 1 {
                return Err(Error::UptaneVersionMismatch(RoleName::Root));
            }
            info!("{} repo root rotated to version {}", self.repo, data.version);
            store.store_root(self.repo, data.version, &bytes)?;
            store.clear_non_root(self.repo)?;
            self.root = Some(data);
            version += 1;
        }
        Ok(())
    }

    fn check_expired(&self, now: DateTime<Utc>) -> Result<(), Error> {
        let root = self.trusted()?;
        if root.expired_at(now) {
            Err(Error::UptaneExpired(self.repo, RoleName::Root))
        } else {
            Ok(())
        }
    }

    fn trusted(&self) -> Result<&RoleData, Error> {
        self.root.as_ref().ok_or_else(|| Error::UptaneMissingRole(self.repo, RoleName::Root))
    }

    fn verifier(&self) -> Result<Verifier, Error> {
        Verifier::from_root(self.trusted()?)
    }
}


/// Verify a non-root role against the trusted Root, also rejecting any
/// version below `floor`.
fn verified_role(chain: &RootChain,
                 bytes: &[u8],
                 role: RoleName,
                 floor: Option<u64>,
                 now: DateTime<Utc>) -> Result<RoleData, Error> {
    let signed = json::from_slice::<TufSigned>(bytes)?;
    let data = chain.verifier()?.verify_role(chain.repo, role, &signed)?;
    if let Some(floor) = floor {
        if data.version < floor {
            return Err(Error::UptaneVersionDowngrade(chain.repo, role));
        }
    }
    if data.expired_at(now) {
        return Err(Error::UptaneExpired(chain.repo, role));
    }
    Ok(data)
}

/// Check a document against the hashes a declaring role published for it.
/// Every hash of a known type must match and at least one must be present.
fn check_declared_hashes(declaring: &RoleData, name: &str, bytes: &[u8], role: RoleName) -> Result<(), Error> {
    let meta = declaring.meta.as_ref()
        .and_then(|meta| meta.get(name))
        .ok_or_else(|| Error::UptaneHashMismatch(role))?;

    let canonical = canonicalize_json(bytes)?;
    let mut found = false;
    for (method, expected) in &meta.hashes {
        let method = match method.parse::<HashMethod>() {
            Ok(method) => method,
            Err(_) => continue,
        };
        if &method.hash(&canonical) != expected {
            return Err(Error::UptaneHashMismatch(role));
        }
        found = true;
    }
    if ! found {
        return Err(Error::UptaneHashMismatch(role));
    }
    Ok(())
}

/// The version the declaring role pins for a document.
fn declared_version(declaring: &RoleData, name: &str, role: RoleName) -> Result<u64, Error> {
    declaring.meta.as_ref()
        .and_then(|meta| meta.get(name))
        .and_then(|meta| meta.version)
        .ok_or_else(|| Error::UptaneVersionMismatch(role))
}


/// The Director repository: authoritative on which target this ECU should
/// install. Holds the trusted Root plus the latest accepted Targets.
pub struct DirectorRepo {
    chain:       RootChain,
    targets:     Option<RoleData>,
    targets_raw: Option<Vec<u8>>,
}

impl DirectorRepo {
    pub fn new() -> Self {
        DirectorRepo {
            chain:       RootChain::new(RepoName::Director),
            targets:     None,
            targets_raw: None,
        }
    }

    /// Rebuild in-memory state from the store, skipping anything that no
    /// longer verifies.
    pub fn init_from_store(&mut self, store: &Store) {
        if let Err(err) = self.chain.load_from_store(store) {
            error!("couldn't load director root from store: {}", err);
            return;
        }
        if self.chain.root.is_none() {
            return;
        }
        match store.load_non_root(RepoName::Director, RoleName::Targets) {
            Ok(Some(bytes)) => {
                match self.verify_targets(&bytes) {
                    Ok(data) => {
                        self.targets = Some(data);
                        self.targets_raw = Some(bytes);
                    }
                    Err(err) => error!("stored director targets no longer verify: {}", err),
                }
            }
            Ok(None) => (),
            Err(err) => error!("couldn't load director targets from store: {}", err),
        }
    }

    fn verify_targets(&self, bytes: &[u8]) -> Result<RoleData, Error> {
        let signed = json::from_slice::<TufSigned>(bytes)?;
        self.chain.verifier()?.verify_role(RepoName::Director, RoleName::Targets, &signed)
    }

    /// Advance Director metadata from the given source: Root (with
    /// rotation), then Targets, with the additional Director-only checks
    /// that there are no delegations and no ECU appears twice.
    pub fn update_meta(&mut self, store: &Store, src: &MetaSource, now: DateTime<Utc>) -> Result<(), Error> {
        self.chain.update(store, src)?;
        self.chain.check_expired(now)?;

        let bytes = src.fetch_role(RepoName::Director, RoleName::Targets, None)?;
        let floor = self.known_targets_version(store)?;
        let data = verified_role(&self.chain, &bytes, RoleName::Targets, floor, now)?;

        if data.has_delegations() {
            return Err(Error::UptaneUnexpectedDelegation);
        }
        let mut seen = HashSet::new();
        if let Some(ref targets) = data.targets {
            for meta in targets.values() {
                if let Some(ref custom) = meta.custom {
                    for serial in custom.ecuIdentifiers.keys() {
                        if ! seen.insert(serial.clone()) {
                            return Err(Error::UptaneDuplicateEcu(serial.clone()));
                        }
                    }
                }
            }
        }

        self.targets = Some(data);
        self.targets_raw = Some(bytes);
        Ok(())
    }

    /// The highest Targets version already accepted, from memory or store.
    fn known_targets_version(&self, store: &Store) -> Result<Option<u64>, Error> {
        let stored = match store.load_non_root(RepoName::Director, RoleName::Targets)? {
            Some(bytes) => Some(extract_version_untrusted(&bytes)?),
            None => None,
        };
        let cached = self.targets.as_ref().map(|data| data.version);
        Ok(match (stored, cached) {
            (Some(a), Some(b)) => Some(if a > b { a } else { b }),
            (stored, cached) => stored.or(cached),
        })
    }

    /// Persist the accepted Targets; called only once a whole
    /// `putMetadata` pass has succeeded.
    pub fn persist(&self, store: &Store) -> Result<(), Error> {
        match self.targets_raw {
            Some(ref raw) => store.store_non_root(RepoName::Director, RoleName::Targets, raw),
            None => Err(Error::UptaneMissingRole(RepoName::Director, RoleName::Targets)),
        }
    }

    /// The subset of Director targets assigned to `(serial, hwid)`.
    pub fn get_targets(&self, serial: &str, hwid: &str) -> Vec<Target> {
        let mut found = Vec::new();
        if let Some(ref data) = self.targets {
            if let Some(ref targets) = data.targets {
                for (filepath, meta) in targets {
                    let target = Target::new(filepath.clone(), meta.clone());
                    if target.hw_id_for(serial) == Some(hwid) {
                        found.push(target);
                    }
                }
            }
        }
        found
    }

    /// Every Director target must appear in Image Targets with identical
    /// filename, length and hash set.
    pub fn match_with_image_targets(&self, image_targets: &RoleData) -> Result<(), Error> {
        let ours = self.targets.as_ref().and_then(|data| data.targets.as_ref())
            .ok_or_else(|| Error::UptaneMissingRole(RepoName::Director, RoleName::Targets))?;
        let theirs = image_targets.targets.as_ref()
            .ok_or_else(|| Error::UptaneMissingRole(RepoName::Image, RoleName::Targets))?;

        for (filepath, meta) in ours {
            let other = theirs.get(filepath)
                .ok_or_else(|| Error::UptaneTargetMismatch(format!("`{}` not in image targets", filepath)))?;
            if other.length != meta.length {
                return Err(Error::UptaneTargetMismatch(format!("`{}` length differs", filepath)));
            }
            if other.hashes != meta.hashes {
                return Err(Error::UptaneTargetMismatch(format!("`{}` hashes differ", filepath)));
            }
        }
        Ok(())
    }

    /// Forget non-Root state so a failed verification cannot leak forward.
    /// The trusted Root survives: it is persisted and monotone.
    pub fn reset_meta(&mut self) {
        self.targets = None;
        self.targets_raw = None;
    }

    /// Forget the accepted Targets in memory and in the store, so the next
    /// cycle re-evaluates from scratch after a failed finalization.
    pub fn drop_targets(&mut self, store: &Store) -> Result<(), Error> {
        self.reset_meta();
        store.clear_non_root(RepoName::Director)
    }

    pub fn root_version(&self) -> Option<u64> {
        self.chain.root.as_ref().map(|root| root.version)
    }

    pub fn targets_version(&self) -> Option<u64> {
        self.targets.as_ref().map(|data| data.version)
    }
}


/// The Image repository: authoritative on target content. Holds the
/// trusted Root plus the latest accepted Timestamp, Snapshot and Targets.
pub struct ImageRepo {
    chain:         RootChain,
    timestamp:     Option<RoleData>,
    timestamp_raw: Option<Vec<u8>>,
    snapshot:      Option<RoleData>,
    snapshot_raw:  Option<Vec<u8>>,
    targets:       Option<RoleData>,
    targets_raw:   Option<Vec<u8>>,
}

impl ImageRepo {
    pub fn new() -> Self {
        ImageRepo {
            chain:         RootChain::new(RepoName::Image),
            timestamp:     None,
            timestamp_raw: None,
            snapshot:      None,
            snapshot_raw:  None,
            targets:       None,
            targets_raw:   None,
        }
    }

    pub fn init_from_store(&mut self, store: &Store) {
        if let Err(err) = self.chain.load_from_store(store) {
            error!("couldn't load image root from store: {}", err);
            return;
        }
        if self.chain.root.is_none() {
            return;
        }
        for &role in &[RoleName::Timestamp, RoleName::Snapshot, RoleName::Targets] {
            match store.load_non_root(RepoName::Image, role) {
                Ok(Some(bytes)) => {
                    let verified = json::from_slice::<TufSigned>(&bytes)
                        .map_err(Error::from)
                        .and_then(|signed| {
                            self.chain.verifier()?.verify_role(RepoName::Image, role, &signed)
                        });
                    match verified {
                        Ok(data) => self.set_role(role, data, bytes),
                        Err(err) => error!("stored image {} no longer verifies: {}", role, err),
                    }
                }
                Ok(None) => (),
                Err(err) => error!("couldn't load image {} from store: {}", role, err),
            }
        }
    }

    fn set_role(&mut self, role: RoleName, data: RoleData, bytes: Vec<u8>) {
        match role {
            RoleName::Timestamp => { self.timestamp = Some(data); self.timestamp_raw = Some(bytes); }
            RoleName::Snapshot  => { self.snapshot = Some(data); self.snapshot_raw = Some(bytes); }
            RoleName::Targets   => { self.targets = Some(data); self.targets_raw = Some(bytes); }
            RoleName::Root      => unreachable!("roots are held by the chain"),
        }
    }

    /// Advance Image metadata: Root (with rotation), then Timestamp,
    /// Snapshot and Targets, each hash-chained to the role before it.
    pub fn update_meta(&mut self, store: &Store, src: &MetaSource, now: DateTime<Utc>) -> Result<(), Error> {
        self.chain.update(store, src)?;
        self.chain.check_expired(now)?;

        // Timestamp: signature, monotone version, expiry
        let ts_bytes = src.fetch_role(RepoName::Image, RoleName::Timestamp, None)?;
        let ts_floor = self.known_version(store, RoleName::Timestamp, &self.timestamp)?;
        let timestamp = verified_role(&self.chain, &ts_bytes, RoleName::Timestamp, ts_floor, now)?;

        // Snapshot: hash from Timestamp, signature, declared version, expiry
        let sn_bytes = src.fetch_role(RepoName::Image, RoleName::Snapshot, None)?;
        check_declared_hashes(&timestamp, "snapshot.json", &sn_bytes, RoleName::Snapshot)?;
        let snapshot = verified_role(&self.chain, &sn_bytes, RoleName::Snapshot, None, now)?;
        if snapshot.version != declared_version(&timestamp, "snapshot.json", RoleName::Snapshot)? {
            return Err(Error::UptaneVersionMismatch(RoleName::Snapshot));
        }

        // Targets: hash from Snapshot, signature, declared version, expiry
        let tg_bytes = src.fetch_role(RepoName::Image, RoleName::Targets, None)?;
        check_declared_hashes(&snapshot, "targets.json", &tg_bytes, RoleName::Targets)?;
        let targets = verified_role(&self.chain, &tg_bytes, RoleName::Targets, None, now)?;
        if targets.version != declared_version(&snapshot, "targets.json", RoleName::Targets)? {
            return Err(Error::UptaneVersionMismatch(RoleName::Targets));
        }

        self.set_role(RoleName::Timestamp, timestamp, ts_bytes);
        self.set_role(RoleName::Snapshot, snapshot, sn_bytes);
        self.set_role(RoleName::Targets, targets, tg_bytes);
        Ok(())
    }

    fn known_version(&self, store: &Store, role: RoleName, cached: &Option<RoleData>)
                     -> Result<Option<u64>, Error> {
        let stored = match store.load_non_root(RepoName::Image, role)? {
            Some(bytes) => Some(extract_version_untrusted(&bytes)?),
            None => None,
        };
        let cached = cached.as_ref().map(|data| data.version);
        Ok(match (stored, cached) {
            (Some(a), Some(b)) => Some(if a > b { a } else { b }),
            (stored, cached) => stored.or(cached),
        })
    }

    /// Persist all accepted non-Root roles; called only once a whole
    /// `putMetadata` pass has succeeded.
    pub fn persist(&self, store: &Store) -> Result<(), Error> {
        for &(role, ref raw) in &[(RoleName::Timestamp, &self.timestamp_raw),
                                  (RoleName::Snapshot, &self.snapshot_raw),
                                  (RoleName::Targets, &self.targets_raw)] {
            match *raw {
                Some(ref bytes) => store.store_non_root(RepoName::Image, role, bytes)?,
                None => return Err(Error::UptaneMissingRole(RepoName::Image, role)),
            }
        }
        Ok(())
    }

    pub fn targets(&self) -> Option<&RoleData> {
        self.targets.as_ref()
    }

    pub fn reset_meta(&mut self) {
        self.timestamp = None;
        self.timestamp_raw = None;
        self.snapshot = None;
        self.snapshot_raw = None;
        self.targets = None;
        self.targets_raw = None;
    }

    pub fn root_version(&self) -> Option<u64> {
        self.chain.root.as_ref().map(|root| root.version)
    }
}
