use chrono::Utc;
use serde_json as json;
use std::process::Command;
use uuid::Uuid;

use datatype::{Config, EcuCustom, EcuVersion, Error, InstallMode, InstallResult,
               Key, KeyPair, KeyType, KeyValue, PrivateKey, RepoName, ResultCode,
               RoleName, Target, TufMeta, TufSigned, extract_version_untrusted};
use pacman::UpdateAgent;
use repository::{DirectorRepo, ImageRepo, RawMetaPack};
use store::Store;


/// The Secondary ECU lifecycle: proves its identity, verifies metadata,
/// receives and installs images, and signs version manifests. At most one
/// target is pending at a time; a verified `putMetadata` is the only way
/// to set it.
pub struct Secondary {
    serial:   String,
    hwid:     String,
    keytype:  KeyType,
    public:   String,
    privkey:  PrivateKey,
    store:    Store,
    director: DirectorRepo,
    image:    ImageRepo,
    agent:    Box<UpdateAgent>,
    pending:  Option<Target>,
}

impl Secondary {
    pub fn new(config: &Config) -> Result<Secondary, Error> {
        let store = Store::new(&config.storage.path)?;
        let agent = config.pacman.kind.new_agent(config)?;
        Secondary::with_parts(config, store, agent)
    }

    /// Build a Secondary around an explicit store and update agent.
    pub fn with_parts(config: &Config, store: Store, agent: Box<UpdateAgent>) -> Result<Secondary, Error> {
        let pair = generate_uptane_keypair(&store, config.uptane.key_type)?;
        let key = Key { keytype: pair.keytype, keyval: KeyValue { public: pair.public.clone() } };
        let keyid = key.key_id()?;

        let serials = match store.load_ecu_serials()? {
            Some(serials) => serials,
            None => {
                let serial = if config.uptane.ecu_serial.is_empty() {
                    keyid.clone()
                } else {
                    config.uptane.ecu_serial.clone()
                };
                let hwid = if config.uptane.ecu_hardware_id.is_empty() {
                    default_hardware_id()
                } else {
                    config.uptane.ecu_hardware_id.clone()
                };
                let serials = vec![(serial, hwid)];
                store.store_ecu_serials(&serials)?;
                serials
            }
        };
        let (serial, hwid) = serials[0].clone();
        if store.load_device_id()?.is_none() {
            store.store_device_id(&format!("{}", Uuid::new_v4()))?;
        }

        let mut director = DirectorRepo::new();
        let mut image = ImageRepo::new();
        director.init_from_store(&store);
        image.init_from_store(&store);

        let mut secondary = Secondary {
            serial:   serial,
            hwid:     hwid,
            keytype:  pair.keytype,
            public:   pair.public,
            privkey:  PrivateKey { keyid: keyid, der_key: pair.private },
            store:    store,
            director: director,
            image:    image,
            agent:    agent,
            pending:  None,
        };
        secondary.finalize_after_reboot()?;
        Ok(secondary)
    }

    /// If we just rebooted with an install waiting on this boot, either
    /// promote it to `current` or roll it back and drop Director targets
    /// so the next cycle re-evaluates from scratch.
    fn finalize_after_reboot(&mut self) -> Result<(), Error> {
        if ! self.agent.reboot_detected() {
            return Ok(());
        }
        info!("Reboot detected, finalizing the pending installation.");
        let (_, _, pending) = self.store.load_installed_versions(&self.serial)?;
        if let Some(pending) = pending {
            let result = self.agent.apply_pending_install(&pending);
            self.store.save_installation_result(&self.serial, &result)?;
            if result.success() {
                info!("Pending installation of {} finalized.", pending.filepath);
                self.store.save_installed_version(&self.serial, &pending, InstallMode::Current)?;
            } else {
                error!("Couldn't finalize {}: {}", pending.filepath, result.result_text);
                self.store.save_installed_version(&self.serial, &pending, InstallMode::None)?;
                self.director.drop_targets(&self.store)?;
            }
        }
        self.agent.complete_install();
        Ok(())
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn hardware_id(&self) -> &str {
        &self.hwid
    }

    /// `(serial, hwid, key type, public key)` for `getInfoResp`.
    pub fn get_info(&self) -> (String, String, KeyType, String) {
        (self.serial.clone(), self.hwid.clone(), self.keytype, self.public.clone())
    }

    /// Sign a manifest of the currently installed image, including the
    /// last recorded installation result. With no intervening state change
    /// the signed body is byte-identical between calls.
    pub fn get_manifest(&self) -> Result<TufSigned, Error> {
        let info = self.agent.installed_image_info()?;
        let hashes = hashmap!{ "sha256".to_string() => info.hash };
        let image = Target::new(info.name, TufMeta {
            length:  info.len,
            hashes:  hashes,
            version: None,
            custom:  None,
        });
        let custom = self.store.load_installation_result(&self.serial)?
            .map(|result| EcuCustom { operation_result: result });
        let version = EcuVersion::from_image(self.serial.clone(), image, custom);
        self.privkey.sign_data(json::to_value(&version)?, self.keytype.sig_type())
    }

    /// The latest stored Root version for a repo, or -1 when none exists.
    pub fn get_root_version(&self, director: bool) -> i64 {
        let repo = if director { RepoName::Director } else { RepoName::Image };
        match self.store.load_latest_root(repo) {
            Ok(Some((_, bytes))) => {
                extract_version_untrusted(&bytes).map(|version| version as i64).unwrap_or(-1)
            }
            Ok(None) => -1,
            Err(err) => {
                error!("couldn't load latest {} root: {}", repo, err);
                -1
            }
        }
    }

    /// Root rotation outside of `putMetadata` is unsupported, pending
    /// clarification from the protocol owners.
    pub fn put_root(&mut self, _root: &[u8], _director: bool) -> Result<(), Error> {
        Err(Error::PutRootUnsupported)
    }

    /// Run Uptane full verification over a received metadata pack. On
    /// success the verified documents are persisted and the single target
    /// assigned to this ECU becomes the pending target.
    pub fn put_metadata(&mut self, pack: &RawMetaPack) -> Result<(), Error> {
        self.do_full_verification(pack).map_err(|err| {
            // rebuild in-memory state from the untouched store so partial
            // acceptance cannot leak into the next cycle
            self.director.reset_meta();
            self.image.reset_meta();
            self.director.init_from_store(&self.store);
            self.image.init_from_store(&self.store);
            err
        })
    }

    fn do_full_verification(&mut self, pack: &RawMetaPack) -> Result<(), Error> {
        let now = Utc::now();
        self.director.update_meta(&self.store, pack, now)?;
        self.image.update_meta(&self.store, pack, now)?;
        {
            let image_targets = self.image.targets()
                .ok_or(Error::UptaneMissingRole(RepoName::Image, RoleName::Targets))?;
            self.director.match_with_image_targets(image_targets)?;
        }

        let mut targets = self.director.get_targets(&self.serial, &self.hwid);
        if targets.len() != 1 {
            return Err(Error::UptaneBadTargetCount(targets.len()));
        }
        let target = targets.pop().expect("single target");
        if ! self.agent.is_target_supported(&target) {
            return Err(Error::Install(format!("update agent can't install {}", target.filepath)));
        }

        self.director.persist(&self.store)?;
        self.image.persist(&self.store)?;
        info!("Metadata verified, pending target is {}.", target.filepath);
        self.pending = Some(target);
        Ok(())
    }

    /// The v1 transfer: the entire firmware in one message, or the
    /// credentials archive when the pending target is an OSTree revision.
    pub fn send_firmware(&mut self, data: &[u8]) -> Result<(), Error> {
        let target = self.pending.clone().ok_or(Error::UptaneNoPendingTarget)?;
        let code = if target.is_ostree() {
            self.agent.download(&target, data)
        } else {
            self.agent.receive_data(&target, data)
        };
        if code.is_success() {
            Ok(())
        } else {
            self.pending = None;
            Err(Error::Install(format!("firmware transfer failed for {}", target.filepath)))
        }
    }

    /// The v2 transfer: one chunk of image bytes. The pending target
    /// survives a failed chunk; the staging file does not.
    pub fn receive_image_chunk(&mut self, data: &[u8]) -> ResultCode {
        let target = match self.pending {
            Some(ref target) => target.clone(),
            None => {
                error!("no pending target to receive image data for");
                return ResultCode::InternalError;
            }
        };
        self.agent.receive_data(&target, data)
    }

    /// The v2 OSTree transfer: pull the pending revision using the
    /// supplied credentials archive.
    pub fn download_ostree_rev(&mut self, archive: &[u8]) -> ResultCode {
        let target = match self.pending {
            Some(ref target) => target.clone(),
            None => {
                error!("no pending target to download a revision for");
                return ResultCode::InternalError;
            }
        };
        self.agent.download(&target, archive)
    }

    /// Install the pending target. The agent commits filesystem intent
    /// first, then the outcome is persisted, then the caller replies — in
    /// that order, so a reboot can never observe an unrecorded install.
    pub fn install(&mut self, target_name: &str) -> ResultCode {
        let target = match self.pending {
            Some(ref target) => target.clone(),
            None => {
                error!("no pending target to install");
                return ResultCode::InternalError;
            }
        };
        if target.filepath != target_name {
            error!("asked to install `{}` but the pending target is `{}`", target_name, target.filepath);
            return ResultCode::InternalError;
        }

        let code = self.agent.install(&target);
        match code {
            ResultCode::Ok => {
                let result = InstallResult::new(target.filepath.clone(), ResultCode::Ok, "".into());
                if let Err(err) = self.store.save_installed_version(&self.serial, &target, InstallMode::Current)
                    .and_then(|()| self.store.save_installation_result(&self.serial, &result)) {
                    error!("install succeeded but couldn't be recorded: {}", err);
                    return ResultCode::InternalError;
                }
                info!("Target {} installed.", target.filepath);
                self.pending = None;
            }
            ResultCode::NeedCompletion => {
                if let Err(err) = self.store.save_installed_version(&self.serial, &target, InstallMode::Pending) {
                    error!("deployment succeeded but couldn't be recorded: {}", err);
                    return ResultCode::InternalError;
                }
                info!("Target {} deployed, waiting for a reboot to finalize.", target.filepath);
            }
            _ => {
                let result = InstallResult::new(target.filepath.clone(), code,
                                                "installation failed".into());
                if let Err(err) = self.store.save_installation_result(&self.serial, &result) {
                    error!("couldn't record the failed install: {}", err);
                }
                self.pending = None;
            }
        }
        code
    }

    /// Clear the agent's reboot flag before the process exits for reboot.
    pub fn complete_install(&mut self) {
        self.agent.complete_install();
    }

    pub fn pending_target(&self) -> Option<&Target> {
        self.pending.as_ref()
    }
}


fn generate_uptane_keypair(store: &Store, keytype: KeyType) -> Result<KeyPair, Error> {
    if let Some(pair) = store.load_keypair()? {
        if pair.keytype != keytype {
            warn!("configured key type {} differs from the stored key {}", keytype, pair.keytype);
        }
        return Ok(pair);
    }
    info!("Generating a new {} Uptane keypair.", keytype);
    let pair = KeyPair::generate(keytype)?;
    store.store_keypair(&pair)?;
    Ok(pair)
}

fn default_hardware_id() -> String {
    Command::new("hostname").output().ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown-hardware".to_string())
}
