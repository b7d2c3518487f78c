use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use datatype::{Error, InstallResult, MultiPartHasher, ResultCode, Target,
               UNKNOWN_SHA256, Util, sha256_hex};
use pacman::{InstalledImageInfo, UpdateAgent};


const CURRENT_TARGET: &'static str = "current_target";


/// Streams a binary image into a `.part` staging file while hashing it,
/// then installs by atomic rename. Installation completes immediately so
/// there is never a pending deployment to finalize.
pub struct FileAgent {
    images_dir: String,
    hasher:     Option<MultiPartHasher>,
}

impl FileAgent {
    pub fn new(images_dir: &str) -> Result<FileAgent, Error> {
        fs::create_dir_all(images_dir)?;
        Ok(FileAgent { images_dir: images_dir.into(), hasher: None })
    }

    fn staging_path(&self, target: &Target) -> String {
        format!("{}/{}.part", self.images_dir, target.filepath)
    }

    fn final_path(&self, name: &str) -> String {
        format!("{}/{}", self.images_dir, name)
    }

    fn discard_staging(&mut self, target: &Target) {
        let _ = fs::remove_file(self.staging_path(target));
        self.hasher = None;
    }
}

impl UpdateAgent for FileAgent {
    fn is_target_supported(&self, target: &Target) -> bool {
        ! target.is_ostree()
    }

    fn installed_image_info(&self) -> Result<InstalledImageInfo, Error> {
        let name_file = self.final_path(CURRENT_TARGET);
        if Path::new(&name_file).exists() {
            let name = String::from_utf8(Util::read_file(&name_file)?)?;
            let data = Util::read_file(&self.final_path(&name))?;
            Ok(InstalledImageInfo {
                name: name,
                len:  data.len() as u64,
                hash: sha256_hex(&data),
            })
        } else {
            Ok(InstalledImageInfo {
                name: "unknown".into(),
                len:  0,
                hash: UNKNOWN_SHA256.into(),
            })
        }
    }

    fn download(&mut self, target: &Target, _: &[u8]) -> ResultCode {
        error!("target {} is not an OSTree revision", target.filepath);
        ResultCode::InternalError
    }

    fn receive_data(&mut self, target: &Target, data: &[u8]) -> ResultCode {
        let staging = self.staging_path(target);
        let received = fs::metadata(&staging).map(|meta| meta.len()).unwrap_or(0);

        if received == 0 {
            let method = match target.first_hash() {
                Some((method, _)) => method,
                None => {
                    error!("no usable hash in metadata for {}", target.filepath);
                    return ResultCode::DownloadFailed;
                }
            };
            self.hasher = Some(MultiPartHasher::new(method));
        } else if self.hasher.is_none() {
            // a stale .part file from an interrupted session can't be hashed
            self.discard_staging(target);
            return ResultCode::DownloadFailed;
        }

        if received + data.len() as u64 > target.length() {
            error!("received {} bytes for {} but the target is only {} bytes",
                   received + data.len() as u64, target.filepath, target.length());
            self.discard_staging(target);
            return ResultCode::DownloadFailed;
        }

        let write = || -> Result<(), Error> {
            let mut file = OpenOptions::new().create(true).append(true).open(&staging)?;
            file.write_all(data)?;
            file.flush()?;
            Ok(())
        };
        if let Err(err) = write() {
            error!("couldn't write to staging file {}: {}", staging, err);
            self.discard_staging(target);
            return ResultCode::DownloadFailed;
        }

        self.hasher.as_mut().expect("staging hasher").update(data);
        trace!("{} bytes of {} received for {}", received + data.len() as u64,
               target.length(), target.filepath);
        ResultCode::Ok
    }

    fn install(&mut self, target: &Target) -> ResultCode {
        let staging = self.staging_path(target);
        let received = match fs::metadata(&staging) {
            Ok(meta) => meta.len(),
            Err(_) => {
                error!("no image has been received for {}", target.filepath);
                return ResultCode::DownloadFailed;
            }
        };

        if received != target.length() {
            error!("image size {} does not match metadata length {}", received, target.length());
            self.discard_staging(target);
            return ResultCode::DownloadFailed;
        }

        let digest = match self.hasher {
            Some(ref mut hasher) => (hasher.method(), hasher.finish()),
            None => {
                self.discard_staging(target);
                return ResultCode::DownloadFailed;
            }
        };
        if ! target.matches_hash(digest.0, &digest.1) {
            error!("image hash {} does not match metadata for {}", digest.1, target.filepath);
            self.discard_staging(target);
            return ResultCode::DownloadFailed;
        }

        if let Err(err) = fs::rename(&staging, self.final_path(&target.filepath)) {
            error!("couldn't move {} into place: {}", staging, err);
            self.discard_staging(target);
            return ResultCode::InstallFailed;
        }
        if let Err(err) = Util::atomic_write(&self.final_path(CURRENT_TARGET), target.filepath.as_bytes()) {
            error!("couldn't record the current target name: {}", err);
            return ResultCode::InstallFailed;
        }

        self.hasher = None;
        ResultCode::Ok
    }

    fn apply_pending_install(&mut self, target: &Target) -> InstallResult {
        InstallResult::new(target.filepath.clone(), ResultCode::InstallFailed,
                           "pending installs are not supported by the file update agent".into())
    }

    fn complete_install(&mut self) {}

    fn reboot_detected(&self) -> bool {
        false
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use testdata::TargetSpec;
    use datatype::{TufCustom, TufMeta};
    use std::collections::HashMap;


    fn temp_agent(name: &str) -> FileAgent {
        let dir = format!("/tmp/sota-test-file-agent-{}-{}", name, ::std::process::id());
        let _ = fs::remove_dir_all(&dir);
        FileAgent::new(&dir).expect("new agent")
    }

    fn binary_target(name: &str, data: &[u8]) -> Target {
        let spec = TargetSpec::binary(name, data, "serial-1", "hw-1");
        Target::new(spec.name, TufMeta {
            length: spec.length,
            hashes: hashmap!{ "sha256".into() => spec.sha256 },
            version: None,
            custom: Some(TufCustom::default()),
        })
    }

    #[test]
    fn fresh_agent_reports_unknown() {
        let agent = temp_agent("unknown");
        let info = agent.installed_image_info().expect("info");
        assert_eq!(info.name, "unknown");
        assert_eq!(info.len, 0);
        assert_eq!(info.hash, UNKNOWN_SHA256);
    }

    #[test]
    fn chunked_receive_and_install() {
        let mut agent = temp_agent("chunks");
        let target = binary_target("app.img", b"some data");

        // arbitrary chunk sizes must be accepted, including one byte
        assert_eq!(agent.receive_data(&target, b"s"), ResultCode::Ok);
        assert_eq!(agent.receive_data(&target, b"ome "), ResultCode::Ok);
        assert_eq!(agent.receive_data(&target, b"data"), ResultCode::Ok);
        assert_eq!(agent.install(&target), ResultCode::Ok);

        let info = agent.installed_image_info().expect("info");
        assert_eq!(info.name, "app.img");
        assert_eq!(info.len, 9);
        assert_eq!(info.hash, sha256_hex(b"some data"));
        assert!(! Path::new(&agent.staging_path(&target)).exists());
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let mut agent = temp_agent("oversize");
        let target = binary_target("app.img", b"some data");

        assert_eq!(agent.receive_data(&target, b"some data"), ResultCode::Ok);
        assert_eq!(agent.receive_data(&target, b"!"), ResultCode::DownloadFailed);
        assert!(! Path::new(&agent.staging_path(&target)).exists());
    }

    #[test]
    fn short_upload_fails_install() {
        let mut agent = temp_agent("short");
        let target = binary_target("app.img", b"some data");

        assert_eq!(agent.receive_data(&target, b"some"), ResultCode::Ok);
        assert_eq!(agent.install(&target), ResultCode::DownloadFailed);
        assert!(! Path::new(&agent.staging_path(&target)).exists());
        assert_eq!(agent.installed_image_info().expect("info").name, "unknown");
    }

    #[test]
    fn corrupt_upload_fails_install() {
        let mut agent = temp_agent("corrupt");
        let target = binary_target("app.img", b"some data");

        assert_eq!(agent.receive_data(&target, b"soma data"), ResultCode::Ok);
        assert_eq!(agent.install(&target), ResultCode::DownloadFailed);
        assert!(! Path::new(&agent.staging_path(&target)).exists());
    }

    #[test]
    fn install_without_receive_fails() {
        let mut agent = temp_agent("no-data");
        let target = binary_target("app.img", b"some data");
        assert_eq!(agent.install(&target), ResultCode::DownloadFailed);
    }

    #[test]
    fn ostree_targets_are_unsupported() {
        let agent = temp_agent("format");
        let spec = TargetSpec::ostree("commit", "abcd", "serial-1", "hw-1");
        let mut hashes = HashMap::new();
        hashes.insert("sha256".into(), spec.sha256);
        let target = Target::new(spec.name, TufMeta {
            length: 0,
            hashes: hashes,
            version: None,
            custom: Some(TufCustom {
                ecuIdentifiers: HashMap::new(),
                targetFormat: spec.format,
                uri: None,
            }),
        });
        assert!(! agent.is_target_supported(&target));
        assert!(agent.is_target_supported(&binary_target("app.img", b"x")));
    }
}
