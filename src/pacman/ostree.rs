use std::ffi::OsStr;
use std::fmt::Debug;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::process::{Command, Output};
use std::str;
use url::Url;
use zip::ZipArchive;

use datatype::{Error, InstallResult, ResultCode, Target, UNKNOWN_SHA256, Util};
use pacman::{InstalledImageInfo, UpdateAgent};


const REMOTE_NAME:  &'static str = "sota-remote";
const REBOOT_FLAG:  &'static str = "need_reboot";


/// Run the external `ostree` binary against the configured sysroot.
struct Ostree;

impl Ostree {
    fn run<S: AsRef<OsStr> + Debug>(sysroot: &str, args: &[S]) -> Result<Output, Error> {
        debug!("running `ostree` command with args: {:?}", args);
        Command::new("ostree")
            .args(args)
            .env("OSTREE_REPO", format!("{}/ostree/repo", sysroot))
            .output()
            .map_err(|err| Error::OsTree(err.to_string()))
            .and_then(|output| {
                if output.status.success() {
                    Ok(output)
                } else {
                    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    Err(Error::OsTree(format!("stdout: {}\nstderr: {}", stdout, stderr)))
                }
            })
    }
}


/// The contents of a treehub credentials archive.
pub struct OstreeCreds {
    pub ca:     Vec<u8>,
    pub cert:   Vec<u8>,
    pub pkey:   Vec<u8>,
    pub server: Url,
}

/// Unpack a ZIP credentials archive with `ca.pem`, `client.pem`,
/// `pkey.pem` and a `server.url` entry (optionally whitespace-terminated).
pub fn extract_credentials(archive: &[u8]) -> Result<OstreeCreds, Error> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;
    let read_entry = |zip: &mut ZipArchive<Cursor<&[u8]>>, name: &str| -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        zip.by_name(name)?.read_to_end(&mut buf)?;
        Ok(buf)
    };

    let ca = read_entry(&mut zip, "ca.pem")?;
    let cert = read_entry(&mut zip, "client.pem")?;
    let pkey = read_entry(&mut zip, "pkey.pem")?;
    let server = String::from_utf8(read_entry(&mut zip, "server.url")?)?;
    Ok(OstreeCreds {
        ca:     ca,
        cert:   cert,
        pkey:   pkey,
        server: server.trim().parse::<Url>()?,
    })
}


/// Drives the OSTree sysroot: pulls commits from a remote using the
/// credentials handed over by the Primary, deploys them, and finalizes
/// after the reboot that activates a deployment.
pub struct OstreeAgent {
    sysroot:     String,
    os:          String,
    reboot_flag: String,
    creds_dir:   String,
}

impl OstreeAgent {
    pub fn new(sysroot: &str, os: &str, storage_path: &str) -> OstreeAgent {
        OstreeAgent {
            sysroot:     sysroot.into(),
            os:          os.into(),
            reboot_flag: format!("{}/{}", storage_path, REBOOT_FLAG),
            creds_dir:   format!("{}/treehub-creds", storage_path),
        }
    }

    /// The commit of the currently booted deployment.
    fn booted_commit(&self) -> Result<Deployment, Error> {
        let output = Ostree::run(&self.sysroot, &["admin", "status"])?;
        Deployment::parse(str::from_utf8(&output.stdout)?)?
            .into_iter()
            .find(|deployment| deployment.current)
            .ok_or_else(|| Error::OsTree("no currently booted deployment".into()))
    }

    fn add_remote(&self, creds: &OstreeCreds) -> Result<(), Error> {
        fs::create_dir_all(&self.creds_dir)?;
        let ca_path = format!("{}/ca.pem", self.creds_dir);
        let cert_path = format!("{}/client.pem", self.creds_dir);
        let pkey_path = format!("{}/pkey.pem", self.creds_dir);
        Util::write_file(&ca_path, &creds.ca)?;
        Util::write_file(&cert_path, &creds.cert)?;
        Util::write_file(&pkey_path, &creds.pkey)?;

        let _ = Ostree::run(&self.sysroot, &["remote", "delete", REMOTE_NAME]);
        Ostree::run(&self.sysroot, &[
            "remote".into(), "add".into(), "--no-gpg-verify".into(),
            format!("--set=tls-ca-path={}", ca_path),
            format!("--set=tls-client-cert-path={}", cert_path),
            format!("--set=tls-client-key-path={}", pkey_path),
            REMOTE_NAME.into(),
            format!("{}", creds.server),
        ]).map(|_| ())
    }

    fn commit_is_local(&self, commit: &str) -> bool {
        Ostree::run(&self.sysroot, &["rev-parse", commit]).is_ok()
    }
}

impl UpdateAgent for OstreeAgent {
    fn is_target_supported(&self, target: &Target) -> bool {
        target.is_ostree()
    }

    fn installed_image_info(&self) -> Result<InstalledImageInfo, Error> {
        match self.booted_commit() {
            Ok(deployment) => Ok(InstalledImageInfo {
                name: deployment.refspec,
                len:  0,
                hash: deployment.commit,
            }),
            Err(err) => {
                debug!("no booted deployment found: {}", err);
                Ok(InstalledImageInfo {
                    name: "unknown".into(),
                    len:  0,
                    hash: UNKNOWN_SHA256.into(),
                })
            }
        }
    }

    fn download(&mut self, target: &Target, data: &[u8]) -> ResultCode {
        let commit = match target.sha256() {
            Some(commit) => commit.to_string(),
            None => {
                error!("no sha256 commit hash for {}", target.filepath);
                return ResultCode::InternalError;
            }
        };
        if self.commit_is_local(&commit) {
            info!("commit {} is already in the local repo", commit);
            return ResultCode::AlreadyProcessed;
        }

        let creds = match extract_credentials(data) {
            Ok(creds) => creds,
            Err(err) => {
                error!("couldn't unpack treehub credentials: {}", err);
                return ResultCode::DownloadFailed;
            }
        };
        if let Err(err) = self.add_remote(&creds) {
            error!("couldn't add the treehub remote: {}", err);
            return ResultCode::DownloadFailed;
        }
        match Ostree::run(&self.sysroot, &["pull", REMOTE_NAME, commit.as_str()]) {
            Ok(_) => ResultCode::Ok,
            Err(err) => {
                error!("couldn't pull commit {}: {}", commit, err);
                ResultCode::DownloadFailed
            }
        }
    }

    fn receive_data(&mut self, target: &Target, _: &[u8]) -> ResultCode {
        error!("{} is an OSTree revision and must be downloaded, not uploaded", target.filepath);
        ResultCode::InternalError
    }

    fn install(&mut self, target: &Target) -> ResultCode {
        let commit = match target.sha256() {
            Some(commit) => commit.to_string(),
            None => return ResultCode::InternalError,
        };
        let mut args = vec!["admin".to_string(), "deploy".to_string()];
        if ! self.os.is_empty() {
            args.push(format!("--os={}", self.os));
        }
        args.push(commit.clone());

        match Ostree::run(&self.sysroot, &args) {
            Ok(_) => {
                // deployment is staged; it activates on the next boot
                if let Err(err) = Util::write_file(&self.reboot_flag, b"1") {
                    error!("couldn't set the reboot flag: {}", err);
                    return ResultCode::InstallFailed;
                }
                ResultCode::NeedCompletion
            }
            Err(err) => {
                error!("couldn't deploy commit {}: {}", commit, err);
                ResultCode::InstallFailed
            }
        }
    }

    fn apply_pending_install(&mut self, target: &Target) -> InstallResult {
        let expected = target.sha256().unwrap_or("");
        match self.booted_commit() {
            Ok(ref deployment) if deployment.commit == expected => {
                InstallResult::new(target.filepath.clone(), ResultCode::Ok, "".into())
            }
            Ok(deployment) => {
                InstallResult::new(target.filepath.clone(), ResultCode::InstallFailed,
                                   format!("booted into {} instead of {}", deployment.commit, expected))
            }
            Err(err) => {
                InstallResult::new(target.filepath.clone(), ResultCode::InstallFailed,
                                   format!("couldn't read the booted deployment: {}", err))
            }
        }
    }

    fn complete_install(&mut self) {
        let _ = fs::remove_file(&self.reboot_flag);
    }

    fn reboot_detected(&self) -> bool {
        Path::new(&self.reboot_flag).exists()
    }
}


/// One deployment line pair from `ostree admin status`.
#[derive(Debug)]
struct Deployment {
    current: bool,
    os_name: String,
    commit:  String,
    refspec: String,
}

impl Deployment {
    fn parse(stdout: &str) -> Result<Vec<Deployment>, Error> {
        stdout.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .chunks(2)
            .map(|pair| {
                if pair.len() != 2 {
                    return Err(Error::Parse(format!("dangling status line: {:?}", pair)));
                }
                let first  = pair[0].split(' ').collect::<Vec<_>>();
                let second = pair[1].split(' ').collect::<Vec<_>>();

                let (current, os_name, commit_id) = match first.len() {
                    2 => (false, first[0], first[1]),
                    3 if first[0].trim() == "*" => (true, first[1], first[2]),
                    _ => return Err(Error::Parse(format!("couldn't parse deployment: {:?}", first)))
                };
                let commit = commit_id.split('.').next().expect("commit id");
                let refspec = match second.len() {
                    3 if second[0].trim() == "origin" && second[1].trim() == "refspec:" => second[2],
                    _ => return Err(Error::Parse(format!("couldn't parse deployment: {:?}", second)))
                };

                Ok(Deployment {
                    current: current,
                    os_name: os_name.into(),
                    commit:  commit.into(),
                    refspec: refspec.into(),
                })
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::FileOptions;


    const ADMIN_STATUS: &'static str = r#"
          poky 10b2be0b055fcb15e10a0669fd09c9d84f20f24b3461aa13186b76a81a1f4a01.0
            origin refspec: poky/sota
        * poky 5f91b49c8d4b20bbff25282632c5eb93b2a254dfcd0a447b787f9f2ba101e8a4.0
            origin refspec: osname:poky/sota
        "#;

    #[test]
    fn parse_admin_status() {
        let deployments = Deployment::parse(ADMIN_STATUS).expect("parse status");
        assert_eq!(deployments.len(), 2);
        assert!(!deployments[0].current);
        assert_eq!(deployments[0].os_name, "poky");
        assert_eq!(deployments[0].commit, "10b2be0b055fcb15e10a0669fd09c9d84f20f24b3461aa13186b76a81a1f4a01");
        assert_eq!(deployments[0].refspec, "poky/sota");
        assert!(deployments[1].current);
        assert_eq!(deployments[1].commit, "5f91b49c8d4b20bbff25282632c5eb93b2a254dfcd0a447b787f9f2ba101e8a4");
    }

    fn credentials_zip(server: &str) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for &(name, data) in &[("ca.pem", "ca data"), ("client.pem", "cert data"),
                               ("pkey.pem", "pkey data"), ("server.url", server)] {
            zip.start_file(name, FileOptions::default()).expect("start file");
            zip.write_all(data.as_bytes()).expect("write entry");
        }
        zip.finish().expect("finish zip").into_inner()
    }

    #[test]
    fn unpack_credentials_archive() {
        let archive = credentials_zip("https://treehub.example.com/api/v3\n");
        let creds = extract_credentials(&archive).expect("extract");
        assert_eq!(creds.ca, b"ca data");
        assert_eq!(creds.cert, b"cert data");
        assert_eq!(creds.pkey, b"pkey data");
        assert_eq!(format!("{}", creds.server), "https://treehub.example.com/api/v3");
    }

    #[test]
    fn truncated_credentials_archive_fails() {
        let archive = credentials_zip("https://treehub.example.com\n");
        assert!(extract_credentials(&archive[..archive.len() / 2]).is_err());
    }

    #[test]
    fn reboot_flag_round_trip() {
        let dir = format!("/tmp/sota-test-ostree-{}", ::std::process::id());
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("create dir");

        let mut agent = OstreeAgent::new("/sysroot", "poky", &dir);
        assert!(!agent.reboot_detected());
        Util::write_file(&agent.reboot_flag, b"1").expect("set flag");
        assert!(agent.reboot_detected());
        agent.complete_install();
        assert!(!agent.reboot_detected());
        fs::remove_dir_all(&dir).expect("cleanup");
    }
}
