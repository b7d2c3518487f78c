pub mod file;
pub mod ostree;

pub use self::file::FileAgent;
pub use self::ostree::OstreeAgent;

use serde::{Deserialize, Deserializer};
use serde::de::Error as SerdeError;
use serde_json as json;
use std::str::FromStr;

use datatype::{Config, Error, InstallResult, ResultCode, Target};


/// What the update agent knows about the currently installed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledImageInfo {
    pub name: String,
    pub len:  u64,
    pub hash: String,
}

/// The seam between the Secondary's lifecycle and the mechanics of putting
/// bytes on disk. One implementation is chosen at startup and never changes.
pub trait UpdateAgent {
    /// Whether this agent can install the given target at all.
    fn is_target_supported(&self, target: &Target) -> bool;

    /// Identify the installed image for the signed manifest.
    fn installed_image_info(&self) -> Result<InstalledImageInfo, Error>;

    /// Fetch an OSTree revision using the supplied credentials archive.
    fn download(&mut self, target: &Target, data: &[u8]) -> ResultCode;

    /// Append a chunk of streamed image bytes to the staging area.
    fn receive_data(&mut self, target: &Target, data: &[u8]) -> ResultCode;

    /// Install the fully received target.
    fn install(&mut self, target: &Target) -> ResultCode;

    /// Finalize an install that was waiting on a reboot.
    fn apply_pending_install(&mut self, target: &Target) -> InstallResult;

    /// Clear the agent's reboot flag once finalization is done.
    fn complete_install(&mut self);

    /// Whether we just booted with an installation waiting to finalize.
    fn reboot_detected(&self) -> bool;
}


/// The available update agents, selected by `pacman.type`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PacMan {
    File,
    Ostree,
}

impl PacMan {
    /// Construct the configured update agent.
    pub fn new_agent(&self, config: &Config) -> Result<Box<UpdateAgent>, Error> {
        match *self {
            PacMan::File => Ok(Box::new(FileAgent::new(&config.pacman.images_path)?)),
            PacMan::Ostree => Ok(Box::new(OstreeAgent::new(&config.pacman.sysroot,
                                                          &config.pacman.os,
                                                          &config.storage.path))),
        }
    }
}

impl FromStr for PacMan {
    type Err = Error;

    fn from_str(s: &str) -> Result<PacMan, Error> {
        match &*s.to_lowercase() {
            "file" | "none" => Ok(PacMan::File),
            "ostree"        => Ok(PacMan::Ostree),
            _ => Err(Error::Parse(format!("unknown pacman type: {}", s)))
        }
    }
}

impl<'de> Deserialize<'de> for PacMan {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<PacMan, D::Error> {
        if let json::Value::String(ref s) = Deserialize::deserialize(de)? {
            s.parse().map_err(|err| SerdeError::custom(format!("invalid pacman type: {}", err)))
        } else {
            Err(SerdeError::custom("pacman type is not a string"))
        }
    }
}
