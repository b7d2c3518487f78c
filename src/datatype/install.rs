use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de::Error as SerdeError;
use serde_json as json;

use datatype::Target;


/// The outcome of an installation step as carried by `installResp` and
/// `downloadOstreeRevResp`. The numeric assignments are part of the wire
/// contract and must not change.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ResultCode {
    Ok,
    AlreadyProcessed,
    VerificationFailed,
    InstallFailed,
    DownloadFailed,
    InternalError,
    GeneralError,
    NeedCompletion,
    Unknown,
}

impl ResultCode {
    pub fn to_wire(&self) -> i64 {
        match *self {
            ResultCode::Ok                 => 0,
            ResultCode::AlreadyProcessed   => 1,
            ResultCode::VerificationFailed => 3,
            ResultCode::InstallFailed      => 4,
            ResultCode::DownloadFailed     => 5,
            ResultCode::InternalError      => 18,
            ResultCode::GeneralError       => 19,
            ResultCode::NeedCompletion     => 21,
            ResultCode::Unknown            => -1,
        }
    }

    pub fn from_wire(val: i64) -> ResultCode {
        match val {
            0  => ResultCode::Ok,
            1  => ResultCode::AlreadyProcessed,
            3  => ResultCode::VerificationFailed,
            4  => ResultCode::InstallFailed,
            5  => ResultCode::DownloadFailed,
            18 => ResultCode::InternalError,
            19 => ResultCode::GeneralError,
            21 => ResultCode::NeedCompletion,
            _  => ResultCode::Unknown,
        }
    }

    /// Did the operation leave the ECU in a good state?
    pub fn is_success(&self) -> bool {
        match *self {
            ResultCode::Ok | ResultCode::AlreadyProcessed => true,
            _ => false
        }
    }
}

impl Serialize for ResultCode {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_i64(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for ResultCode {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let val = json::Value::deserialize(de)?;
        val.as_i64()
            .map(ResultCode::from_wire)
            .ok_or_else(|| SerdeError::custom("ResultCode is not a number"))
    }
}


/// An installation result as recorded in the store and reported inside the
/// signed ECU manifest.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct InstallResult {
    pub id:          String,
    pub result_code: ResultCode,
    pub result_text: String,
}

impl InstallResult {
    pub fn new(id: String, code: ResultCode, text: String) -> Self {
        InstallResult { id: id, result_code: code, result_text: text }
    }

    pub fn success(&self) -> bool {
        self.result_code.is_success()
    }
}


/// How an entry in the installed-versions history relates to the present.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub enum InstallMode {
    #[serde(rename = "current")]
    Current,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "none")]
    None,
}

/// One entry of the per-ECU installation history.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct InstalledVersion {
    pub target: Target,
    pub mode:   InstallMode,
}
