use base64;
use crypto::digest::Digest;
use crypto::ed25519;
use crypto::sha2::{Sha256, Sha512};
use hex::ToHex;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::{Rsa, Padding};
use openssl::sign::Verifier as OpensslVerifier;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{RSAKeyPair, RSASigningState, RSA_PSS_SHA256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de::Error as SerdeError;
use serde_json as json;
use std::fmt::{self, Display, Formatter};
use std::os::raw::c_int;
use std::str::FromStr;
use std::sync::Arc;
use untrusted::Input;

use datatype::{Error, Signature, TufSigned, canonicalize_value};


const RSA_PKCS1_PSS_PADDING: c_int = 6;


/// The types of public key supported for an Uptane identity.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum KeyType {
    Ed25519,
    Rsa2048,
    Rsa3072,
    Rsa4096,
}

impl KeyType {
    /// The numeric key type carried by `getInfoResp` on the wire.
    pub fn to_wire(&self) -> i64 {
        match *self {
            KeyType::Ed25519 => 0,
            KeyType::Rsa2048 => 2,
            KeyType::Rsa3072 => 3,
            KeyType::Rsa4096 => 4,
        }
    }

    pub fn from_wire(val: i64) -> Result<Self, Error> {
        match val {
            0 => Ok(KeyType::Ed25519),
            2 => Ok(KeyType::Rsa2048),
            3 => Ok(KeyType::Rsa3072),
            4 => Ok(KeyType::Rsa4096),
            _ => Err(Error::TufKeyType(format!("unknown wire key type: {}", val)))
        }
    }

    pub fn sig_type(&self) -> SignatureType {
        match *self {
            KeyType::Ed25519 => SignatureType::Ed25519,
            _                => SignatureType::RsaSsaPss,
        }
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &*s.to_lowercase() {
            "ed25519"         => Ok(KeyType::Ed25519),
            "rsa" | "rsa2048" => Ok(KeyType::Rsa2048),
            "rsa3072"         => Ok(KeyType::Rsa3072),
            "rsa4096"         => Ok(KeyType::Rsa4096),
            _ => Err(Error::TufKeyType(s.to_string()))
        }
    }
}

impl Display for KeyType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            KeyType::Ed25519 => write!(f, "ed25519"),
            KeyType::Rsa2048 => write!(f, "rsa2048"),
            KeyType::Rsa3072 => write!(f, "rsa3072"),
            KeyType::Rsa4096 => write!(f, "rsa4096"),
        }
    }
}

impl<'de> Deserialize<'de> for KeyType {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        if let json::Value::String(ref s) = Deserialize::deserialize(de)? {
            s.parse().map_err(|err| SerdeError::custom(format!("unknown KeyType: {}", err)))
        } else {
            Err(SerdeError::custom("unknown KeyType"))
        }
    }
}

impl Serialize for KeyType {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(match *self {
            KeyType::Ed25519 => "ed25519",
            _                => "rsa"
        })
    }
}


/// The signing methods appearing in TUF `signatures` entries.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SignatureType {
    Ed25519,
    RsaSsaPss,
}

impl<'de> Deserialize<'de> for SignatureType {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        if let json::Value::String(ref s) = Deserialize::deserialize(de)? {
            s.parse().map_err(|err| SerdeError::custom(format!("unknown SignatureType: {}", err)))
        } else {
            Err(SerdeError::custom("unknown SignatureType"))
        }
    }
}

impl Serialize for SignatureType {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(match *self {
            SignatureType::Ed25519   => "ed25519",
            SignatureType::RsaSsaPss => "rsassa-pss-sha256"
        })
    }
}

impl FromStr for SignatureType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ed25519" => Ok(SignatureType::Ed25519),
            "rsassa-pss" | "rsassa-pss-sha256" => Ok(SignatureType::RsaSsaPss),
            _ => Err(Error::TufSigType(s.to_string()))
        }
    }
}

impl SignatureType {
    pub fn sign_msg(&self, msg: &[u8], der_key: &[u8]) -> Result<Vec<u8>, Error> {
        match *self {
            SignatureType::Ed25519 => Ok(ed25519::signature(msg, der_key).as_ref().into()),

            SignatureType::RsaSsaPss => {
                let pair = RSAKeyPair::from_der(Input::from(der_key))?;
                let mut state = RSASigningState::new(Arc::new(pair))?;
                let mut sig = vec![0; state.key_pair().public_modulus_len()];
                state.sign(&RSA_PSS_SHA256, &SystemRandom::new(), msg, &mut sig)?;
                Ok(sig)
            }
        }
    }

    pub fn verify_msg(&self, msg: &[u8], der_key: &[u8], sig: &[u8]) -> bool {
        match *self {
            SignatureType::Ed25519 => ed25519::verify(msg, der_key, sig),

            SignatureType::RsaSsaPss => {
                let verify = || -> Result<bool, Error> {
                    let pub_key = PKey::from_rsa(Rsa::public_key_from_der(der_key)?)?;
                    let mut verifier = OpensslVerifier::new(MessageDigest::sha256(), &pub_key)?;
                    verifier.set_rsa_padding(Padding::from_raw(RSA_PKCS1_PSS_PADDING))?;
                    verifier.update(msg)?;
                    Ok(verifier.verify(sig)?)
                };
                verify().unwrap_or_else(|err| { trace!("RSA SSA-PSS verification failed: {}", err); false })
            }
        }
    }

    /// Encode a raw signature the way it appears in metadata.
    pub fn encode_sig(&self, sig: &[u8]) -> String {
        match *self {
            SignatureType::Ed25519   => sig.to_hex(),
            SignatureType::RsaSsaPss => base64::encode(sig),
        }
    }
}


/// A persistent Uptane keypair with a precomputed key id.
#[derive(Clone)]
pub struct PrivateKey {
    pub keyid:   String,
    pub der_key: Vec<u8>,
}

impl PrivateKey {
    /// Sign a JSON value, returning it wrapped with its signature.
    pub fn sign_data(&self, data: json::Value, sig_type: SignatureType) -> Result<TufSigned, Error> {
        let cjson = canonicalize_value(&data)?;
        let sig = sig_type.sign_msg(&cjson, &self.der_key)?;
        Ok(TufSigned {
            signatures: vec![Signature {
                keyid:  self.keyid.clone(),
                method: sig_type,
                sig:    sig_type.encode_sig(&sig),
            }],
            signed: data,
        })
    }
}


/// A freshly generated or reloaded Uptane keypair. The public half is kept
/// in the format role metadata expects: PEM for RSA, hex for Ed25519.
pub struct KeyPair {
    pub keytype: KeyType,
    pub public:  String,
    pub private: Vec<u8>,
}

impl KeyPair {
    pub fn generate(keytype: KeyType) -> Result<KeyPair, Error> {
        match keytype {
            KeyType::Ed25519 => {
                let mut seed = [0u8; 32];
                SystemRandom::new().fill(&mut seed)?;
                let (secret, public) = ed25519::keypair(&seed);
                Ok(KeyPair {
                    keytype: keytype,
                    public:  public.to_hex(),
                    private: secret.as_ref().into(),
                })
            }

            KeyType::Rsa2048 | KeyType::Rsa3072 | KeyType::Rsa4096 => {
                let bits = match keytype {
                    KeyType::Rsa3072 => 3072,
                    KeyType::Rsa4096 => 4096,
                    _                => 2048,
                };
                let rsa = Rsa::generate(bits).map_err(|err| Error::KeyGen(err.to_string()))?;
                let der = rsa.private_key_to_der()?;
                let pem = rsa.public_key_to_pem()?;
                Ok(KeyPair {
                    keytype: keytype,
                    public:  String::from_utf8(pem)?,
                    private: der,
                })
            }
        }
    }
}


/// A hash algorithm appearing in a target's `hashes` map.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum HashMethod {
    Sha256,
    Sha512,
}

impl HashMethod {
    pub fn name(&self) -> &'static str {
        match *self {
            HashMethod::Sha256 => "sha256",
            HashMethod::Sha512 => "sha512",
        }
    }

    pub fn hash(&self, data: &[u8]) -> String {
        let mut hasher = MultiPartHasher::new(*self);
        hasher.update(data);
        hasher.finish()
    }
}

impl FromStr for HashMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &*s.to_lowercase() {
            "sha256" => Ok(HashMethod::Sha256),
            "sha512" => Ok(HashMethod::Sha512),
            _ => Err(Error::Parse(format!("unknown hash method: {}", s)))
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    HashMethod::Sha256.hash(data)
}

pub fn sha512_hex(data: &[u8]) -> String {
    HashMethod::Sha512.hash(data)
}


enum HashState {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incrementally hash data arriving in chunks.
pub struct MultiPartHasher {
    method: HashMethod,
    state:  HashState,
}

impl MultiPartHasher {
    pub fn new(method: HashMethod) -> MultiPartHasher {
        let state = match method {
            HashMethod::Sha256 => HashState::Sha256(Sha256::new()),
            HashMethod::Sha512 => HashState::Sha512(Sha512::new()),
        };
        MultiPartHasher { method: method, state: state }
    }

    pub fn method(&self) -> HashMethod {
        self.method
    }

    pub fn update(&mut self, data: &[u8]) {
        match self.state {
            HashState::Sha256(ref mut digest) => digest.input(data),
            HashState::Sha512(ref mut digest) => digest.input(data),
        }
    }

    /// The hex digest of all data seen so far.
    pub fn finish(&mut self) -> String {
        match self.state {
            HashState::Sha256(ref mut digest) => digest.result_str(),
            HashState::Sha512(ref mut digest) => digest.result_str(),
        }
    }
}
