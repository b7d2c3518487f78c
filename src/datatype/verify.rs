use base64;
use hex::FromHex;
use pem;
use serde_json as json;
use std::collections::{HashMap, HashSet};

use datatype::{Error, Key, KeyType, RepoName, RoleData, RoleMeta, RoleName,
               Signature, SignatureType, TufSigned, canonicalize_value};


/// Verify signed role documents against the key set and thresholds that a
/// trusted Root delegates to each role.
pub struct Verifier {
    keys:  HashMap<String, Key>,
    roles: HashMap<RoleName, RoleMeta>,
}

impl Verifier {
    /// Build a verifier from the `keys` and `roles` of a trusted Root.
    pub fn from_root(root: &RoleData) -> Result<Verifier, Error> {
        let mut verifier = Verifier { keys: HashMap::new(), roles: HashMap::new() };
        for (role, meta) in root.roles.as_ref().ok_or(Error::UptaneMissingRoles)? {
            verifier.add_meta(*role, meta.clone())?;
        }
        for (id, key) in root.keys.as_ref().ok_or(Error::UptaneMissingKeys)? {
            verifier.add_key(id.clone(), key.clone())?;
        }
        Ok(verifier)
    }

    pub fn add_meta(&mut self, role: RoleName, meta: RoleMeta) -> Result<(), Error> {
        trace!("adding role to verifier: {}", role);
        if self.roles.get(&role).is_some() {
            Err(Error::TufRole(format!("{} already exists", role)))
        } else if meta.threshold < 1 {
            Err(Error::UptaneThreshold(format!("{} threshold too low", role)))
        } else {
            self.roles.insert(role, meta);
            Ok(())
        }
    }

    pub fn add_key(&mut self, id: String, key: Key) -> Result<(), Error> {
        trace!("adding key_id to verifier: {}", id);
        if id != key.key_id()? {
            Err(Error::TufKeyId(format!("wrong key_id: {}", id)))
        } else if self.keys.get(&id).is_some() {
            Err(Error::TufKeyId(format!("key_id already exists: {}", id)))
        } else {
            self.keys.insert(id, key);
            Ok(())
        }
    }

    /// Check the signatures on a signed document and parse out its role
    /// data, confirming the `_type` tag names the expected role. Expiry is
    /// left to the caller.
    pub fn verify_role(&self, repo: RepoName, role: RoleName, signed: &TufSigned) -> Result<RoleData, Error> {
        self.verify_signatures(repo, role, signed)?;
        let data = json::from_value::<RoleData>(signed.signed.clone())?;
        if data._type != role {
            Err(Error::TufRole(format!("expected `{}`, got `{}`", role, data._type)))
        } else {
            Ok(data)
        }
    }

    /// Verify that a role-defined threshold of distinct keys signed the data.
    pub fn verify_signatures(&self, repo: RepoName, role: RoleName, signed: &TufSigned) -> Result<(), Error> {
        let meta = self.roles.get(&role).ok_or_else(|| Error::TufRole(format!("{} not found", role)))?;
        let cjson = canonicalize_value(&signed.signed)?;
        let valid = signed.signatures
            .iter()
            .filter(|sig| meta.keyids.contains(&sig.keyid))
            .filter(|sig| self.verify_data(&cjson, sig))
            .map(|sig| &sig.keyid)
            .collect::<HashSet<_>>();

        if (valid.len() as u64) < meta.threshold {
            debug!("{} of {} valid signatures for {} {}", valid.len(), meta.threshold, repo, role);
            Err(Error::UptaneBadSignature(repo, role))
        } else {
            Ok(())
        }
    }

    /// Verify that one signature matches the data.
    pub fn verify_data(&self, data: &[u8], sig: &Signature) -> bool {
        let verify = || -> Result<bool, Error> {
            let key = self.keys.get(&sig.keyid).ok_or_else(|| Error::KeyNotFound(sig.keyid.clone()))?;
            match key.keytype {
                KeyType::Ed25519 => {
                    let sig = Vec::from_hex(&sig.sig)?;
                    let key = Vec::from_hex(&key.keyval.public)?;
                    Ok(SignatureType::Ed25519.verify_msg(data, &key, &sig))
                }

                KeyType::Rsa2048 | KeyType::Rsa3072 | KeyType::Rsa4096 => {
                    let sig = base64::decode(&sig.sig)?;
                    let pem = pem::parse(&key.keyval.public)?;
                    Ok(SignatureType::RsaSsaPss.verify_msg(data, &pem.contents, &sig))
                }
            }
        };

        match verify() {
            Ok(true)  => { trace!("successful verification: {}", sig.keyid); true }
            Ok(false) => { trace!("failed verification: {}", sig.keyid); false }
            Err(err)  => { trace!("failed verification for {}: {}", sig.keyid, err); false }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use testdata::Signer;


    #[test]
    fn threshold_must_be_met() {
        let signer = Signer::new("verify-threshold");
        let root = signer.root_data(1);
        let verifier = Verifier::from_root(&root).expect("verifier");

        let signed = signer.sign_targets_for(&[("app.img", 9, "00ff", "serial-1", "hw-1")], 1);
        verifier.verify_role(RepoName::Director, RoleName::Targets, &signed).expect("verify targets");

        let unsigned = TufSigned { signatures: Vec::new(), signed: signed.signed.clone() };
        match verifier.verify_role(RepoName::Director, RoleName::Targets, &unsigned) {
            Err(Error::UptaneBadSignature(RepoName::Director, RoleName::Targets)) => (),
            other => panic!("expected UptaneBadSignature, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn altered_payload_is_rejected() {
        let signer = Signer::new("verify-altered");
        let root = signer.root_data(1);
        let verifier = Verifier::from_root(&root).expect("verifier");

        let mut signed = signer.sign_targets_for(&[("app.img", 9, "00ff", "serial-1", "hw-1")], 1);
        signed.signed["version"] = json!(9);
        assert!(verifier.verify_role(RepoName::Director, RoleName::Targets, &signed).is_err());
    }

    #[test]
    fn type_tag_must_match_role() {
        let signer = Signer::new("verify-type-tag");
        let root = signer.root_data(1);
        let verifier = Verifier::from_root(&root).expect("verifier");

        let signed = signer.sign_targets_for(&[("app.img", 9, "00ff", "serial-1", "hw-1")], 1);
        assert!(verifier.verify_role(RepoName::Director, RoleName::Snapshot, &signed).is_err());
    }

    #[test]
    fn duplicate_signatures_only_count_once() {
        let signer = Signer::new("verify-duplicate-sigs");
        let mut root = signer.root_data(1);
        if let Some(ref mut roles) = root.roles {
            roles.get_mut(&RoleName::Targets).expect("targets role").threshold = 2;
        }
        let verifier = Verifier::from_root(&root).expect("verifier");

        let mut signed = signer.sign_targets_for(&[("app.img", 9, "00ff", "serial-1", "hw-1")], 1);
        let dup = signed.signatures[0].clone();
        signed.signatures.push(dup);
        assert!(verifier.verify_role(RepoName::Director, RoleName::Targets, &signed).is_err());
    }
}
