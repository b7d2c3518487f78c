use serde_json as json;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use datatype::ResultCode;
use repository::RawMetaPack;
use secondary::Secondary;
use wire::{self, Msg};


/// What the connection loop should do after a message was handled.
pub enum HandleStatus {
    /// Send the response and keep the connection.
    Ok(Msg),
    /// Send the response, then record that a reboot is needed.
    RebootRequired(Msg),
    /// Close the connection without replying.
    UnknownMsg,
}

pub type Handler = Box<FnMut(&Msg) -> HandleStatus>;

/// Routes each decoded request to the operation closure registered for
/// its message tag. The closures share the Secondary behind a
/// reference-counted handle; the Secondary knows nothing about them.
pub struct Dispatcher {
    handlers: HashMap<u8, Handler>,
}

impl Dispatcher {
    pub fn new(secondary: Rc<RefCell<Secondary>>) -> Dispatcher {
        let mut dispatcher = Dispatcher { handlers: HashMap::new() };

        let sec = secondary.clone();
        dispatcher.register(wire::GET_INFO_REQ, Box::new(move |_| {
            let (serial, hwid, key_type, key) = sec.borrow().get_info();
            HandleStatus::Ok(Msg::GetInfoResp {
                serial:   serial,
                hwid:     hwid,
                key_type: key_type,
                key:      key.into_bytes(),
            })
        }));

        let sec = secondary.clone();
        dispatcher.register(wire::MANIFEST_REQ, Box::new(move |_| {
            let manifest = sec.borrow().get_manifest()
                .and_then(|signed| Ok(json::to_vec(&signed)?))
                .unwrap_or_else(|err| {
                    error!("couldn't produce a manifest: {}", err);
                    b"{}".to_vec()
                });
            HandleStatus::Ok(Msg::ManifestResp { manifest: manifest })
        }));

        let sec = secondary.clone();
        dispatcher.register(wire::PUT_META_REQ, Box::new(move |msg| {
            let pack = match *msg {
                Msg::PutMetaReq { ref director_root, ref director_targets, ref image_root,
                                  ref image_timestamp, ref image_snapshot, ref image_targets } => {
                    RawMetaPack {
                        director_root:    director_root.clone(),
                        director_targets: director_targets.clone(),
                        image_root:       image_root.clone(),
                        image_timestamp:  image_timestamp.clone(),
                        image_snapshot:   image_snapshot.clone(),
                        image_targets:    image_targets.clone(),
                    }
                }
                _ => return HandleStatus::UnknownMsg,
            };
            HandleStatus::Ok(Msg::PutMetaResp { ok: put_metadata(&sec, pack) })
        }));

        let sec = secondary.clone();
        dispatcher.register(wire::PUT_META_REQ2, Box::new(move |msg| {
            let pack = match *msg {
                Msg::PutMetaReq2 { ref director, ref image } => {
                    match Msg::pack_from_collections(director.clone(), image.clone()) {
                        Ok(pack) => pack,
                        Err(err) => {
                            error!("bad metadata collection: {}", err);
                            return HandleStatus::Ok(Msg::PutMetaResp { ok: false });
                        }
                    }
                }
                _ => return HandleStatus::UnknownMsg,
            };
            HandleStatus::Ok(Msg::PutMetaResp { ok: put_metadata(&sec, pack) })
        }));

        let sec = secondary.clone();
        dispatcher.register(wire::SEND_FIRMWARE_REQ, Box::new(move |msg| {
            let ok = match *msg {
                Msg::SendFirmwareReq { ref firmware } => {
                    sec.borrow_mut().send_firmware(firmware)
                        .map_err(|err| error!("firmware transfer failed: {}", err))
                        .is_ok()
                }
                _ => return HandleStatus::UnknownMsg,
            };
            HandleStatus::Ok(Msg::SendFirmwareResp { ok: ok })
        }));

        let sec = secondary.clone();
        dispatcher.register(wire::UPLOAD_DATA_REQ, Box::new(move |msg| {
            let code = match *msg {
                Msg::UploadDataReq { ref data } => sec.borrow_mut().receive_image_chunk(data),
                _ => return HandleStatus::UnknownMsg,
            };
            HandleStatus::Ok(Msg::UploadDataResp { ok: code == ResultCode::Ok })
        }));

        let sec = secondary.clone();
        dispatcher.register(wire::DOWNLOAD_OSTREE_REV_REQ, Box::new(move |msg| {
            let result = match *msg {
                Msg::DownloadOstreeRevReq { ref tls_cred } => {
                    sec.borrow_mut().download_ostree_rev(tls_cred)
                }
                _ => return HandleStatus::UnknownMsg,
            };
            HandleStatus::Ok(Msg::DownloadOstreeRevResp { result: result })
        }));

        let sec = secondary.clone();
        dispatcher.register(wire::INSTALL_REQ, Box::new(move |msg| {
            let result = match *msg {
                Msg::InstallReq { ref name } => sec.borrow_mut().install(name),
                _ => return HandleStatus::UnknownMsg,
            };
            let resp = Msg::InstallResp { result: result };
            if result == ResultCode::NeedCompletion {
                HandleStatus::RebootRequired(resp)
            } else {
                HandleStatus::Ok(resp)
            }
        }));

        dispatcher
    }

    pub fn register(&mut self, tag: u8, handler: Handler) {
        self.handlers.insert(tag, handler);
    }

    pub fn handle(&mut self, msg: &Msg) -> HandleStatus {
        trace!("dispatching message with tag {}", msg.tag());
        match self.handlers.get_mut(&msg.tag()) {
            Some(handler) => handler(msg),
            None => HandleStatus::UnknownMsg,
        }
    }
}

fn put_metadata(sec: &Rc<RefCell<Secondary>>, pack: RawMetaPack) -> bool {
    sec.borrow_mut().put_metadata(&pack)
        .map_err(|err| error!("metadata rejected: {}", err))
        .is_ok()
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use datatype::{Config, EcuVersion, KeyType};
    use pacman::FileAgent;
    use store::Store;
    use testdata::{ScriptedAgent, Signer, TargetSpec, pack_for};


    fn temp_config(name: &str) -> Config {
        let base = format!("/tmp/sota-test-dispatch-{}-{}", name, ::std::process::id());
        let _ = fs::remove_dir_all(&base);
        let mut config = Config::default();
        config.storage.path = format!("{}/store", base);
        config.pacman.images_path = format!("{}/images", base);
        config.uptane.ecu_serial = "serial-1".into();
        config.uptane.ecu_hardware_id = "hw-1".into();
        config
    }

    fn file_dispatcher(config: &Config) -> Dispatcher {
        let store = Store::new(&config.storage.path).expect("store");
        let agent = Box::new(FileAgent::new(&config.pacman.images_path).expect("agent"));
        let secondary = Secondary::with_parts(config, store, agent).expect("secondary");
        Dispatcher::new(Rc::new(RefCell::new(secondary)))
    }

    fn expect_resp(status: HandleStatus) -> Msg {
        match status {
            HandleStatus::Ok(resp) => resp,
            HandleStatus::RebootRequired(_) => panic!("unexpected reboot required"),
            HandleStatus::UnknownMsg => panic!("unexpected unknown message"),
        }
    }

    #[test]
    fn get_info_and_manifest() {
        let config = temp_config("info");
        let mut dispatcher = file_dispatcher(&config);

        match expect_resp(dispatcher.handle(&Msg::GetInfoReq)) {
            Msg::GetInfoResp { serial, hwid, key_type, key } => {
                assert_eq!(serial, "serial-1");
                assert_eq!(hwid, "hw-1");
                assert_eq!(key_type, KeyType::Ed25519);
                assert!(!key.is_empty());
            }
            other => panic!("expected GetInfoResp, got {:?}", other),
        }

        match expect_resp(dispatcher.handle(&Msg::ManifestReq)) {
            Msg::ManifestResp { manifest } => {
                let signed = json::from_slice::<::datatype::TufSigned>(&manifest).expect("manifest json");
                let version = json::from_value::<EcuVersion>(signed.signed).expect("ecu version");
                assert_eq!(version.ecu_serial, "serial-1");
            }
            other => panic!("expected ManifestResp, got {:?}", other),
        }
    }

    #[test]
    fn v1_and_v2_metadata_families() {
        let config = temp_config("families");
        let mut dispatcher = file_dispatcher(&config);
        let spec = TargetSpec::binary("app.img", b"some data", "serial-1", "hw-1");
        let pack = pack_for(&Signer::new("director"), &Signer::new("image"), &[spec], 1);

        // v2 first, as the Primary's client tries it
        let req2 = Msg::PutMetaReq2 {
            director: vec![("root".into(), pack.director_root.clone()),
                           ("targets".into(), pack.director_targets.clone())],
            image: vec![("root".into(), pack.image_root.clone()),
                        ("timestamp".into(), pack.image_timestamp.clone()),
                        ("snapshot".into(), pack.image_snapshot.clone()),
                        ("targets".into(), pack.image_targets.clone())],
        };
        match expect_resp(dispatcher.handle(&req2)) {
            Msg::PutMetaResp { ok } => assert!(ok),
            other => panic!("expected PutMetaResp, got {:?}", other),
        }

        // the v1 shape of the same pack is accepted too
        match expect_resp(dispatcher.handle(&Msg::from_pack(pack))) {
            Msg::PutMetaResp { ok } => assert!(ok),
            other => panic!("expected PutMetaResp, got {:?}", other),
        }
    }

    #[test]
    fn upload_install_round() {
        let config = temp_config("upload");
        let mut dispatcher = file_dispatcher(&config);
        let spec = TargetSpec::binary("app.img", b"some data", "serial-1", "hw-1");
        let pack = pack_for(&Signer::new("director"), &Signer::new("image"), &[spec], 1);
        expect_resp(dispatcher.handle(&Msg::from_pack(pack)));

        for chunk in b"some data".chunks(4) {
            match expect_resp(dispatcher.handle(&Msg::UploadDataReq { data: chunk.to_vec() })) {
                Msg::UploadDataResp { ok } => assert!(ok),
                other => panic!("expected UploadDataResp, got {:?}", other),
            }
        }
        match expect_resp(dispatcher.handle(&Msg::InstallReq { name: "app.img".into() })) {
            Msg::InstallResp { result } => assert_eq!(result, ResultCode::Ok),
            other => panic!("expected InstallResp, got {:?}", other),
        }
    }

    #[test]
    fn responses_are_unknown_messages() {
        let config = temp_config("unknown");
        let mut dispatcher = file_dispatcher(&config);
        match dispatcher.handle(&Msg::PutMetaResp { ok: true }) {
            HandleStatus::UnknownMsg => (),
            _ => panic!("expected UnknownMsg"),
        }
        match dispatcher.handle(&Msg::GetInfoResp {
            serial: "s".into(), hwid: "h".into(), key_type: KeyType::Ed25519, key: vec![],
        }) {
            HandleStatus::UnknownMsg => (),
            _ => panic!("expected UnknownMsg"),
        }
    }

    #[test]
    fn need_completion_requests_reboot() {
        let config = temp_config("reboot");
        let store = Store::new(&config.storage.path).expect("store");
        let rebooted = Rc::new(RefCell::new(false));
        let agent = Box::new(ScriptedAgent::new(ResultCode::NeedCompletion, rebooted));
        let secondary = Secondary::with_parts(&config, store, agent).expect("secondary");
        let mut dispatcher = Dispatcher::new(Rc::new(RefCell::new(secondary)));

        let commit = "5f91b49c8d4b20bbff25282632c5eb93b2a254dfcd0a447b787f9f2ba101e8a4";
        let spec = TargetSpec::ostree("ota-commit", commit, "serial-1", "hw-1");
        let pack = pack_for(&Signer::new("director"), &Signer::new("image"), &[spec], 1);
        expect_resp(dispatcher.handle(&Msg::from_pack(pack)));

        match dispatcher.handle(&Msg::InstallReq { name: "ota-commit".into() }) {
            HandleStatus::RebootRequired(Msg::InstallResp { result }) => {
                assert_eq!(result, ResultCode::NeedCompletion);
            }
            _ => panic!("expected RebootRequired(InstallResp)"),
        }
    }
}
