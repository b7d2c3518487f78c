//! The fixed message choice spoken over TCP between Primary and Secondary.
//! The top-level context tags 0 through 14 are protocol constants shared
//! with every deployed peer and must never be renumbered.

use asn1::{self, DecodeError, Reader};
use datatype::{Error, KeyType, ResultCode};
use repository::RawMetaPack;


pub const GET_INFO_REQ:             u8 = 0;
pub const GET_INFO_RESP:            u8 = 1;
pub const MANIFEST_REQ:             u8 = 2;
pub const MANIFEST_RESP:            u8 = 3;
pub const PUT_META_REQ:             u8 = 4;
pub const PUT_META_RESP:            u8 = 5;
pub const SEND_FIRMWARE_REQ:        u8 = 6;
pub const SEND_FIRMWARE_RESP:       u8 = 7;
pub const INSTALL_REQ:              u8 = 8;
pub const INSTALL_RESP:             u8 = 9;
pub const UPLOAD_DATA_REQ:          u8 = 10;
pub const UPLOAD_DATA_RESP:         u8 = 11;
pub const DOWNLOAD_OSTREE_REV_REQ:  u8 = 12;
pub const DOWNLOAD_OSTREE_REV_RESP: u8 = 13;
pub const PUT_META_REQ2:            u8 = 14;

const RESULT_SUCCESS: i64 = 0;
const RESULT_FAILURE: i64 = 1;


/// One message of the request/response alphabet.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    GetInfoReq,
    GetInfoResp { serial: String, hwid: String, key_type: KeyType, key: Vec<u8> },
    ManifestReq,
    ManifestResp { manifest: Vec<u8> },
    PutMetaReq { director_root: Vec<u8>, director_targets: Vec<u8>, image_root: Vec<u8>,
                 image_timestamp: Vec<u8>, image_snapshot: Vec<u8>, image_targets: Vec<u8> },
    PutMetaResp { ok: bool },
    SendFirmwareReq { firmware: Vec<u8> },
    SendFirmwareResp { ok: bool },
    InstallReq { name: String },
    InstallResp { result: ResultCode },
    UploadDataReq { data: Vec<u8> },
    UploadDataResp { ok: bool },
    DownloadOstreeRevReq { tls_cred: Vec<u8> },
    DownloadOstreeRevResp { result: ResultCode },
    PutMetaReq2 { director: Vec<(String, Vec<u8>)>, image: Vec<(String, Vec<u8>)> },
}

impl Msg {
    pub fn from_pack(pack: RawMetaPack) -> Msg {
        Msg::PutMetaReq {
            director_root:    pack.director_root,
            director_targets: pack.director_targets,
            image_root:       pack.image_root,
            image_timestamp:  pack.image_timestamp,
            image_snapshot:   pack.image_snapshot,
            image_targets:    pack.image_targets,
        }
    }

    pub fn tag(&self) -> u8 {
        match *self {
            Msg::GetInfoReq                => GET_INFO_REQ,
            Msg::GetInfoResp { .. }        => GET_INFO_RESP,
            Msg::ManifestReq               => MANIFEST_REQ,
            Msg::ManifestResp { .. }       => MANIFEST_RESP,
            Msg::PutMetaReq { .. }         => PUT_META_REQ,
            Msg::PutMetaResp { .. }        => PUT_META_RESP,
            Msg::SendFirmwareReq { .. }    => SEND_FIRMWARE_REQ,
            Msg::SendFirmwareResp { .. }   => SEND_FIRMWARE_RESP,
            Msg::InstallReq { .. }         => INSTALL_REQ,
            Msg::InstallResp { .. }        => INSTALL_RESP,
            Msg::UploadDataReq { .. }      => UPLOAD_DATA_REQ,
            Msg::UploadDataResp { .. }     => UPLOAD_DATA_RESP,
            Msg::DownloadOstreeRevReq { .. }  => DOWNLOAD_OSTREE_REV_REQ,
            Msg::DownloadOstreeRevResp { .. } => DOWNLOAD_OSTREE_REV_RESP,
            Msg::PutMetaReq2 { .. }        => PUT_META_REQ2,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut content = Vec::new();
        match *self {
            Msg::GetInfoReq | Msg::ManifestReq => (),

            Msg::GetInfoResp { ref serial, ref hwid, key_type, ref key } => {
                asn1::write_utf8(&mut content, serial);
                asn1::write_utf8(&mut content, hwid);
                asn1::write_int(&mut content, key_type.to_wire());
                asn1::write_octets(&mut content, key);
            }

            Msg::ManifestResp { ref manifest } => {
                // manifest CHOICE { json [0] OCTET STRING }
                asn1::write_tlv(&mut content, asn1::context_primitive(0), manifest);
            }

            Msg::PutMetaReq { ref director_root, ref director_targets, ref image_root,
                              ref image_timestamp, ref image_snapshot, ref image_targets } => {
                let mut director = Vec::new();
                asn1::write_octets(&mut director, director_root);
                asn1::write_octets(&mut director, director_targets);
                asn1::write_tlv(&mut content, asn1::context(0), &director);

                let mut image = Vec::new();
                asn1::write_octets(&mut image, image_root);
                asn1::write_octets(&mut image, image_timestamp);
                asn1::write_octets(&mut image, image_snapshot);
                asn1::write_octets(&mut image, image_targets);
                asn1::write_tlv(&mut content, asn1::context(0), &image);
            }

            Msg::PutMetaResp { ok } |
            Msg::SendFirmwareResp { ok } |
            Msg::UploadDataResp { ok } => {
                asn1::write_int(&mut content, if ok { RESULT_SUCCESS } else { RESULT_FAILURE });
            }

            Msg::SendFirmwareReq { ref firmware } => {
                asn1::write_octets(&mut content, firmware);
            }

            Msg::InstallReq { ref name } => {
                asn1::write_utf8(&mut content, name);
            }

            Msg::InstallResp { result } |
            Msg::DownloadOstreeRevResp { result } => {
                asn1::write_int(&mut content, result.to_wire());
            }

            Msg::UploadDataReq { ref data } => {
                asn1::write_octets(&mut content, data);
            }

            Msg::DownloadOstreeRevReq { ref tls_cred } => {
                asn1::write_octets(&mut content, tls_cred);
            }

            Msg::PutMetaReq2 { ref director, ref image } => {
                for repo in &[director, image] {
                    let mut collection = Vec::new();
                    for &(ref role, ref json) in repo.iter() {
                        let mut item = Vec::new();
                        asn1::write_utf8(&mut item, role);
                        asn1::write_octets(&mut item, json);
                        asn1::write_tlv(&mut collection, asn1::TAG_SEQUENCE, &item);
                    }
                    asn1::write_tlv(&mut content, asn1::context(0), &collection);
                }
            }
        }

        let mut buf = Vec::new();
        asn1::write_tlv(&mut buf, asn1::context(self.tag()), &content);
        buf
    }

    /// Decode one message from the head of `buf`, returning it along with
    /// the number of bytes consumed. `MoreNeeded` means the buffer holds a
    /// prefix of a valid message.
    pub fn decode(buf: &[u8]) -> Result<(Msg, usize), DecodeError> {
        let mut outer = Reader::new(buf);
        let (tag, content) = outer.read_tlv()?;
        if ! asn1::is_context(tag) {
            return Err(DecodeError::Invalid(format!("not a message tag: {:#04x}", tag)));
        }

        // a complete but malformed body is invalid, never MoreNeeded
        let msg = Msg::decode_body(asn1::tag_number(tag), content).map_err(|err| match err {
            DecodeError::MoreNeeded => DecodeError::Invalid("truncated message body".into()),
            invalid => invalid,
        })?;
        Ok((msg, outer.consumed()))
    }

    fn decode_body(tag: u8, content: &[u8]) -> Result<Msg, DecodeError> {
        let mut body = Reader::new(content);
        let msg = match tag {
            GET_INFO_REQ => Msg::GetInfoReq,
            MANIFEST_REQ => Msg::ManifestReq,

            GET_INFO_RESP => {
                let serial = body.read_utf8()?;
                let hwid = body.read_utf8()?;
                let key_type = KeyType::from_wire(body.read_int()?)
                    .map_err(|err| DecodeError::Invalid(format!("{}", err)))?;
                let key = body.read_octets()?;
                Msg::GetInfoResp { serial: serial, hwid: hwid, key_type: key_type, key: key }
            }

            MANIFEST_RESP => {
                let manifest = body.expect_tlv(asn1::context_primitive(0))?;
                Msg::ManifestResp { manifest: manifest.into() }
            }

            PUT_META_REQ => {
                let mut director = Reader::new(body.expect_tlv(asn1::context(0))?);
                let director_root = director.read_octets()?;
                let director_targets = director.read_octets()?;

                let mut image = Reader::new(body.expect_tlv(asn1::context(0))?);
                Msg::PutMetaReq {
                    director_root:    director_root,
                    director_targets: director_targets,
                    image_root:       image.read_octets()?,
                    image_timestamp:  image.read_octets()?,
                    image_snapshot:   image.read_octets()?,
                    image_targets:    image.read_octets()?,
                }
            }

            PUT_META_RESP => Msg::PutMetaResp { ok: body.read_int()? == RESULT_SUCCESS },
            SEND_FIRMWARE_REQ => Msg::SendFirmwareReq { firmware: body.read_octets()? },
            SEND_FIRMWARE_RESP => Msg::SendFirmwareResp { ok: body.read_int()? == RESULT_SUCCESS },
            INSTALL_REQ => Msg::InstallReq { name: body.read_utf8()? },
            INSTALL_RESP => Msg::InstallResp { result: ResultCode::from_wire(body.read_int()?) },
            UPLOAD_DATA_REQ => Msg::UploadDataReq { data: body.read_octets()? },
            UPLOAD_DATA_RESP => Msg::UploadDataResp { ok: body.read_int()? == RESULT_SUCCESS },
            DOWNLOAD_OSTREE_REV_REQ => Msg::DownloadOstreeRevReq { tls_cred: body.read_octets()? },
            DOWNLOAD_OSTREE_REV_RESP => {
                Msg::DownloadOstreeRevResp { result: ResultCode::from_wire(body.read_int()?) }
            }

            PUT_META_REQ2 => {
                let director = Msg::decode_collection(body.expect_tlv(asn1::context(0))?)?;
                let image = Msg::decode_collection(body.expect_tlv(asn1::context(0))?)?;
                Msg::PutMetaReq2 { director: director, image: image }
            }

            tag => return Err(DecodeError::Invalid(format!("unknown message tag: {}", tag))),
        };
        Ok(msg)
    }

    fn decode_collection(content: &[u8]) -> Result<Vec<(String, Vec<u8>)>, DecodeError> {
        let mut collection = Reader::new(content);
        let mut items = Vec::new();
        while ! collection.is_empty() {
            let mut item = Reader::new(collection.expect_tlv(asn1::TAG_SEQUENCE)?);
            items.push((item.read_utf8()?, item.read_octets()?));
        }
        Ok(items)
    }

    /// Assemble a metadata pack from a v2 role-tagged collection pair.
    pub fn pack_from_collections(director: Vec<(String, Vec<u8>)>,
                                 image: Vec<(String, Vec<u8>)>) -> Result<RawMetaPack, Error> {
        use datatype::RepoName;

        let mut pack = RawMetaPack::default();
        for (repo, collection) in vec![(RepoName::Director, director), (RepoName::Image, image)] {
            for (role, json) in collection {
                pack.set_role(repo, role.parse()?, json)?;
            }
        }
        Ok(pack)
    }
}
