extern crate base64;
extern crate chrono;
extern crate crypto;
extern crate hex;
extern crate itoa;
#[macro_use]
extern crate log;
#[macro_use]
extern crate maplit;
extern crate net2;
extern crate openssl;
extern crate pem;
extern crate ring;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
extern crate toml;
extern crate untrusted;
extern crate url;
extern crate uuid;
extern crate zip;

pub mod asn1;
pub mod datatype;
pub mod dispatch;
pub mod pacman;
pub mod repository;
pub mod secondary;
pub mod server;
pub mod store;
#[cfg(test)]
pub mod testdata;
pub mod wire;
