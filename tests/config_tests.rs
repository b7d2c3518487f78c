extern crate sota;

use std::fs;
use std::io::Write;

use sota::datatype::Config;


const DEFAULT_CONFIG: &'static str = r#"
[network]
port = 9030
primary_ip = ""
primary_port = 9040

[uptane]
ecu_serial = ""
ecu_hardware_id = ""
key_type = "ed25519"
force_install_completion = false

[storage]
path = "/var/sota"

[pacman]
type = "file"
images_path = "/var/sota/images"
"#;

#[test]
fn parse_default_config() {
    let config = Config::parse(DEFAULT_CONFIG).expect("parse default config");
    assert_eq!(config, Config::default());
}

#[test]
fn empty_config_uses_defaults() {
    let config = Config::parse("").expect("parse empty config");
    assert_eq!(config, Config::default());
}

#[test]
fn partial_sections_keep_other_defaults() {
    let config = Config::parse("[network]\nport = 9999\n").expect("parse partial config");
    assert_eq!(config.network.port, 9999);
    assert_eq!(config.network.primary_port, 9040);
    assert_eq!(config.storage.path, "/var/sota");
}

#[test]
fn ostree_pacman_section() {
    let toml = r#"
        [pacman]
        type = "ostree"
        sysroot = "/ostree-sysroot"
        os = "poky"
    "#;
    let config = Config::parse(toml).expect("parse ostree config");
    assert_eq!(config.pacman.kind, sota::pacman::PacMan::Ostree);
    assert_eq!(config.pacman.sysroot, "/ostree-sysroot");
    assert_eq!(config.pacman.os, "poky");
}

#[test]
fn unknown_pacman_type_is_rejected() {
    assert!(Config::parse("[pacman]\ntype = \"dpkg\"\n").is_err());
    assert!(Config::parse("[uptane]\nkey_type = \"dsa\"\n").is_err());
}

#[test]
fn later_files_override_earlier_ones() {
    let dir = format!("/tmp/sota-test-config-{}", std::process::id());
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("create dir");

    let base = format!("{}/00-base.toml", dir);
    let site = format!("{}/50-site.toml", dir);
    write_file(&base, "[network]\nport = 9030\nprimary_port = 9040\n\n[uptane]\necu_serial = \"base-serial\"\n");
    write_file(&site, "[network]\nport = 9999\n");

    let config = Config::load(&[base, site]).expect("load configs");
    assert_eq!(config.network.port, 9999);
    assert_eq!(config.network.primary_port, 9040);
    assert_eq!(config.uptane.ecu_serial, "base-serial");
    fs::remove_dir_all(&dir).expect("cleanup");
}

#[test]
fn missing_config_file_is_an_error() {
    assert!(Config::load(&["/nonexistent/sota.toml".to_string()]).is_err());
    assert!(Config::load(&[]).is_err());
}

fn write_file(path: &str, text: &str) {
    let mut file = fs::File::create(path).expect("create config file");
    file.write_all(text.as_bytes()).expect("write config file");
}
