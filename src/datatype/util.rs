use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use datatype::Error;


pub struct Util;

impl Util {
    pub fn read_file(path: &str) -> Result<Vec<u8>, Error> {
        let mut file = BufReader::new(File::open(path)
            .map_err(|err| Error::Storage(format!("couldn't open {}: {}", path, err)))?);
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|err| Error::Storage(format!("couldn't read {}: {}", path, err)))?;
        Ok(buf)
    }

    pub fn write_file(path: &str, buf: &[u8]) -> Result<(), Error> {
        if let Some(dir) = Path::new(path).parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|err| Error::Storage(format!("couldn't open {} for writing: {}", path, err)))?;
        file.write_all(buf)
            .map_err(|err| Error::Storage(format!("couldn't write to {}: {}", path, err)))?;
        file.flush()?;
        Ok(())
    }

    /// Write via a temporary sibling then rename, so that a crash leaves
    /// either the old contents or the new, never a torn file.
    pub fn atomic_write(path: &str, buf: &[u8]) -> Result<(), Error> {
        let tmp = format!("{}.tmp", path);
        Util::write_file(&tmp, buf)?;
        fs::rename(&tmp, path)
            .map_err(|err| Error::Storage(format!("couldn't rename {} into place: {}", tmp, err)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn atomic_write_replaces_contents() {
        let dir = format!("/tmp/sota-test-util-{}", ::std::process::id());
        let path = format!("{}/record.json", dir);
        Util::atomic_write(&path, b"first").expect("first write");
        assert_eq!(Util::read_file(&path).expect("read"), b"first");
        Util::atomic_write(&path, b"second").expect("second write");
        assert_eq!(Util::read_file(&path).expect("read"), b"second");
        fs::remove_dir_all(&dir).expect("cleanup");
    }
}
