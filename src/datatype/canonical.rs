use itoa;
use serde_json as json;

use datatype::Error;


/// Convert a JSON byte stream to the canonical form used for hashing and
/// signing: lexicographically ordered keys and no insignificant whitespace.
/// The signing side must produce byte-identical output or verification of
/// any hash or signature over the document will fail.
pub fn canonicalize_json(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let value = json::from_slice(bytes)?;
    let mut buf = Vec::new();
    write_value(&value, &mut buf)?;
    Ok(buf)
}

/// Canonicalize an already parsed JSON value.
pub fn canonicalize_value(value: &json::Value) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    write_value(value, &mut buf)?;
    Ok(buf)
}

fn write_value(value: &json::Value, buf: &mut Vec<u8>) -> Result<(), Error> {
    match *value {
        json::Value::Null        => buf.extend(b"null"),
        json::Value::Bool(true)  => buf.extend(b"true"),
        json::Value::Bool(false) => buf.extend(b"false"),

        json::Value::Number(ref num) => {
            if let Some(n) = num.as_i64() {
                itoa::write(&mut *buf, n)?;
            } else if let Some(n) = num.as_u64() {
                itoa::write(&mut *buf, n)?;
            } else {
                return Err(Error::Canonical(format!("not an integer: {}", num)));
            }
        }

        json::Value::String(ref text) => write_string(text, buf)?,

        json::Value::Array(ref values) => {
            buf.push(b'[');
            for (index, val) in values.iter().enumerate() {
                if index > 0 { buf.push(b','); }
                write_value(val, buf)?;
            }
            buf.push(b']');
        }

        // serde_json maps are backed by a BTreeMap so the keys are
        // already in lexicographic order
        json::Value::Object(ref fields) => {
            buf.push(b'{');
            for (index, (key, val)) in fields.iter().enumerate() {
                if index > 0 { buf.push(b','); }
                write_string(key, buf)?;
                buf.push(b':');
                write_value(val, buf)?;
            }
            buf.push(b'}');
        }
    }
    Ok(())
}

fn write_string(text: &str, buf: &mut Vec<u8>) -> Result<(), Error> {
    Ok(buf.extend(json::to_string(text)?.as_bytes()))
}
