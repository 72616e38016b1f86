use std::fmt;

use crate::{Error, Result};

pub const NAME_LEN: usize = 11;
const BASE_LEN: usize = 8;
const EXT_LEN: usize = 3;
const ILLEGAL_CHARS: &[u8] = b"\"*+,:;<=>?[]|/\\";

/// Space padded, upper case 8.3 name as stored in a directory entry.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ShortName([u8; NAME_LEN]);

impl ShortName {
    pub fn parse(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        let (base, ext) = match bytes.iter().position(|&c| c == b'.') {
            Some(dot) => (&bytes[..dot], &bytes[dot + 1..]),
            None => (bytes, &[][..]),
        };
        if base.is_empty() || base.len() > BASE_LEN || ext.len() > EXT_LEN {
            return Err(Error::InvalidName);
        }

        let mut raw = [b' '; NAME_LEN];
        for (slot, &c) in raw.iter_mut().zip(base.iter()) {
            *slot = Self::convert(c)?;
        }
        for (slot, &c) in raw[BASE_LEN..].iter_mut().zip(ext.iter()) {
            *slot = Self::convert(c)?;
        }
        Ok(Self(raw))
    }

    fn convert(c: u8) -> Result<u8> {
        if c <= b' ' || c >= 0x7F || c == b'.' || ILLEGAL_CHARS.contains(&c) {
            return Err(Error::InvalidName);
        }
        Ok(c.to_ascii_uppercase())
    }

    pub fn from_raw(raw: [u8; NAME_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; NAME_LEN] {
        &self.0
    }
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut base = self.0[..BASE_LEN].to_vec();
        if base[0] == 0x05 {
            base[0] = 0xE5;
        }
        let trim = |part: &[u8]| {
            let len = part.iter().rposition(|&c| c != b' ').map_or(0, |i| i + 1);
            part[..len].iter().map(|&c| c as char).collect::<String>()
        };

        let mut name = trim(&base);
        let ext = trim(&self.0[BASE_LEN..]);
        if !ext.is_empty() {
            name.push('.');
            name += &ext;
        }
        f.pad(&name)
    }
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortName({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Splits an optional `N:` drive prefix and one leading separator off `path`.
/// Only the root directory exists, so any further separator is an error.
pub(crate) fn split_path(path: &str) -> Result<(u8, &str)> {
    let bytes = path.as_bytes();
    let (drive, rest) = if bytes.len() >= 2 && bytes[1] == b':' {
        if !bytes[0].is_ascii_digit() {
            return Err(Error::InvalidDrive);
        }
        (bytes[0] - b'0', &path[2..])
    } else {
        (0, path)
    };

    let rest = rest
        .strip_prefix('/')
        .or_else(|| rest.strip_prefix('\\'))
        .unwrap_or(rest);
    if rest.contains(|c| c == '/' || c == '\\') {
        return Err(Error::NoPath);
    }
    Ok((drive, rest))
}
