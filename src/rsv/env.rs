//! The boot environment, stored as the record of the ENV region.
//!
//! The blob is laid out the way U-Boot expects it: a little-endian CRC-32 of the data area,
//! followed by `name=value` entries each terminated by a NUL, and an empty entry (a second NUL)
//! closing the list. The rest of the blob is zero padding, covered by the CRC.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;
use tracing::warn;

use super::{RegionKind, RsvError, RsvManager, RsvResult};
use crate::nand::BlockDevice;

pub const ENV_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const CRC_LEN: usize = std::mem::size_of::<u32>();

#[derive(Debug, Error, Eq, PartialEq)]
pub enum EnvError {
    #[error("environment blob of {0} bytes is too short")]
    TooShort(usize),

    #[error("environment CRC mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    BadCrc { stored: u32, computed: u32 },

    #[error("environment entry is not valid UTF-8")]
    NotUtf8,

    #[error("environment entry {0:?} has no '='")]
    MissingSeparator(String),

    #[error("environment needs {needed} bytes, only {size} available")]
    TooLarge { needed: usize, size: usize },

    #[error("invalid variable name {0:?}")]
    InvalidName(String),
}

/// A set of environment variables, kept sorted by name
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Set a variable. Names must be non-empty and free of '=' and NUL; values free of NUL.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), EnvError> {
        if name.is_empty() || name.contains(['=', '\0']) || value.contains('\0') {
            return Err(EnvError::InvalidName(name.to_string()));
        }

        self.vars.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.vars.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Parse a blob, checking its CRC
    pub fn decode(blob: &[u8]) -> Result<Self, EnvError> {
        if blob.len() <= CRC_LEN {
            return Err(EnvError::TooShort(blob.len()));
        }

        let mut buf = blob;
        let stored = buf.get_u32_le();
        let computed = ENV_CRC.checksum(buf);
        if stored != computed {
            return Err(EnvError::BadCrc { stored, computed });
        }

        let mut env = Self::new();
        for entry in buf.split(|&x| x == 0).take_while(|x| !x.is_empty()) {
            let entry = std::str::from_utf8(entry).map_err(|_| EnvError::NotUtf8)?;
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| EnvError::MissingSeparator(entry.to_string()))?;
            env.vars.insert(name.to_string(), value.to_string());
        }

        Ok(env)
    }

    /// Serialize into a blob of exactly `size` bytes
    pub fn encode(&self, size: usize) -> Result<Bytes, EnvError> {
        let mut data = BytesMut::with_capacity(size);
        data.put_u32_le(0);
        for (name, value) in self.vars.iter() {
            data.put_slice(name.as_bytes());
            data.put_u8(b'=');
            data.put_slice(value.as_bytes());
            data.put_u8(0);
        }
        data.put_u8(0);

        if data.len() > size {
            return Err(EnvError::TooLarge {
                needed: data.len(),
                size,
            });
        }
        data.resize(size, 0);

        let crc = ENV_CRC.checksum(&data[CRC_LEN..]);
        data[..CRC_LEN].copy_from_slice(&crc.to_le_bytes());

        Ok(data.freeze())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Environment {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        let vars = iter
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { vars }
    }
}

/// Load the environment, falling back to `defaults` when none was ever saved or the saved one is
/// damaged
pub fn load_env<D: BlockDevice>(
    rsv: &RsvManager<D>,
    defaults: &Environment,
) -> RsvResult<Environment> {
    let blob = match rsv.get_env() {
        Ok(blob) => blob,
        Err(RsvError::NoValidRecord(_)) => return Ok(defaults.clone()),
        Err(error) => return Err(error),
    };

    match Environment::decode(&blob) {
        Ok(env) => Ok(env),
        Err(error) => {
            warn!(target: "nand_rsv::env", %error, "saved environment unusable, using defaults");
            Ok(defaults.clone())
        }
    }
}

/// Commit the environment, padded to the ENV region's record size
pub fn save_env<D: BlockDevice>(rsv: &RsvManager<D>, env: &Environment) -> RsvResult<()> {
    let size = rsv.layout().region(RegionKind::Env).size;
    let blob = env.encode(size)?;
    rsv.put_env(&blob)
}
