use autotss_registry::{Device, Ecid};

use crate::catalog::FirmwareCatalog;
use crate::error::ValidationError;
use crate::util;

const MAX_NAME_LEN: usize = 20;

/// Device families that can have signing tickets saved.
const SUPPORTED_FAMILIES: &[&str] = &["iPhone", "iPad", "iPod", "AppleTV"];

pub fn family_is_supported(identifier: &str) -> bool {
    SUPPORTED_FAMILIES
        .iter()
        .any(|family| identifier.starts_with(family))
}

/// ApNonces are SHA-384 based (64 hex chars) from A10 on, SHA-1 (40) before.
pub fn apnonce_len(cpid: u32) -> usize {
    if (0x8010..0x8900).contains(&cpid) {
        64
    } else {
        40
    }
}

/// A12 and newer entangle the nonce, so a pinned ApNonce is useless without
/// its generator.
fn requires_generator(cpid: u32) -> bool {
    (0x8020..0x8900).contains(&cpid)
}

pub fn validate_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    match name.chars().count() {
        1..=MAX_NAME_LEN => Ok(name.to_string()),
        _ => Err(ValidationError::InvalidName),
    }
}

pub fn validate_generator(generator: &str) -> Result<String, ValidationError> {
    let generator = generator.trim().to_ascii_lowercase();
    let valid = generator.len() == 18
        && generator.starts_with("0x")
        && generator[2..].chars().all(|c| c.is_ascii_hexdigit());

    if valid {
        Ok(generator)
    } else {
        Err(ValidationError::InvalidGenerator(generator))
    }
}

pub fn validate_apnonce(apnonce: &str, cpid: u32) -> Result<String, ValidationError> {
    let apnonce = apnonce.trim().to_ascii_lowercase();
    let expected = apnonce_len(cpid);

    if apnonce.len() == expected && apnonce.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(apnonce)
    } else {
        Err(ValidationError::InvalidApnonce { apnonce, expected })
    }
}

/// Checks that `apnonce` is derived from `generator`.
///
/// Both must already be validated. The generator is hashed as its 8-byte
/// little-endian encoding; 64 character nonces are truncated SHA-384.
pub fn nonce_matches(generator: &str, apnonce: &str) -> bool {
    let value = match u64::from_str_radix(generator.trim_start_matches("0x"), 16) {
        Ok(ok) => ok,
        Err(_) => return false,
    };
    let bytes = value.to_le_bytes();

    match apnonce.len() {
        40 => util::sha1(&bytes) == apnonce,
        64 => util::sha384(&bytes)[..64] == *apnonce,
        _ => false,
    }
}

/// Validating constructor for [`Device`].
///
/// Fields are checked in a fixed order and `build` stops at the first invalid
/// one, so callers never see a half-validated device.
#[derive(Clone, Debug)]
pub struct DeviceBuilder {
    name: String,
    identifier: String,
    boardconfig: String,
    ecid: String,
    generator: Option<String>,
    apnonce: Option<String>,
}

impl DeviceBuilder {
    pub fn new(name: &str, identifier: &str, boardconfig: &str, ecid: &str) -> Self {
        Self {
            name: name.to_string(),
            identifier: identifier.to_string(),
            boardconfig: boardconfig.to_string(),
            ecid: ecid.to_string(),
            generator: None,
            apnonce: None,
        }
    }

    pub fn generator(mut self, generator: Option<&str>) -> Self {
        self.generator = generator.map(str::to_string);
        self
    }

    pub fn apnonce(mut self, apnonce: Option<&str>) -> Self {
        self.apnonce = apnonce.map(str::to_string);
        self
    }

    pub async fn build(self, catalog: &dyn FirmwareCatalog) -> Result<Device, ValidationError> {
        let name = validate_name(&self.name)?;

        let requested = self.identifier.trim();
        let identifier = catalog
            .devices()
            .await?
            .into_iter()
            .find(|device| device.identifier.eq_ignore_ascii_case(requested))
            .map(|device| device.identifier)
            .ok_or_else(|| ValidationError::UnknownIdentifier(requested.to_string()))?;
        if !family_is_supported(&identifier) {
            return Err(ValidationError::UnsupportedDevice(identifier));
        }

        let boardconfig = self.boardconfig.trim().to_ascii_lowercase();
        if !boardconfig.ends_with("ap") {
            return Err(ValidationError::InvalidBoardconfig(boardconfig));
        }
        let info = catalog.device(&identifier).await?;
        let cpid = info
            .boards
            .iter()
            .find(|board| board.boardconfig.eq_ignore_ascii_case(&boardconfig))
            .map(|board| board.cpid)
            .ok_or_else(|| ValidationError::BoardMismatch {
                identifier: identifier.clone(),
                boardconfig: boardconfig.clone(),
            })?;

        let ecid = Ecid::parse(&self.ecid)
            .ok_or_else(|| ValidationError::InvalidEcid(self.ecid.trim().to_string()))?;

        let generator = self
            .generator
            .as_deref()
            .map(validate_generator)
            .transpose()?;

        let apnonce = self
            .apnonce
            .as_deref()
            .map(|apnonce| validate_apnonce(apnonce, cpid))
            .transpose()?;

        match (&generator, &apnonce) {
            (Some(generator), Some(apnonce)) if !nonce_matches(generator, apnonce) => {
                return Err(ValidationError::NonceMismatch {
                    generator: generator.clone(),
                    apnonce: apnonce.clone(),
                });
            }
            (None, Some(_)) if requires_generator(cpid) => {
                return Err(ValidationError::GeneratorRequired);
            }
            _ => (),
        }

        Ok(Device {
            name,
            identifier,
            boardconfig,
            cpid,
            ecid,
            generator,
            apnonce,
            saved_blobs: Vec::new(),
        })
    }
}
