#[macro_use]
extern crate thiserror;
#[macro_use]
extern crate serde;

use std::fmt;

mod sqlite;

pub use crate::sqlite::SqliteStore;

/// Default upper bound on the number of devices a single user may register.
pub const DEFAULT_MAX_DEVICES: usize = 10;

/// Chat user that owns a set of devices.
pub type UserId = u64;

/// An error that may occur when reading or mutating the device registry.
#[derive(Debug, Error)]
pub enum Error {
    /// Another device, owned by any user, already uses this ECID.
    #[error("a device with ECID {0} is already registered")]
    DuplicateEcid(Ecid),
    /// The owning user already has a device with this name (ignoring case).
    #[error("you already have a device named '{0}'")]
    DuplicateName(String),
    /// Adding the device would put the user over the configured maximum.
    #[error("device limit of {0} reached")]
    TooManyDevices(usize),
    /// No device with this ECID is registered.
    #[error("no device with ECID {0} is registered")]
    NotFound(Ecid),
    /// The user has no record in the registry.
    #[error("user {0} has no registered devices")]
    UnknownUser(UserId),
    /// The connection mutex was poisoned by a panicking writer.
    #[error("registry lock poisoned")]
    Lock,
    /// Saved blob metadata could not be encoded or decoded.
    #[error("failed to (de)serialize saved blobs")]
    Json(#[from] serde_json::Error),
    /// The underlying SQLite database returned an error.
    #[error("database error")]
    Sqlite(#[from] rusqlite::Error),
}

/// Canonical ECID: lowercase hex without a `0x` prefix or leading zeros.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Ecid(Box<str>);

impl Ecid {
    /// Normalizes user input into an ECID.
    ///
    /// Accepts any letter case, an optional `0x` prefix and leading zeros. Returns
    /// `None` unless the remaining digits are hex and 10, 11, 13 or 14 long.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let input = input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))
            .unwrap_or(input);

        let digits = input.trim_start_matches('0').to_ascii_lowercase();
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        match digits.len() {
            10 | 11 | 13 | 14 => Some(Ecid(digits.into())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ecid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A firmware a signing ticket has already been saved for.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SavedBlob {
    pub version: String,
    pub buildid: String,
}

/// A registered device.
///
/// Instances read back from a [`DeviceStore`] were validated when they were
/// added; new instances should come from the validating builder in the
/// `autotss` crate.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Device {
    pub name: String,
    pub identifier: String,
    pub boardconfig: String,
    pub cpid: u32,
    pub ecid: Ecid,
    pub generator: Option<String>,
    pub apnonce: Option<String>,
    pub saved_blobs: Vec<SavedBlob>,
}

impl Device {
    pub fn has_blob(&self, buildid: &str) -> bool {
        self.saved_blobs.iter().any(|blob| blob.buildid == buildid)
    }
}

/// Which devices a query covers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    /// Every registered device.
    All,
    /// Devices whose owner has the enabled flag set.
    Enabled,
    /// Devices of one user, regardless of the enabled flag.
    User(UserId),
}

/// Persistence boundary for registered devices.
///
/// Every method is atomic on its own; callers that need a sequence of calls to
/// be consistent must serialize them.
pub trait DeviceStore: Send + Sync {
    /// Registers `device` for `user`.
    ///
    /// Fails on a duplicate ECID across all users, a name already used by the
    /// same user (ignoring case), or when the user is at the device limit.
    fn add(&self, user: UserId, device: &Device) -> Result<(), Error>;

    /// Removes a device, deleting the owner's record if it becomes empty.
    fn remove(&self, ecid: &Ecid) -> Result<Device, Error>;

    /// Lists devices in registration order.
    fn devices(&self, scope: Scope) -> Result<Vec<Device>, Error>;

    fn device(&self, ecid: &Ecid) -> Result<Option<Device>, Error>;

    fn owner(&self, ecid: &Ecid) -> Result<Option<UserId>, Error>;

    /// Replaces the saved blob list of one device in a single write.
    fn update_saved_blobs(&self, ecid: &Ecid, blobs: &[SavedBlob]) -> Result<(), Error>;

    fn enabled(&self, user: UserId) -> Result<Option<bool>, Error>;

    fn set_enabled(&self, user: UserId, enabled: bool) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecid_normalizes_case_prefix_and_zeros() {
        let a = Ecid::parse("0x000ABCDEF01234").unwrap();
        let b = Ecid::parse("abcdef01234").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "abcdef01234");
    }

    #[test]
    fn ecid_rejects_bad_input() {
        assert!(Ecid::parse("").is_none());
        assert!(Ecid::parse("abcdef0").is_none());
        assert!(Ecid::parse("123456789012").is_none());
        assert!(Ecid::parse("zz3456789012a").is_none());
        assert!(Ecid::parse("123456789012345").is_none());
    }

    #[test]
    fn ecid_accepts_known_lengths() {
        for len in [10, 11, 13, 14] {
            let input = "1".repeat(len);
            assert_eq!(Ecid::parse(&input).map(|e| e.as_str().len()), Some(len));
        }
    }
}
