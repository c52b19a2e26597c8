use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::{Device, DeviceStore, Ecid, Error, SavedBlob, Scope, UserId, DEFAULT_MAX_DEVICES};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ecid TEXT NOT NULL UNIQUE,
    user_id INTEGER NOT NULL REFERENCES users(user_id),
    name TEXT NOT NULL,
    identifier TEXT NOT NULL,
    boardconfig TEXT NOT NULL,
    cpid INTEGER NOT NULL,
    generator TEXT,
    apnonce TEXT,
    saved_blobs TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS devices_user ON devices(user_id);
";

const DEVICE_COLUMNS: &str =
    "d.name, d.identifier, d.boardconfig, d.cpid, d.ecid, d.generator, d.apnonce, d.saved_blobs";

/// Device registry backed by a single SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    max_devices: usize,
}

impl SqliteStore {
    /// Open or create the registry at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Create an in-memory registry (useful for tests).
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_devices: DEFAULT_MAX_DEVICES,
        })
    }

    pub fn with_max_devices(mut self, max_devices: usize) -> Self {
        self.max_devices = max_devices;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, Error> {
        self.conn.lock().map_err(|_| Error::Lock)
    }
}

/// Raw row; `saved_blobs` is decoded outside the rusqlite closure so that a
/// JSON failure surfaces as `Error::Json`.
struct DeviceRow {
    name: String,
    identifier: String,
    boardconfig: String,
    cpid: u32,
    ecid: String,
    generator: Option<String>,
    apnonce: Option<String>,
    saved_blobs: String,
}

impl DeviceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            identifier: row.get(1)?,
            boardconfig: row.get(2)?,
            cpid: row.get(3)?,
            ecid: row.get(4)?,
            generator: row.get(5)?,
            apnonce: row.get(6)?,
            saved_blobs: row.get(7)?,
        })
    }

    fn into_device(self) -> Result<Device, Error> {
        Ok(Device {
            name: self.name,
            identifier: self.identifier,
            boardconfig: self.boardconfig,
            cpid: self.cpid,
            // Rows are only written from already-normalized values.
            ecid: Ecid(self.ecid.into()),
            generator: self.generator,
            apnonce: self.apnonce,
            saved_blobs: serde_json::from_str(&self.saved_blobs)?,
        })
    }
}

fn query_devices(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Device>, Error> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, DeviceRow::from_row)?;

    let mut devices = Vec::new();
    for row in rows {
        devices.push(row?.into_device()?);
    }
    Ok(devices)
}

impl DeviceStore for SqliteStore {
    fn add(&self, user: UserId, device: &Device) -> Result<(), Error> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let user_key = user as i64;

        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM devices WHERE ecid = ?1)",
            params![device.ecid.as_str()],
            |row| row.get(0),
        )?;
        if taken {
            return Err(Error::DuplicateEcid(device.ecid.clone()));
        }

        let name_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM devices WHERE user_id = ?1 AND name = ?2 COLLATE NOCASE)",
            params![user_key, device.name],
            |row| row.get(0),
        )?;
        if name_taken {
            return Err(Error::DuplicateName(device.name.clone()));
        }

        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM devices WHERE user_id = ?1",
            params![user_key],
            |row| row.get(0),
        )?;
        if count as usize >= self.max_devices {
            return Err(Error::TooManyDevices(self.max_devices));
        }

        tx.execute(
            "INSERT OR IGNORE INTO users (user_id, enabled) VALUES (?1, 1)",
            params![user_key],
        )?;
        tx.execute(
            "INSERT INTO devices (ecid, user_id, name, identifier, boardconfig, cpid, generator, apnonce, saved_blobs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                device.ecid.as_str(),
                user_key,
                device.name,
                device.identifier,
                device.boardconfig,
                device.cpid,
                device.generator,
                device.apnonce,
                serde_json::to_string(&device.saved_blobs)?,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn remove(&self, ecid: &Ecid) -> Result<Device, Error> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let found = tx
            .query_row(
                &format!("SELECT {}, d.user_id FROM devices d WHERE d.ecid = ?1", DEVICE_COLUMNS),
                params![ecid.as_str()],
                |row| Ok((DeviceRow::from_row(row)?, row.get::<_, i64>(8)?)),
            )
            .optional()?;
        let (row, user_key) = found.ok_or_else(|| Error::NotFound(ecid.clone()))?;

        tx.execute("DELETE FROM devices WHERE ecid = ?1", params![ecid.as_str()])?;
        tx.execute(
            "DELETE FROM users WHERE user_id = ?1
             AND NOT EXISTS(SELECT 1 FROM devices WHERE user_id = ?1)",
            params![user_key],
        )?;

        tx.commit()?;
        row.into_device()
    }

    fn devices(&self, scope: Scope) -> Result<Vec<Device>, Error> {
        let conn = self.lock()?;
        match scope {
            Scope::All => query_devices(
                &conn,
                &format!("SELECT {} FROM devices d ORDER BY d.id", DEVICE_COLUMNS),
                &[],
            ),
            Scope::Enabled => query_devices(
                &conn,
                &format!(
                    "SELECT {} FROM devices d JOIN users u ON u.user_id = d.user_id
                     WHERE u.enabled = 1 ORDER BY d.id",
                    DEVICE_COLUMNS
                ),
                &[],
            ),
            Scope::User(user) => query_devices(
                &conn,
                &format!("SELECT {} FROM devices d WHERE d.user_id = ?1 ORDER BY d.id", DEVICE_COLUMNS),
                &[&(user as i64)],
            ),
        }
    }

    fn device(&self, ecid: &Ecid) -> Result<Option<Device>, Error> {
        let conn = self.lock()?;
        let mut devices = query_devices(
            &conn,
            &format!("SELECT {} FROM devices d WHERE d.ecid = ?1", DEVICE_COLUMNS),
            &[&ecid.as_str()],
        )?;
        Ok(devices.pop())
    }

    fn owner(&self, ecid: &Ecid) -> Result<Option<UserId>, Error> {
        let conn = self.lock()?;
        let user = conn
            .query_row(
                "SELECT user_id FROM devices WHERE ecid = ?1",
                params![ecid.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(user.map(|user| user as UserId))
    }

    fn update_saved_blobs(&self, ecid: &Ecid, blobs: &[SavedBlob]) -> Result<(), Error> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE devices SET saved_blobs = ?1 WHERE ecid = ?2",
            params![serde_json::to_string(blobs)?, ecid.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(ecid.clone()));
        }
        Ok(())
    }

    fn enabled(&self, user: UserId) -> Result<Option<bool>, Error> {
        let conn = self.lock()?;
        let enabled = conn
            .query_row(
                "SELECT enabled FROM users WHERE user_id = ?1",
                params![user as i64],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(enabled)
    }

    fn set_enabled(&self, user: UserId, enabled: bool) -> Result<(), Error> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE users SET enabled = ?1 WHERE user_id = ?2",
            params![enabled, user as i64],
        )?;
        if changed == 0 {
            return Err(Error::UnknownUser(user));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, ecid: &str) -> Device {
        Device {
            name: name.to_string(),
            identifier: "iPhone10,6".to_string(),
            boardconfig: "d221ap".to_string(),
            cpid: 0x8015,
            ecid: Ecid::parse(ecid).unwrap(),
            generator: None,
            apnonce: None,
            saved_blobs: Vec::new(),
        }
    }

    #[test]
    fn add_and_list_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add(1, &device("first", "1111111111")).unwrap();
        store.add(1, &device("second", "2222222222")).unwrap();
        store.add(2, &device("other", "3333333333")).unwrap();

        let names: Vec<_> = store
            .devices(Scope::User(1))
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(store.devices(Scope::All).unwrap().len(), 3);
    }

    #[test]
    fn rejects_duplicate_ecid_regardless_of_case() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add(1, &device("phone", "00ABCDEF0123")).unwrap();
        let err = store.add(2, &device("tablet", "abcdef0123")).unwrap_err();
        assert!(matches!(err, Error::DuplicateEcid(_)));
    }

    #[test]
    fn rejects_duplicate_name_per_user() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add(1, &device("Phone", "1111111111")).unwrap();
        let err = store.add(1, &device("pHONE", "2222222222")).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));

        // Same name is fine for a different user.
        store.add(2, &device("phone", "3333333333")).unwrap();
    }

    #[test]
    fn enforces_device_limit() {
        let store = SqliteStore::open_in_memory().unwrap().with_max_devices(2);
        store.add(1, &device("a", "1111111111")).unwrap();
        store.add(1, &device("b", "2222222222")).unwrap();
        let err = store.add(1, &device("c", "3333333333")).unwrap_err();
        assert!(matches!(err, Error::TooManyDevices(2)));
        assert_eq!(store.devices(Scope::User(1)).unwrap().len(), 2);
    }

    #[test]
    fn remove_drops_empty_user() {
        let store = SqliteStore::open_in_memory().unwrap();
        let phone = device("phone", "1111111111");
        store.add(7, &phone).unwrap();
        assert_eq!(store.enabled(7).unwrap(), Some(true));

        let removed = store.remove(&phone.ecid).unwrap();
        assert_eq!(removed, phone);
        assert_eq!(store.enabled(7).unwrap(), None);

        let err = store.remove(&phone.ecid).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn remove_keeps_user_with_devices_left() {
        let store = SqliteStore::open_in_memory().unwrap();
        let phone = device("phone", "1111111111");
        store.add(7, &phone).unwrap();
        store.add(7, &device("pad", "2222222222")).unwrap();

        store.remove(&phone.ecid).unwrap();
        assert_eq!(store.enabled(7).unwrap(), Some(true));
        assert_eq!(store.owner(&Ecid::parse("2222222222").unwrap()).unwrap(), Some(7));
    }

    #[test]
    fn updates_saved_blobs() {
        let store = SqliteStore::open_in_memory().unwrap();
        let phone = device("phone", "1111111111");
        store.add(1, &phone).unwrap();

        let blobs = vec![SavedBlob {
            version: "16.7.10".to_string(),
            buildid: "20H350".to_string(),
        }];
        store.update_saved_blobs(&phone.ecid, &blobs).unwrap();

        let stored = store.device(&phone.ecid).unwrap().unwrap();
        assert_eq!(stored.saved_blobs, blobs);

        let missing = Ecid::parse("9999999999").unwrap();
        assert!(matches!(
            store.update_saved_blobs(&missing, &blobs),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn enabled_scope_filters_users() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add(1, &device("a", "1111111111")).unwrap();
        store.add(2, &device("b", "2222222222")).unwrap();
        store.set_enabled(2, false).unwrap();

        let enabled = store.devices(Scope::Enabled).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "a");

        // A user's own scope ignores the flag.
        assert_eq!(store.devices(Scope::User(2)).unwrap().len(), 1);
        assert!(matches!(store.set_enabled(3, true), Err(Error::UnknownUser(3))));
    }
}
