use std::path::Path;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use uuid::Uuid;

/// The subset of a device kept across restarts for offline display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDevice {
    pub id: Uuid,
    pub friendly_name: String,
    pub stored_icon_url: Option<String>,
}

pub struct DeviceStore {
    conn: Connection,
}

impl DeviceStore {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id              TEXT PRIMARY KEY,
                friendly_name   TEXT NOT NULL,
                stored_icon_url TEXT
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Insert or replace the persisted record of a device
    pub fn save(&self, device: &StoredDevice) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO devices (id, friendly_name, stored_icon_url)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                friendly_name = excluded.friendly_name,
                stored_icon_url = excluded.stored_icon_url
            "#,
            params![
                device.id.to_string(),
                &device.friendly_name,
                &device.stored_icon_url,
            ],
        )
        .context("Failed to save device")?;

        Ok(())
    }

    /// Load every persisted device
    pub fn load_all(&self) -> Result<Vec<StoredDevice>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, friendly_name, stored_icon_url FROM devices")
            .context("Failed to prepare query")?;

        let devices = stmt
            .query_map([], |row| Self::row_to_device(row))
            .context("Failed to query devices")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect devices")?;

        Ok(devices)
    }

    fn row_to_device(row: &rusqlite::Row) -> Result<StoredDevice, rusqlite::Error> {
        let id_str: String = row.get(0)?;
        let id = Uuid::parse_str(&id_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?;

        // Older records wrote the literal "null" for unresolved icons
        let stored_icon_url: Option<String> = row.get(2)?;
        let stored_icon_url = stored_icon_url.filter(|url| !url.is_empty() && url != "null");

        Ok(StoredDevice {
            id,
            friendly_name: row.get(1)?,
            stored_icon_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(name: &str, url: Option<&str>) -> StoredDevice {
        StoredDevice {
            id: Uuid::new_v4(),
            friendly_name: name.to_string(),
            stored_icon_url: url.map(str::to_string),
        }
    }

    #[test]
    fn test_save_and_load() {
        let store = DeviceStore::open(":memory:").unwrap();
        let device = stored("Kitchen Oven", Some("http://x/icon.png"));

        store.save(&device).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![device]);
    }

    #[test]
    fn test_save_overwrites_existing_record() {
        let store = DeviceStore::open(":memory:").unwrap();
        let mut device = stored("Oven", None);
        store.save(&device).unwrap();

        device.friendly_name = "Kitchen Oven".to_string();
        device.stored_icon_url = Some("local://defaultURL".to_string());
        store.save(&device).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], device);
    }

    #[test]
    fn test_null_literal_is_unresolved() {
        let store = DeviceStore::open(":memory:").unwrap();
        let device = stored("Fridge", Some("null"));
        store.save(&device).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded[0].stored_icon_url, None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/devices.db");
        let device = stored("Washer", Some("http://x/washer.png"));

        DeviceStore::open(&path).unwrap().save(&device).unwrap();

        let loaded = DeviceStore::open(&path).unwrap().load_all().unwrap();
        assert_eq!(loaded, vec![device]);
    }
}
