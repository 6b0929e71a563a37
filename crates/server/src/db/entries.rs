use pipeline::model::{CanonicalEntry, LogLevel, RawValue};
use rusqlite::params;
use std::collections::BTreeMap;

use super::{Database, StoreResult};

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CanonicalEntry> {
    let ts: String = row.get(0)?;
    let level: String = row.get(1)?;
    let metadata: Option<String> = row.get(3)?;
    Ok(CanonicalEntry {
        timestamp: super::parse_ts(&ts),
        level: LogLevel::parse(&level).unwrap_or(LogLevel::Info),
        message: row.get(2)?,
        metadata: metadata
            .and_then(|raw| serde_json::from_str::<BTreeMap<String, RawValue>>(&raw).ok())
            .unwrap_or_default(),
        line_index: row.get::<_, i64>(4)? as usize,
    })
}

impl Database {
    /// Bulk-insert parsed entries in one transaction, preserving source
    /// order through `line_index`.
    pub fn insert_entries(&self, file_id: &str, entries: &[CanonicalEntry]) -> StoreResult<()> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO log_entries (file_id, ts, level, message, metadata, line_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in entries {
                let metadata = if entry.metadata.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&entry.metadata)?)
                };
                stmt.execute(params![
                    file_id,
                    entry.timestamp.to_rfc3339(),
                    entry.level.as_str(),
                    entry.message,
                    metadata,
                    entry.line_index as i64,
                ])?;
            }
            Ok(())
        })
    }

    /// All entries of a file in source order.
    pub fn entries_for_file(&self, file_id: &str, limit: Option<i64>) -> StoreResult<Vec<CanonicalEntry>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ts, level, message, metadata, line_index FROM log_entries
                 WHERE file_id = ?1 ORDER BY line_index ASC, id ASC LIMIT ?2",
            )?;
            let entries = stmt
                .query_map(params![file_id, limit.unwrap_or(i64::MAX)], map_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    pub fn entry_count_for_file(&self, file_id: &str) -> StoreResult<i64> {
        self.with(|conn| {
            Ok(conn.query_row(
                "SELECT count(*) FROM log_entries WHERE file_id = ?1",
                params![file_id],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(level: LogLevel, message: &str, line_index: usize) -> CanonicalEntry {
        CanonicalEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
            level,
            message: message.to_string(),
            metadata: BTreeMap::new(),
            line_index,
        }
    }

    #[test]
    fn test_round_trip_preserves_order_and_levels() {
        let db = Database::open_in_memory().unwrap();
        let entries = vec![
            entry(LogLevel::Info, "first", 0),
            entry(LogLevel::Error, "second", 1),
            entry(LogLevel::Fatal, "third", 2),
        ];
        db.insert_entries("file-1", &entries).unwrap();

        let loaded = db.entries_for_file("file-1", None).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].message, "first");
        assert_eq!(loaded[1].level, LogLevel::Error);
        assert_eq!(loaded[2].level, LogLevel::Fatal);
        assert_eq!(loaded[2].line_index, 2);
    }

    #[test]
    fn test_metadata_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let mut e = entry(LogLevel::Warn, "with meta", 0);
        e.metadata
            .insert("request_id".to_string(), RawValue::String("abc".to_string()));
        e.metadata.insert("attempt".to_string(), RawValue::Number(2.0));
        db.insert_entries("file-1", &[e]).unwrap();

        let loaded = db.entries_for_file("file-1", None).unwrap();
        assert_eq!(
            loaded[0].metadata.get("request_id").unwrap().as_str(),
            Some("abc")
        );
        assert_eq!(loaded[0].metadata.get("attempt").unwrap().as_f64(), Some(2.0));
    }

    #[test]
    fn test_limit_applies() {
        let db = Database::open_in_memory().unwrap();
        let entries: Vec<CanonicalEntry> = (0..10)
            .map(|i| entry(LogLevel::Info, &format!("m{}", i), i))
            .collect();
        db.insert_entries("file-1", &entries).unwrap();
        let loaded = db.entries_for_file("file-1", Some(4)).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[3].message, "m3");
    }

    #[test]
    fn test_files_are_isolated() {
        let db = Database::open_in_memory().unwrap();
        db.insert_entries("file-1", &[entry(LogLevel::Info, "a", 0)]).unwrap();
        db.insert_entries("file-2", &[entry(LogLevel::Info, "b", 0)]).unwrap();
        assert_eq!(db.entry_count_for_file("file-1").unwrap(), 1);
        assert_eq!(db.entries_for_file("file-2", None).unwrap()[0].message, "b");
    }
}
