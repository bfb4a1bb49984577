use std::future::Future;

use rusqlite::params;

use rollcall_core::RosterEntry;

use crate::{Database, StoreError};

/// Enrollment lookup seam. Session startup takes its roster snapshot
/// through this rather than a concrete store, so tests can supply a
/// canned class list.
pub trait Roster {
    fn snapshot(
        &self,
        class_id: &str,
    ) -> impl Future<Output = Result<Vec<RosterEntry>, StoreError>> + Send;
}

impl Roster for Database {
    fn snapshot(
        &self,
        class_id: &str,
    ) -> impl Future<Output = Result<Vec<RosterEntry>, StoreError>> + Send {
        self.roster_for_class(class_id)
    }
}

impl Database {
    /// Replace the enrollment rows for a class.
    pub async fn replace_roster(
        &self,
        class_id: &str,
        entries: Vec<RosterEntry>,
    ) -> Result<(), StoreError> {
        let class_id = class_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM roster WHERE class_id = ?1", params![class_id])?;
            for entry in &entries {
                tx.execute(
                    "INSERT INTO roster (class_id, student_id, display_name) VALUES (?1, ?2, ?3)",
                    params![class_id, entry.student_id, entry.display_name],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Enrollment snapshot for a class, in stable student-id order.
    pub async fn roster_for_class(&self, class_id: &str) -> Result<Vec<RosterEntry>, StoreError> {
        let class_id = class_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT student_id, display_name FROM roster
                 WHERE class_id = ?1 ORDER BY student_id",
            )?;
            let mut rows = stmt.query(params![class_id])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(RosterEntry {
                    student_id: row.get("student_id")?,
                    display_name: row.get("display_name")?,
                });
            }
            Ok(entries)
        })
        .await
    }
}
