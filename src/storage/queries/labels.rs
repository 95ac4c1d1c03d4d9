//! Label operations.

use rusqlite::{params, Connection};

use crate::domain::{Label, LabelId};
use crate::storage::database::Result;

/// Inserts or renames labels.
pub fn upsert_all(conn: &Connection, labels: &[Label]) -> Result<()> {
    let mut stmt = conn.prepare(
        r#"
        INSERT INTO labels (id, name, is_system) VALUES (?1, ?2, ?3)
        ON CONFLICT(id) DO UPDATE SET name = excluded.name, is_system = excluded.is_system
        "#,
    )?;
    for label in labels {
        stmt.execute(params![label.id.0, label.name, label.is_system as i32])?;
    }
    Ok(())
}

/// Retrieves all labels ordered by name.
pub fn get_all(conn: &Connection) -> Result<Vec<Label>> {
    let mut stmt = conn.prepare("SELECT id, name, is_system FROM labels ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(Label {
            id: LabelId(row.get(0)?),
            name: row.get(1)?,
            is_system: row.get::<_, i32>(2)? != 0,
        })
    })?;
    let labels: std::result::Result<Vec<_>, _> = rows.collect();
    Ok(labels?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn upsert_renames_in_place() {
        let db = Database::open_in_memory().await.unwrap();

        let labels = db
            .with_conn(|conn| {
                upsert_all(
                    conn,
                    &[
                        Label {
                            id: LabelId::from("INBOX"),
                            name: "INBOX".into(),
                            is_system: true,
                        },
                        Label {
                            id: LabelId::from("Label_1"),
                            name: "Work".into(),
                            is_system: false,
                        },
                    ],
                )?;
                upsert_all(
                    conn,
                    &[Label {
                        id: LabelId::from("Label_1"),
                        name: "Clients".into(),
                        is_system: false,
                    }],
                )?;
                get_all(conn)
            })
            .await
            .unwrap();

        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].name, "Clients");
        assert!(labels[1].is_system);
    }
}
