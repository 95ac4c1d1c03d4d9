//! Person operations.

use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::Person;
use crate::storage::database::Result;

/// Inserts a person or updates the display name.
///
/// A missing name never overwrites a known one.
pub fn upsert(conn: &Connection, person: &Person) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO people (email, display_name) VALUES (?1, ?2)
        ON CONFLICT(email) DO UPDATE SET
            display_name = COALESCE(excluded.display_name, people.display_name)
        "#,
        params![person.email, person.display_name],
    )?;
    Ok(())
}

/// Retrieves a person by normalized email.
pub fn get(conn: &Connection, email: &str) -> Result<Option<Person>> {
    Ok(conn
        .query_row(
            "SELECT email, display_name FROM people WHERE email = ?1",
            [email],
            |row| {
                Ok(Person {
                    email: row.get(0)?,
                    display_name: row.get(1)?,
                })
            },
        )
        .optional()?)
}
