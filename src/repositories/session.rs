//! The remembered owner, so the store stays usable offline after a restart.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, FromQueryResult, Value};

use super::statement;
use crate::constants::TABLE_SESSION;
use crate::utils::datetime;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredOwner {
    pub user_id: String,
    pub email: Option<String>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, FromQueryResult)]
struct SessionRow {
    user_id: String,
    email: Option<String>,
    stored_at: String,
}

pub struct SessionRepository;

impl SessionRepository {
    /// Store `user_id` as the current owner, replacing any previous one.
    pub async fn remember<C>(conn: &C, user_id: &str, email: Option<&str>) -> Result<()>
    where
        C: ConnectionTrait,
    {
        let sql = format!(
            "INSERT INTO {TABLE_SESSION} (slot, user_id, email, stored_at) VALUES (1, ?, ?, ?) \
             ON CONFLICT(slot) DO UPDATE SET user_id = excluded.user_id, email = excluded.email, \
             stored_at = excluded.stored_at"
        );
        let values: Vec<Value> = vec![
            user_id.into(),
            email.map(str::to_string).into(),
            datetime::format_storage(datetime::now()).into(),
        ];
        conn.execute(statement(&sql, values)).await?;
        Ok(())
    }

    pub async fn get<C>(conn: &C) -> Result<Option<StoredOwner>>
    where
        C: ConnectionTrait,
    {
        let sql = format!("SELECT user_id, email, stored_at FROM {TABLE_SESSION} WHERE slot = 1");
        let row = SessionRow::find_by_statement(statement(&sql, Vec::new()))
            .one(conn)
            .await?;

        match row {
            Some(row) => Ok(Some(StoredOwner {
                user_id: row.user_id,
                email: row.email,
                stored_at: datetime::parse_storage(&row.stored_at)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn forget<C>(conn: &C) -> Result<()>
    where
        C: ConnectionTrait,
    {
        let sql = format!("DELETE FROM {TABLE_SESSION}");
        conn.execute(statement(&sql, Vec::new())).await?;
        Ok(())
    }
}
