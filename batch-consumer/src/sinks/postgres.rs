use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use health::HealthCheck;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use crate::message::Record;
use crate::sink::{BatchSink, RecordFailure, SinkError, WriteReport};
use crate::user::User;

/// Upserts users by id, so redelivered records overwrite rather than duplicate.
pub struct PgUserSink {
    pool: PgPool,
    bulk_upsert: String,
    single_upsert: String,
}

fn is_valid_table(table: &str) -> bool {
    let mut chars = table.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl PgUserSink {
    pub async fn connect(url: &str, max_connections: u32, table: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;

        Self::from_pool(pool, table)
    }

    pub fn from_pool(pool: PgPool, table: &str) -> Result<Self, SinkError> {
        // Identifiers can't be bound, so the table name is checked before we format it in
        if !is_valid_table(table) {
            return Err(SinkError::InvalidTable(table.to_owned()));
        }

        let bulk_upsert = format!(
            r#"
INSERT INTO "{table}"
    (id, username, email, url, phone, active, locked, date_of_birth)
SELECT * FROM UNNEST(
    $1::text[], $2::text[], $3::text[], $4::text[],
    $5::text[], $6::bool[], $7::bool[], $8::timestamptz[]
)
ON CONFLICT (id) DO UPDATE SET
    username = EXCLUDED.username,
    email = EXCLUDED.email,
    url = EXCLUDED.url,
    phone = EXCLUDED.phone,
    active = EXCLUDED.active,
    locked = EXCLUDED.locked,
    date_of_birth = EXCLUDED.date_of_birth
            "#
        );

        let single_upsert = format!(
            r#"
INSERT INTO "{table}"
    (id, username, email, url, phone, active, locked, date_of_birth)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (id) DO UPDATE SET
    username = EXCLUDED.username,
    email = EXCLUDED.email,
    url = EXCLUDED.url,
    phone = EXCLUDED.phone,
    active = EXCLUDED.active,
    locked = EXCLUDED.locked,
    date_of_birth = EXCLUDED.date_of_birth
            "#
        );

        Ok(Self {
            pool,
            bulk_upsert,
            single_upsert,
        })
    }

    async fn upsert_all(&self, records: &[Record<User>]) -> Result<(), sqlx::Error> {
        let len = records.len();
        let mut ids = Vec::with_capacity(len);
        let mut usernames = Vec::with_capacity(len);
        let mut emails = Vec::with_capacity(len);
        let mut urls = Vec::with_capacity(len);
        let mut phones = Vec::with_capacity(len);
        let mut actives = Vec::with_capacity(len);
        let mut lockeds = Vec::with_capacity(len);
        let mut births: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(len);

        for record in records {
            let user = &record.value;
            ids.push(user.id.as_str());
            usernames.push((!user.username.is_empty()).then_some(user.username.as_str()));
            emails.push(user.email.as_str());
            urls.push(user.url.as_str());
            phones.push(user.phone.as_str());
            actives.push(user.active);
            lockeds.push(user.locked);
            births.push(user.date_of_birth);
        }

        sqlx::query(&self.bulk_upsert)
            .bind(ids)
            .bind(usernames)
            .bind(emails)
            .bind(urls)
            .bind(phones)
            .bind(actives)
            .bind(lockeds)
            .bind(births)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn upsert_one(&self, user: &User) -> Result<(), sqlx::Error> {
        sqlx::query(&self.single_upsert)
            .bind(&user.id)
            .bind((!user.username.is_empty()).then_some(user.username.as_str()))
            .bind(&user.email)
            .bind(&user.url)
            .bind(&user.phone)
            .bind(user.active)
            .bind(user.locked)
            .bind(user.date_of_birth)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl BatchSink<User> for PgUserSink {
    async fn write_batch(&self, records: &[Record<User>]) -> Result<WriteReport, SinkError> {
        let error = match self.upsert_all(records).await {
            Ok(()) => return Ok(WriteReport::committed()),
            Err(error @ sqlx::Error::Database(_)) => error,
            Err(error) => return Err(error.into()),
        };

        // One row broke the statement, find out which by writing them one at a time.
        // Rows written here may be written again if the batch is retried, which the upsert allows.
        info!(%error, records = records.len(), "bulk upsert failed, falling back to single rows");

        let mut failures = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match self.upsert_one(&record.value).await {
                Ok(()) => {}
                Err(sqlx::Error::Database(error)) => {
                    warn!(
                        record_id = record.id,
                        user_id = record.value.id.as_str(),
                        %error,
                        "failed to upsert user"
                    );
                    failures.push(RecordFailure::new(index, error.to_string()));
                }
                Err(error) => return Err(error.into()),
            }
        }

        Ok(WriteReport::with_failures(failures))
    }
}

#[async_trait]
impl HealthCheck for PgUserSink {
    async fn check(&self) -> Result<(), String> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::collections::HashMap;

    fn record(id: u64, user_id: &str, email: &str) -> Record<User> {
        Record::new(
            id,
            Message::new("{}", HashMap::new()),
            User {
                id: user_id.to_owned(),
                username: format!("user{id}"),
                email: email.to_owned(),
                url: "https://example.com".to_owned(),
                phone: "+1 555 0100".to_owned(),
                active: true,
                ..Default::default()
            },
        )
    }

    #[test]
    fn table_names_are_checked() {
        assert!(is_valid_table("users"));
        assert!(is_valid_table("_users_v2"));
        assert!(!is_valid_table(""));
        assert!(!is_valid_table("2users"));
        assert!(!is_valid_table("users\"; DROP TABLE users; --"));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a Postgres database at DATABASE_URL"]
    async fn upserts_a_batch(db: PgPool) {
        let sink = PgUserSink::from_pool(db.clone(), "users").unwrap();

        let report = sink
            .write_batch(&[record(0, "u1", "a@example.com"), record(1, "u2", "b@example.com")])
            .await
            .unwrap();
        assert!(report.is_complete());

        // Redelivery overwrites
        let report = sink
            .write_batch(&[record(2, "u1", "c@example.com")])
            .await
            .unwrap();
        assert!(report.is_complete());

        let emails: Vec<(String,)> = sqlx::query_as("SELECT email FROM users ORDER BY id")
            .fetch_all(&db)
            .await
            .unwrap();
        assert_eq!(
            emails,
            vec![("c@example.com".to_owned(),), ("b@example.com".to_owned(),)]
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a Postgres database at DATABASE_URL"]
    async fn reports_the_rows_that_failed(db: PgPool) {
        let sink = PgUserSink::from_pool(db.clone(), "users").unwrap();

        let report = sink
            .write_batch(&[
                record(0, "u1", "a@example.com"),
                record(1, "u2", "a@example.com"),
                record(2, "u3", "c@example.com"),
            ])
            .await
            .unwrap();

        let failed: Vec<usize> = report.failures().iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![1]);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a Postgres database at DATABASE_URL"]
    async fn health_check_pings_the_pool(db: PgPool) {
        let sink = PgUserSink::from_pool(db, "users").unwrap();
        assert!(sink.check().await.is_ok());
    }
}
