//! SQLite-backed implementation of [`super::GroupStore`] and
//! [`super::MessageStore`], grounded on `tasks/store.rs` and
//! `memory/store.rs`'s `CREATE TABLE IF NOT EXISTS` + one-pool-per-store
//! shape.

use crate::error::{Result, StoreError};
use crate::{ContainerOverrides, Jid, Message, RegisteredGroup};
use anyhow::Context as _;
use sqlx::{Row as _, SqlitePool};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registered_groups (
                jid TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                folder TEXT NOT NULL UNIQUE,
                server_folder TEXT,
                trigger_pattern TEXT NOT NULL,
                requires_trigger INTEGER NOT NULL,
                added_at TEXT NOT NULL,
                backend TEXT,
                container_overrides TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create registered_groups table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                chat_jid TEXT NOT NULL,
                id TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_name TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                source_timestamp INTEGER,
                is_from_me INTEGER NOT NULL,
                is_bot INTEGER NOT NULL,
                PRIMARY KEY (chat_jid, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create messages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_chat_source_ts ON messages(chat_jid, source_timestamp)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create messages index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                chat_jid TEXT NOT NULL,
                folder TEXT NOT NULL,
                prompt TEXT NOT NULL,
                run_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create scheduled_tasks table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_run_at ON scheduled_tasks(run_at)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create scheduled_tasks index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_cursors (
                chat_jid TEXT PRIMARY KEY,
                cursor TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create chat_cursors table")?;

        Ok(())
    }
}

fn scheduled_task_from_row(row: sqlx::sqlite::SqliteRow) -> Result<super::ScheduledTask> {
    let run_at_raw: String = row.try_get("run_at").context("failed to read run_at")?;
    let run_at = chrono::DateTime::parse_from_rfc3339(&run_at_raw)
        .context("failed to parse scheduled task run_at")?
        .with_timezone(&chrono::Utc);
    let created_at_raw: String = row.try_get("created_at").context("failed to read created_at")?;
    let created_at = chrono::DateTime::parse_from_rfc3339(&created_at_raw)
        .context("failed to parse scheduled task created_at")?
        .with_timezone(&chrono::Utc);

    Ok(super::ScheduledTask {
        id: row.try_get("id").context("failed to read scheduled task id")?,
        chat_jid: Jid::new(
            row.try_get::<String, _>("chat_jid")
                .context("failed to read scheduled task chat_jid")?,
        ),
        folder: row.try_get("folder").context("failed to read scheduled task folder")?,
        prompt: row.try_get("prompt").context("failed to read scheduled task prompt")?,
        run_at,
        created_at,
    })
}

#[async_trait::async_trait]
impl super::ScheduledTaskStore for SqliteStore {
    async fn schedule(&self, task: super::ScheduledTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_tasks (id, chat_jid, folder, prompt, run_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                prompt = excluded.prompt,
                run_at = excluded.run_at
            "#,
        )
        .bind(&task.id)
        .bind(task.chat_jid.as_str())
        .bind(&task.folder)
        .bind(&task.prompt)
        .bind(task.run_at.to_rfc3339())
        .bind(task.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to persist scheduled task")?;
        Ok(())
    }

    async fn due(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<super::ScheduledTask>> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks WHERE run_at <= ? ORDER BY run_at ASC")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch due scheduled tasks")?;
        rows.into_iter().map(scheduled_task_from_row).collect()
    }

    async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to remove scheduled task")?;
        Ok(())
    }

    async fn list_for_chat(&self, chat_jid: &Jid) -> Result<Vec<super::ScheduledTask>> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks WHERE chat_jid = ? ORDER BY run_at ASC")
            .bind(chat_jid.as_str())
            .fetch_all(&self.pool)
            .await
            .context("failed to list scheduled tasks for chat")?;
        rows.into_iter().map(scheduled_task_from_row).collect()
    }
}

fn group_from_row(row: sqlx::sqlite::SqliteRow) -> Result<RegisteredGroup> {
    let trigger_pattern: String = row
        .try_get("trigger_pattern")
        .context("failed to read trigger_pattern")?;
    let trigger = regex::Regex::new(&trigger_pattern)
        .with_context(|| format!("stored trigger pattern is invalid regex: {trigger_pattern}"))?;
    let added_at_raw: String = row.try_get("added_at").context("failed to read added_at")?;
    let added_at = chrono::DateTime::parse_from_rfc3339(&added_at_raw)
        .context("failed to parse added_at")?
        .with_timezone(&chrono::Utc);
    let container_overrides_raw: Option<String> = row.try_get("container_overrides").ok();
    let container = container_overrides_raw
        .filter(|raw| !raw.is_empty())
        .map(|raw| serde_json::from_str::<ContainerOverrides>(&raw))
        .transpose()
        .context("failed to parse stored container overrides")?;

    Ok(RegisteredGroup {
        jid: Jid::new(row.try_get::<String, _>("jid").context("failed to read jid")?),
        display_name: row
            .try_get("display_name")
            .context("failed to read display_name")?,
        folder: row.try_get("folder").context("failed to read folder")?,
        server_folder: row.try_get("server_folder").ok(),
        trigger,
        requires_trigger: row
            .try_get::<i64, _>("requires_trigger")
            .context("failed to read requires_trigger")?
            != 0,
        added_at,
        backend: row.try_get("backend").ok(),
        container,
    })
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Message> {
    let timestamp_raw: String = row.try_get("timestamp").context("failed to read timestamp")?;
    let timestamp = chrono::DateTime::parse_from_rfc3339(&timestamp_raw)
        .context("failed to parse message timestamp")?
        .with_timezone(&chrono::Utc);

    Ok(Message {
        id: row.try_get("id").context("failed to read message id")?,
        chat_jid: Jid::new(
            row.try_get::<String, _>("chat_jid")
                .context("failed to read chat_jid")?,
        ),
        sender: row.try_get("sender").context("failed to read sender")?,
        sender_name: row
            .try_get("sender_name")
            .context("failed to read sender_name")?,
        content: row.try_get("content").context("failed to read content")?,
        timestamp,
        source_timestamp: row.try_get("source_timestamp").ok(),
        is_from_me: row
            .try_get::<i64, _>("is_from_me")
            .context("failed to read is_from_me")?
            != 0,
        is_bot: row
            .try_get::<i64, _>("is_bot")
            .context("failed to read is_bot")?
            != 0,
    })
}

#[async_trait::async_trait]
impl super::GroupStore for SqliteStore {
    async fn register(&self, group: RegisteredGroup) -> Result<()> {
        let existing_owner: Option<String> =
            sqlx::query_scalar("SELECT jid FROM registered_groups WHERE folder = ?")
                .bind(&group.folder)
                .fetch_optional(&self.pool)
                .await
                .context("failed to check folder uniqueness")?;

        if let Some(owner) = existing_owner
            && owner != group.jid.as_str()
        {
            return Err(StoreError::FolderConflict {
                folder: group.folder,
                jid: owner,
            }
            .into());
        }

        let container_json = group
            .container
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize container overrides")?;

        sqlx::query(
            r#"
            INSERT INTO registered_groups
                (jid, display_name, folder, server_folder, trigger_pattern, requires_trigger, added_at, backend, container_overrides)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(jid) DO UPDATE SET
                display_name = excluded.display_name,
                folder = excluded.folder,
                server_folder = excluded.server_folder,
                trigger_pattern = excluded.trigger_pattern,
                requires_trigger = excluded.requires_trigger,
                backend = excluded.backend,
                container_overrides = excluded.container_overrides
            "#,
        )
        .bind(group.jid.as_str())
        .bind(&group.display_name)
        .bind(&group.folder)
        .bind(&group.server_folder)
        .bind(group.trigger.as_str())
        .bind(group.requires_trigger as i64)
        .bind(group.added_at.to_rfc3339())
        .bind(&group.backend)
        .bind(container_json)
        .execute(&self.pool)
        .await
        .context("failed to upsert registered group")?;

        Ok(())
    }

    async fn get(&self, jid: &Jid) -> Result<Option<RegisteredGroup>> {
        let row = sqlx::query("SELECT * FROM registered_groups WHERE jid = ?")
            .bind(jid.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch registered group")?;
        row.map(group_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<RegisteredGroup>> {
        let rows = sqlx::query("SELECT * FROM registered_groups ORDER BY added_at ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list registered groups")?;
        rows.into_iter().map(group_from_row).collect()
    }

    async fn remove(&self, jid: &Jid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM registered_groups WHERE jid = ?")
            .bind(jid.as_str())
            .execute(&self.pool)
            .await
            .context("failed to remove registered group")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl super::MessageStore for SqliteStore {
    async fn append(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages
                (chat_jid, id, sender, sender_name, content, timestamp, source_timestamp, is_from_me, is_bot)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chat_jid, id) DO NOTHING
            "#,
        )
        .bind(message.chat_jid.as_str())
        .bind(&message.id)
        .bind(&message.sender)
        .bind(&message.sender_name)
        .bind(&message.content)
        .bind(message.timestamp.to_rfc3339())
        .bind(message.source_timestamp)
        .bind(message.is_from_me as i64)
        .bind(message.is_bot as i64)
        .execute(&self.pool)
        .await
        .context("failed to append message")?;

        Ok(())
    }

    async fn recent(&self, chat_jid: &Jid, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM (SELECT * FROM messages WHERE chat_jid = ? ORDER BY timestamp DESC LIMIT ?) ORDER BY timestamp ASC",
        )
        .bind(chat_jid.as_str())
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch recent messages")?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn get_by_source_timestamp(
        &self,
        chat_jid: &Jid,
        source_timestamp: i64,
    ) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE chat_jid = ? AND source_timestamp = ?")
            .bind(chat_jid.as_str())
            .bind(source_timestamp)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch message by source timestamp")?;
        row.map(message_from_row).transpose()
    }

    async fn latest(&self, chat_jid: &Jid) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE chat_jid = ? ORDER BY timestamp DESC LIMIT 1")
            .bind(chat_jid.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch latest message")?;
        row.map(message_from_row).transpose()
    }

    async fn cursor(&self, chat_jid: &Jid) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let row = sqlx::query("SELECT cursor FROM chat_cursors WHERE chat_jid = ?")
            .bind(chat_jid.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch chat cursor")?;
        row.map(|row| -> Result<chrono::DateTime<chrono::Utc>> {
            let raw: String = row.try_get("cursor").context("failed to read cursor")?;
            let parsed = chrono::DateTime::parse_from_rfc3339(&raw).context("failed to parse chat cursor")?;
            Ok(parsed.with_timezone(&chrono::Utc))
        })
        .transpose()
    }

    async fn commit_cursor(&self, chat_jid: &Jid, cursor: chrono::DateTime<chrono::Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_cursors (chat_jid, cursor) VALUES (?, ?)
            ON CONFLICT(chat_jid) DO UPDATE SET cursor = excluded.cursor
            "#,
        )
        .bind(chat_jid.as_str())
        .bind(cursor.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to commit chat cursor")?;
        Ok(())
    }

    async fn since_cursor(
        &self,
        chat_jid: &Jid,
        cursor: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<Message>> {
        let rows = match cursor {
            Some(cursor) => {
                sqlx::query("SELECT * FROM messages WHERE chat_jid = ? AND timestamp > ? ORDER BY timestamp ASC")
                    .bind(chat_jid.as_str())
                    .bind(cursor.to_rfc3339())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM messages WHERE chat_jid = ? ORDER BY timestamp ASC")
                    .bind(chat_jid.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("failed to fetch messages since cursor")?;
        rows.into_iter().map(message_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GroupStore, MessageStore};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        let store = SqliteStore::new(pool);
        store.initialize().await.expect("schema should initialize");
        store
    }

    fn sample_group(jid: &str, folder: &str) -> RegisteredGroup {
        RegisteredGroup {
            jid: Jid::new(jid),
            display_name: "Test Group".to_string(),
            folder: folder.to_string(),
            server_folder: None,
            trigger: regex::Regex::new("@bot").unwrap(),
            requires_trigger: false,
            added_at: chrono::Utc::now(),
            backend: None,
            container: None,
        }
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let store = setup().await;
        store.register(sample_group("slack:C1", "main")).await.unwrap();
        let fetched = store.get(&Jid::new("slack:C1")).await.unwrap().unwrap();
        assert_eq!(fetched.folder, "main");
        assert!(fetched.is_main());
    }

    #[tokio::test]
    async fn folder_conflict_is_rejected() {
        let store = setup().await;
        store.register(sample_group("slack:C1", "team-a")).await.unwrap();
        let err = store
            .register(sample_group("slack:C2", "team-a"))
            .await
            .expect_err("duplicate folder must be rejected");
        assert!(err.to_string().contains("already in use"));
    }

    #[tokio::test]
    async fn re_registering_same_jid_updates_in_place() {
        let store = setup().await;
        store.register(sample_group("slack:C1", "main")).await.unwrap();
        let mut updated = sample_group("slack:C1", "main");
        updated.display_name = "Renamed".to_string();
        store.register(updated).await.unwrap();
        let fetched = store.get(&Jid::new("slack:C1")).await.unwrap().unwrap();
        assert_eq!(fetched.display_name, "Renamed");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recent_messages_are_ordered_oldest_to_newest() {
        let store = setup().await;
        let jid = Jid::new("slack:C1");
        for (i, ts) in [1, 2, 3].into_iter().enumerate() {
            store
                .append(&Message {
                    id: format!("m{i}"),
                    chat_jid: jid.clone(),
                    sender: "u1".to_string(),
                    sender_name: "User".to_string(),
                    content: format!("msg {i}"),
                    timestamp: chrono::Utc::now() + chrono::Duration::seconds(i as i64),
                    source_timestamp: Some(ts),
                    is_from_me: false,
                    is_bot: false,
                })
                .await
                .unwrap();
        }

        let recent = store.recent(&jid, 10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "msg 0");
        assert_eq!(recent[2].content, "msg 2");
    }

    #[tokio::test]
    async fn due_scheduled_tasks_are_returned_oldest_first() {
        use crate::store::{ScheduledTask, ScheduledTaskStore};

        let store = setup().await;
        let jid = Jid::new("slack:C1");
        let now = chrono::Utc::now();
        store
            .schedule(ScheduledTask {
                id: "t2".to_string(),
                chat_jid: jid.clone(),
                folder: "main".to_string(),
                prompt: "second".to_string(),
                run_at: now - chrono::Duration::seconds(10),
                created_at: now,
            })
            .await
            .unwrap();
        store
            .schedule(ScheduledTask {
                id: "t1".to_string(),
                chat_jid: jid.clone(),
                folder: "main".to_string(),
                prompt: "first".to_string(),
                run_at: now - chrono::Duration::seconds(20),
                created_at: now,
            })
            .await
            .unwrap();
        store
            .schedule(ScheduledTask {
                id: "future".to_string(),
                chat_jid: jid.clone(),
                folder: "main".to_string(),
                prompt: "not yet".to_string(),
                run_at: now + chrono::Duration::seconds(60),
                created_at: now,
            })
            .await
            .unwrap();

        let due = store.due(now).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, "t1");
        assert_eq!(due[1].id, "t2");

        store.remove("t1").await.unwrap();
        assert_eq!(store.list_for_chat(&jid).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cursor_gates_since_cursor_and_round_trips() {
        let store = setup().await;
        let jid = Jid::new("slack:C1");
        assert_eq!(store.cursor(&jid).await.unwrap(), None);

        let mut timestamps = Vec::new();
        for i in 0..3 {
            let ts = chrono::Utc::now() + chrono::Duration::seconds(i);
            timestamps.push(ts);
            store
                .append(&Message {
                    id: format!("m{i}"),
                    chat_jid: jid.clone(),
                    sender: "u1".to_string(),
                    sender_name: "User".to_string(),
                    content: format!("msg {i}"),
                    timestamp: ts,
                    source_timestamp: Some(i),
                    is_from_me: false,
                    is_bot: false,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.since_cursor(&jid, None).await.unwrap().len(), 3);

        store.commit_cursor(&jid, timestamps[0]).await.unwrap();
        assert_eq!(store.cursor(&jid).await.unwrap(), Some(timestamps[0]));
        let remaining = store.since_cursor(&jid, Some(timestamps[0])).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].content, "msg 1");

        store.commit_cursor(&jid, timestamps[2]).await.unwrap();
        assert_eq!(store.since_cursor(&jid, Some(timestamps[2])).await.unwrap().len(), 0);
    }
}
