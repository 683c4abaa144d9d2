use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::CollaboratorError;

/// Identity of a syllabus: one per topic, level and owner. `user_id = None`
/// is the shared syllabus every user can start from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyllabusKey {
    pub topic: String,
    pub level: String,
    pub user_id: Option<String>,
}

impl SyllabusKey {
    pub fn new(topic: &str, level: &str, user_id: Option<&str>) -> Self {
        Self {
            topic: topic.trim().to_string(),
            level: level.to_string(),
            user_id: user_id.map(str::to_string),
        }
    }

    /// Deterministic id, so repeated saves of the same key upsert one record.
    pub fn syllabus_id(&self) -> String {
        let canonical = format!(
            "{}\u{1f}{}\u{1f}{}",
            self.topic.to_lowercase(),
            self.level.to_lowercase(),
            self.user_id.as_deref().unwrap_or("")
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, canonical.as_bytes()).to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSyllabus {
    pub id: String,
    pub syllabus: Value,
}

/// Domain persistence used by workflow steps. Every write is an upsert, so a
/// workflow re-run after a crash does not duplicate content.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    async fn find_syllabus(&self, key: &SyllabusKey) -> Result<Option<StoredSyllabus>, CollaboratorError>;

    /// Upsert `syllabus` under `key` and return its stable id.
    async fn save_syllabus(&self, key: &SyllabusKey, syllabus: &Value) -> Result<String, CollaboratorError>;

    async fn load_syllabus(&self, id: &str) -> Result<Option<Value>, CollaboratorError>;

    async fn save_lesson_content(&self, lesson_id: &str, exposition: &str) -> Result<(), CollaboratorError>;

    async fn load_lesson_content(&self, lesson_id: &str) -> Result<Option<String>, CollaboratorError>;
}

#[derive(Debug, Default)]
struct Documents {
    syllabi: HashMap<String, Value>,
    lessons: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct InMemoryContentRepository {
    docs: Mutex<Documents>,
}

impl InMemoryContentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Documents>, CollaboratorError> {
        self.docs
            .lock()
            .map_err(|_| CollaboratorError::Storage("content lock poisoned".into()))
    }
}

#[async_trait]
impl ContentRepository for InMemoryContentRepository {
    async fn find_syllabus(&self, key: &SyllabusKey) -> Result<Option<StoredSyllabus>, CollaboratorError> {
        let id = key.syllabus_id();
        let docs = self.lock()?;
        Ok(docs.syllabi.get(&id).map(|syllabus| StoredSyllabus {
            id,
            syllabus: syllabus.clone(),
        }))
    }

    async fn save_syllabus(&self, key: &SyllabusKey, syllabus: &Value) -> Result<String, CollaboratorError> {
        let id = key.syllabus_id();
        self.lock()?.syllabi.insert(id.clone(), syllabus.clone());
        Ok(id)
    }

    async fn load_syllabus(&self, id: &str) -> Result<Option<Value>, CollaboratorError> {
        Ok(self.lock()?.syllabi.get(id).cloned())
    }

    async fn save_lesson_content(&self, lesson_id: &str, exposition: &str) -> Result<(), CollaboratorError> {
        self.lock()?
            .lessons
            .insert(lesson_id.to_string(), exposition.to_string());
        Ok(())
    }

    async fn load_lesson_content(&self, lesson_id: &str) -> Result<Option<String>, CollaboratorError> {
        Ok(self.lock()?.lessons.get(lesson_id).cloned())
    }
}

/// Content tables living next to the job table in the same database.
#[derive(Debug, Clone)]
pub struct SqliteContentRepository {
    pool: SqlitePool,
}

fn storage(err: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::Storage(err.to_string())
}

impl SqliteContentRepository {
    pub async fn new(pool: SqlitePool) -> Result<Self, CollaboratorError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS syllabi (
                id          TEXT PRIMARY KEY,
                topic       TEXT NOT NULL,
                level       TEXT NOT NULL,
                user_id     TEXT NULL,
                content     TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lesson_contents (
                lesson_id   TEXT PRIMARY KEY,
                exposition  TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(storage)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl ContentRepository for SqliteContentRepository {
    async fn find_syllabus(&self, key: &SyllabusKey) -> Result<Option<StoredSyllabus>, CollaboratorError> {
        let id = key.syllabus_id();
        Ok(self
            .load_syllabus(&id)
            .await?
            .map(|syllabus| StoredSyllabus { id, syllabus }))
    }

    async fn save_syllabus(&self, key: &SyllabusKey, syllabus: &Value) -> Result<String, CollaboratorError> {
        let id = key.syllabus_id();
        sqlx::query(
            r#"
            INSERT INTO syllabi (id, topic, level, user_id, content, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(&key.topic)
        .bind(&key.level)
        .bind(key.user_id.as_deref())
        .bind(syllabus.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(id)
    }

    async fn load_syllabus(&self, id: &str) -> Result<Option<Value>, CollaboratorError> {
        let row = sqlx::query("SELECT content FROM syllabi WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        match row {
            Some(row) => {
                let content: String = row.try_get("content").map_err(storage)?;
                Ok(Some(serde_json::from_str(&content).map_err(storage)?))
            }
            None => Ok(None),
        }
    }

    async fn save_lesson_content(&self, lesson_id: &str, exposition: &str) -> Result<(), CollaboratorError> {
        sqlx::query(
            r#"
            INSERT INTO lesson_contents (lesson_id, exposition, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(lesson_id) DO UPDATE SET exposition = excluded.exposition, updated_at = excluded.updated_at
            "#,
        )
        .bind(lesson_id)
        .bind(exposition)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn load_lesson_content(&self, lesson_id: &str) -> Result<Option<String>, CollaboratorError> {
        let row = sqlx::query("SELECT exposition FROM lesson_contents WHERE lesson_id = ?1")
            .bind(lesson_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.map(|row| row.try_get("exposition").map_err(storage))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_pool;
    use serde_json::json;

    async fn exercise(repo: &dyn ContentRepository) {
        let key = SyllabusKey::new("Graph Theory", "Beginner", Some("u-1"));
        assert!(repo.find_syllabus(&key).await.unwrap().is_none());

        let id = repo.save_syllabus(&key, &json!({"v": 1})).await.unwrap();
        let again = repo.save_syllabus(&key, &json!({"v": 2})).await.unwrap();
        assert_eq!(id, again);

        let found = repo.find_syllabus(&key).await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.syllabus, json!({"v": 2}));

        let shared = SyllabusKey::new("Graph Theory", "Beginner", None);
        assert!(repo.find_syllabus(&shared).await.unwrap().is_none());

        repo.save_lesson_content("l-1", "first").await.unwrap();
        repo.save_lesson_content("l-1", "second").await.unwrap();
        assert_eq!(repo.load_lesson_content("l-1").await.unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn syllabus_id_ignores_topic_case_and_padding() {
        let a = SyllabusKey::new("  Rust ", "Advanced", None);
        let b = SyllabusKey::new("rust", "advanced", None);
        assert_eq!(a.syllabus_id(), b.syllabus_id());
        assert_ne!(a.syllabus_id(), SyllabusKey::new("rust", "Beginner", None).syllabus_id());
    }

    #[tokio::test]
    async fn in_memory_upserts() {
        exercise(&InMemoryContentRepository::new()).await;
    }

    #[tokio::test]
    async fn sqlite_upserts() {
        let pool = open_pool("sqlite::memory:", 1).await.unwrap();
        let repo = SqliteContentRepository::new(pool).await.unwrap();
        exercise(&repo).await;
    }
}
