//! Chat sessions, their messages and pinned documents.

use super::{Database, now_millis};
use crate::error::{CoreError, Result};
use focus_ai_models::Role;
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSession {
    pub id: i64,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: i64,
    pub role: Role,
    pub content: String,
    pub token_count: u32,
    pub created_at: i64,
}

fn session_from_row(row: &SqliteRow) -> ChatSession {
    ChatSession {
        id: row.get("id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let role: String = row.get("role");
    let token_count: i64 = row.get("token_count");
    Ok(ChatMessage {
        id: row.get("id"),
        session_id: row.get("session_id"),
        role: role.parse().map_err(CoreError::Consistency)?,
        content: row.get("content"),
        token_count: token_count.max(0) as u32,
        created_at: row.get("created_at"),
    })
}

impl Database {
    pub async fn create_session(&self, title: &str) -> Result<ChatSession> {
        let title = match title.trim() {
            "" => "Untitled session",
            t => t,
        };
        let now = now_millis();
        let id = sqlx::query(
            "INSERT INTO chat_sessions (title, created_at, updated_at) VALUES (?1, ?2, ?2)",
        )
        .bind(title)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();
        Ok(ChatSession {
            id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_session(&self, id: i64) -> Result<Option<ChatSession>> {
        let row = sqlx::query("SELECT id, title, created_at, updated_at FROM chat_sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    /// Sessions, most recently active first.
    pub async fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM chat_sessions ORDER BY updated_at DESC, id DESC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    /// Delete a session with its messages and pins.
    pub async fn delete_session(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn add_message(
        &self,
        session_id: i64,
        role: Role,
        content: &str,
        token_count: u32,
    ) -> Result<ChatMessage> {
        let now = now_millis();
        let mut tx = self.pool().begin().await?;
        let id = sqlx::query(
            "INSERT INTO chat_messages (session_id, role, content, token_count, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(token_count as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        sqlx::query("UPDATE chat_sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ChatMessage {
            id,
            session_id,
            role,
            content: content.to_string(),
            token_count,
            created_at: now,
        })
    }

    /// All messages of a session in the order they were written.
    pub async fn session_messages(&self, session_id: i64) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query("SELECT * FROM chat_messages WHERE session_id = ?1 ORDER BY id")
            .bind(session_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// The `limit` newest messages, newest first.
    pub async fn recent_messages(&self, session_id: i64, limit: usize) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Returns `false` when the document was already pinned.
    pub async fn pin_document(&self, session_id: i64, document_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO pinned_documents (session_id, document_id, pinned_at) VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
        )
        .bind(session_id)
        .bind(document_id)
        .bind(now_millis())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn unpin_document(&self, session_id: i64, document_id: i64) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM pinned_documents WHERE session_id = ?1 AND document_id = ?2")
                .bind(session_id)
                .bind(document_id)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Pinned document ids in pin order, excluding documents marked deleted.
    pub async fn pinned_documents(&self, session_id: i64) -> Result<Vec<i64>> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT p.document_id FROM pinned_documents p JOIN documents d ON d.id = p.document_id
            WHERE p.session_id = ?1 AND d.deleted_at IS NULL
            ORDER BY p.pinned_at, p.document_id
            "#,
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?)
    }
}
