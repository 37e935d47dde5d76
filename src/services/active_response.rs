//! Active response: lockout directives and their execution.
//!
//! The detection engine emits `ResponseDirective` records onto a Redis list;
//! the responder process drains that queue and acts through a dedicated
//! MySQL admin channel. The two halves share only the queue, never state.

use crate::config::{ResponseConfig, StreamConfig};
use crate::utils::error::{PipelineError, PipelineResult};
use mysql_async::prelude::Queryable;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

/// One flagged user, as handed to the responder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseDirective {
    pub user: String,
    pub reason: String,
    pub triggering_event_ids: Vec<i64>,
}

/// The shared queue (a Redis list; directives are small and rare).
pub struct ResponseQueue {
    conn: ConnectionManager,
    key: String,
}

impl ResponseQueue {
    pub async fn connect(config: &StreamConfig) -> PipelineResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, key: config.response_queue.clone() })
    }

    pub async fn push(&mut self, directives: &[ResponseDirective]) -> PipelineResult<()> {
        if directives.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for directive in directives {
            pipe.rpush(&self.key, serde_json::to_string(directive)?);
        }
        pipe.query_async::<_, ()>(&mut self.conn).await?;
        Ok(())
    }

    /// Blocking pop with a timeout; `None` on timeout.
    pub async fn pop(&mut self, timeout_secs: f64) -> PipelineResult<Option<ResponseDirective>> {
        let reply: Option<(String, String)> =
            self.conn.blpop(&self.key, timeout_secs).await?;
        match reply {
            Some((_, payload)) => match serde_json::from_str(&payload) {
                Ok(directive) => Ok(Some(directive)),
                Err(e) => {
                    tracing::warn!("Dropping malformed response directive: {}", e);
                    Ok(None)
                },
            },
            None => Ok(None),
        }
    }
}

/// MySQL admin channel: account lockout and session termination.
pub struct AdminClient {
    pool: mysql_async::Pool,
    protected_users: Vec<String>,
}

impl AdminClient {
    pub fn new(config: &ResponseConfig) -> PipelineResult<Self> {
        if config.admin_url.is_empty() {
            return Err(PipelineError::config(
                "response.admin_url (MYSQL_ADMIN_URL) is required for the responder",
            ));
        }
        let opts = mysql_async::Opts::from_url(&config.admin_url)
            .map_err(|e| PipelineError::config(format!("bad admin URL: {e}")))?;
        Ok(Self {
            pool: mysql_async::Pool::new(opts),
            protected_users: config.protected_users.clone(),
        })
    }

    /// Lock the account and kill its live sessions. Protected accounts are
    /// refused outright.
    pub async fn lock_and_kill(&self, directive: &ResponseDirective) -> PipelineResult<()> {
        let user = &directive.user;
        if self.protected_users.iter().any(|u| u == user) {
            tracing::warn!("Refusing to lock protected account {}", user);
            return Ok(());
        }
        let Some(safe_user) = sanitize_account_name(user) else {
            tracing::warn!("Refusing to lock account with unsafe name {:?}", user);
            return Ok(());
        };

        let mut conn = self.pool.get_conn().await?;

        // Account names cannot be bound as parameters in ALTER USER.
        let lock_sql = format!("ALTER USER '{safe_user}'@'%' ACCOUNT LOCK");
        conn.query_drop(lock_sql).await?;
        tracing::info!("Locked account {} ({})", user, directive.reason);

        let session_ids: Vec<i64> = conn
            .exec(
                "SELECT ID FROM information_schema.PROCESSLIST WHERE USER = ?",
                (user,),
            )
            .await?;
        for session_id in session_ids {
            if let Err(e) = conn.query_drop(format!("KILL {session_id}")).await {
                // the session may have already ended
                tracing::debug!("KILL {} failed: {}", session_id, e);
            } else {
                tracing::info!("Killed session {} of {}", session_id, user);
            }
        }

        drop(conn);
        Ok(())
    }
}

/// Account names reach string-built DDL, so only a conservative charset is
/// allowed through.
fn sanitize_account_name(user: &str) -> Option<String> {
    if user.is_empty() || user.len() > 64 {
        return None;
    }
    if user
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        Some(user.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_round_trips_as_json() {
        let directive = ResponseDirective {
            user: "eve".into(),
            reason: "12 rule violations in one batch".into(),
            triggering_event_ids: vec![4, 8, 15],
        };
        let json = serde_json::to_string(&directive).unwrap();
        let back: ResponseDirective = serde_json::from_str(&json).unwrap();
        assert_eq!(directive, back);
    }

    #[test]
    fn account_name_sanitizer_rejects_injection_attempts() {
        assert_eq!(sanitize_account_name("app_user"), Some("app_user".into()));
        assert_eq!(sanitize_account_name("svc-1.batch"), Some("svc-1.batch".into()));
        assert!(sanitize_account_name("x' OR '1'='1").is_none());
        assert!(sanitize_account_name("a'@'localhost").is_none());
        assert!(sanitize_account_name("").is_none());
        assert!(sanitize_account_name(&"a".repeat(65)).is_none());
    }
}
