use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

/// Who produced a ledger message, in the neutral shape prompt assembly
/// consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Customer,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct SpeakerTurn {
    pub speaker: Speaker,
    pub text: String,
}

fn speaker_to_str(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::Customer => "customer",
        Speaker::Assistant => "assistant",
    }
}

fn str_to_speaker(value: &str) -> Result<Speaker> {
    match value {
        "customer" => Ok(Speaker::Customer),
        "assistant" => Ok(Speaker::Assistant),
        _ => anyhow::bail!("unknown message role: {value}"),
    }
}

/// Append-only per-(tenant, customer) message log. Full history is kept for
/// audit; only a bounded suffix is ever read back into prompts.
#[derive(Clone)]
pub struct ConversationLedger {
    pool: SqlitePool,
}

impl ConversationLedger {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a customer message and the assistant's reply, upserting the
    /// thread and bumping `last_interaction_at`. Two consecutive `seq`
    /// values keep replay order independent of timestamp resolution.
    pub async fn append_exchange(
        &self,
        tenant_id: &str,
        customer_identifier: &str,
        customer_text: &str,
        assistant_text: &str,
    ) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.context("begin ledger append")?;

        let thread_id: String = {
            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM conversations
                 WHERE tenant_id = $1 AND customer_identifier = $2",
            )
            .bind(tenant_id)
            .bind(customer_identifier)
            .fetch_optional(&mut *tx)
            .await
            .context("look up conversation thread")?;

            match existing {
                Some((id,)) => {
                    sqlx::query(
                        "UPDATE conversations SET last_interaction_at = $1 WHERE id = $2",
                    )
                    .bind(&timestamp)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await
                    .context("bump thread interaction time")?;
                    id
                }
                None => {
                    let id = Uuid::new_v4().to_string();
                    sqlx::query(
                        "INSERT INTO conversations
                             (id, tenant_id, customer_identifier, last_interaction_at)
                         VALUES ($1, $2, $3, $4)",
                    )
                    .bind(&id)
                    .bind(tenant_id)
                    .bind(customer_identifier)
                    .bind(&timestamp)
                    .execute(&mut *tx)
                    .await
                    .context("create conversation thread")?;
                    id
                }
            }
        };

        let (last_seq,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(seq), 0) FROM conversation_messages
             WHERE conversation_id = $1",
        )
        .bind(&thread_id)
        .fetch_one(&mut *tx)
        .await
        .context("read last message seq")?;

        for (offset, (speaker, text)) in [
            (Speaker::Customer, customer_text),
            (Speaker::Assistant, assistant_text),
        ]
        .into_iter()
        .enumerate()
        {
            sqlx::query(
                "INSERT INTO conversation_messages
                     (id, conversation_id, role, text, seq, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&thread_id)
            .bind(speaker_to_str(speaker))
            .bind(text)
            .bind(last_seq + 1 + offset as i64)
            .bind(&timestamp)
            .execute(&mut *tx)
            .await
            .context("append ledger message")?;
        }

        tx.commit().await.context("commit ledger append")?;
        Ok(())
    }

    /// Last `limit` messages in chronological order. An unknown thread is
    /// an empty window, not an error.
    pub async fn recent_window(
        &self,
        tenant_id: &str,
        customer_identifier: &str,
        limit: usize,
    ) -> Result<Vec<SpeakerTurn>> {
        #[allow(clippy::cast_possible_wrap)]
        let limit_i64 = limit as i64;

        let rows = sqlx::query(
            "SELECT m.role, m.text
             FROM conversation_messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.tenant_id = $1 AND c.customer_identifier = $2
             ORDER BY m.seq DESC
             LIMIT $3",
        )
        .bind(tenant_id)
        .bind(customer_identifier)
        .bind(limit_i64)
        .fetch_all(&self.pool)
        .await
        .context("query recent window")?;

        let mut turns: Vec<SpeakerTurn> = rows
            .iter()
            .map(|row| {
                let role_raw: String = row.try_get("role")?;
                Ok(SpeakerTurn {
                    speaker: str_to_speaker(&role_raw)?,
                    text: row.try_get("text")?,
                })
            })
            .collect::<Result<_>>()?;
        turns.reverse();
        Ok(turns)
    }

    /// Total messages recorded for a thread (audit/tests).
    pub async fn message_count(
        &self,
        tenant_id: &str,
        customer_identifier: &str,
    ) -> Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt
             FROM conversation_messages m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.tenant_id = $1 AND c.customer_identifier = $2",
        )
        .bind(tenant_id)
        .bind(customer_identifier)
        .fetch_one(&self.pool)
        .await
        .context("count thread messages")?;
        let count: i64 = row.try_get("cnt")?;
        usize::try_from(count).context("convert message count to usize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewTenant, memory_store};

    async fn seeded() -> (crate::store::Store, String) {
        let store = memory_store().await;
        let tenant = store
            .tenants()
            .create(NewTenant {
                api_key: "key-1".to_string(),
                model_name: "llama3".to_string(),
                balance: 100,
                ..NewTenant::default()
            })
            .await
            .unwrap();
        (store, tenant.id)
    }

    #[tokio::test]
    async fn append_creates_thread_and_pair() {
        let (store, tenant_id) = seeded().await;
        let ledger = store.conversations();

        ledger
            .append_exchange(&tenant_id, "guest", "hi", "hello!")
            .await
            .unwrap();

        let window = ledger.recent_window(&tenant_id, "guest", 6).await.unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].speaker, Speaker::Customer);
        assert_eq!(window[0].text, "hi");
        assert_eq!(window[1].speaker, Speaker::Assistant);
        assert_eq!(window[1].text, "hello!");
    }

    #[tokio::test]
    async fn empty_window_for_unknown_thread() {
        let (store, tenant_id) = seeded().await;
        let window = store
            .conversations()
            .recent_window(&tenant_id, "stranger", 6)
            .await
            .unwrap();
        assert!(window.is_empty());
    }

    // Ten exchanges (20 messages): the window returns exactly the last six
    // in original order, while the full history stays on record.
    #[tokio::test]
    async fn window_is_bounded_to_last_six() {
        let (store, tenant_id) = seeded().await;
        let ledger = store.conversations();

        for i in 0..10 {
            ledger
                .append_exchange(
                    &tenant_id,
                    "guest",
                    &format!("question {i}"),
                    &format!("answer {i}"),
                )
                .await
                .unwrap();
        }

        let window = ledger.recent_window(&tenant_id, "guest", 6).await.unwrap();
        assert_eq!(window.len(), 6);
        assert_eq!(window[0].text, "question 7");
        assert_eq!(window[1].text, "answer 7");
        assert_eq!(window[2].text, "question 8");
        assert_eq!(window[3].text, "answer 8");
        assert_eq!(window[4].text, "question 9");
        assert_eq!(window[5].text, "answer 9");

        let total = ledger.message_count(&tenant_id, "guest").await.unwrap();
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn threads_are_isolated_per_customer() {
        let (store, tenant_id) = seeded().await;
        let ledger = store.conversations();

        ledger
            .append_exchange(&tenant_id, "alice", "a?", "a!")
            .await
            .unwrap();
        ledger
            .append_exchange(&tenant_id, "bob", "b?", "b!")
            .await
            .unwrap();

        let alice = ledger.recent_window(&tenant_id, "alice", 6).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].text, "a?");
    }
}
