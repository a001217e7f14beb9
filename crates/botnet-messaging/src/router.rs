use crate::MessageError;
use botnet_types::time::now_millis;
use botnet_types::{classify_domain, DomainClass, MessageStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub from_type: DomainClass,
    pub to_type: DomainClass,
    pub requires_manual_check: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub message_id: String,
    pub from_domain: String,
    pub to_domain: String,
    pub content: String,
    pub message_type: String,
    pub status: MessageStatus,
    pub metadata: MessageMetadata,
    /// Caller-supplied metadata, stored verbatim.
    pub extra: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub response_id: String,
    pub message_id: String,
    pub from_domain: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewedMessage {
    #[serde(flatten)]
    pub message: Message,
    pub responses: Vec<MessageResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Review {
    pub inbox: Vec<ReviewedMessage>,
    pub sent: Vec<ReviewedMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendRequest {
    pub from_domain: String,
    pub to_domain: String,
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
    /// Keeps the id of a message forwarded from another node.
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Criteria for [`delete_messages`]. Set fields are combined with AND.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteCriteria {
    #[serde(default)]
    pub message_id: Option<String>,
    /// Matches either sender or recipient.
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    /// Epoch milliseconds; messages created before this are matched.
    #[serde(default)]
    pub older_than: Option<i64>,
}

impl DeleteCriteria {
    fn is_empty(&self) -> bool {
        self.message_id.is_none()
            && self.domain.is_none()
            && self.message_type.is_none()
            && self.older_than.is_none()
    }
}

/// Delivery status for a (sender, recipient) class pair. `None` for pairs
/// involving an invalid domain.
pub fn resolve_status(from: DomainClass, to: DomainClass) -> Option<MessageStatus> {
    match (from, to) {
        (DomainClass::Local, DomainClass::Local) => Some(MessageStatus::DeliveredLocally),
        (DomainClass::Local, DomainClass::Federated) => Some(MessageStatus::SentToFederated),
        (DomainClass::Federated, DomainClass::Local) => Some(MessageStatus::DeliveredLocally),
        (DomainClass::Federated, DomainClass::Federated) => Some(MessageStatus::SentViaNetwork),
        _ => None,
    }
}

fn class_of(domain: &str, role: &str) -> Result<DomainClass, MessageError> {
    match classify_domain(domain) {
        DomainClass::Invalid => Err(MessageError::InvalidDomain(format!("{role}: {domain}"))),
        class => Ok(class),
    }
}

const MESSAGE_COLUMNS: &str = "message_id, from_domain, to_domain, content, message_type, status,
    from_type, to_type, requires_manual_check, metadata, created_at, updated_at";

fn parse_column<T: std::str::FromStr<Err = String>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::<dyn std::error::Error + Send + Sync>::from(e),
        )
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let extra: String = row.get(9)?;
    Ok(Message {
        message_id: row.get(0)?,
        from_domain: row.get(1)?,
        to_domain: row.get(2)?,
        content: row.get(3)?,
        message_type: row.get(4)?,
        status: parse_column(row, 5)?,
        metadata: MessageMetadata {
            from_type: parse_column(row, 6)?,
            to_type: parse_column(row, 7)?,
            requires_manual_check: row.get(8)?,
        },
        extra: serde_json::from_str(&extra).unwrap_or(serde_json::Value::Null),
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn row_to_response(row: &Row<'_>) -> rusqlite::Result<MessageResponse> {
    Ok(MessageResponse {
        response_id: row.get(0)?,
        message_id: row.get(1)?,
        from_domain: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Looks up a message by id.
///
/// # Errors
///
/// Returns `MessageError::Database` on SQL failure.
pub fn get_message(conn: &Connection, message_id: &str) -> Result<Option<Message>, MessageError> {
    let message = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1"),
            params![message_id],
            row_to_message,
        )
        .optional()?;
    Ok(message)
}

/// Persists a message and resolves its delivery status.
///
/// Invalid sender or recipient domains are rejected before anything is
/// written. A reused `message_id` yields [`MessageError::DuplicateMessage`].
///
/// # Errors
///
/// - [`MessageError::InvalidDomain`] if either domain does not classify.
/// - [`MessageError::Validation`] for blank content.
/// - [`MessageError::DuplicateMessage`] if `message_id` is taken.
pub fn send_message(conn: &Connection, request: &SendRequest) -> Result<Message, MessageError> {
    let from_type = class_of(&request.from_domain, "from")?;
    let to_type = class_of(&request.to_domain, "to")?;
    if request.content.trim().is_empty() {
        return Err(MessageError::Validation("content is required".to_string()));
    }
    let status = resolve_status(from_type, to_type)
        .ok_or_else(|| MessageError::InvalidDomain(request.to_domain.clone()))?;
    let requires_manual_check = status == MessageStatus::SentToFederated;

    let message_id = match request.message_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };
    let extra = request
        .metadata
        .clone()
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    let now = now_millis();

    let tx = conn.unchecked_transaction()?;
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO messages (message_id, from_domain, to_domain, content, message_type,
             status, from_type, to_type, requires_manual_check, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            message_id,
            request.from_domain,
            request.to_domain,
            request.content,
            request.message_type.as_deref().unwrap_or("text"),
            from_type.as_str(),
            to_type.as_str(),
            requires_manual_check,
            extra.to_string(),
            now,
        ],
    )?;
    if inserted == 0 {
        return Err(MessageError::DuplicateMessage(message_id));
    }
    tx.execute(
        "UPDATE messages SET status = ?2 WHERE message_id = ?1 AND status = 'pending'",
        params![message_id, status.as_str()],
    )?;
    let message = get_message(&tx, &message_id)?
        .ok_or_else(|| MessageError::NotFound(message_id.clone()))?;
    tx.commit()?;

    tracing::info!(
        message_id = %message.message_id,
        from = %message.from_domain,
        to = %message.to_domain,
        status = %message.status,
        "message stored"
    );
    Ok(message)
}

fn responses_for(
    conn: &Connection,
    message_id: &str,
) -> Result<Vec<MessageResponse>, MessageError> {
    let mut stmt = conn.prepare(
        "SELECT response_id, message_id, from_domain, content, created_at
         FROM message_responses WHERE message_id = ?1
         ORDER BY created_at, response_id",
    )?;
    let rows = stmt
        .query_map(params![message_id], row_to_response)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn with_responses(
    conn: &Connection,
    messages: Vec<Message>,
) -> Result<Vec<ReviewedMessage>, MessageError> {
    messages
        .into_iter()
        .map(|message| {
            let responses = responses_for(conn, &message.message_id)?;
            Ok(ReviewedMessage { message, responses })
        })
        .collect()
}

/// Inbox and sent messages of `domain`, newest first, each with its
/// responses.
pub fn review_messages(
    conn: &Connection,
    domain: &str,
    limit: usize,
) -> Result<Review, MessageError> {
    let query = |column: &str| -> Result<Vec<Message>, MessageError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {column} = ?1
             ORDER BY created_at DESC, message_id LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![domain, limit as i64], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    };

    let inbox = with_responses(conn, query("to_domain")?)?;
    let sent = with_responses(conn, query("from_domain")?)?;
    Ok(Review { inbox, sent })
}

/// Adds a response from `responder`, who must be the message's recipient.
///
/// # Errors
///
/// - [`MessageError::Validation`] for blank content.
/// - [`MessageError::NotFound`] if the message does not exist.
/// - [`MessageError::Forbidden`] if `responder` is not the recipient.
pub fn set_response(
    conn: &Connection,
    message_id: &str,
    responder: &str,
    content: &str,
) -> Result<MessageResponse, MessageError> {
    if content.trim().is_empty() {
        return Err(MessageError::Validation("content is required".to_string()));
    }
    let message = get_message(conn, message_id)?
        .ok_or_else(|| MessageError::NotFound(message_id.to_string()))?;
    if message.to_domain != responder {
        return Err(MessageError::Forbidden(format!(
            "{responder} is not the recipient of {message_id}"
        )));
    }

    let response = MessageResponse {
        response_id: uuid::Uuid::new_v4().to_string(),
        message_id: message_id.to_string(),
        from_domain: responder.to_string(),
        content: content.to_string(),
        created_at: now_millis(),
    };
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO message_responses (response_id, message_id, from_domain, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            response.response_id,
            response.message_id,
            response.from_domain,
            response.content,
            response.created_at
        ],
    )?;
    tx.execute(
        "UPDATE messages SET status = 'responded', updated_at = ?2 WHERE message_id = ?1",
        params![message_id, response.created_at],
    )?;
    tx.commit()?;

    tracing::info!(message_id = %message_id, responder = %responder, "message responded");
    Ok(response)
}

/// Responses to messages sent by `caller`, optionally limited to `message_ids`.
pub fn check_responses(
    conn: &Connection,
    caller: &str,
    message_ids: Option<&[String]>,
) -> Result<Vec<MessageResponse>, MessageError> {
    let mut stmt = conn.prepare(
        "SELECT r.response_id, r.message_id, r.from_domain, r.content, r.created_at
         FROM message_responses r
         JOIN messages m ON m.message_id = r.message_id
         WHERE m.from_domain = ?1
         ORDER BY r.created_at, r.response_id",
    )?;
    let responses = stmt
        .query_map(params![caller], row_to_response)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(match message_ids {
        Some(ids) => responses
            .into_iter()
            .filter(|r| ids.contains(&r.message_id))
            .collect(),
        None => responses,
    })
}

/// Messages awaiting a response from a federated target, grouped by
/// target domain.
pub fn pending_federated(conn: &Connection) -> Result<BTreeMap<String, Vec<String>>, MessageError> {
    let mut stmt = conn.prepare(
        "SELECT to_domain, message_id FROM messages
         WHERE status = 'sent_to_federated'
         ORDER BY to_domain, created_at, rowid",
    )?;
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?;
    for row in rows {
        let (target, message_id) = row?;
        groups.entry(target).or_default().push(message_id);
    }
    Ok(groups)
}

/// Stores responses fetched from `target` and marks their messages
/// responded. Responses to messages not addressed to `target` are ignored.
/// Returns the newly stored responses.
pub fn ingest_responses(
    conn: &Connection,
    target: &str,
    responses: &[MessageResponse],
) -> Result<Vec<MessageResponse>, MessageError> {
    let tx = conn.unchecked_transaction()?;
    let mut stored = Vec::new();
    for response in responses {
        let addressed: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE message_id = ?1 AND to_domain = ?2)",
            params![response.message_id, target],
            |row| row.get(0),
        )?;
        if !addressed {
            tracing::debug!(message_id = %response.message_id, target = %target, "ignoring unrelated response");
            continue;
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO message_responses (response_id, message_id, from_domain, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                response.response_id,
                response.message_id,
                response.from_domain,
                response.content,
                response.created_at
            ],
        )?;
        tx.execute(
            "UPDATE messages SET status = 'responded', updated_at = ?2
             WHERE message_id = ?1 AND status != 'responded'",
            params![response.message_id, now_millis()],
        )?;
        if inserted == 1 {
            stored.push(response.clone());
        }
    }
    tx.commit()?;
    Ok(stored)
}

/// Purges matching messages (and their responses). At least one criterion
/// is required.
///
/// # Errors
///
/// Returns [`MessageError::Validation`] when no criterion is set.
pub fn delete_messages(conn: &Connection, criteria: &DeleteCriteria) -> Result<usize, MessageError> {
    if criteria.is_empty() {
        return Err(MessageError::Validation(
            "at least one delete criterion is required".to_string(),
        ));
    }
    let deleted = conn.execute(
        "DELETE FROM messages
         WHERE (?1 IS NULL OR message_id = ?1)
           AND (?2 IS NULL OR from_domain = ?2 OR to_domain = ?2)
           AND (?3 IS NULL OR message_type = ?3)
           AND (?4 IS NULL OR created_at < ?4)",
        params![
            criteria.message_id,
            criteria.domain,
            criteria.message_type,
            criteria.older_than
        ],
    )?;
    tracing::info!(deleted, "purged messages");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        botnet_db::run_migrations(&conn).unwrap();
        conn
    }

    fn request(from: &str, to: &str) -> SendRequest {
        SendRequest {
            from_domain: from.to_string(),
            to_domain: to.to_string(),
            content: "hello".to_string(),
            ..SendRequest::default()
        }
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn routing_matrix() {
        use DomainClass::*;
        assert_eq!(resolve_status(Local, Local), Some(MessageStatus::DeliveredLocally));
        assert_eq!(resolve_status(Local, Federated), Some(MessageStatus::SentToFederated));
        assert_eq!(resolve_status(Federated, Local), Some(MessageStatus::DeliveredLocally));
        assert_eq!(resolve_status(Federated, Federated), Some(MessageStatus::SentViaNetwork));
        assert_eq!(resolve_status(Invalid, Local), None);
        assert_eq!(resolve_status(Local, Invalid), None);
    }

    #[test]
    fn local_to_federated_requires_manual_check() {
        let conn = setup();
        let message = send_message(&conn, &request("alice", "botnet.remote.example")).unwrap();
        assert_eq!(message.status, MessageStatus::SentToFederated);
        assert!(message.metadata.requires_manual_check);
        assert_eq!(message.metadata.from_type, DomainClass::Local);
        assert_eq!(message.metadata.to_type, DomainClass::Federated);
    }

    #[test]
    fn invalid_domains_have_no_side_effects() {
        let conn = setup();
        for (from, to) in [("alice", "bob.example.com"), ("evil.example", "bob"), ("", "bob")] {
            let err = send_message(&conn, &request(from, to)).unwrap_err();
            assert!(matches!(err, MessageError::InvalidDomain(_)), "{from} -> {to}");
        }
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let conn = setup();
        let mut req = request("botnet.peer.example", "bob");
        req.message_id = Some("fixed-id".to_string());
        let first = send_message(&conn, &req).unwrap();
        assert_eq!(first.status, MessageStatus::DeliveredLocally);
        let err = send_message(&conn, &req).unwrap_err();
        assert!(matches!(err, MessageError::DuplicateMessage(id) if id == "fixed-id"));
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn only_the_recipient_may_respond() {
        let conn = setup();
        let message = send_message(&conn, &request("alice", "bob")).unwrap();
        let err = set_response(&conn, &message.message_id, "carol", "hi").unwrap_err();
        assert!(matches!(err, MessageError::Forbidden(_)));

        set_response(&conn, &message.message_id, "bob", "hi alice").unwrap();
        let review = review_messages(&conn, "alice", 10).unwrap();
        assert_eq!(review.sent.len(), 1);
        assert_eq!(review.sent[0].message.status, MessageStatus::Responded);
        assert_eq!(review.sent[0].responses[0].content, "hi alice");

        let inbox = review_messages(&conn, "bob", 10).unwrap().inbox;
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn check_responses_only_returns_the_callers_messages() {
        let conn = setup();
        let mine = send_message(&conn, &request("botnet.a.example", "bob")).unwrap();
        let theirs = send_message(&conn, &request("botnet.b.example", "bob")).unwrap();
        set_response(&conn, &mine.message_id, "bob", "for a").unwrap();
        set_response(&conn, &theirs.message_id, "bob", "for b").unwrap();

        let responses = check_responses(&conn, "botnet.a.example", None).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].content, "for a");

        let filtered =
            check_responses(&conn, "botnet.a.example", Some(&["other".to_string()])).unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn ingest_ignores_responses_for_other_targets() {
        let conn = setup();
        let message = send_message(&conn, &request("alice", "botnet.r.example")).unwrap();
        let response = MessageResponse {
            response_id: "r-1".to_string(),
            message_id: message.message_id.clone(),
            from_domain: "botnet.r.example".to_string(),
            content: "pong".to_string(),
            created_at: 1,
        };

        let stored = ingest_responses(&conn, "botnet.other.example", &[response.clone()]).unwrap();
        assert!(stored.is_empty());

        let stored = ingest_responses(&conn, "botnet.r.example", &[response.clone()]).unwrap();
        assert_eq!(stored.len(), 1);
        let again = ingest_responses(&conn, "botnet.r.example", &[response]).unwrap();
        assert!(again.is_empty());

        let message = get_message(&conn, &message.message_id).unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Responded);
        assert!(pending_federated(&conn).unwrap().is_empty());
    }

    #[test]
    fn delete_requires_criteria() {
        let conn = setup();
        send_message(&conn, &request("alice", "bob")).unwrap();
        send_message(&conn, &request("carol", "dave")).unwrap();
        assert!(matches!(
            delete_messages(&conn, &DeleteCriteria::default()),
            Err(MessageError::Validation(_))
        ));
        let deleted = delete_messages(
            &conn,
            &DeleteCriteria {
                domain: Some("bob".to_string()),
                ..DeleteCriteria::default()
            },
        )
        .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(count(&conn), 1);
    }
}
