//! Question/answer protocol: one party poses a question with a closed
//! set of valid responses, the other picks one.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use skein_engine::{EventBus, FailurePolicy, InboundContext, MessageHandler, ThreadLocks};
use skein_store::{RecordStore, RecordStoreExt};
use skein_types::event::EventPayload;
use skein_types::message::MessageTypeUri;
use skein_types::records::{QuestionAnswerRecord, QuestionAnswerState};
use skein_types::{OutboundMessage, SkeinError, SkeinResult, WireMessage};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Question.
pub const TYPE_QUESTION: &str = "https://didcomm.org/questionanswer/1.0/question";
/// Answer.
pub const TYPE_ANSWER: &str = "https://didcomm.org/questionanswer/1.0/answer";

const PROTOCOL: &str = "questionanswer";

/// One acceptable response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidResponse {
    /// The response text.
    pub text: String,
}

/// Question body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    /// The question text.
    pub question_text: String,
    /// Optional elaboration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_detail: Option<String>,
    /// Responses the questioner will accept.
    pub valid_responses: Vec<ValidResponse>,
}

/// Answer body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// The chosen response, one of the question's valid responses.
    pub response: String,
}

/// Question/answer operations for both sides.
pub struct QuestionAnswerService {
    store: Arc<dyn RecordStore>,
    locks: Arc<ThreadLocks>,
    events: EventBus,
}

impl QuestionAnswerService {
    /// Build the service over the shared store, locks and event bus.
    pub fn new(store: Arc<dyn RecordStore>, locks: Arc<ThreadLocks>, events: EventBus) -> Self {
        Self {
            store,
            locks,
            events,
        }
    }

    fn lock_key(thread_id: &str) -> String {
        format!("{PROTOCOL}/{thread_id}")
    }

    /// Look up the record for an exchange thread.
    pub async fn find(&self, thread_id: &str) -> SkeinResult<Option<QuestionAnswerRecord>> {
        self.store.find_by_thread(thread_id).await
    }

    /// Pose a question over a connection.
    pub async fn ask(
        &self,
        connection_id: impl Into<String>,
        question_text: impl Into<String>,
        valid_responses: Vec<String>,
    ) -> SkeinResult<(QuestionAnswerRecord, OutboundMessage)> {
        let question_text = question_text.into();
        if valid_responses.is_empty() {
            return Err(SkeinError::Validation(
                "a question needs at least one valid response".into(),
            ));
        }
        let message = WireMessage::new(
            TYPE_QUESTION,
            serde_json::to_value(Question {
                question_text: question_text.clone(),
                question_detail: None,
                valid_responses: valid_responses
                    .iter()
                    .cloned()
                    .map(|text| ValidResponse { text })
                    .collect(),
            })?,
        );
        let record = QuestionAnswerRecord {
            id: Uuid::new_v4().to_string(),
            thread_id: message.thread_id().to_string(),
            connection_id: connection_id.into(),
            state: QuestionAnswerState::QuestionSent,
            question_text,
            valid_responses,
            response: None,
            created_at: Utc::now(),
        };
        let _guard = self.locks.acquire(&Self::lock_key(&record.thread_id)).await;
        self.store.save_record(&record).await?;
        self.emit(&record, None);
        let connection_id = Some(record.connection_id.clone());
        Ok((record, OutboundMessage::reply(message, connection_id)))
    }

    /// A question arrived: record it for the application to answer.
    pub async fn process_question(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let connection = ctx.assert_ready_connection()?;
        let body: Question = ctx.message.body_as()?;
        if body.valid_responses.is_empty() {
            return Err(SkeinError::Validation(
                "question carries no valid responses".into(),
            ));
        }
        let record = QuestionAnswerRecord {
            id: Uuid::new_v4().to_string(),
            thread_id: ctx.message.thread_id().to_string(),
            connection_id: connection.id.clone(),
            state: QuestionAnswerState::QuestionReceived,
            question_text: body.question_text,
            valid_responses: body.valid_responses.into_iter().map(|r| r.text).collect(),
            response: None,
            created_at: Utc::now(),
        };
        let _guard = self.locks.acquire(&Self::lock_key(&record.thread_id)).await;
        self.store.save_record(&record).await?;
        self.emit(&record, None);
        Ok(None)
    }

    /// Answer a previously received question.
    pub async fn answer(
        &self,
        thread_id: &str,
        response: impl Into<String>,
    ) -> SkeinResult<OutboundMessage> {
        let response = response.into();
        let _guard = self.locks.acquire(&Self::lock_key(thread_id)).await;
        let mut record: QuestionAnswerRecord = self
            .find(thread_id)
            .await?
            .ok_or_else(|| SkeinError::RecordNotFound(thread_id.to_string()))?;
        if record.state != QuestionAnswerState::QuestionReceived {
            return Err(SkeinError::StateTransition {
                thread_id: thread_id.to_string(),
                state: record.state.to_string(),
                trigger: "answer".to_string(),
            });
        }
        if !record.valid_responses.contains(&response) {
            return Err(SkeinError::Validation(format!(
                "'{response}' is not a valid response"
            )));
        }
        let previous = record.state;
        record.response = Some(response.clone());
        record.state = QuestionAnswerState::AnswerSent;
        self.store.update_record(&record).await?;
        self.emit(&record, Some(previous));

        let message = WireMessage::new(TYPE_ANSWER, serde_json::to_value(Answer { response })?)
            .with_thread(thread_id.to_string());
        Ok(OutboundMessage::reply(message, Some(record.connection_id)))
    }

    /// The peer's answer arrived: validate it against the offered
    /// responses.
    pub async fn process_answer(
        &self,
        message: &WireMessage,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let body: Answer = message.body_as()?;
        let thread_id = message.thread_id();
        let _guard = self.locks.acquire(&Self::lock_key(thread_id)).await;
        let mut record: QuestionAnswerRecord =
            self.find(thread_id).await?.ok_or_else(|| SkeinError::StateTransition {
                thread_id: thread_id.to_string(),
                state: "none".to_string(),
                trigger: "answer".to_string(),
            })?;
        if record.state != QuestionAnswerState::QuestionSent {
            return Err(SkeinError::StateTransition {
                thread_id: thread_id.to_string(),
                state: record.state.to_string(),
                trigger: "answer".to_string(),
            });
        }
        if !record.valid_responses.contains(&body.response) {
            return Err(SkeinError::Validation(format!(
                "'{}' is not one of the offered responses",
                body.response
            )));
        }
        let previous = record.state;
        record.response = Some(body.response);
        record.state = QuestionAnswerState::AnswerReceived;
        self.store.update_record(&record).await?;
        self.emit(&record, Some(previous));
        Ok(None)
    }

    fn emit(&self, record: &QuestionAnswerRecord, previous: Option<QuestionAnswerState>) {
        self.events.publish(EventPayload::StateChanged {
            protocol: PROTOCOL.to_string(),
            record_id: record.id.clone(),
            thread_id: record.thread_id.clone(),
            previous_state: previous.map(|s| s.to_string()),
            new_state: record.state.to_string(),
        });
    }
}

/// Inbound handler for the question/answer protocol.
pub struct QuestionAnswerHandler {
    service: Arc<QuestionAnswerService>,
}

impl QuestionAnswerHandler {
    /// Wrap the service for registration.
    pub fn new(service: Arc<QuestionAnswerService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl MessageHandler for QuestionAnswerHandler {
    fn message_types(&self) -> Vec<String> {
        vec![TYPE_QUESTION.into(), TYPE_ANSWER.into()]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Reply
    }

    async fn handle(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>> {
        let uri = MessageTypeUri::from_str(&ctx.message.message_type)?;
        match uri.name.as_str() {
            "question" => self.service.process_question(ctx).await,
            "answer" => self.service.process_answer(&ctx.message).await,
            _ => Err(SkeinError::Validation(format!(
                "unexpected message type: {}",
                ctx.message.message_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_store::MemoryStore;
    use skein_types::records::{ConnectionRecord, ConnectionRole, ConnectionState};

    fn service() -> QuestionAnswerService {
        QuestionAnswerService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ThreadLocks::new()),
            EventBus::default(),
        )
    }

    fn ready_connection() -> ConnectionRecord {
        ConnectionRecord::new(
            "t-conn",
            "did:peer:alice",
            ConnectionRole::Responder,
            ConnectionState::Completed,
        )
    }

    #[tokio::test]
    async fn test_question_and_matching_answer() {
        let asker = service();
        let responder = service();

        let (record, question) = asker
            .ask("conn-1", "Proceed?", vec!["yes".into(), "no".into()])
            .await
            .unwrap();
        assert_eq!(record.state, QuestionAnswerState::QuestionSent);

        let ctx = InboundContext::new(question.message).with_connection(ready_connection());
        responder.process_question(&ctx).await.unwrap();
        let received = responder.find(&record.thread_id).await.unwrap().unwrap();
        assert_eq!(received.state, QuestionAnswerState::QuestionReceived);

        let answer = responder.answer(&record.thread_id, "yes").await.unwrap();
        assert_eq!(answer.message.message_type, TYPE_ANSWER);

        asker.process_answer(&answer.message).await.unwrap();
        let record = asker.find(&record.thread_id).await.unwrap().unwrap();
        assert_eq!(record.state, QuestionAnswerState::AnswerReceived);
        assert_eq!(record.response.as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn test_answer_outside_offered_set_rejected() {
        let responder = service();
        let question = WireMessage::new(
            TYPE_QUESTION,
            serde_json::json!({
                "question_text": "Proceed?",
                "valid_responses": [{ "text": "yes" }, { "text": "no" }]
            }),
        );
        let thread_id = question.thread_id().to_string();
        let ctx = InboundContext::new(question).with_connection(ready_connection());
        responder.process_question(&ctx).await.unwrap();

        let err = responder.answer(&thread_id, "maybe").await.unwrap_err();
        assert!(matches!(err, SkeinError::Validation(_)));
    }

    #[tokio::test]
    async fn test_answer_for_unknown_thread_rejected() {
        let asker = service();
        let answer = WireMessage::new(TYPE_ANSWER, serde_json::json!({ "response": "yes" }))
            .with_thread("t-ghost");
        let err = asker.process_answer(&answer).await.unwrap_err();
        assert!(err.is_state_transition());
    }

    #[tokio::test]
    async fn test_invalid_inbound_answer_rejected() {
        let asker = service();
        let (record, _) = asker
            .ask("conn-1", "Proceed?", vec!["yes".into()])
            .await
            .unwrap();
        let answer = WireMessage::new(TYPE_ANSWER, serde_json::json!({ "response": "never" }))
            .with_thread(&record.thread_id);
        let err = asker.process_answer(&answer).await.unwrap_err();
        assert!(matches!(err, SkeinError::Validation(_)));
        // The record is untouched.
        let record = asker.find(&record.thread_id).await.unwrap().unwrap();
        assert_eq!(record.state, QuestionAnswerState::QuestionSent);
        assert!(record.response.is_none());
    }
}
