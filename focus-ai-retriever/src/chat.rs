//! Chat sessions answered with retrieval-augmented context.

use crate::config::ChatConfig;
use crate::error::{CoreError, Result};
use crate::retrieval::capability_router::CapabilityRouter;
use crate::retrieval::context_assembler::ContextAssembler;
use crate::storage::{ChatMessage, ChatSession, Database, ModelConfiguration};
use focus_ai_context::{FragmentSource, PackedContext, TokenEstimator};
use focus_ai_models::{
    GenerationRequest, PromptMessage, ResponseFragment, ResponseSender, ResponseStream, Role,
    response_channel,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sends chat turns and manages sessions.
#[derive(Clone)]
pub struct ChatService {
    db: Database,
    assembler: ContextAssembler,
    router: CapabilityRouter,
    estimator: Arc<dyn TokenEstimator>,
    config: ChatConfig,
    token_budget: usize,
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("config", &self.config)
            .field("token_budget", &self.token_budget)
            .finish()
    }
}

impl ChatService {
    pub fn new(
        db: Database,
        assembler: ContextAssembler,
        router: CapabilityRouter,
        estimator: Arc<dyn TokenEstimator>,
        config: ChatConfig,
    ) -> Self {
        let token_budget = assembler.config().token_budget;
        Self {
            db,
            assembler,
            router,
            estimator,
            config,
            token_budget,
        }
    }

    pub fn with_token_budget(mut self, token_budget: usize) -> Self {
        self.token_budget = token_budget;
        self
    }

    pub async fn create_session(&self, title: &str) -> Result<ChatSession> {
        self.db.create_session(title).await
    }

    pub async fn get_session(&self, session_id: i64) -> Result<ChatSession> {
        self.db
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoreError::not_found("session", session_id))
    }

    pub async fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        self.db.list_sessions().await
    }

    pub async fn delete_session(&self, session_id: i64) -> Result<bool> {
        self.db.delete_session(session_id).await
    }

    pub async fn messages(&self, session_id: i64) -> Result<Vec<ChatMessage>> {
        self.get_session(session_id).await?;
        self.db.session_messages(session_id).await
    }

    fn validate(&self, message: &str) -> Result<()> {
        let chars = message.trim().chars().count();
        if chars < self.config.min_message_chars {
            return Err(CoreError::validation(format!(
                "message must be at least {} characters",
                self.config.min_message_chars
            )));
        }
        if chars > self.config.max_message_chars {
            return Err(CoreError::validation(format!(
                "message must be at most {} characters, got {chars}",
                self.config.max_message_chars
            )));
        }
        Ok(())
    }

    /// Answer `message` in `session_id`.
    ///
    /// The returned stream yields text fragments in order and ends with exactly one `End` or
    /// `Error` fragment. The assistant reply is stored once the stream ends with `End`. Dropping the
    /// stream stops the generation and nothing is stored.
    ///
    /// Any other failure after the user message is stored, such as a provider refusing the request,
    /// arrives as a stream holding a single `Error` fragment.
    ///
    /// # Errors
    /// - `Validation` for messages outside the configured length bounds
    /// - `NotFound` for an unknown session
    /// - `NoCapableModel` when no TEXT_GEN model can be resolved
    pub async fn send(&self, session_id: i64, message: &str) -> Result<ResponseStream> {
        self.validate(message)?;
        self.get_session(session_id).await?;

        let content = message.trim();
        let tokens = self.estimator.estimate(content) as u32;
        let user_message = self
            .db
            .add_message(session_id, Role::User, content, tokens)
            .await?;

        let (tx, rx) = response_channel(self.config.stream_capacity);
        match self.start_reply(session_id, user_message.id, content).await {
            Ok((model, upstream)) => {
                tokio::spawn(forward(self.clone(), session_id, model, upstream, tx));
            }
            Err(e @ CoreError::NoCapableModel { .. }) => return Err(e),
            Err(e) => {
                warn!("Session {}: could not start a reply: {}", session_id, e);
                tx.error(e.to_string()).await;
            }
        }
        Ok(rx)
    }

    async fn start_reply(
        &self,
        session_id: i64,
        user_message_id: i64,
        content: &str,
    ) -> Result<(ModelConfiguration, ResponseStream)> {
        let context = self
            .assembler
            .assemble_excluding(session_id, content, self.token_budget, Some(user_message_id))
            .await?;
        let request = build_request(&self.config.system_prompt, &context, content);

        let (model, upstream) = self.router.generate(request).await?;
        info!(
            "Session {}: answering with {} ({} context fragment(s))",
            session_id,
            model.display_name,
            context.fragments.len()
        );
        Ok((model, upstream))
    }
}

fn build_request(system_prompt: &str, context: &PackedContext, message: &str) -> GenerationRequest {
    let mut system = system_prompt.to_string();
    let documents: Vec<_> = context
        .fragments
        .iter()
        .filter(|f| f.source != FragmentSource::History)
        .collect();
    if !documents.is_empty() {
        system.push_str("\n\nContext:");
        for (i, fragment) in documents.iter().enumerate() {
            system.push_str(&format!("\n\n[{}] {}", i + 1, fragment.text));
        }
    }

    let mut messages = vec![PromptMessage::new(Role::System, system)];
    // history arrives newest first
    let mut history: Vec<_> = context
        .fragments
        .iter()
        .filter(|f| f.source == FragmentSource::History)
        .collect();
    history.reverse();
    for fragment in history {
        let role = fragment
            .role
            .as_deref()
            .and_then(|r| r.parse().ok())
            .unwrap_or(Role::User);
        messages.push(PromptMessage::new(role, fragment.text.clone()));
    }
    messages.push(PromptMessage::new(Role::User, message));

    GenerationRequest {
        messages,
        ..Default::default()
    }
}

/// Relay the provider stream to the consumer, then record the outcome.
async fn forward(
    service: ChatService,
    session_id: i64,
    model: ModelConfiguration,
    mut upstream: ResponseStream,
    tx: ResponseSender,
) {
    let mut reply = String::new();
    loop {
        if tx.is_closed() {
            debug!("Session {}: consumer went away, stopping generation", session_id);
            return;
        }
        match upstream.next().await {
            Some(ResponseFragment::Text(delta)) => {
                reply.push_str(&delta);
                if !tx.text(delta).await {
                    debug!("Session {}: consumer went away, stopping generation", session_id);
                    return;
                }
            }
            Some(ResponseFragment::End { finish_reason }) => {
                let tokens = service.estimator.estimate(&reply) as u32;
                let stored = service
                    .db
                    .add_message(session_id, Role::Assistant, &reply, tokens)
                    .await;
                if let Err(e) = service.router.report_success(model.id).await {
                    warn!("Could not record success of model {}: {}", model.id, e);
                }
                match stored {
                    Ok(_) => tx.end(finish_reason).await,
                    Err(e) => tx.error(format!("reply could not be saved: {e}")).await,
                }
                return;
            }
            Some(ResponseFragment::Error(message)) => {
                warn!("Session {}: {} failed mid-stream: {}", session_id, model.display_name, message);
                if let Err(e) = service.router.report_failure(model.id).await {
                    warn!("Could not record failure of model {}: {}", model.id, e);
                }
                tx.error(message).await;
                return;
            }
            None => {
                if let Err(e) = service.router.report_failure(model.id).await {
                    warn!("Could not record failure of model {}: {}", model.id, e);
                }
                tx.error(format!("{} closed the stream without finishing", model.display_name))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, RouterConfig};
    use crate::retrieval::capability_router::ClientFactory;
    use crate::retrieval::vector_index::{SqliteVectorIndex, VectorIndexManager};
    use crate::storage::{HealthState, NewModelConfiguration};
    use async_trait::async_trait;
    use focus_ai_context::WordCountEstimator;
    use focus_ai_models::{Capability, ModelClient, ModelError, ProbeReport};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Script {
        Echo,
        FailMidway,
        Endless,
        Refuse,
    }

    struct ScriptedClient {
        script: Script,
        requests: Arc<Mutex<Vec<GenerationRequest>>>,
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        fn provider_name(&self) -> &str {
            "scripted"
        }
        fn model_id(&self) -> &str {
            "scripted"
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::TextGen]
        }
        async fn generate(&self, request: GenerationRequest) -> focus_ai_models::Result<ResponseStream> {
            if let Script::Refuse = self.script {
                return Err(ModelError::Provider {
                    status: 503,
                    message: "overloaded".into(),
                });
            }
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            self.requests.lock().unwrap().push(request);
            let (tx, rx) = response_channel(4);
            let script = self.script;
            tokio::spawn(async move {
                match script {
                    Script::Echo => {
                        tx.text("you said: ").await;
                        tx.text(last).await;
                        tx.end(Some("stop".into())).await;
                    }
                    Script::FailMidway => {
                        tx.text("partial").await;
                        tx.error("connection reset").await;
                    }
                    Script::Endless => {
                        while tx.text("more ").await {}
                    }
                    Script::Refuse => {}
                }
            });
            Ok(rx)
        }
        async fn probe(&self) -> focus_ai_models::Result<ProbeReport> {
            Err(ModelError::malformed("not probed in tests"))
        }
    }

    struct ScriptedFactory {
        script: Script,
        requests: Arc<Mutex<Vec<GenerationRequest>>>,
    }

    #[async_trait]
    impl ClientFactory for ScriptedFactory {
        async fn connect(
            &self,
            _model: &ModelConfiguration,
            _timeout: Duration,
        ) -> Result<Arc<dyn ModelClient>> {
            Ok(Arc::new(ScriptedClient {
                script: self.script,
                requests: Arc::clone(&self.requests),
            }))
        }
    }

    struct Fixture {
        db: Database,
        chat: ChatService,
        requests: Arc<Mutex<Vec<GenerationRequest>>>,
        model_id: i64,
    }

    async fn fixture(script: Script, with_model: bool) -> Fixture {
        let db = Database::open_memory().await.unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let router = CapabilityRouter::new(
            db.clone(),
            Arc::new(ScriptedFactory {
                script,
                requests: Arc::clone(&requests),
            }),
            &RouterConfig::default(),
        );
        let mut model_id = 0;
        if with_model {
            model_id = db
                .add_model_configuration(&NewModelConfiguration {
                    display_name: "writer".into(),
                    provider: "ollama".into(),
                    model_id: "llama3.2".into(),
                    capabilities: vec![Capability::TextGen],
                    ..Default::default()
                })
                .await
                .unwrap()
                .id;
            db.assign_capability(Capability::TextGen, &[model_id]).await.unwrap();
        }
        let index = Arc::new(SqliteVectorIndex::open_memory().await.unwrap());
        let vectors = VectorIndexManager::new(db.clone(), index, Arc::new(router.clone()), 8);
        let estimator: Arc<dyn TokenEstimator> = Arc::new(WordCountEstimator);
        let assembler = ContextAssembler::new(
            db.clone(),
            vectors,
            Arc::clone(&estimator),
            ContextConfig::default(),
        );
        let chat = ChatService::new(db.clone(), assembler, router, estimator, ChatConfig::default());
        Fixture {
            db,
            chat,
            requests,
            model_id,
        }
    }

    #[tokio::test]
    async fn test_send_streams_and_persists_reply() {
        let fx = fixture(Script::Echo, true).await;
        let session = fx.chat.create_session("demo").await.unwrap();

        let first = fx.chat.send(session.id, "hello there").await.unwrap().collect().await;
        assert_eq!(first.text, "you said: hello there");
        assert_eq!(first.finish_reason.as_deref(), Some("stop"));
        assert!(first.error.is_none());

        fx.chat.send(session.id, "second turn").await.unwrap().collect().await;
        let messages = fx.chat.messages(session.id).await.unwrap();
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);

        // the second prompt carries the first exchange in order, then the new turn
        let requests = fx.requests.lock().unwrap();
        let contents: Vec<_> = requests[1].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            &contents[1..],
            &["hello there", "you said: hello there", "second turn"]
        );
        assert_eq!(requests[1].messages[0].role, Role::System);
    }

    #[tokio::test]
    async fn test_validation_happens_before_anything_is_stored() {
        let fx = fixture(Script::Echo, true).await;
        let session = fx.chat.create_session("v").await.unwrap();

        assert!(matches!(
            fx.chat.send(session.id, " a ").await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            fx.chat.send(session.id, &"x".repeat(1001)).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            fx.chat.send(424242, "hello").await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(fx.chat.messages(session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_text_model_reaches_the_caller() {
        let fx = fixture(Script::Echo, false).await;
        let session = fx.chat.create_session("none").await.unwrap();
        assert!(matches!(
            fx.chat.send(session.id, "anyone there?").await,
            Err(CoreError::NoCapableModel { capability: Capability::TextGen, .. })
        ));
    }

    #[tokio::test]
    async fn test_mid_stream_error_is_a_single_terminal_fragment() {
        let fx = fixture(Script::FailMidway, true).await;
        let session = fx.chat.create_session("err").await.unwrap();

        let mut stream = fx.chat.send(session.id, "try this").await.unwrap();
        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next().await {
            fragments.push(fragment);
        }
        assert_eq!(
            fragments,
            vec![
                ResponseFragment::Text("partial".into()),
                ResponseFragment::Error("connection reset".into()),
            ]
        );

        let messages = fx.db.session_messages(session.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        let model = fx.db.get_model_configuration(fx.model_id).await.unwrap().unwrap();
        assert_eq!(model.health.state, HealthState::Degraded);
    }

    #[tokio::test]
    async fn test_refused_generation_arrives_as_one_error_fragment() {
        let fx = fixture(Script::Refuse, true).await;
        let session = fx.chat.create_session("refused").await.unwrap();

        let mut stream = fx.chat.send(session.id, "are you busy?").await.unwrap();
        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next().await {
            fragments.push(fragment);
        }
        assert_eq!(fragments.len(), 1);
        match &fragments[0] {
            ResponseFragment::Error(message) => assert!(message.contains("overloaded")),
            other => panic!("expected an error fragment, got {other:?}"),
        }

        // the user turn stays, no assistant reply is stored
        let messages = fx.db.session_messages(session.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        let model = fx.db.get_model_configuration(fx.model_id).await.unwrap().unwrap();
        assert_eq!(model.health.state, HealthState::Degraded);
    }

    #[tokio::test]
    async fn test_dropping_the_stream_stops_generation() {
        let fx = fixture(Script::Endless, true).await;
        let session = fx.chat.create_session("drop").await.unwrap();

        let mut stream = fx.chat.send(session.id, "go on forever").await.unwrap();
        assert!(matches!(stream.next().await, Some(ResponseFragment::Text(_))));
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let messages = fx.db.session_messages(session.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }
}
