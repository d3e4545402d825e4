//! Tool-call dispatcher.
//!
//! The model can call a closed set of tools. Each call is parsed into a
//! typed [`ToolInvocation`], run on its own task, and turned into exactly one
//! [`FunctionResponse`] carrying the call's id. Failures (bad arguments,
//! handler errors, panics, unknown names) become `{"error": ...}` payloads.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::error::ToolError;
use crate::protocol::{FunctionCall, FunctionDeclaration, FunctionResponse, ToolDeclarations, ToolResponse};
use crate::session::SessionEvent;

pub const ILLUSTRATION_TOOL: &str = "generateIllustration";
pub const AWARD_BADGE_TOOL: &str = "awardBadge";
pub const PRESENT_CHOICES_TOOL: &str = "presentChoices";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IllustrationArgs {
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwardBadgeArgs {
    #[serde(alias = "badge_id")]
    pub badge_id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PresentChoicesArgs {
    #[serde(default)]
    pub prompt: Option<String>,
    pub choices: Vec<String>,
}

/// A parsed tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    Illustration(IllustrationArgs),
    AwardBadge(AwardBadgeArgs),
    PresentChoices(PresentChoicesArgs),
    Unknown(String),
}

impl ToolInvocation {
    pub fn parse(call: &FunctionCall) -> Result<Self, ToolError> {
        // Models sometimes omit args entirely for no-arg calls
        let args = if call.args.is_null() { json!({}) } else { call.args.clone() };
        let invocation = match call.name.as_str() {
            ILLUSTRATION_TOOL => Self::Illustration(parse_args(ILLUSTRATION_TOOL, args)?),
            AWARD_BADGE_TOOL => Self::AwardBadge(parse_args(AWARD_BADGE_TOOL, args)?),
            PRESENT_CHOICES_TOOL => Self::PresentChoices(parse_args(PRESENT_CHOICES_TOOL, args)?),
            other => Self::Unknown(other.to_string()),
        };
        Ok(invocation)
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: &'static str, args: serde_json::Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|source| ToolError::InvalidArguments { tool, source })
}

/// Output of the external illustration service.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Illustration {
    pub uri: String,
    pub mime_type: String,
}

/// External image-generation service.
#[async_trait]
pub trait Illustrator: Send + Sync {
    async fn illustrate(&self, prompt: &str, style: Option<&str>) -> Result<Illustration, ToolError>;
}

/// Used when no illustration backend is wired in.
#[derive(Debug, Default, Clone)]
pub struct NoIllustrator;

#[async_trait]
impl Illustrator for NoIllustrator {
    async fn illustrate(&self, _prompt: &str, _style: Option<&str>) -> Result<Illustration, ToolError> {
        Err(ToolError::Failed("illustration service is not configured".to_string()))
    }
}

/// Badges earned during the session. Awarding is idempotent.
#[derive(Debug, Default)]
pub struct BadgeBook {
    awarded: HashSet<String>,
    order: Vec<String>,
}

impl BadgeBook {
    /// Returns true the first time a badge is awarded.
    pub fn award(&mut self, badge_id: &str) -> bool {
        if !self.awarded.insert(badge_id.to_string()) {
            return false;
        }
        self.order.push(badge_id.to_string());
        true
    }

    pub fn contains(&self, badge_id: &str) -> bool {
        self.awarded.contains(badge_id)
    }

    /// Badges in award order.
    pub fn badges(&self) -> &[String] {
        &self.order
    }
}

/// Routes tool calls to their handlers. Cheap to clone; clones share the
/// badge book and event channel.
#[derive(Clone)]
pub struct ToolDispatcher {
    badges: Arc<Mutex<BadgeBook>>,
    illustrator: Arc<dyn Illustrator>,
    events: Option<UnboundedSender<SessionEvent>>,
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(NoIllustrator))
    }
}

impl ToolDispatcher {
    pub fn new(illustrator: Arc<dyn Illustrator>) -> Self {
        Self {
            badges: Arc::new(Mutex::new(BadgeBook::default())),
            illustrator,
            events: None,
        }
    }

    /// Side effects (badges, choices, illustrations) are reported here.
    pub fn with_events(mut self, events: UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn set_events(&mut self, events: UnboundedSender<SessionEvent>) {
        self.events = Some(events);
    }

    /// Snapshot of awarded badges.
    pub fn badges(&self) -> Vec<String> {
        self.badges.lock().map(|book| book.badges().to_vec()).unwrap_or_default()
    }

    /// Declarations advertised in the setup message.
    pub fn declarations() -> ToolDeclarations {
        ToolDeclarations {
            function_declarations: vec![
                FunctionDeclaration {
                    name: ILLUSTRATION_TOOL.to_string(),
                    description: "Generate an illustration for the current scene of the story.".to_string(),
                    parameters: json!({
                        "type": "OBJECT",
                        "properties": {
                            "prompt": {"type": "STRING", "description": "What the picture should show."},
                            "style": {"type": "STRING", "description": "Optional art style."}
                        },
                        "required": ["prompt"]
                    }),
                },
                FunctionDeclaration {
                    name: AWARD_BADGE_TOOL.to_string(),
                    description: "Award the listener a badge for an achievement.".to_string(),
                    parameters: json!({
                        "type": "OBJECT",
                        "properties": {
                            "badgeId": {"type": "STRING", "description": "Identifier of the badge, e.g. bunny_hop."}
                        },
                        "required": ["badgeId"]
                    }),
                },
                FunctionDeclaration {
                    name: PRESENT_CHOICES_TOOL.to_string(),
                    description: "Show the listener a set of choices for what happens next.".to_string(),
                    parameters: json!({
                        "type": "OBJECT",
                        "properties": {
                            "prompt": {"type": "STRING"},
                            "choices": {"type": "ARRAY", "items": {"type": "STRING"}}
                        },
                        "required": ["choices"]
                    }),
                },
            ],
        }
    }

    /// Handle every call of one `toolCall` message. Calls run concurrently;
    /// responses keep the call order.
    pub async fn dispatch_all(&self, calls: Vec<FunctionCall>) -> ToolResponse {
        let tasks = calls.into_iter().map(|call| {
            let dispatcher = self.clone();
            let id = call.id.clone();
            let name = call.name.clone();
            let handle = tokio::spawn(async move { dispatcher.dispatch(call).await });
            async move {
                match handle.await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Tool handler for {} ({}) did not complete: {}", name, id, e);
                        error_response(id, name, &ToolError::Panicked)
                    }
                }
            }
        });

        ToolResponse {
            function_responses: join_all(tasks).await,
        }
    }

    /// Handle a single call. Never fails; errors become error payloads.
    pub async fn dispatch(&self, call: FunctionCall) -> FunctionResponse {
        debug!("Dispatching tool call {} ({})", call.name, call.id);
        self.emit(SessionEvent::ToolCalled {
            id: call.id.clone(),
            name: call.name.clone(),
        });

        let outcome = match ToolInvocation::parse(&call) {
            Ok(invocation) => self.run(invocation).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                info!("Tool {} ({}) completed", call.name, call.id);
                FunctionResponse {
                    id: call.id,
                    name: call.name,
                    response: result,
                }
            }
            Err(e) => {
                warn!("Tool {} ({}) failed: {}", call.name, call.id, e);
                error_response(call.id, call.name, &e)
            }
        }
    }

    async fn run(&self, invocation: ToolInvocation) -> Result<serde_json::Value, ToolError> {
        match invocation {
            ToolInvocation::Illustration(args) => {
                let illustration = self.illustrator.illustrate(&args.prompt, args.style.as_deref()).await?;
                let uri = illustration.uri.clone();
                self.emit(SessionEvent::IllustrationReady {
                    prompt: args.prompt,
                    illustration,
                });
                Ok(json!({"result": "Illustration ready", "imageUri": uri}))
            }
            ToolInvocation::AwardBadge(args) => {
                let newly_awarded = {
                    let mut book = self
                        .badges
                        .lock()
                        .map_err(|_| ToolError::Failed("badge book is poisoned".to_string()))?;
                    book.award(&args.badge_id)
                };
                if newly_awarded {
                    info!("Badge awarded: {}", args.badge_id);
                    self.emit(SessionEvent::BadgeAwarded { badge_id: args.badge_id });
                } else {
                    debug!("Badge {} already awarded", args.badge_id);
                }
                Ok(json!({"result": "Awarded"}))
            }
            ToolInvocation::PresentChoices(args) => {
                if args.choices.is_empty() {
                    return Err(ToolError::Failed("no choices given".to_string()));
                }
                self.emit(SessionEvent::ChoicesPresented {
                    prompt: args.prompt,
                    choices: args.choices,
                });
                Ok(json!({"result": "Choices presented"}))
            }
            ToolInvocation::Unknown(name) => Err(ToolError::UnknownTool(name)),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // Nobody listening is fine
            let _ = events.send(event);
        }
    }
}

fn error_response(id: String, name: String, error: &ToolError) -> FunctionResponse {
    FunctionResponse {
        id,
        name,
        response: json!({"error": error.to_string()}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn call(id: &str, name: &str, args: serde_json::Value) -> FunctionCall {
        FunctionCall {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    struct FixedIllustrator;

    #[async_trait]
    impl Illustrator for FixedIllustrator {
        async fn illustrate(&self, prompt: &str, _style: Option<&str>) -> Result<Illustration, ToolError> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(Illustration {
                uri: format!("https://images.example/{}.png", prompt.replace(' ', "_")),
                mime_type: "image/png".to_string(),
            })
        }
    }

    struct PanickingIllustrator;

    #[async_trait]
    impl Illustrator for PanickingIllustrator {
        async fn illustrate(&self, _prompt: &str, _style: Option<&str>) -> Result<Illustration, ToolError> {
            panic!("renderer exploded");
        }
    }

    #[tokio::test]
    async fn award_badge_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = ToolDispatcher::default().with_events(tx);

        let first = dispatcher
            .dispatch_all(vec![call("42", "awardBadge", json!({"badgeId": "bunny_hop"}))])
            .await;
        assert_eq!(first.function_responses.len(), 1);
        assert_eq!(first.function_responses[0].id, "42");
        assert_eq!(first.function_responses[0].name, "awardBadge");
        assert_eq!(first.function_responses[0].response, json!({"result": "Awarded"}));

        let second = dispatcher
            .dispatch_all(vec![call("43", "awardBadge", json!({"badgeId": "bunny_hop"}))])
            .await;
        assert_eq!(second.function_responses[0].id, "43");
        assert_eq!(dispatcher.badges(), vec!["bunny_hop".to_string()]);

        let mut awarded = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::BadgeAwarded { .. }) {
                awarded += 1;
            }
        }
        assert_eq!(awarded, 1);
    }

    #[tokio::test]
    async fn every_call_gets_exactly_one_response_in_order() {
        let dispatcher = ToolDispatcher::new(Arc::new(FixedIllustrator));
        let calls = vec![
            call("a", "generateIllustration", json!({"prompt": "a red fox"})),
            call("b", "noSuchTool", json!({})),
            call("c", "presentChoices", json!({"choices": ["left", "right"]})),
            call("d", "awardBadge", json!({"wrong": true})),
        ];

        let response = dispatcher.dispatch_all(calls).await;
        let ids: Vec<_> = response.function_responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);

        let payloads: Vec<&serde_json::Value> = response.function_responses.iter().map(|r| &r.response).collect();
        assert_eq!(payloads[0]["imageUri"], "https://images.example/a_red_fox.png");
        assert_eq!(payloads[1]["error"], "Unknown tool: noSuchTool");
        assert_eq!(payloads[2]["result"], "Choices presented");
        assert!(payloads[3]["error"].as_str().unwrap().starts_with("Invalid arguments for awardBadge"));
    }

    #[tokio::test]
    async fn handler_panic_becomes_error_response() {
        let dispatcher = ToolDispatcher::new(Arc::new(PanickingIllustrator));
        let response = dispatcher
            .dispatch_all(vec![call("p", "generateIllustration", json!({"prompt": "boom"}))])
            .await;
        assert_eq!(response.function_responses.len(), 1);
        assert_eq!(response.function_responses[0].id, "p");
        assert_eq!(response.function_responses[0].response["error"], "Tool handler panicked");
    }

    #[tokio::test]
    async fn missing_illustrator_reports_error() {
        let dispatcher = ToolDispatcher::default();
        let response = dispatcher
            .dispatch(call("x", "generateIllustration", json!({"prompt": "castle"})))
            .await;
        assert_eq!(response.response["error"], "illustration service is not configured");
    }

    #[test]
    fn parse_closed_tool_set() {
        let parsed = ToolInvocation::parse(&call("1", "presentChoices", json!({"prompt": "Which way?", "choices": ["up"]}))).unwrap();
        assert_eq!(
            parsed,
            ToolInvocation::PresentChoices(PresentChoicesArgs {
                prompt: Some("Which way?".to_string()),
                choices: vec!["up".to_string()],
            })
        );
        assert_eq!(
            ToolInvocation::parse(&call("2", "dance", serde_json::Value::Null)).unwrap(),
            ToolInvocation::Unknown("dance".to_string())
        );
        assert_eq!(ToolDispatcher::declarations().function_declarations.len(), 3);
    }
}
