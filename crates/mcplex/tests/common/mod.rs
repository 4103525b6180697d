use std::sync::{Arc, Mutex};

use mcplex::{
    ServerHandler,
    model::*,
    service::{NotificationContext, RequestContext, RoleServer},
};

pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// A small arithmetic server: `sum` answers immediately, `countdown`
/// emits progress and only finishes when told to (or when cancelled).
#[derive(Debug, Clone, Default)]
pub struct Calculator {
    /// Reasons of every cancellation notice observed.
    pub cancellations: Arc<Mutex<Vec<Option<String>>>>,
    /// Methods that reached a handler, in arrival order.
    pub seen_methods: Arc<Mutex<Vec<String>>>,
}

impl Calculator {
    fn record(&self, method: &str) {
        self.seen_methods.lock().unwrap().push(method.to_string());
    }
}

impl ServerHandler for Calculator {
    async fn list_tools(
        &self,
        _params: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        self.record("tools/list");
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["a", "b"]
        });
        Ok(ListToolsResult {
            tools: vec![Tool::new("sum", "add two numbers", object(schema))],
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        self.record("tools/call");
        match params.name.as_ref() {
            "sum" => {
                let arguments = params.arguments.unwrap_or_default();
                let a = arguments.get("a").and_then(|v| v.as_i64()).ok_or_else(|| {
                    ErrorData::invalid_params("missing argument `a`", None)
                })?;
                let b = arguments.get("b").and_then(|v| v.as_i64()).ok_or_else(|| {
                    ErrorData::invalid_params("missing argument `b`", None)
                })?;
                Ok(CallToolResult::success(vec![Content::text(
                    (a + b).to_string(),
                )]))
            }
            "countdown" => {
                let arguments = params.arguments.unwrap_or_default();
                let steps = arguments.get("steps").and_then(|v| v.as_u64()).unwrap_or(3);
                let step_ms = arguments
                    .get("stepMs")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(10);
                let progress_token = context.meta.get_progress_token();
                for step in 0..steps {
                    if context.ct.is_cancelled() {
                        return Err(ErrorData::cancelled(context.ct.reason()));
                    }
                    if let Some(token) = &progress_token {
                        let _ = context
                            .peer
                            .notify_progress(ProgressNotificationParam {
                                progress_token: token.clone(),
                                progress: step as f64,
                                total: Some(steps as f64),
                                message: None,
                            })
                            .await;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(step_ms)).await;
                }
                Ok(CallToolResult::success(vec![Content::text("done")]))
            }
            "hang" => {
                // parks until the peer cancels
                let reason = context.ct.cancelled().await;
                Err(ErrorData::cancelled(reason))
            }
            _ => Err(ErrorData::invalid_params(
                format!("unknown tool {}", params.name),
                None,
            )),
        }
    }

    async fn on_cancelled(
        &self,
        params: CancelledNotificationParam,
        _context: NotificationContext<RoleServer>,
    ) {
        self.cancellations.lock().unwrap().push(params.reason);
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "calculator".into(),
                version: "1.0.0".into(),
                title: None,
            },
            instructions: Some("a calculator for tests".into()),
        }
    }
}
