use serde::{Deserialize, Serialize};

use super::{ClientRequest, JsonObject, ServerRequest};

/// Feature toggles advertised by one side during `initialize`, immutable
/// for the rest of the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<JsonObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

impl ServerCapabilities {
    pub fn builder() -> ServerCapabilitiesBuilder {
        ServerCapabilitiesBuilder::default()
    }

    /// Whether a request from the client targets a feature this server
    /// advertised. `initialize` and `ping` are always permitted.
    pub fn permits(&self, request: &ClientRequest) -> bool {
        match request {
            ClientRequest::InitializeRequest(_) | ClientRequest::PingRequest(_) => true,
            ClientRequest::ListToolsRequest(_) | ClientRequest::CallToolRequest(_) => {
                self.tools.is_some()
            }
            ClientRequest::ListPromptsRequest(_) | ClientRequest::GetPromptRequest(_) => {
                self.prompts.is_some()
            }
            ClientRequest::ListResourcesRequest(_)
            | ClientRequest::ListResourceTemplatesRequest(_)
            | ClientRequest::ReadResourceRequest(_) => self.resources.is_some(),
            ClientRequest::SubscribeRequest(_) | ClientRequest::UnsubscribeRequest(_) => self
                .resources
                .as_ref()
                .is_some_and(|r| r.subscribe.unwrap_or(false)),
            ClientRequest::SetLevelRequest(_) => self.logging.is_some(),
            ClientRequest::CompleteRequest(_) => self.completions.is_some(),
        }
    }
}

impl ClientCapabilities {
    pub fn builder() -> ClientCapabilitiesBuilder {
        ClientCapabilitiesBuilder::default()
    }

    /// Whether a request from the server targets a feature this client
    /// advertised. `ping` is always permitted.
    pub fn permits(&self, request: &ServerRequest) -> bool {
        match request {
            ServerRequest::PingRequest(_) => true,
            ServerRequest::CreateMessageRequest(_) => self.sampling.is_some(),
            ServerRequest::ListRootsRequest(_) => self.roots.is_some(),
            ServerRequest::CreateElicitationRequest(_) => self.elicitation.is_some(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerCapabilitiesBuilder {
    capabilities: ServerCapabilities,
}

impl ServerCapabilitiesBuilder {
    pub fn enable_tools(mut self) -> Self {
        self.capabilities.tools = Some(ToolsCapability::default());
        self
    }
    pub fn enable_tool_list_changed(mut self) -> Self {
        self.capabilities.tools = Some(ToolsCapability {
            list_changed: Some(true),
        });
        self
    }
    pub fn enable_prompts(mut self) -> Self {
        self.capabilities.prompts = Some(PromptsCapability::default());
        self
    }
    pub fn enable_resources(mut self) -> Self {
        self.capabilities.resources = Some(ResourcesCapability::default());
        self
    }
    pub fn enable_resources_subscribe(mut self) -> Self {
        let resources = self.capabilities.resources.get_or_insert_default();
        resources.subscribe = Some(true);
        self
    }
    pub fn enable_logging(mut self) -> Self {
        self.capabilities.logging = Some(JsonObject::default());
        self
    }
    pub fn enable_completions(mut self) -> Self {
        self.capabilities.completions = Some(JsonObject::default());
        self
    }
    pub fn build(self) -> ServerCapabilities {
        self.capabilities
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientCapabilitiesBuilder {
    capabilities: ClientCapabilities,
}

impl ClientCapabilitiesBuilder {
    pub fn enable_roots(mut self) -> Self {
        self.capabilities.roots = Some(RootsCapability::default());
        self
    }
    pub fn enable_roots_list_changed(mut self) -> Self {
        self.capabilities.roots = Some(RootsCapability {
            list_changed: Some(true),
        });
        self
    }
    pub fn enable_sampling(mut self) -> Self {
        self.capabilities.sampling = Some(JsonObject::default());
        self
    }
    pub fn enable_elicitation(mut self) -> Self {
        self.capabilities.elicitation = Some(JsonObject::default());
        self
    }
    pub fn build(self) -> ClientCapabilities {
        self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ListPromptsRequest, PingRequest};

    #[test]
    fn test_capability_gate_table() {
        let capabilities = ServerCapabilities::builder().enable_tools().build();
        let list_prompts = ClientRequest::ListPromptsRequest(ListPromptsRequest {
            method: Default::default(),
            params: None,
            extensions: Default::default(),
        });
        assert!(!capabilities.permits(&list_prompts));

        let ping = ClientRequest::PingRequest(PingRequest {
            method: Default::default(),
            extensions: Default::default(),
        });
        assert!(capabilities.permits(&ping));
    }

    #[test]
    fn test_subscribe_needs_subscribe_flag() {
        let without_subscribe = ServerCapabilities::builder().enable_resources().build();
        let with_subscribe = ServerCapabilities::builder()
            .enable_resources_subscribe()
            .build();
        let subscribe = ClientRequest::SubscribeRequest(crate::model::SubscribeRequest::new(
            crate::model::SubscribeRequestParam {
                uri: "file:///x".into(),
            },
        ));
        assert!(!without_subscribe.permits(&subscribe));
        assert!(with_subscribe.permits(&subscribe));
    }

    #[test]
    fn test_capabilities_serialize_camel_case() {
        let capabilities = ServerCapabilities::builder().enable_tool_list_changed().build();
        let value = serde_json::to_value(&capabilities).unwrap();
        assert_eq!(value, serde_json::json!({"tools": {"listChanged": true}}));
    }
}
