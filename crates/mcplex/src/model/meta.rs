use serde::{Deserialize, Serialize};

use super::{
    ClientNotification, ClientRequest, Extensions, JsonObject, Notification,
    NotificationNoParam, ProgressToken, Request, RequestNoParam, RequestOptionalParam,
    ServerNotification, ServerRequest,
};

/// The `_meta` object carried inside `params`.
///
/// Stored in a message's [`Extensions`](super::Extensions) rather than on
/// the params type itself; the serde proxy layer moves it in and out of
/// the wire representation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct Meta(pub JsonObject);

const PROGRESS_TOKEN_FIELD: &str = "progressToken";

impl Meta {
    pub fn new() -> Self {
        Self(JsonObject::new())
    }

    pub fn get_progress_token(&self) -> Option<ProgressToken> {
        self.0
            .get(PROGRESS_TOKEN_FIELD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .map(ProgressToken)
    }

    pub fn set_progress_token(&mut self, token: ProgressToken) {
        self.0
            .insert(PROGRESS_TOKEN_FIELD.to_string(), token.0.into_json_value());
    }

    pub fn extend(&mut self, other: Meta) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Uniform access to the [`Meta`] stashed in a message's extensions.
pub trait GetMeta {
    fn get_meta(&self) -> Option<&Meta>;
    fn get_meta_mut(&mut self) -> &mut Meta;
}

/// Uniform access to a message's [`Extensions`].
pub trait GetExtensions {
    fn extensions(&self) -> &Extensions;
    fn extensions_mut(&mut self) -> &mut Extensions;
}

macro_rules! impl_get_meta {
    ($($ty:ident),* $(,)?) => {
        $(
            impl<M, P> GetMeta for $ty<M, P> {
                fn get_meta(&self) -> Option<&Meta> {
                    self.extensions.get::<Meta>()
                }
                fn get_meta_mut(&mut self) -> &mut Meta {
                    if self.extensions.get::<Meta>().is_none() {
                        self.extensions.insert(Meta::new());
                    }
                    self.extensions.get_mut::<Meta>().expect("meta was just inserted")
                }
            }

            impl<M, P> GetExtensions for $ty<M, P> {
                fn extensions(&self) -> &Extensions {
                    &self.extensions
                }
                fn extensions_mut(&mut self) -> &mut Extensions {
                    &mut self.extensions
                }
            }
        )*
    };
}

impl_get_meta!(Request, RequestOptionalParam, Notification);

macro_rules! impl_get_meta_no_param {
    ($($ty:ident),* $(,)?) => {
        $(
            impl<M> GetMeta for $ty<M> {
                fn get_meta(&self) -> Option<&Meta> {
                    self.extensions.get::<Meta>()
                }
                fn get_meta_mut(&mut self) -> &mut Meta {
                    if self.extensions.get::<Meta>().is_none() {
                        self.extensions.insert(Meta::new());
                    }
                    self.extensions.get_mut::<Meta>().expect("meta was just inserted")
                }
            }

            impl<M> GetExtensions for $ty<M> {
                fn extensions(&self) -> &Extensions {
                    &self.extensions
                }
                fn extensions_mut(&mut self) -> &mut Extensions {
                    &mut self.extensions
                }
            }
        )*
    };
}

impl_get_meta_no_param!(RequestNoParam, NotificationNoParam);

macro_rules! enum_get_meta {
    ($Enum:ident { $($Variant:ident),* $(,)? }) => {
        impl GetMeta for $Enum {
            fn get_meta(&self) -> Option<&Meta> {
                match self {
                    $($Enum::$Variant(inner) => inner.get_meta(),)*
                }
            }
            fn get_meta_mut(&mut self) -> &mut Meta {
                match self {
                    $($Enum::$Variant(inner) => inner.get_meta_mut(),)*
                }
            }
        }

        impl GetExtensions for $Enum {
            fn extensions(&self) -> &Extensions {
                match self {
                    $($Enum::$Variant(inner) => inner.extensions(),)*
                }
            }
            fn extensions_mut(&mut self) -> &mut Extensions {
                match self {
                    $($Enum::$Variant(inner) => inner.extensions_mut(),)*
                }
            }
        }
    };
}

enum_get_meta!(ClientRequest {
    InitializeRequest,
    PingRequest,
    ListToolsRequest,
    CallToolRequest,
    ListPromptsRequest,
    GetPromptRequest,
    ListResourcesRequest,
    ListResourceTemplatesRequest,
    ReadResourceRequest,
    SubscribeRequest,
    UnsubscribeRequest,
    SetLevelRequest,
    CompleteRequest,
});

enum_get_meta!(ServerRequest {
    PingRequest,
    CreateMessageRequest,
    ListRootsRequest,
    CreateElicitationRequest,
});

enum_get_meta!(ClientNotification {
    CancelledNotification,
    ProgressNotification,
    InitializedNotification,
    RootsListChangedNotification,
});

enum_get_meta!(ServerNotification {
    CancelledNotification,
    ProgressNotification,
    LoggingMessageNotification,
    ResourceUpdatedNotification,
    ResourceListChangedNotification,
    ToolListChangedNotification,
    PromptListChangedNotification,
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NumberOrString;

    #[test]
    fn test_progress_token_round_trip() {
        let mut meta = Meta::new();
        meta.set_progress_token(ProgressToken(NumberOrString::Number(9)));
        assert_eq!(
            meta.get_progress_token(),
            Some(ProgressToken(NumberOrString::Number(9)))
        );
    }

    #[test]
    fn test_get_meta_mut_inserts_once() {
        let mut request = crate::model::PingRequest {
            method: Default::default(),
            extensions: Default::default(),
        };
        request
            .get_meta_mut()
            .set_progress_token(ProgressToken(NumberOrString::Number(1)));
        assert!(request.get_meta().is_some());
    }
}
