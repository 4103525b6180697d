//! Wire representation of the generic request/notification shells.
//!
//! The [`Meta`] attached to a message lives in its [`Extensions`]; on the
//! wire it appears as the `_meta` member of `params`. These impls bridge
//! the two representations through small proxy structs so that the public
//! types never expose `_meta` as a field.
use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use super::{
    Extensions, Meta, Notification, NotificationNoParam, Request, RequestNoParam,
    RequestOptionalParam,
};

#[derive(Serialize, Deserialize)]
struct ParamsWithMeta<'a, P> {
    #[serde(skip_serializing_if = "Option::is_none")]
    _meta: Option<Cow<'a, Meta>>,
    #[serde(flatten)]
    _rest: P,
}

#[derive(Serialize, Deserialize)]
struct MessageShell<'a, M, P> {
    method: M,
    params: ParamsWithMeta<'a, P>,
}

#[derive(Serialize, Deserialize)]
struct MessageShellOptionalParams<'a, M, P> {
    method: M,
    params: Option<ParamsWithMeta<'a, P>>,
}

#[derive(Serialize, Deserialize)]
struct MessageShellNoParams<M> {
    method: M,
}

fn extensions_with_meta(meta: Option<Meta>) -> Extensions {
    let mut extensions = Extensions::new();
    if let Some(meta) = meta {
        extensions.insert(meta);
    }
    extensions
}

macro_rules! serialize_with_params {
    ($ty:ident) => {
        impl<M: Serialize, P: Serialize> Serialize for $ty<M, P> {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                MessageShell::serialize(
                    &MessageShell {
                        method: &self.method,
                        params: ParamsWithMeta {
                            _meta: self.extensions.get::<Meta>().map(Cow::Borrowed),
                            _rest: &self.params,
                        },
                    },
                    serializer,
                )
            }
        }
    };
}

serialize_with_params!(Request);
serialize_with_params!(Notification);

impl<'de, M, P> Deserialize<'de> for Request<M, P>
where
    M: Deserialize<'de>,
    P: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let shell = MessageShell::deserialize(deserializer)?;
        Ok(Request {
            extensions: extensions_with_meta(shell.params._meta.map(Cow::into_owned)),
            method: shell.method,
            params: shell.params._rest,
        })
    }
}

impl<'de, M, P> Deserialize<'de> for Notification<M, P>
where
    M: Deserialize<'de>,
    P: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let shell = MessageShell::deserialize(deserializer)?;
        Ok(Notification {
            extensions: extensions_with_meta(shell.params._meta.map(Cow::into_owned)),
            method: shell.method,
            params: shell.params._rest,
        })
    }
}

impl<M: Serialize, P: Serialize> Serialize for RequestOptionalParam<M, P> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let meta = self.extensions.get::<Meta>().map(Cow::Borrowed);
        MessageShellOptionalParams::serialize(
            &MessageShellOptionalParams {
                method: &self.method,
                params: match (&self.params, meta) {
                    (None, None) => None,
                    (params, _meta) => Some(ParamsWithMeta {
                        _meta,
                        _rest: params.as_ref(),
                    }),
                },
            },
            serializer,
        )
    }
}

impl<'de, M, P> Deserialize<'de> for RequestOptionalParam<M, P>
where
    M: Deserialize<'de>,
    P: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let shell = MessageShellOptionalParams::<'_, _, Option<P>>::deserialize(deserializer)?;
        let (params, meta) = match shell.params {
            Some(body) => (body._rest, body._meta.map(Cow::into_owned)),
            None => (None, None),
        };
        Ok(RequestOptionalParam {
            extensions: extensions_with_meta(meta),
            method: shell.method,
            params,
        })
    }
}

macro_rules! impl_no_params {
    ($ty:ident) => {
        impl<M: Serialize> Serialize for $ty<M> {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                MessageShellNoParams::serialize(
                    &MessageShellNoParams {
                        method: &self.method,
                    },
                    serializer,
                )
            }
        }

        impl<'de, M: Deserialize<'de>> Deserialize<'de> for $ty<M> {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let shell = MessageShellNoParams::<M>::deserialize(deserializer)?;
                Ok($ty {
                    extensions: Extensions::new(),
                    method: shell.method,
                })
            }
        }
    };
}

impl_no_params!(RequestNoParam);
impl_no_params!(NotificationNoParam);

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{GetMeta, NumberOrString, ProgressToken};

    #[test]
    fn test_meta_round_trips_through_params() {
        let mut request: Request<String, serde_json::Value> = Request {
            method: "tools/call".into(),
            params: json!({"name": "echo"}),
            extensions: Extensions::new(),
        };
        request
            .get_meta_mut()
            .set_progress_token(ProgressToken(NumberOrString::Number(3)));

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["params"]["_meta"]["progressToken"], 3);

        let parsed: Request<String, serde_json::Value> = serde_json::from_value(value).unwrap();
        assert_eq!(
            parsed.get_meta().and_then(Meta::get_progress_token),
            Some(ProgressToken(NumberOrString::Number(3)))
        );
        assert_eq!(parsed.params["name"], "echo");
    }

    #[test]
    fn test_no_meta_is_omitted() {
        let request: Request<String, serde_json::Value> = Request {
            method: "m".into(),
            params: json!({}),
            extensions: Extensions::new(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value["params"].get("_meta").is_none());
    }

    #[test]
    fn test_optional_params_absent() {
        let request: RequestOptionalParam<String, serde_json::Value> = RequestOptionalParam {
            method: "tools/list".into(),
            params: None,
            extensions: Extensions::new(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("params").is_none());

        let parsed: RequestOptionalParam<String, serde_json::Value> =
            serde_json::from_value(json!({"method": "tools/list"})).unwrap();
        assert!(parsed.params.is_none());
    }

    #[test]
    fn test_no_param_shell() {
        let value = serde_json::to_value(RequestNoParam {
            method: "ping".to_string(),
            extensions: Extensions::new(),
        })
        .unwrap();
        assert_eq!(value, json!({"method": "ping"}));
    }
}
