//! Line-framed JSON-RPC over any `AsyncRead`/`AsyncWrite` pair: one
//! envelope per line, which is what stdio-style pipes and the in-memory
//! duplex used by tests speak.
use std::{marker::PhantomData, sync::Arc};

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{
    bytes::{Buf, BufMut, BytesMut},
    codec::{Decoder, Encoder, FramedRead, FramedWrite},
};

use super::Transport;
use crate::service::{RxJsonRpcMessage, ServiceRole, TxJsonRpcMessage};

#[derive(Error, Debug)]
pub enum JsonRpcMessageCodecError {
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<JsonRpcMessageCodecError> for std::io::Error {
    fn from(value: JsonRpcMessageCodecError) -> Self {
        match value {
            JsonRpcMessageCodecError::Io(io) => io,
            serde => std::io::Error::new(std::io::ErrorKind::InvalidData, serde),
        }
    }
}

/// Newline-delimited JSON codec for whole JSON-RPC envelopes.
#[derive(Debug)]
pub struct JsonRpcMessageCodec<T> {
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Default for JsonRpcMessageCodec<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: serde::de::DeserializeOwned> Decoder for JsonRpcMessageCodec<T> {
    type Item = T;
    type Error = JsonRpcMessageCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(end) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(end);
        src.advance(1);
        if line.is_empty() {
            return self.decode(src);
        }
        let item = serde_json::from_slice(&line)?;
        Ok(Some(item))
    }
}

impl<T: serde::Serialize> Encoder<T> for JsonRpcMessageCodec<T> {
    type Error = JsonRpcMessageCodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = serde_json::to_vec(&item)?;
        dst.reserve(data.len() + 1);
        dst.put_slice(&data);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Transport over separate read and write halves.
pub struct AsyncRwTransport<R: ServiceRole, Rd, Wr> {
    reader: FramedRead<Rd, JsonRpcMessageCodec<RxJsonRpcMessage<R>>>,
    writer: Arc<tokio::sync::Mutex<FramedWrite<Wr, JsonRpcMessageCodec<TxJsonRpcMessage<R>>>>>,
}

impl<R: ServiceRole, Rd: AsyncRead, Wr: AsyncWrite> AsyncRwTransport<R, Rd, Wr> {
    pub fn new(reader: Rd, writer: Wr) -> Self {
        Self {
            reader: FramedRead::new(reader, JsonRpcMessageCodec::default()),
            writer: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                writer,
                JsonRpcMessageCodec::default(),
            ))),
        }
    }
}

impl<R, Rd, Wr> Transport<R> for AsyncRwTransport<R, Rd, Wr>
where
    R: ServiceRole,
    Rd: AsyncRead + Send + Unpin + 'static,
    Wr: AsyncWrite + Send + Unpin + 'static,
{
    type Error = std::io::Error;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<R>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        use futures::SinkExt;
        let writer = self.writer.clone();
        async move {
            let mut writer = writer.lock().await;
            writer.send(item).await.map_err(Into::into)
        }
    }

    async fn receive(&mut self) -> Option<RxJsonRpcMessage<R>> {
        loop {
            match self.reader.next().await? {
                Ok(message) => return Some(message),
                Err(error) => {
                    // a malformed line is reported, not fatal
                    tracing::warn!(%error, "failed to decode inbound message");
                    continue;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        use futures::SinkExt;
        let mut writer = self.writer.lock().await;
        SinkExt::<TxJsonRpcMessage<R>>::close(&mut *writer)
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientJsonRpcMessage, ClientRequest, PingRequest, RequestId};

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let mut client: AsyncRwTransport<crate::RoleClient, _, _> =
            AsyncRwTransport::new(client_read, client_write);
        let mut server: AsyncRwTransport<crate::RoleServer, _, _> =
            AsyncRwTransport::new(server_read, server_write);

        let message = ClientJsonRpcMessage::request(
            ClientRequest::PingRequest(PingRequest {
                method: Default::default(),
                extensions: Default::default(),
            }),
            RequestId::Number(7),
        );
        client.send(message.clone()).await.unwrap();
        let received = server.receive().await.unwrap();
        assert_eq!(received, message);
    }

    #[test]
    fn test_codec_skips_empty_lines() {
        let mut codec = JsonRpcMessageCodec::<serde_json::Value>::default();
        let mut buffer = BytesMut::from(&b"\n{\"a\":1}\n"[..]);
        let value = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_codec_waits_for_newline() {
        let mut codec = JsonRpcMessageCodec::<serde_json::Value>::default();
        let mut buffer = BytesMut::from(&b"{\"a\":"[..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(b"1}\n");
        assert!(codec.decode(&mut buffer).unwrap().is_some());
    }
}
