//! WebSocket transport: one reader and one writer task per connection.

pub mod handler;
pub mod reader;
pub mod writer;

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;

use crate::errors::TransportError;

/// What the writer puts on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(Arc<str>),
    /// Liveness probe.
    Ping,
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.to_string().into()),
            Frame::Ping => Message::Ping(Vec::new().into()),
        };
        self.send(msg).await.map_err(TransportError::from)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::close(self).await.map_err(TransportError::from)
    }
}
