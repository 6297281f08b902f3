//! Adapters from an upgraded axum WebSocket to the core transport traits.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use crate::connection::{Frame, FrameSink, FrameSource, TransportError};

/// WebSocket normal-closure status code.
const NORMAL_CLOSURE: u16 = 1000;

/// Write half of an upgraded socket.
///
/// The open flag flips on the first failed write or on close, so later
/// sends can bail out before touching the sink.
pub struct WsFrameSink {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    open: AtomicBool,
}

impl WsFrameSink {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender: Mutex::new(sender),
            open: AtomicBool::new(true),
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[async_trait]
impl FrameSink for WsFrameSink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
            Frame::Close => Message::Close(None),
        };

        let mut sender = self.sender.lock().await;
        sender.send(message).await.map_err(|e| {
            self.mark_closed();
            TransportError::Io(e.to_string())
        })
    }

    async fn close(&self, reason: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }
        self.mark_closed();

        let frame = CloseFrame {
            code: NORMAL_CLOSURE,
            reason: reason.into(),
        };

        let mut sender = self.sender.lock().await;
        sender
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Read half of an upgraded socket.
///
/// Ping/pong frames are answered by axum itself and skipped here, so the
/// session only ever sees text, binary, and close.
pub struct WsFrameSource {
    receiver: SplitStream<WebSocket>,
}

impl WsFrameSource {
    pub fn new(receiver: SplitStream<WebSocket>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            return match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => Some(Ok(Frame::Text(text.to_string()))),
                Some(Ok(Message::Binary(data))) => Some(Ok(Frame::Binary(data.to_vec()))),
                Some(Ok(Message::Close(_))) => Some(Ok(Frame::Close)),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Err(e)) => Some(Err(TransportError::Io(e.to_string()))),
                None => None,
            };
        }
    }
}
