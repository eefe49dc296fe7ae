//! The admin duplex channel: lets a remote client register rules, reset the
//! engine, subscribe to events, and answer `Callback` matcher/step RPCs,
//! all multiplexed over one framed connection.
//!
//! [`crate::server`] accepts the raw socket and hands it to
//! [`ConnectionHandle::run`], which owns the connection for its whole
//! lifetime: reading [`wire::ClientMessage`]s, writing back
//! [`wire::ServerMessage`]s (both direct RPC replies and `EventBus`
//! broadcasts), and routing `CallbackReply`s to the [`rpc::RpcDispatcher`]
//! waiting on them.

pub mod body;
pub mod codec;
pub mod convert;
pub mod rpc;
pub mod stream;
pub mod wire;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::engine::Engine;
use crate::error::Result;
use codec::MessageChannel;
use rpc::RpcDispatcher;
use wire::{ClientMessage, ServerMessage};

/// Drives a single admin connection end to end. Cheaply cloneable so the
/// outbound-writer task and the inbound-reader task can share the same
/// dispatcher and engine handle.
pub struct ConnectionHandle {
    engine: Arc<Engine>,
    dispatcher: Arc<RpcDispatcher>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerMessage>>,
}

impl ConnectionHandle {
    pub fn new(engine: Arc<Engine>) -> (Arc<Self>, mpsc::UnboundedSender<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = RpcDispatcher::new(tx.clone());
        let handle = Arc::new(Self {
            engine,
            dispatcher,
            outbound_rx: tokio::sync::Mutex::new(rx),
        });
        (handle, tx)
    }

    /// Owns `io` for the duration of the connection: reads `ClientMessage`s
    /// and answers them (and any `EventBus` broadcasts subscribed to along
    /// the way) until the peer disconnects or sends something unparseable.
    pub async fn run<IO>(self: Arc<Self>, io: IO) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let channel: MessageChannel<IO, ServerMessage, ClientMessage> = MessageChannel::new(io);
        let (mut writer, mut reader) = split_channel(channel);

        let outbound_rx = {
            let mut guard = self.outbound_rx.lock().await;
            std::mem::replace(&mut *guard, mpsc::unbounded_channel().1)
        };

        let writer_task = tokio::spawn(async move {
            let mut outbound_rx = outbound_rx;
            while let Some(message) = outbound_rx.recv().await {
                if writer.send(&message).await.is_err() {
                    break;
                }
            }
        });

        let result = loop {
            match reader.recv().await {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle_client_message(message).await {
                        tracing::warn!(error = %e, "admin connection message handling failed");
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        writer_task.abort();
        result
    }

    async fn handle_client_message(&self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::AddRule { correlation_id, rule } => {
                match convert::rule_builder_from_wire(&rule, Some(&self.dispatcher))
                    .and_then(|builder| self.engine.add_rule(builder))
                {
                    Ok(_) => self.reply_ack(correlation_id),
                    Err(e) => self.reply_error(correlation_id, e.to_string()),
                }
            }
            ClientMessage::RemoveRule { correlation_id, rule_id } => {
                self.engine.remove_rule(&rule_id);
                self.reply_ack(correlation_id);
            }
            ClientMessage::Reset { correlation_id } => {
                self.engine.reset();
                self.reply_ack(correlation_id);
            }
            ClientMessage::WaitForRuleMatch { correlation_id, rule_id } => {
                match self.engine.rules().iter().find(|r| r.id == rule_id).cloned() {
                    Some(rule) => {
                        let waiter = rule.subscribe_next_match();
                        let dispatcher = self.dispatcher.clone();
                        tokio::spawn(async move {
                            if let Ok(completed) = waiter.await {
                                let request = wire::RecordedRequestWire {
                                    method: completed.method,
                                    url: completed.url,
                                    headers: Vec::new(),
                                    body: body::WireBody::omitted(),
                                    matched_rule_id: Some(completed.rule_id),
                                    tags: Vec::new(),
                                };
                                let _ = dispatcher.send_direct(ServerMessage::RuleMatched {
                                    correlation_id,
                                    request,
                                });
                            }
                        });
                    }
                    None => self.reply_error(correlation_id, format!("unknown rule {rule_id}")),
                }
            }
            ClientMessage::SubscribeEvents { correlation_id } => {
                self.spawn_event_forwarder();
                self.reply_ack(correlation_id);
            }
            ClientMessage::CallbackReply { correlation_id, result } => {
                self.dispatcher.complete(&correlation_id, result);
            }
        }
        Ok(())
    }

    fn reply_ack(&self, correlation_id: String) {
        let _ = self.dispatcher.send_direct(ServerMessage::Ack { correlation_id });
    }

    fn reply_error(&self, correlation_id: String, message: String) {
        let _ = self
            .dispatcher
            .send_direct(ServerMessage::Error { correlation_id, message });
    }

    fn spawn_event_forwarder(&self) {
        let mut rx = self.engine.events().subscribe();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let message: ServerMessage = (&event).into();
                if dispatcher.send_direct(message).is_err() {
                    break;
                }
            }
        });
    }
}

fn split_channel<IO>(
    channel: MessageChannel<IO, ServerMessage, ClientMessage>,
) -> (WriterHalf<IO>, ReaderHalf<IO>)
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let shared = Arc::new(tokio::sync::Mutex::new(channel));
    (WriterHalf(shared.clone()), ReaderHalf(shared))
}

struct WriterHalf<IO>(Arc<tokio::sync::Mutex<MessageChannel<IO, ServerMessage, ClientMessage>>>);
struct ReaderHalf<IO>(Arc<tokio::sync::Mutex<MessageChannel<IO, ServerMessage, ClientMessage>>>);

impl<IO> WriterHalf<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    async fn send(&mut self, message: &ServerMessage) -> Result<()> {
        self.0.lock().await.send(message).await
    }
}

impl<IO> ReaderHalf<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    async fn recv(&mut self) -> Result<Option<ClientMessage>> {
        self.0.lock().await.recv().await
    }
}
