use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::time::timeout;
use warp::ws::WebSocket;

use crate::config::ServerConfig;
use crate::constants::{CLOSE_NORMAL, REASON_SESSION_CLOSED};
use crate::core::connection::Connection;
use crate::core::frames::{ChatMessage, ClientFrame, ErrorCode, MessageDraft, ServerFrame};
use crate::core::router::SharedRouter;
use crate::core::transport::WsTransport;

// Handle a WebSocket connection for an already identified user
pub async fn handle_ws_client(
    ws: WebSocket,
    user_id: String,
    router: SharedRouter,
    config: Arc<ServerConfig>,
) {
    let (ws_tx, mut ws_rx) = ws.split();

    let conn = Arc::new(Connection::with_settings(
        user_id,
        WsTransport::new(ws_tx),
        config.connection_settings(),
    ));
    router.attach(Arc::clone(&conn)).await;
    info!("Client connected: user {} on connection {}", conn.user_id(), conn.id());

    reply(&conn, &ServerFrame::Connected);

    loop {
        let next = match timeout(config.read_timeout, ws_rx.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!("Read timeout on connection {}", conn.id());
                break;
            }
        };

        match next {
            Some(Ok(msg)) => {
                if msg.is_close() {
                    break;
                }
                // Pings are answered by warp; pongs only refresh the read timeout
                if msg.is_text() || msg.is_binary() {
                    process_frame(msg.as_bytes(), &conn, &router).await;
                }
            }
            Some(Err(e)) => {
                warn!("WebSocket error on connection {}: {}", conn.id(), e);
                reply(&conn, &ServerFrame::error(ErrorCode::ReadError, e.to_string()));
                break;
            }
            None => break,
        }
    }

    router.detach(&conn).await;
    conn.close(CLOSE_NORMAL, REASON_SESSION_CLOSED);
    info!("Client disconnected: user {} on connection {}", conn.user_id(), conn.id());
}

// Process an incoming data frame
async fn process_frame(data: &[u8], conn: &Connection, router: &SharedRouter) {
    let frame = match ClientFrame::parse(data) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Failed to parse frame from connection {}: {}", conn.id(), e);
            reply(conn, &ServerFrame::error(ErrorCode::BadRequest, "invalid payload"));
            return;
        }
    };

    match frame {
        ClientFrame::Join { conversation_id } => {
            if conversation_id.is_empty() {
                return reply_missing_conversation(conn);
            }
            router.join(&conversation_id, conn).await;
            reply(conn, &ServerFrame::Joined { conversation_id });
        }
        ClientFrame::Leave { conversation_id } => {
            if conversation_id.is_empty() {
                return reply_missing_conversation(conn);
            }
            router.leave(&conversation_id, conn).await;
            reply(conn, &ServerFrame::Left { conversation_id });
        }
        ClientFrame::Message(draft) => handle_message(draft, conn, router).await,
        ClientFrame::Unsupported => {
            reply(conn, &ServerFrame::error(ErrorCode::UnsupportedType, "unknown frame type"));
        }
    }
}

async fn handle_message(draft: MessageDraft, conn: &Connection, router: &SharedRouter) {
    if draft.conversation_id.is_empty() {
        return reply_missing_conversation(conn);
    }

    let message = ChatMessage::from_draft(conn.user_id().to_string(), draft);
    let conversation_id = message.conversation_id.clone();
    let frame = ServerFrame::Message {
        conversation_id: conversation_id.clone(),
        message,
    };

    let payload = match frame.to_payload() {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            reply(conn, &ServerFrame::error(ErrorCode::InternalError, "failed to encode message"));
            return;
        }
    };

    let delivered = router
        .broadcast(&conversation_id, payload.clone(), Some(conn.user_id()))
        .await;

    // Echo to the sender, falling back to this socket if it was just replaced
    if !router.notify_user(conn.user_id(), payload.clone()).await {
        let _ = conn.send(payload);
    }

    debug!(
        "Message from {} in {} delivered to {} members",
        conn.user_id(),
        conversation_id,
        delivered
    );
}

fn reply_missing_conversation(conn: &Connection) {
    reply(conn, &ServerFrame::error(ErrorCode::BadRequest, "conversation_id is required"));
}

fn reply(conn: &Connection, frame: &ServerFrame) {
    match frame.to_payload() {
        Ok(payload) => {
            if let Err(e) = conn.send(payload) {
                debug!("Failed to reply on connection {}: {}", conn.id(), e);
            }
        }
        Err(e) => error!("Failed to serialize reply: {}", e),
    }
}
