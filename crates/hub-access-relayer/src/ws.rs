use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hub_access_protocol::{
    HubAccessClientFrame, HubAccessServerFrame, WalletAddress, validate_hub_id,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::{Challenge, SignatureResponse};
use crate::registry::FrameSender;
use crate::{AppState, now_ms};

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<HubAccessServerFrame>();

    let sender_task = tokio::spawn(async move {
        if let Err(error) = write_outgoing_frames(&mut sink, out_rx).await {
            warn!("websocket sender loop ended with error: {error}");
        }
    });

    state
        .registry
        .attach(&connection_id, out_tx.clone(), now_ms())
        .await;
    debug!(%connection_id, "connection opened");

    read_incoming_frames(&state, &connection_id, &out_tx, &mut stream).await;

    state.dispatcher.on_disconnect(&connection_id).await;
    debug!(%connection_id, "connection closed");

    drop(out_tx);
    let _ = sender_task.await;
}

async fn write_outgoing_frames(
    sink: &mut SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<HubAccessServerFrame>,
) -> anyhow::Result<()> {
    while let Some(frame) = out_rx.recv().await {
        let serialized = serde_json::to_string(&frame)?;
        sink.send(Message::Text(serialized.into())).await?;
    }

    Ok(())
}

async fn read_incoming_frames(
    state: &AppState,
    connection_id: &str,
    out_tx: &FrameSender,
    stream: &mut SplitStream<WebSocket>,
) {
    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(error) => {
                warn!(connection_id, "websocket receive error: {error}");
                break;
            }
        };

        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };

        state.registry.touch(connection_id, now_ms()).await;

        let frame = match serde_json::from_str::<HubAccessClientFrame>(&text) {
            Ok(frame) => frame,
            Err(error) => {
                let _ = out_tx.send(HubAccessServerFrame::error(
                    "invalid_frame",
                    format!("invalid hub access client frame: {error}"),
                ));
                continue;
            }
        };

        handle_frame(state, connection_id, out_tx, frame).await;
    }
}

async fn handle_frame(
    state: &AppState,
    connection_id: &str,
    out_tx: &FrameSender,
    frame: HubAccessClientFrame,
) {
    match frame {
        HubAccessClientFrame::Register { wallet_address } => {
            let wallet = match WalletAddress::parse(&wallet_address) {
                Ok(wallet) => wallet,
                Err(error) => {
                    let _ = out_tx.send(HubAccessServerFrame::error(
                        "invalid_wallet_address",
                        error.to_string(),
                    ));
                    return;
                }
            };

            let superseded = state.registry.register_wallet(connection_id, &wallet).await;
            info!(
                connection_id,
                wallet = %wallet,
                superseded = ?superseded,
                "wallet registered"
            );

            let _ = out_tx.send(HubAccessServerFrame::Registered {
                status: "ok".to_string(),
                wallet_address: wallet.to_string(),
                connection_id: connection_id.to_string(),
            });
        }
        HubAccessClientFrame::RegisterHub { hub_id } => {
            let hub_id = match validate_hub_id(&hub_id) {
                Ok(hub_id) => hub_id.to_string(),
                Err(error) => {
                    let _ = out_tx.send(HubAccessServerFrame::error(
                        "invalid_hub_id",
                        error.to_string(),
                    ));
                    return;
                }
            };

            state.registry.register_hub(connection_id, &hub_id).await;
            info!(connection_id, %hub_id, "hub terminal registered");

            let _ = out_tx.send(HubAccessServerFrame::HubRegistered {
                hub_id,
                connection_id: connection_id.to_string(),
            });
        }
        HubAccessClientFrame::RequestSignature {
            access_request_id,
            message,
            hub_id,
        } => {
            let _ = state
                .dispatcher
                .request_signature(
                    connection_id,
                    Challenge {
                        request_id: access_request_id,
                        message,
                        hub_id,
                    },
                )
                .await;
        }
        HubAccessClientFrame::SubmitSignature {
            request_id,
            signature,
            message,
        } => {
            if let Ok(report) = state
                .dispatcher
                .submit_signature(
                    connection_id,
                    SignatureResponse {
                        request_id,
                        signature,
                        message,
                    },
                )
                .await
            {
                debug!(
                    connection_id,
                    granted = report.outcome.status_changed(),
                    hub_recipients = report.hub_recipients,
                    broadcast_fallback = report.broadcast_fallback,
                    "signature submission handled"
                );
            }
        }
    }
}
