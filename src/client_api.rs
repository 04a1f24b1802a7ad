use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::kv::{ClientReply, ClientRequest};

/// One pending client request: the parsed command and where to send the reply.
pub type Pending = (ClientRequest, oneshot::Sender<ClientReply>);

#[derive(Clone)]
struct ApiState {
    tx: mpsc::Sender<Pending>,
    timeout: Duration,
}

/// Spawn a background thread that runs an axum HTTP server and forwards
/// requests to the Raft event loop via `tx`.
pub fn start(addr: SocketAddr, tx: mpsc::Sender<Pending>, timeout: Duration) {
    thread::spawn(move || match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(serve(addr, ApiState { tx, timeout })),
        Err(e) => error!(error = %e, "client api: failed to start tokio runtime"),
    });
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/client", post(handle_client))
        .with_state(state)
}

async fn serve(addr: SocketAddr, state: ApiState) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "client api: bind failed");
            return;
        }
    };

    info!(%addr, "client api listening");

    if let Err(e) = axum::serve(listener, router(state)).await {
        error!(error = %e, "client api: server error");
    }
}

/// `ServeClient`: the body is the command text, `GET <key>` or `SET <key> <value>`.
async fn handle_client(State(state): State<ApiState>, body: String) -> Json<ClientReply> {
    let request = match body.parse::<ClientRequest>() {
        Ok(request) => request,
        Err(e) => return Json(ClientReply::fail(e.to_string(), None)),
    };
    Json(submit(&state, request).await)
}

/// Hand a request to the event loop and wait for its reply, bounded by the
/// client timeout. A write that times out may still commit later.
async fn submit(state: &ApiState, request: ClientRequest) -> ClientReply {
    let (resp_tx, resp_rx) = oneshot::channel();

    if state.tx.send((request, resp_tx)).is_err() {
        return ClientReply::fail("server shutting down", None);
    }

    match tokio::time::timeout(state.timeout, resp_rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => ClientReply::fail("request dropped", None),
        Err(_) => ClientReply::fail("timed out", None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(timeout: Duration) -> (ApiState, mpsc::Receiver<Pending>) {
        let (tx, rx) = mpsc::channel();
        (ApiState { tx, timeout }, rx)
    }

    #[tokio::test]
    async fn forwards_parsed_request_and_returns_reply() {
        let (state, rx) = state(Duration::from_secs(2));
        let worker = thread::spawn(move || {
            let (request, reply) = rx.recv().unwrap();
            assert_eq!(request, ClientRequest::Get { key: "x".into() });
            reply
                .send(ClientReply::ok("5", Some(crate::types::NodeId::from(0))))
                .unwrap();
        });

        let Json(reply) = handle_client(State(state), "GET x".to_string()).await;

        worker.join().unwrap();
        assert!(reply.success);
        assert_eq!(reply.data, "5");
    }

    #[tokio::test]
    async fn malformed_command_never_reaches_event_loop() {
        let (state, rx) = state(Duration::from_secs(2));

        let Json(reply) = handle_client(State(state), "SET x".to_string()).await;

        assert!(!reply.success);
        assert_eq!(reply.data, "usage: SET <key> <value>");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let (state, rx) = state(Duration::from_millis(50));

        let Json(reply) = handle_client(State(state), "SET x 1".to_string()).await;

        assert!(!reply.success);
        assert_eq!(reply.data, "timed out");
        drop(rx);
    }

    #[tokio::test]
    async fn stopped_event_loop_fails_fast() {
        let (state, rx) = state(Duration::from_secs(2));
        drop(rx);

        let Json(reply) = handle_client(State(state), "GET x".to_string()).await;

        assert_eq!(reply, ClientReply::fail("server shutting down", None));
    }
}
