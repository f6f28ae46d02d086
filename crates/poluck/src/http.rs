use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing};
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::crypto;
use crate::node::NodeHandle;
use crate::types::Transaction;

/// Shared state for the node HTTP API.
#[derive(Clone)]
struct ApiState {
    node: NodeHandle,
}

/// HTTP API for submitting transactions and inspecting the head.
pub struct NodeApi {
    router: Router,
}

impl NodeApi {
    #[must_use]
    pub fn new(handle: NodeHandle) -> Self {
        let state = ApiState { node: handle };

        let router = Router::new()
            .route("/tx", routing::post(submit_tx))
            .route("/head", routing::get(get_head))
            .route("/chain", routing::get(get_chain))
            .route("/reset", routing::post(reset_enclave))
            .with_state(state);

        Self { router }
    }

    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the HTTP server.
    ///
    /// # Errors
    /// Returns an error if the server fails to start.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        axum::serve(listener, self.router).await
    }
}

#[derive(Deserialize)]
struct SubmitTx {
    /// Hex-encoded transaction body.
    data: String,
}

/// Queue a transaction on the node. Responds with its content hash.
async fn submit_tx(State(state): State<ApiState>, Json(req): Json<SubmitTx>) -> impl IntoResponse {
    let data = match hex::decode(req.data.trim()) {
        Ok(data) => data,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid hex: {e}")).into_response(),
    };
    let tx = Transaction { data };

    let hash = match crypto::content_hash(&tx) {
        Ok(hash) => hash,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    if state.node.transactions.send(tx).await.is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "node channel closed").into_response();
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "hash": hash })),
    )
        .into_response()
}

/// Current head, its chain luck and height, and the mempool size.
async fn get_head(State(state): State<ApiState>) -> impl IntoResponse {
    let body = {
        let view = state.node.view.borrow();
        serde_json::json!({
            "head": view.head,
            "luck": view.luck,
            "height": view.height,
            "pending": view.pending,
        })
    };
    Json(body)
}

/// The adopted chain, oldest first.
async fn get_chain(State(state): State<ApiState>) -> impl IntoResponse {
    let chain = state.node.view.borrow().chain.clone();
    Json(chain)
}

/// Operator reset of a stuck enclave. Responds with the new round status.
async fn reset_enclave(State(state): State<ApiState>) -> impl IntoResponse {
    match state.node.reset_enclave().await {
        Ok(status) => (StatusCode::OK, Json(serde_json::json!({ "status": status }))).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
