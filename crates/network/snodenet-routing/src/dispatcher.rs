//! Sends onion requests and turns their failures into pool, swarm and path updates.

use crate::directory;
use crate::error::{Result, RoutingError};
use crate::failure::FailureOutcome;
use crate::network::Core;
use crate::onion;
use crate::paths;
use crate::state::NetworkState;
use crate::transport::HttpRequest;
use crate::types::{
    Destination, OnionPath, OnionVersion, ResponseInfo, ServerDestination, Snode, SnodeEndpoint,
};
use crate::wire::{self, OnionHttpRequest};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const NEXT_NODE_NOT_FOUND_PREFIX: &str = "Next node not found: ";
const SERVER_ERROR_MESSAGE: &str = "Loki Server error";

/// Routes requests through onion paths.
#[derive(Clone)]
pub struct RequestDispatcher {
    core: Arc<Core>,
}

impl RequestDispatcher {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Sends `payload` to `destination` through a random path.
    pub async fn send_onion_request(
        &self,
        payload: &[u8],
        destination: &Destination,
        version: OnionVersion,
    ) -> Result<(ResponseInfo, Option<Bytes>)> {
        send_onion_request(&self.core, payload, destination, version).await
    }

    /// Calls a storage server RPC method through a path.
    pub async fn send_to_snode(
        &self,
        endpoint: SnodeEndpoint,
        params: &Value,
        snode: &Snode,
        public_key: Option<&str>,
    ) -> Result<Bytes> {
        send_to_snode(&self.core, endpoint, params, snode, public_key).await
    }

    /// Sends an HTTP request to an external server whose x25519 key is known.
    pub async fn send_to_server(
        &self,
        request: &OnionHttpRequest,
        server_x25519_public_key: &str,
        version: OnionVersion,
    ) -> Result<(ResponseInfo, Option<Bytes>)> {
        let host = request.url.host_str().ok_or(RoutingError::InvalidUrl)?;
        let payload = wire::generate_payload(request, version)?;
        let destination = Destination::Server(ServerDestination {
            host: host.to_string(),
            target: version.target().to_string(),
            x25519_public_key: server_x25519_public_key.to_string(),
            scheme: Some(request.url.scheme().to_string()),
            port: request.url.port(),
        });

        send_onion_request(&self.core, &payload, &destination, version)
            .await
            .map_err(|e| {
                warn!("Couldn't reach server {}: {}", request.url, e);
                e
            })
    }
}

pub(crate) async fn send_onion_request(
    core: &Arc<Core>,
    payload: &[u8],
    destination: &Destination,
    version: OnionVersion,
) -> Result<(ResponseInfo, Option<Bytes>)> {
    let path = paths::get_path(core, destination.snode()).await?;
    let onion = onion::build_onion(payload, &path, destination)?;

    if matches!(destination, Destination::Server(_)) {
        let limit = core.config.max_request_size as f64 * 0.75;
        if onion.ciphertext.len() as f64 > limit {
            warn!(
                "Onion request of {} bytes is approaching the {} byte limit",
                onion.ciphertext.len(),
                core.config.max_request_size
            );
        }
    }

    let request = HttpRequest::post(onion.guard.url("onion_req/v2"), onion.guard_request_body()?);
    let response = match core.transport.execute(request).await {
        Ok(response) => response,
        Err(err) => return Err(handle_guard_error(core, &path, err).await),
    };

    let opened = wire::open_response(&response, &onion.destination_symmetric_key, version);
    if reached_destination(&opened) {
        let path = path.clone();
        core.queue.submit(move |state| record_path_success(state, &path))?;
    }

    let opened = opened?;
    if let Some(server_ms) = opened.server_timestamp_ms {
        core.set_clock_offset(server_ms);
    }
    let decoded = opened.into_success()?;
    Ok((decoded.info, decoded.body))
}

/// Whether the reply made it back from the destination, successful or not.
fn reached_destination(opened: &Result<wire::DecodedResponse>) -> bool {
    matches!(
        opened,
        Ok(_)
            | Err(RoutingError::RequestFailedAtDestination { .. })
            | Err(RoutingError::ClockOutOfSync)
            | Err(RoutingError::SignatureVerificationFailed)
    )
}

fn record_path_success(state: &mut NetworkState, path: &OnionPath) {
    state.path_failures.record_success(path);
    for hop in path.hops() {
        state.hop_failures.record_success(hop);
    }
}

async fn handle_guard_error(core: &Arc<Core>, path: &OnionPath, err: RoutingError) -> RoutingError {
    let RoutingError::HttpRequestFailed { status_code, body } = &err else {
        return err;
    };
    match *status_code {
        0 => {
            debug!("Ambiguous failure on path {}; not penalising it", path);
            err
        }
        406 => {
            warn!("The user's clock is out of sync with the service node network.");
            RoutingError::ClockOutOfSync
        }
        status_code => {
            let path = path.clone();
            let body = body.clone();
            let classified = core
                .queue
                .run(move |state| classify_guard_failure(state, &path, status_code, body.as_deref()))
                .await;
            if let Err(e) = classified {
                warn!("Couldn't record path failure: {}", e);
            }
            err
        }
    }
}

/// Error message from a guard's reply body: the JSON `result` string or the raw text.
fn guard_error_message(body: &[u8]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(json) => match json.get("result").and_then(Value::as_str) {
            Some(result) => result.to_string(),
            None => String::from_utf8_lossy(body).into_owned(),
        },
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

pub(crate) fn classify_guard_failure(
    state: &mut NetworkState,
    path: &OnionPath,
    status_code: u16,
    body: Option<&[u8]>,
) {
    let message = body.map(guard_error_message).unwrap_or_default();
    if message.trim() == SERVER_ERROR_MESSAGE {
        debug!("Destination server error on path {}; not penalising it", path);
        return;
    }

    if let Some(ed25519_key) = message.trim().strip_prefix(NEXT_NODE_NOT_FOUND_PREFIX) {
        if let Some(snode) = path.find_by_ed25519(ed25519_key.trim()).cloned() {
            handle_hop_failure(state, path, &snode, status_code, body);
            return;
        }
        debug!("Unreachable next node {} isn't part of {}", ed25519_key, path);
    }

    handle_path_failure(state, path, status_code, body);
}

fn handle_hop_failure(
    state: &mut NetworkState,
    path: &OnionPath,
    snode: &Snode,
    status_code: u16,
    body: Option<&[u8]>,
) {
    match state.hop_failures.record_failure(snode.clone()) {
        FailureOutcome::Counted(count) => {
            debug!("Next node {} not found; failure count {}", snode, count);
        }
        FailureOutcome::ThresholdReached => {
            info!("Repairing path {} without {}", path, snode);
            state.handle_snode_error(status_code, body, snode, None);
            if let Err(e) = state.repair_path_snode(snode) {
                warn!("Couldn't repair path {}: {}", path, e);
                handle_path_failure(state, path, status_code, body);
            }
        }
    }
}

fn handle_path_failure(state: &mut NetworkState, path: &OnionPath, status_code: u16, body: Option<&[u8]>) {
    match state.path_failures.record_failure(path.clone()) {
        FailureOutcome::Counted(count) => {
            debug!("Path {} failed with status {}; failure count {}", path, status_code, count);
        }
        FailureOutcome::ThresholdReached => {
            for hop in path.hops() {
                state.handle_snode_error(status_code, body, hop, None);
            }
            state.drop_path(path);
        }
    }
}

pub(crate) async fn send_to_snode(
    core: &Arc<Core>,
    endpoint: SnodeEndpoint,
    params: &Value,
    snode: &Snode,
    public_key: Option<&str>,
) -> Result<Bytes> {
    let payload = wire::snode_payload(endpoint, params)?;
    let destination = Destination::Snode(snode.clone());

    match send_onion_request(core, &payload, &destination, OnionVersion::V3).await {
        Ok((_, body)) => Ok(body.unwrap_or_default()),
        Err(RoutingError::RequestFailedAtDestination { status_code, body }) => {
            let mapped = directory::handle_error(
                core,
                status_code,
                body.as_ref().map(|b| b.to_vec()),
                snode,
                public_key,
            )
            .await?;
            Err(mapped.unwrap_or(RoutingError::RequestFailedAtDestination { status_code, body }))
        }
        Err(e) => Err(e),
    }
}
