//! Wire framing for onion requests and their responses.
//!
//! V2 and V3 carry `[u32 LE length][ciphertext][JSON]` envelopes and JSON
//! payloads. V4 frames a request info record and an optional body as
//! `l<len>:<info><len>:<body>e`.

use crate::crypto::aead::{self, SymmetricKey, IV_SIZE};
use crate::error::{Result, RoutingError};
use crate::types::{OnionVersion, RequestInfo, ResponseInfo, SnodeEndpoint};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::Url;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Prepends the ciphertext length and appends the JSON document.
pub fn encode_envelope(ciphertext: &[u8], json: &Value) -> Result<Vec<u8>> {
    let length = u32::try_from(ciphertext.len())
        .map_err(|_| RoutingError::InvalidEncoding("ciphertext too large".into()))?;
    let json = serde_json::to_vec(json)?;

    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + ciphertext.len() + json.len());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(&json);
    Ok(out)
}

pub fn decode_envelope(data: &[u8]) -> Result<(Vec<u8>, Value)> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(RoutingError::InvalidEncoding("envelope too short".into()));
    }
    let (prefix, rest) = data.split_at(LENGTH_PREFIX_SIZE);
    let mut length = [0u8; LENGTH_PREFIX_SIZE];
    length.copy_from_slice(prefix);
    let length = u32::from_le_bytes(length) as usize;
    if rest.len() < length {
        return Err(RoutingError::InvalidEncoding(format!(
            "envelope declares {} bytes, {} available",
            length,
            rest.len()
        )));
    }

    let (ciphertext, json) = rest.split_at(length);
    let json = serde_json::from_slice(json)
        .map_err(|e| RoutingError::InvalidEncoding(format!("envelope JSON: {}", e)))?;
    Ok((ciphertext.to_vec(), json))
}

/// Frames `info` and an optional body as `l<len>:<info>[<len>:<body>]e`.
pub fn encode_bencoded(info: &[u8], body: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(info.len() + body.map_or(0, <[u8]>::len) + 24);
    out.push(b'l');
    push_segment(&mut out, info);
    if let Some(body) = body {
        push_segment(&mut out, body);
    }
    out.push(b'e');
    out
}

fn push_segment(out: &mut Vec<u8>, segment: &[u8]) {
    out.extend_from_slice(segment.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(segment);
}

/// Splits a bencoded frame into its info segment and optional body.
pub fn decode_bencoded(data: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    let rest = data
        .strip_prefix(b"l")
        .ok_or_else(|| RoutingError::InvalidResponse("frame must start with 'l'".into()))?;

    let (info, rest) = take_segment(rest)?;
    match rest {
        [b'e'] => Ok((info.to_vec(), None)),
        _ => {
            let (body, rest) = take_segment(rest)?;
            if rest != b"e" {
                return Err(RoutingError::InvalidResponse("frame must end with 'e'".into()));
            }
            Ok((info.to_vec(), Some(body.to_vec())))
        }
    }
}

fn take_segment(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let colon = data
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| RoutingError::InvalidResponse("missing segment length".into()))?;
    let length: usize = std::str::from_utf8(&data[..colon])
        .ok()
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| RoutingError::InvalidResponse("bad segment length".into()))?;

    let rest = &data[colon + 1..];
    if rest.len() < length {
        return Err(RoutingError::InvalidResponse("truncated segment".into()));
    }
    Ok(rest.split_at(length))
}

/// An HTTP request to deliver to a server through a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionHttpRequest {
    pub method: String,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl OnionHttpRequest {
    pub fn new(method: impl Into<String>, url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|_| RoutingError::InvalidUrl)?;
        Ok(Self {
            method: method.into(),
            url,
            headers: BTreeMap::new(),
            body: None,
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    fn header(&self, name: &str) -> Option<&String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    fn headers_without(&self, name: &str) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .filter(|(key, _)| !key.eq_ignore_ascii_case(name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Builds the plaintext the destination server receives.
pub fn generate_payload(request: &OnionHttpRequest, version: OnionVersion) -> Result<Vec<u8>> {
    let query = request.url.query().map(|q| format!("?{}", q)).unwrap_or_default();

    match version {
        OnionVersion::V2 | OnionVersion::V3 => {
            let mut headers: Map<String, Value> = request
                .headers_without("User-Agent")
                .into_iter()
                .map(|(key, value)| {
                    let value = match value.to_lowercase().as_str() {
                        "true" => Value::Bool(true),
                        "false" => Value::Bool(false),
                        _ => Value::String(value),
                    };
                    (key, value)
                })
                .collect();

            let path = request.url.path();
            let endpoint = format!("{}{}", path.strip_prefix('/').unwrap_or(path), query);

            let body = match &request.body {
                Some(body) => {
                    headers.insert("Content-Type".into(), Value::String("application/json".into()));
                    String::from_utf8(body.clone()).unwrap_or_else(|_| "null".to_string())
                }
                None => "null".to_string(),
            };

            let payload = json!({
                "body": body,
                "endpoint": endpoint,
                "method": request.method,
                "headers": headers,
            });
            Ok(serde_json::to_vec(&payload)?)
        }
        OnionVersion::V4 => {
            let mut headers = request.headers_without("User-Agent");
            let content_type = request.header("Content-Type").cloned();
            headers.retain(|key, _| !key.eq_ignore_ascii_case("Content-Type"));
            if request.body.is_some() {
                headers.insert(
                    "Content-Type".into(),
                    content_type.unwrap_or_else(|| "application/json".into()),
                );
            }

            let info = RequestInfo {
                method: request.method.clone(),
                endpoint: format!("{}{}", request.url.path(), query),
                headers,
            };
            let info = serde_json::to_vec(&info).map_err(|_| RoutingError::InvalidRequestInfo)?;
            Ok(encode_bencoded(&info, request.body.as_deref()))
        }
    }
}

/// Storage server RPC payload carried to a node destination.
pub fn snode_payload(endpoint: SnodeEndpoint, params: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&json!({
        "method": endpoint.as_str(),
        "params": params,
    }))?)
}

/// A decrypted onion response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedResponse {
    pub info: ResponseInfo,
    pub body: Option<Bytes>,
    /// Server time in milliseconds, when the destination reported one
    pub server_timestamp_ms: Option<i64>,
    /// Reported with a non-2xx status
    failure_body: Bytes,
}

impl DecodedResponse {
    /// Turns a non-2xx status into [`RoutingError::RequestFailedAtDestination`].
    pub fn into_success(self) -> Result<DecodedResponse> {
        if is_success(self.info.code) {
            Ok(self)
        } else {
            Err(RoutingError::RequestFailedAtDestination {
                status_code: self.info.code,
                body: Some(self.failure_body),
            })
        }
    }
}

/// Decrypts the guard's reply with the destination key and checks its status.
pub fn decode_response(
    data: &[u8],
    key: &SymmetricKey,
    version: OnionVersion,
) -> Result<DecodedResponse> {
    open_response(data, key, version)?.into_success()
}

/// Decrypts the guard's reply without rejecting non-2xx statuses, so a
/// server timestamp on a failed reply is still available.
///
/// Clock and signature failures are reported as errors right away.
pub fn open_response(
    data: &[u8],
    key: &SymmetricKey,
    version: OnionVersion,
) -> Result<DecodedResponse> {
    match version {
        OnionVersion::V2 | OnionVersion::V3 => open_json_response(data, key),
        OnionVersion::V4 => open_bencoded_response(data, key),
    }
}

fn open_json_response(data: &[u8], key: &SymmetricKey) -> Result<DecodedResponse> {
    let result = match serde_json::from_slice::<Value>(data) {
        Ok(Value::Object(object)) => object
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RoutingError::InvalidJson("missing result".into()))?,
        Ok(Value::String(result)) => result,
        _ => String::from_utf8(data.to_vec())
            .map_err(|_| RoutingError::InvalidJson("response isn't UTF-8".into()))?,
    };

    let sealed = STANDARD
        .decode(result.trim())
        .map_err(|e| RoutingError::InvalidJson(format!("result isn't base64: {}", e)))?;
    if sealed.len() < IV_SIZE {
        return Err(RoutingError::InvalidJson("result too short".into()));
    }

    let plaintext = aead::decrypt(&sealed, key)?;
    let inner: Value = serde_json::from_slice(&plaintext)?;
    let status_code = inner
        .get("status_code")
        .or_else(|| inner.get("status"))
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .ok_or_else(|| RoutingError::InvalidJson("missing status code".into()))?;

    match status_code {
        406 => return Err(RoutingError::ClockOutOfSync),
        401 => return Err(RoutingError::SignatureVerificationFailed),
        _ => {}
    }

    if let Some(body) = inner.get("body").and_then(Value::as_str) {
        let body_bytes = Bytes::copy_from_slice(body.as_bytes());
        let parsed = match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(parsed)) => parsed,
            _ => {
                return Err(RoutingError::RequestFailedAtDestination {
                    status_code,
                    body: Some(body_bytes),
                })
            }
        };
        return Ok(DecodedResponse {
            info: ResponseInfo::new(status_code),
            body: Some(body_bytes.clone()),
            server_timestamp_ms: parsed.get("t").and_then(Value::as_i64),
            failure_body: body_bytes,
        });
    }

    let plaintext = Bytes::from(plaintext);
    Ok(DecodedResponse {
        info: ResponseInfo::new(status_code),
        body: Some(plaintext.clone()),
        server_timestamp_ms: None,
        failure_body: plaintext,
    })
}

fn open_bencoded_response(data: &[u8], key: &SymmetricKey) -> Result<DecodedResponse> {
    if data.len() < IV_SIZE {
        return Err(RoutingError::InvalidResponse("response too short".into()));
    }
    let plaintext = aead::decrypt(data, key)?;
    let (info, body) = decode_bencoded(&plaintext)?;
    let info: ResponseInfo = serde_json::from_slice(&info)
        .map_err(|e| RoutingError::InvalidResponse(format!("response info: {}", e)))?;

    match info.code {
        406 | 425 => return Err(RoutingError::ClockOutOfSync),
        401 => return Err(RoutingError::SignatureVerificationFailed),
        _ => {}
    }

    Ok(DecodedResponse {
        info,
        body: body.map(Bytes::from),
        server_timestamp_ms: None,
        failure_body: Bytes::from(plaintext),
    })
}

fn is_success(status_code: u16) -> bool {
    (200..300).contains(&status_code)
}
