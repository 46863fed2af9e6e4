// RevealUptime probes as a CloudFormation custom resource.
//
// Expected template resource:
//
//   "Type": "Custom::CoppereggProbe",
//   "Properties": {
//     "Parameters": {
//       "Probes": [
//         { "ProbeDesc": "A description", "Type": "GET", "ProbeDest": "http://localhost",
//           "CheckContents": "match", "ContentMatch": "text", "Frequency": 30,
//           "Timeout": 10000, "Retries": 3, "Tags": "comma,delimited", "Stations": ["LON"] }
//       ]
//     }
//   }
//
// Probe keys are snake_cased before being POSTed, which yields the field
// names the RevealUptime API expects (`probe_desc`, `probe_dest`, ...).
// Created probe ids travel back to the stack as a base64url JSON list in the
// physical resource id and are read again on delete.

use anyhow::Context;
use async_trait::async_trait;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::Handler;
use crate::cfn::StackResponder;
use crate::client::{ApiResponse, ClientError, Endpoint};
use crate::config::Config;
use crate::protocol::{rekey, CfnResponse, Payload, RequestType, ResourceRequest};

pub const PROBE_RESOURCE_TYPE: &str = "Custom::CoppereggProbe";

const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encode probe ids as the opaque physical resource id.
pub fn encode_probe_ids(ids: &[Value]) -> String {
    TOKEN_ENGINE.encode(Value::Array(ids.to_vec()).to_string())
}

/// Decode a physical resource id produced by `encode_probe_ids`.
///
/// Returns `None` for anything that is not base64url-encoded JSON list.
pub fn decode_probe_ids(token: &str) -> Option<Vec<Value>> {
    let bytes = TOKEN_ENGINE.decode(token.trim()).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Array(ids) => Some(ids),
        _ => None,
    }
}

/// `Parameters.Probes` as a flat list; a lone probe object is accepted too.
pub fn probe_list(parameters: &Value) -> Vec<Value> {
    fn flatten_into(value: &Value, out: &mut Vec<Value>) {
        match value {
            Value::Array(items) => items.iter().for_each(|v| flatten_into(v, out)),
            Value::Null => {}
            other => out.push(other.clone()),
        }
    }

    let mut probes = Vec::new();
    if let Some(value) = parameters.get("probes") {
        flatten_into(value, &mut probes);
    }
    probes
}

fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn failure_text(result: &Result<ApiResponse, ClientError>) -> String {
    match result {
        Ok(reply) => reply.body.trim().to_string(),
        Err(e) => e.to_string(),
    }
}

pub struct ProbeHandler {
    endpoint: Endpoint,
    responder: StackResponder,
    create_path: String,
    delete_path: String,
}

impl ProbeHandler {
    pub fn new(
        endpoint: Endpoint,
        responder: StackResponder,
        create_path: impl Into<String>,
        delete_path: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            responder,
            create_path: create_path.into(),
            delete_path: delete_path.into(),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let c = &config.copperegg;
        let endpoint = Endpoint::new(
            &c.revealuptime_url,
            config.credentials.revealuptime_username.clone(),
            config.credentials.revealuptime_password.clone(),
            config.request_timeout(),
        )
        .context("failed to build RevealUptime endpoint")?;
        let responder = StackResponder::new(config.request_timeout())
            .context("failed to build stack responder")?;
        Ok(Self::new(
            endpoint,
            responder,
            c.revealuptime_create_path.clone(),
            c.revealuptime_delete_path.clone(),
        ))
    }

    /// Perform the requested action and build the stack response. Does not
    /// deliver the response.
    pub async fn process(&self, request: &ResourceRequest) -> CfnResponse {
        let mut response = CfnResponse::for_request(request);
        match request.request_type() {
            RequestType::Create => {
                let probes = probe_list(request.parameters());
                self.create_probes(&probes, &mut response).await;
            }
            RequestType::Update => {
                error!("Update requested but not supported!");
                response.fail("Updates are not supported on this resource");
            }
            RequestType::Delete => {
                self.delete_probes(request.physical_resource_id.as_deref(), &mut response)
                    .await;
            }
            RequestType::Unknown(kind) => {
                error!(request_type = %kind, "Unknown request type received");
                response.fail("Unknown request type received");
            }
        }
        response
    }

    /// Create every probe. If any creation fails, the ones that succeeded are
    /// deleted again and the response is marked FAILED.
    pub async fn create_probes(&self, probes: &[Value], response: &mut CfnResponse) {
        let mut ids = Vec::with_capacity(probes.len());
        let mut errors = Vec::new();

        for probe in probes {
            let body = rekey(probe);
            debug!(probe = %body, "Attempting probe creation");
            let result = self.endpoint.post_json(&self.create_path, &body).await;
            match &result {
                Ok(reply) if reply.is_ok() => {
                    let id = reply
                        .json()
                        .ok()
                        .and_then(|v| v.get("id").cloned())
                        .filter(|id| !id_string(id).trim().is_empty());
                    match id {
                        Some(id) => ids.push(id),
                        None => errors.push(format!(
                            "missing probe id in response: {}",
                            reply.body.trim()
                        )),
                    }
                }
                _ => errors.push(failure_text(&result)),
            }
        }

        if errors.is_empty() {
            debug!(?ids, "Probes created");
            response.physical_resource_id = encode_probe_ids(&ids);
            response.succeed(format!("New copperegg probes added: {}", ids.len()));
        } else {
            warn!(
                created = ids.len(),
                failed = errors.len(),
                "Probe creation failed, removing probes already created"
            );
            for result in self.probe_deletion(&ids).await {
                if !matches!(&result, Ok(reply) if reply.is_ok()) {
                    warn!(error = %failure_text(&result), "Probe rollback deletion failed");
                }
            }
            response.fail(format!("Probe creation failed: {}", errors.join(", ")));
        }
    }

    /// Issue one DELETE per probe id. Empty ids are skipped.
    pub async fn probe_deletion(&self, ids: &[Value]) -> Vec<Result<ApiResponse, ClientError>> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let probe_id = id_string(id);
            debug!(probe_id = %probe_id, "Copperegg probe deletion");
            let probe_id = probe_id.trim();
            if probe_id.is_empty() {
                error!("Encountered an empty probe ID. Skipping.");
                continue;
            }
            let item = format!("{probe_id}.json");
            results.push(self.endpoint.delete_item(&self.delete_path, &item).await);
        }
        results
    }

    /// Delete the probes named by the physical resource id. A 404 counts as
    /// already deleted. An unreadable token means there is nothing to delete.
    pub async fn delete_probes(
        &self,
        physical_resource_id: Option<&str>,
        response: &mut CfnResponse,
    ) {
        let Some(ids) = physical_resource_id.and_then(decode_probe_ids) else {
            info!("No probe ids encoded in physical resource id");
            response.succeed("No probes to delete!");
            return;
        };

        let errors: Vec<String> = self
            .probe_deletion(&ids)
            .await
            .iter()
            .filter(|result| {
                !matches!(result, Ok(reply) if reply.status == 200 || reply.status == 404)
            })
            .map(failure_text)
            .collect();

        if errors.is_empty() {
            info!(count = ids.len(), "Probes removed");
            response.succeed(format!("Probes removed ({})", ids.len()));
        } else {
            response.fail(format!("Probe deletion failed: {}", errors.join(", ")));
        }
    }
}

#[async_trait]
impl Handler for ProbeHandler {
    fn name(&self) -> &'static str {
        "copperegg_probe"
    }

    fn valid(&self, payload: &Payload) -> bool {
        payload
            .cfn_resource()
            .and_then(|r| {
                r.get("resource_type")
                    .and_then(Value::as_str)
                    .map(|t| t == PROBE_RESOURCE_TYPE)
            })
            .unwrap_or(false)
    }

    async fn execute(&self, payload: &Payload) -> anyhow::Result<()> {
        let resource = payload
            .cfn_resource()
            .context("payload has no cfn_resource")?;
        let request = ResourceRequest::from_value(resource).context("malformed cfn_resource")?;
        let response = self.process(&request).await;
        self.responder
            .respond_to_stack(&response, &request.response_url)
            .await
            .context("failed to respond to stack")?;
        Ok(())
    }
}
