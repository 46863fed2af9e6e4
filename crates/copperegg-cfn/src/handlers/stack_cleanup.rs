// Removes RevealCloud servers once their stack has been deleted.
//
// Servers are matched by tag: anything registered with the stack id in its
// tag list (`t`) belongs to the stack.

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::Handler;
use crate::client::Endpoint;
use crate::config::Config;
use crate::protocol::Payload;

pub const STACK_RESOURCE_TYPE: &str = "AWS::CloudFormation::Stack";
pub const DELETE_COMPLETE: &str = "DELETE_COMPLETE";

pub struct StackServerCleanup {
    endpoint: Endpoint,
    index_path: String,
    delete_path: String,
}

impl StackServerCleanup {
    pub fn new(
        endpoint: Endpoint,
        index_path: impl Into<String>,
        delete_path: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            index_path: index_path.into(),
            delete_path: delete_path.into(),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let c = &config.copperegg;
        let endpoint = Endpoint::new(
            &c.revealcloud_url,
            config.credentials.revealcloud_username.clone(),
            config.credentials.revealcloud_password.clone(),
            config.request_timeout(),
        )
        .context("failed to build RevealCloud endpoint")?;
        Ok(Self::new(
            endpoint,
            c.revealcloud_index_path.clone(),
            c.revealcloud_delete_path.clone(),
        ))
    }

    /// All registered servers tagged with `stack_id`.
    pub async fn detect_servers(&self, stack_id: &str) -> anyhow::Result<Vec<Value>> {
        let reply = self
            .endpoint
            .get(&self.index_path)
            .await
            .context("failed to list revealcloud servers")?;
        if !(200..300).contains(&reply.status) {
            bail!(
                "revealcloud server index returned status {}: {}",
                reply.status,
                reply.body.trim()
            );
        }

        let servers = match reply.json().context("revealcloud server index is not JSON")? {
            Value::Array(servers) => servers,
            other => bail!("revealcloud server index is not a list: {other}"),
        };

        Ok(servers
            .into_iter()
            .filter(|server| {
                server
                    .get("t")
                    .and_then(Value::as_array)
                    .is_some_and(|tags| tags.iter().any(|t| t.as_str() == Some(stack_id)))
            })
            .collect())
    }

    /// Delete every server tagged with `stack_id`, returning the servers that
    /// were removed. All deletions are attempted; any failure fails the call
    /// afterwards.
    pub async fn destroy_servers(&self, stack_id: &str) -> anyhow::Result<Vec<Value>> {
        let servers = self.detect_servers(stack_id).await?;
        debug!(
            count = servers.len(),
            "Number of servers detected to remove from revealcloud"
        );

        let mut removed = Vec::with_capacity(servers.len());
        let mut errors = Vec::new();

        for server in servers {
            let Some(uuid) = server.get("uuid").and_then(Value::as_str).map(str::to_string) else {
                warn!(server = %server, "Skipping revealcloud server without uuid");
                continue;
            };
            info!(uuid = %uuid, "Removing server instance from revealcloud");
            debug!(server = %server, "Server instance information");

            let item = format!("{uuid}.json");
            match self.endpoint.delete_item(&self.delete_path, &item).await {
                Ok(reply) if (200..300).contains(&reply.status) || reply.status == 404 => {
                    removed.push(server);
                }
                Ok(reply) => errors.push(format!("{uuid}: {}", reply.body.trim())),
                Err(e) => errors.push(format!("{uuid}: {e}")),
            }
        }

        if !errors.is_empty() {
            bail!("revealcloud server removal failed: {}", errors.join(", "));
        }
        Ok(removed)
    }
}

#[async_trait]
impl Handler for StackServerCleanup {
    fn name(&self) -> &'static str {
        "copperegg_stack_server_cleanup"
    }

    fn valid(&self, payload: &Payload) -> bool {
        let Some(event) = payload.cfn_event() else {
            return false;
        };
        let field = |key: &str| event.get(key).and_then(Value::as_str).map(str::to_string);
        field("resource_type").as_deref() == Some(STACK_RESOURCE_TYPE)
            && field("resource_status").as_deref() == Some(DELETE_COMPLETE)
    }

    async fn execute(&self, payload: &Payload) -> anyhow::Result<()> {
        let event = payload.cfn_event().context("payload has no cfn_event")?;
        let stack_id = event
            .get("stack_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .context("cfn_event has no stack_id")?;
        let removed = self.destroy_servers(stack_id).await?;
        info!(
            stack_id,
            count = removed.len(),
            "revealcloud servers removed for deleted stack"
        );
        Ok(())
    }
}
