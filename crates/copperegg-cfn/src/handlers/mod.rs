// Job handlers. Each handler decides whether a payload is meant for it and,
// if so, performs the CopperEgg calls for that payload.

pub mod probe;
pub mod stack_cleanup;

use async_trait::async_trait;

use crate::config::Config;
use crate::protocol::Payload;

pub use probe::ProbeHandler;
pub use stack_cleanup::StackServerCleanup;

#[async_trait]
pub trait Handler: Send + Sync {
    /// Short identifier used in logs and job outcomes.
    fn name(&self) -> &'static str;

    /// Whether this handler should process `payload`.
    fn valid(&self, payload: &Payload) -> bool;

    /// Process the payload. An `Err` marks the job as failed.
    async fn execute(&self, payload: &Payload) -> anyhow::Result<()>;
}

/// Build every handler from the loaded configuration.
pub fn from_config(config: &Config) -> anyhow::Result<Vec<Box<dyn Handler>>> {
    Ok(vec![
        Box::new(ProbeHandler::from_config(config)?),
        Box::new(StackServerCleanup::from_config(config)?),
    ])
}
