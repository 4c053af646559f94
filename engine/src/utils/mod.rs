//! Utils is the shared context and wait primitives for the engine.
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;


use kube::client::Client;
use rand::{rngs::StdRng, thread_rng, RngCore, SeedableRng};
use tokio::time::Instant;

use crate::{error::Error, routing::RoutingClient};

use anyhow::Result;

/// Engine context shared by every component.
pub struct Context<R, Rng> {
    /// Kube client
    pub k_client: Client,
    /// Client for the external load-generator controller
    pub routing_client: R,
    /// Random number generator
    pub rng: Mutex<Rng>,
    /// Cadence and bound applied to every wait loop
    pub polling: PollConfig,
}

impl<R> Context<R, StdRng> {
    /// Create new context
    pub fn new(k_client: Client, routing_client: R) -> Result<Self>
    where
        R: RoutingClient,
    {
        Ok(Context {
            k_client,
            routing_client,
            rng: Mutex::new(StdRng::from_rng(thread_rng())?),
            polling: PollConfig::default(),
        })
    }

    /// Replace the default poll configuration.
    pub fn with_polling(mut self, polling: PollConfig) -> Self {
        self.polling = polling;
        self
    }
}

/// Cadence and upper bound for the engine's wait loops.
///
/// Waits poll at a fixed interval with no backoff. The deadline bounds how
/// long a wait may last; a control plane that never converges surfaces
/// [`Error::WaitTimeout`] instead of hanging the caller.
#[derive(Clone, Debug)]
pub struct PollConfig {
    /// Time between condition checks.
    pub interval: Duration,
    /// Maximum total wait, or `None` to poll until cancelled.
    pub deadline: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deadline: Some(Duration::from_secs(600)),
        }
    }
}

/// Poll `check` at the configured cadence until it yields a value.
///
/// `check` returning `Ok(None)` means "not yet"; errors propagate
/// immediately. Dropping the returned future cancels the wait.
pub(crate) async fn wait_for<T, F, Fut>(
    polling: &PollConfig,
    what: impl Into<String>,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let what = what.into();
    let started = Instant::now();
    loop {
        if let Some(found) = check().await? {
            return Ok(found);
        }
        if let Some(deadline) = polling.deadline {
            if started.elapsed() >= deadline {
                return Err(Error::WaitTimeout {
                    what,
                    waited: started.elapsed(),
                });
            }
        }
        tokio::time::sleep(polling.interval).await;
    }
}

/// Number of random bytes in a generated migration identity.
const MIGRATION_NAME_BYTES: usize = 16;

/// Generate a random, hex-encoded resource identity.
///
/// 16 bytes of entropy make collisions negligible, and the hex form is a
/// valid DNS-1123 label.
pub fn generate_random_name(cx: Arc<Context<impl RoutingClient, impl RngCore>>) -> String {
    let mut name_bytes = [0u8; MIGRATION_NAME_BYTES];
    let mut rng = cx.rng.lock().expect("should be able to acquire lock");
    rng.fill_bytes(&mut name_bytes);
    hex::encode(name_bytes)
}
