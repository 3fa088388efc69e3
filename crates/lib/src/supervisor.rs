//! Supervisor: brings both connections up, pumps each inbound stream through the router on its
//! own task, restarts a connection whose stream ends, and tears everything down on cancellation.

use crate::channels::{ConnectionState, PlatformConnection};
use crate::config::ReconnectConfig;
use crate::error::{ConnectError, SupervisorError};
use crate::relay::RelayRouter;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Sessions that stayed up this long restart with the initial delay again.
const STABLE_SESSION: Duration = Duration::from_secs(60);

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Connect attempts allowed at startup before giving up.
    pub startup_max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(c: &ReconnectConfig) -> Self {
        Self {
            initial_delay: c.initial_delay(),
            max_delay: c.max_delay(),
            multiplier: c.multiplier,
            startup_max_attempts: c.startup_max_attempts.max(1),
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(63) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

/// Connect outcome that distinguishes cancellation from failure.
enum Attempt {
    Connected,
    Cancelled,
}

pub struct Supervisor {
    telegram: Arc<dyn PlatformConnection>,
    discord: Arc<dyn PlatformConnection>,
    router: Arc<RelayRouter>,
    policy: ReconnectPolicy,
}

impl Supervisor {
    pub fn new(
        telegram: Arc<dyn PlatformConnection>,
        discord: Arc<dyn PlatformConnection>,
        router: Arc<RelayRouter>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            telegram,
            discord,
            router,
            policy,
        }
    }

    /// Current state of (telegram, discord).
    pub fn states(&self) -> (ConnectionState, ConnectionState) {
        (self.telegram.state(), self.discord.state())
    }

    /// Run until `shutdown` is cancelled. Returns an error only when startup fails.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        let started = tokio::try_join!(
            connect_at_startup(self.telegram.as_ref(), &self.policy, &shutdown),
            connect_at_startup(self.discord.as_ref(), &self.policy, &shutdown),
        );
        match started {
            Ok((Attempt::Connected, Attempt::Connected)) => {}
            Ok(_) => {
                self.disconnect_all().await;
                return Ok(());
            }
            Err(e) => {
                log::error!("supervisor: {}", e);
                self.disconnect_all().await;
                return Err(e);
            }
        }
        log::info!("supervisor: both connections up, relaying");

        let tasks = [self.telegram.clone(), self.discord.clone()].map(|conn| {
            tokio::spawn(pump(
                conn,
                self.router.clone(),
                self.policy.clone(),
                shutdown.clone(),
            ))
        });
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("supervisor: pump task panicked: {}", e);
            }
        }
        self.disconnect_all().await;
        log::info!("supervisor: stopped");
        Ok(())
    }

    async fn disconnect_all(&self) {
        tokio::join!(self.telegram.disconnect(), self.discord.disconnect());
    }
}

/// Startup connect: transport errors retried up to the policy limit, auth errors fatal.
async fn connect_at_startup(
    conn: &dyn PlatformConnection,
    policy: &ReconnectPolicy,
    shutdown: &CancellationToken,
) -> Result<Attempt, SupervisorError> {
    let fail = |source: ConnectError| SupervisorError::Startup {
        platform: conn.platform(),
        source,
    };
    let mut attempt: u32 = 0;
    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => return Ok(Attempt::Cancelled),
            r = conn.connect() => r,
        };
        match result {
            Ok(()) => return Ok(Attempt::Connected),
            Err(e) if e.is_auth() => return Err(fail(e)),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.startup_max_attempts {
                    return Err(fail(e));
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                log::warn!(
                    "supervisor: {} connect failed attempt={} retry_in_ms={} error={}",
                    conn.platform(),
                    attempt,
                    delay.as_millis(),
                    e
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(Attempt::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Runtime reconnect: retries forever (auth included, in case the token is fixed externally).
/// `attempt` is the backoff index to start from.
async fn reconnect(
    conn: &dyn PlatformConnection,
    policy: &ReconnectPolicy,
    mut attempt: u32,
    shutdown: &CancellationToken,
) -> Attempt {
    loop {
        let delay = policy.delay_for_attempt(attempt);
        log::info!(
            "supervisor: {} reconnecting attempt={} delay_ms={}",
            conn.platform(),
            attempt + 1,
            delay.as_millis()
        );
        tokio::select! {
            _ = shutdown.cancelled() => return Attempt::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
        let result = tokio::select! {
            _ = shutdown.cancelled() => return Attempt::Cancelled,
            r = conn.connect() => r,
        };
        match result {
            Ok(()) => {
                log::info!("supervisor: {} reconnected", conn.platform());
                return Attempt::Connected;
            }
            Err(e) if e.is_auth() => {
                log::error!("supervisor: {} reconnect rejected: {}", conn.platform(), e);
            }
            Err(e) => {
                log::warn!("supervisor: {} reconnect failed: {}", conn.platform(), e);
            }
        }
        attempt = attempt.saturating_add(1);
    }
}

/// Consume one connection's stream sequentially until shutdown, reconnecting when it ends.
async fn pump(
    conn: Arc<dyn PlatformConnection>,
    router: Arc<RelayRouter>,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
) {
    let platform = conn.platform();
    let mut failures: u32 = 0;
    loop {
        let started = Instant::now();
        match conn.inbound_stream() {
            Ok(mut stream) => loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    ev = stream.next() => ev,
                };
                let Some(event) = next else {
                    log::warn!("supervisor: {} inbound stream ended", platform);
                    break;
                };
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    _ = router.handle(event) => {}
                }
            },
            Err(e) => log::warn!("supervisor: {} has no inbound stream: {}", platform, e),
        }
        if started.elapsed() > STABLE_SESSION {
            failures = 0;
        }
        conn.disconnect().await;
        let attempt = failures;
        failures = failures.saturating_add(1);
        match reconnect(conn.as_ref(), &policy, attempt, &shutdown).await {
            Attempt::Connected => {}
            Attempt::Cancelled => return,
        }
    }
}
