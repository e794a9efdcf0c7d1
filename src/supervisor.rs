use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::accounts::AccountStore;
use crate::clock::Clock;
use crate::config::ReconnectConfig;
use crate::error::Result;
use crate::rate_limiter::{record_adapter_call, RateLimiter};
use crate::telegram::adapter::TelegramAdapter;

/// Connection supervisor state machine, per spec §4.8. Grounded directly on the
/// teacher's `retry_handler::CircuitState` (`Closed`/`Open { opened_at }`/`HalfOpen {
/// successful_calls }`) — same shape (plain enum variants carrying the instant of the
/// transition), generalized from a binary circuit breaker to the five states the
/// connection lifecycle needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SupervisorState {
    Connecting,
    Connected,
    Error { since: i64 },
    Reconnecting,
    GivingUp,
}

/// `delay = min(initial * multiplier^(attempt-1), max)`, per spec §4.8. Jitter is not
/// part of spec.md's own formula, so it defaults off — the knob exists because the
/// teacher's `calculate_delay` always exposes one, but default behavior matches the
/// spec's reproducible formula exactly.
pub fn calculate_delay_ms(config: &ReconnectConfig, attempt: u32, jitter: bool) -> u64 {
    let base = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32 - 1);
    let capped = base.min(config.max_delay_ms as f64);
    if jitter {
        let jitter_range = capped * 0.1;
        let offset = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        (capped + offset).max(0.0) as u64
    } else {
        capped as u64
    }
}

/// Supervises a single account's connection lifecycle. Owns the account's adapter and
/// drives `start`/`getMe`/health-probe transitions; the daemon polls `state()` and
/// drives reconnection dispatch on its 10th-iteration tick (spec §4.9).
pub struct AccountSupervisor {
    pub account_id: i64,
    adapter: Arc<dyn TelegramAdapter>,
    clock: Arc<dyn Clock>,
    accounts: Arc<AccountStore>,
    reconnect: ReconnectConfig,
    rate_limiter: Arc<RateLimiter>,
    state: RwLock<SupervisorState>,
    reconnect_attempts: AtomicU32,
    next_reconnect_at: AtomicI64,
    last_activity: AtomicI64,
}

impl AccountSupervisor {
    pub fn new(
        account_id: i64,
        adapter: Arc<dyn TelegramAdapter>,
        clock: Arc<dyn Clock>,
        accounts: Arc<AccountStore>,
        reconnect: ReconnectConfig,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            account_id,
            adapter,
            clock,
            accounts,
            reconnect,
            rate_limiter,
            state: RwLock::new(SupervisorState::Connecting),
            reconnect_attempts: AtomicU32::new(0),
            next_reconnect_at: AtomicI64::new(0),
            last_activity: AtomicI64::new(0),
        }
    }

    pub async fn state(&self) -> SupervisorState {
        *self.state.read().await
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    pub fn touch_activity(&self) {
        self.last_activity.store(self.clock.now_ms(), Ordering::SeqCst);
    }

    /// `connecting -> connected` on success, `-> error` on failure. Resets
    /// `reconnectAttempts` to 0 on success.
    pub async fn connect(&self) -> Result<()> {
        *self.state.write().await = SupervisorState::Connecting;

        match self.try_connect().await {
            Ok(me) => {
                self.on_connected(me).await;
                Ok(())
            }
            Err(e) => {
                warn!(account_id = self.account_id, error = %e, "connect attempt failed");
                self.enter_error().await;
                Err(e)
            }
        }
    }

    async fn try_connect(&self) -> Result<crate::telegram::adapter::SelfUser> {
        record_adapter_call(
            &self.rate_limiter,
            self.clock.as_ref(),
            "start",
            Some(&self.account_id.to_string()),
            self.adapter.start(true),
        )
        .await?;
        record_adapter_call(
            &self.rate_limiter,
            self.clock.as_ref(),
            "users.getMe",
            Some(&self.account_id.to_string()),
            self.adapter.get_me(),
        )
        .await
    }

    async fn on_connected(&self, me: crate::telegram::adapter::SelfUser) {
        if let Err(e) = self
            .accounts
            .set_user_id(self.account_id, &me.user_id.to_string(), me.username.as_deref())
            .await
        {
            warn!(account_id = self.account_id, error = %e, "failed to persist learned user_id");
        }

        // During connect, if getMe().id equals another account's user_id, merge
        // per spec §3's rule.
        match self.accounts.merge_duplicates(&me.user_id.to_string()).await {
            Ok(Some(survivor)) if survivor.id != self.account_id => {
                info!(account_id = self.account_id, survivor = survivor.id, "merged duplicate account");
            }
            Ok(_) => {}
            Err(e) => warn!(account_id = self.account_id, error = %e, "duplicate merge check failed"),
        }

        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.touch_activity();
        *self.state.write().await = SupervisorState::Connected;
    }

    /// `connected -> error`: a periodic health probe (every 10s, driven by the daemon)
    /// calls `getMe()`; any error flips to `error`.
    pub async fn health_probe(&self) {
        if *self.state.read().await != SupervisorState::Connected {
            return;
        }
        let result = record_adapter_call(
            &self.rate_limiter,
            self.clock.as_ref(),
            "users.getMe",
            Some(&self.account_id.to_string()),
            self.adapter.get_me(),
        )
        .await;
        if let Err(e) = result {
            warn!(account_id = self.account_id, error = %e, "health probe failed");
            self.enter_error().await;
        }
    }

    /// `pub(crate)` so the daemon's realtime update loop can also drive `connected ->
    /// error` directly when the update stream itself fails, per spec §4.8.
    pub(crate) async fn enter_error(&self) {
        let now_ms = self.clock.now_ms();
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay_ms = calculate_delay_ms(&self.reconnect, attempt, false);
        self.next_reconnect_at.store(now_ms + delay_ms as i64, Ordering::SeqCst);
        *self.state.write().await = SupervisorState::Error { since: now_ms };

        if attempt > self.reconnect.max_attempts {
            error!(account_id = self.account_id, attempt, "exceeded max reconnect attempts, giving up");
        }
    }

    /// `error -> reconnecting` when `now >= nextReconnectAt`; `reconnecting ->
    /// {connected, error}` via the same connect path. Terminal once `reconnectAttempts
    /// > maxAttempts`. Called by the daemon's reconnection-dispatch tick.
    pub async fn maybe_reconnect(&self) -> Result<()> {
        let current = *self.state.read().await;
        if !matches!(current, SupervisorState::Error { .. }) {
            return Ok(());
        }

        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        if attempts > self.reconnect.max_attempts {
            *self.state.write().await = SupervisorState::GivingUp;
            return Ok(());
        }

        let now_ms = self.clock.now_ms();
        if now_ms < self.next_reconnect_at.load(Ordering::SeqCst) {
            return Ok(());
        }

        *self.state.write().await = SupervisorState::Reconnecting;
        self.connect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_exponential_formula_without_jitter() {
        let config = ReconnectConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 10,
            backoff_multiplier: 2.0,
        };
        assert_eq!(calculate_delay_ms(&config, 1, false), 1_000);
        assert_eq!(calculate_delay_ms(&config, 2, false), 2_000);
        assert_eq!(calculate_delay_ms(&config, 3, false), 4_000);
        assert_eq!(calculate_delay_ms(&config, 6, false), 32_000);
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 10,
            backoff_multiplier: 2.0,
        };
        assert_eq!(calculate_delay_ms(&config, 10, false), 60_000);
    }
}
