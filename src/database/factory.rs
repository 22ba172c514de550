//! Session cache keyed by target and scope.
//!
//! The factory hands out at most one live session per `(target, scope)` pair.
//! Callers asking for the same key concurrently wait on the key's slot, so a
//! session is established once and then reused. Sessions that turn out to be
//! broken are evicted and re-established on the next request.

use super::connection::{ConnectionTarget, Connector, Scope};
use super::session::{Session, SqlParam};
use super::types::Record;
use crate::config::ConnectionSettings;
use crate::error::ProviderError;
use crate::resilience::{with_retry, RetryConfig, Sleeper};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

type Slot<S> = Arc<AsyncMutex<Option<S>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    target: ConnectionTarget,
    scope: Scope,
}

/// Produces authenticated sessions on demand.
pub struct ConnectorFactory<C: Connector> {
    connector: C,
    connect_timeout: Duration,
    command_timeout: Duration,
    retry: RetryConfig,
    sleeper: Sleeper,
    slots: Mutex<HashMap<SessionKey, Slot<C::Session>>>,
}

impl<C: Connector> ConnectorFactory<C> {
    pub fn new(connector: C, settings: &ConnectionSettings) -> Self {
        Self {
            connector,
            connect_timeout: settings.connect_timeout,
            command_timeout: settings.command_timeout,
            retry: settings.retry.clone(),
            sleeper: Sleeper::tokio(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the sleeper used between connection attempts.
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Get a session for `scope` on `target`, establishing one if needed.
    ///
    /// Establishment retries transient failures with backoff; each attempt is
    /// bounded by the connect timeout. The returned lease holds the session
    /// exclusively until dropped.
    pub async fn get_connector(
        &self,
        scope: &Scope,
        target: &ConnectionTarget,
    ) -> Result<SessionLease<C::Session>, ProviderError> {
        let key = SessionKey {
            target: target.clone(),
            scope: scope.clone(),
        };

        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key).or_default())
        };

        let mut guard = slot.lock_owned().await;

        if guard.as_ref().is_some_and(|session| !session.is_healthy()) {
            debug!(%target, %scope, "discarding broken session");
            guard.take();
        }

        if guard.is_none() {
            let session = self.establish(target, scope).await?;
            *guard = Some(session);
        }

        Ok(SessionLease::new(guard, self.command_timeout))
    }

    async fn establish(
        &self,
        target: &ConnectionTarget,
        scope: &Scope,
    ) -> Result<C::Session, ProviderError> {
        let connect_timeout = self.connect_timeout;
        let connector = &self.connector;

        let session = with_retry(&self.retry, &self.sleeper, move || async move {
            match tokio::time::timeout(connect_timeout, connector.connect(target, scope)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(connect_timeout.as_secs())),
            }
        })
        .await?;

        info!(%target, %scope, "session established");
        Ok(session)
    }

    /// Number of cached live sessions.
    pub fn session_count(&self) -> usize {
        let slots: Vec<_> = self.slots.lock().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| slot.try_lock().map_or(true, |session| session.is_some()))
            .count()
    }

    /// Close every cached session.
    ///
    /// Returns the first close error, after attempting all of them.
    pub async fn dispose(&self) -> Result<(), ProviderError> {
        let slots: Vec<_> = self.slots.lock().drain().collect();
        let mut first_error = None;

        for (key, slot) in slots {
            let session = slot.lock().await.take();
            if let Some(session) = session {
                debug!(target = %key.target, scope = %key.scope, "closing session");
                if let Err(e) = session.close().await {
                    warn!(target = %key.target, error = %e, "failed to close session");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Exclusive use of one cached session.
///
/// Commands are bounded by the command timeout. A command that times out,
/// loses its connection, or is cancelled part-way evicts the session from the
/// cache.
pub struct SessionLease<S: Session> {
    guard: OwnedMutexGuard<Option<S>>,
    command_timeout: Duration,
    in_flight: bool,
}

impl<S: Session> SessionLease<S> {
    fn new(guard: OwnedMutexGuard<Option<S>>, command_timeout: Duration) -> Self {
        Self {
            guard,
            command_timeout,
            in_flight: false,
        }
    }

    pub async fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam<'_>],
    ) -> Result<Vec<Record>, ProviderError> {
        let timeout = self.command_timeout;
        self.in_flight = true;
        let result = match self.guard.as_mut() {
            Some(session) => bounded(timeout, session.query(sql, params)).await,
            None => Err(evicted()),
        };
        self.in_flight = false;
        self.observe(result)
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlParam<'_>]) -> Result<u64, ProviderError> {
        let timeout = self.command_timeout;
        self.in_flight = true;
        let result = match self.guard.as_mut() {
            Some(session) => bounded(timeout, session.execute(sql, params)).await,
            None => Err(evicted()),
        };
        self.in_flight = false;
        self.observe(result)
    }

    /// Whether the lease still holds a session.
    pub fn is_live(&self) -> bool {
        self.guard.is_some()
    }

    fn observe<T>(&mut self, result: Result<T, ProviderError>) -> Result<T, ProviderError> {
        if let Err(e) = &result {
            if e.is_session_lost() || matches!(e, ProviderError::Timeout { .. }) {
                warn!(error = %e, "evicting session");
                self.guard.take();
            }
        }
        result
    }
}

impl<S: Session> Drop for SessionLease<S> {
    fn drop(&mut self) {
        if self.in_flight {
            debug!("command cancelled, evicting session");
            self.guard.take();
        }
    }
}

fn evicted() -> ProviderError {
    ProviderError::connection("session was evicted after a failure")
}

async fn bounded<T>(
    timeout: Duration,
    command: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    match tokio::time::timeout(timeout, command).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::timeout(timeout.as_secs())),
    }
}
