//! Azure AD token acquisition for token-based credentials.
//!
//! Tokens come from a [`TokenSource`]. [`CachedToken`] keeps the last token
//! and refreshes it shortly before it expires; [`ChainedTokenSource`] tries a
//! list of sources in order and uses the first that answers.
//!
//! The Azure sources themselves need the `azure-auth` feature. Without it a
//! token-based credential is rejected when the provider is configured.

use crate::auth::CredentialDescriptor;
use crate::constants::TOKEN_REFRESH_MARGIN;
use crate::error::{ConfigError, ProviderError};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// An access token and, when known, when it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    expires_at: Option<Instant>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<Instant>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Whether the token is still usable for at least `margin`.
    ///
    /// Tokens without a known expiry are never reused.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at > Instant::now() + margin)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Something that can hand out access tokens for Azure SQL.
pub trait TokenSource: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Acquire a new token.
    fn fetch(&self) -> BoxFuture<'_, Result<AccessToken, ProviderError>>;
}

/// Tries each source in order; the first success wins.
///
/// When every source fails and at least one failed transiently, the chain
/// reports a connection error so the caller can retry.
pub struct ChainedTokenSource {
    sources: Vec<Box<dyn TokenSource>>,
}

impl ChainedTokenSource {
    pub fn new(sources: Vec<Box<dyn TokenSource>>) -> Self {
        Self { sources }
    }
}

impl TokenSource for ChainedTokenSource {
    fn name(&self) -> &str {
        "default chain"
    }

    fn fetch(&self) -> BoxFuture<'_, Result<AccessToken, ProviderError>> {
        Box::pin(async move {
            let mut failures = Vec::with_capacity(self.sources.len());
            let mut transient = false;
            for source in &self.sources {
                match source.fetch().await {
                    Ok(token) => {
                        debug!(source = source.name(), "token acquired");
                        return Ok(token);
                    }
                    Err(e) => {
                        debug!(source = source.name(), error = %e, "token source failed");
                        transient |= e.is_transient();
                        failures.push(format!("{}: {}", source.name(), e));
                    }
                }
            }
            let message = format!(
                "no credential in the default chain succeeded ({})",
                failures.join("; ")
            );
            if transient {
                Err(ProviderError::connection(message))
            } else {
                Err(ProviderError::auth(message))
            }
        })
    }
}

/// Caches the token of a source until it is about to expire.
pub struct CachedToken {
    source: Box<dyn TokenSource>,
    cached: Mutex<Option<AccessToken>>,
    refresh_margin: Duration,
}

impl CachedToken {
    pub fn new(source: Box<dyn TokenSource>) -> Self {
        Self::with_margin(source, TOKEN_REFRESH_MARGIN)
    }

    pub fn with_margin(source: Box<dyn TokenSource>, refresh_margin: Duration) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
            refresh_margin,
        }
    }

    /// Return the cached token, fetching a new one if it is missing or stale.
    pub async fn token(&self) -> Result<AccessToken, ProviderError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(self.refresh_margin) {
                return Ok(token.clone());
            }
            debug!(source = self.source.name(), "refreshing access token");
        }

        let token = self.source.fetch().await.inspect_err(|e| {
            warn!(source = self.source.name(), error = %e, "token acquisition failed");
        })?;
        *cached = Some(token.clone());
        Ok(token)
    }
}

/// Build the token cache a credential needs, if any.
pub fn build_token_source(
    credential: &CredentialDescriptor,
) -> Result<Option<Arc<CachedToken>>, ConfigError> {
    if !credential.is_token_based() {
        return Ok(None);
    }

    #[cfg(feature = "azure-auth")]
    {
        Ok(azure::source_for(credential).map(|source| Arc::new(CachedToken::new(source))))
    }

    #[cfg(not(feature = "azure-auth"))]
    {
        Err(ConfigError::UnsupportedAuthMethod(credential.method_name()))
    }
}

#[cfg(feature = "azure-auth")]
mod azure {
    use super::{AccessToken, ChainedTokenSource, TokenSource};
    use crate::auth::CredentialDescriptor;
    use crate::constants::AZURE_SQL_SCOPE;
    use crate::error::ProviderError;
    use azure_core::credentials::{Secret, TokenCredential};
    use azure_core::error::ErrorKind;
    use azure_identity::{
        AzureCliCredential, ClientSecretCredential, ManagedIdentityCredential,
        ManagedIdentityCredentialOptions, UserAssignedId,
    };
    use futures_util::future::BoxFuture;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    pub(super) enum AzureSource {
        ServicePrincipal {
            tenant_id: String,
            client_id: String,
            client_secret: String,
        },
        Environment,
        ManagedIdentity {
            user_id: Option<String>,
        },
        AzureCli,
    }

    pub(super) fn source_for(credential: &CredentialDescriptor) -> Option<Box<dyn TokenSource>> {
        match credential {
            CredentialDescriptor::UsernamePassword { .. } => None,
            CredentialDescriptor::ServicePrincipal {
                tenant_id,
                client_id,
                client_secret,
            } => Some(Box::new(AzureSource::ServicePrincipal {
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            })),
            CredentialDescriptor::DefaultChain => Some(Box::new(ChainedTokenSource::new(vec![
                Box::new(AzureSource::Environment),
                Box::new(AzureSource::ManagedIdentity { user_id: None }),
                Box::new(AzureSource::AzureCli),
            ]))),
            CredentialDescriptor::ManagedIdentity { user_id } => {
                Some(Box::new(AzureSource::ManagedIdentity {
                    user_id: user_id.clone(),
                }))
            }
        }
    }

    fn client_secret(
        tenant_id: &str,
        client_id: &str,
        secret: &str,
    ) -> Result<Arc<dyn TokenCredential>, ProviderError> {
        let credential = ClientSecretCredential::new(
            tenant_id,
            client_id.to_string(),
            Secret::new(secret.to_string()),
            None,
        )
        .map_err(|e| ProviderError::auth(e.to_string()))?;
        Ok(credential)
    }

    impl AzureSource {
        fn credential(&self) -> Result<Arc<dyn TokenCredential>, ProviderError> {
            match self {
                AzureSource::ServicePrincipal {
                    tenant_id,
                    client_id,
                    client_secret: secret,
                } => client_secret(tenant_id, client_id, secret),
                AzureSource::Environment => {
                    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
                    match (
                        var("AZURE_TENANT_ID"),
                        var("AZURE_CLIENT_ID"),
                        var("AZURE_CLIENT_SECRET"),
                    ) {
                        (Some(tenant), Some(client), Some(secret)) => {
                            client_secret(&tenant, &client, &secret)
                        }
                        _ => Err(ProviderError::auth(
                            "AZURE_TENANT_ID/AZURE_CLIENT_ID/AZURE_CLIENT_SECRET not set",
                        )),
                    }
                }
                AzureSource::ManagedIdentity { user_id } => {
                    let options = user_id.as_ref().map(|id| ManagedIdentityCredentialOptions {
                        user_assigned_id: Some(UserAssignedId::ClientId(id.clone())),
                        ..Default::default()
                    });
                    let credential = ManagedIdentityCredential::new(options)
                        .map_err(|e| ProviderError::auth(e.to_string()))?;
                    Ok(credential)
                }
                AzureSource::AzureCli => {
                    let credential = AzureCliCredential::new(None)
                        .map_err(|e| ProviderError::auth(e.to_string()))?;
                    Ok(credential)
                }
            }
        }
    }

    impl TokenSource for AzureSource {
        fn name(&self) -> &str {
            match self {
                AzureSource::ServicePrincipal { .. } => "service principal",
                AzureSource::Environment => "environment",
                AzureSource::ManagedIdentity { .. } => "managed identity",
                AzureSource::AzureCli => "azure cli",
            }
        }

        fn fetch(&self) -> BoxFuture<'_, Result<AccessToken, ProviderError>> {
            Box::pin(async move {
                let credential = self.credential()?;
                let token = credential
                    .get_token(&[AZURE_SQL_SCOPE], None)
                    .await
                    .map_err(|e| token_error(self.name(), &e))?;

                let remaining = token.expires_on - time::OffsetDateTime::now_utc();
                let expires_at = u64::try_from(remaining.whole_seconds())
                    .ok()
                    .map(|secs| Instant::now() + Duration::from_secs(secs));

                Ok(AccessToken::new(token.token.secret().to_string(), expires_at))
            })
        }
    }

    /// Transport failures and server-side HTTP errors from the token endpoint
    /// are connection errors. Anything else means the credential was refused.
    pub(super) fn token_error(source: &str, e: &azure_core::Error) -> ProviderError {
        let message = format!("{}: {}", source, e);
        if is_transport_failure(e) {
            ProviderError::connection(message)
        } else {
            ProviderError::auth(message)
        }
    }

    fn is_transport_failure(e: &azure_core::Error) -> bool {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(e);
        while let Some(err) = current {
            if err.is::<std::io::Error>() {
                return true;
            }
            if let Some(azure) = err.downcast_ref::<azure_core::Error>() {
                match azure.kind() {
                    ErrorKind::Io => return true,
                    ErrorKind::HttpResponse { status, .. } if status.is_server_error() => {
                        return true
                    }
                    _ => {}
                }
            }
            current = err.source();
        }
        false
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        name: &'static str,
        calls: Arc<AtomicU32>,
        lifetime: Option<Duration>,
        fail: bool,
        unreachable: bool,
    }

    impl CountingSource {
        fn boxed(
            name: &'static str,
            lifetime: Option<Duration>,
            fail: bool,
        ) -> (Box<dyn TokenSource>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let source = CountingSource {
                name,
                calls: calls.clone(),
                lifetime,
                fail,
                unreachable: false,
            };
            (Box::new(source), calls)
        }

        /// A source whose endpoint cannot be reached.
        fn unreachable(name: &'static str) -> Box<dyn TokenSource> {
            Box::new(CountingSource {
                name,
                calls: Arc::new(AtomicU32::new(0)),
                lifetime: None,
                fail: true,
                unreachable: true,
            })
        }
    }

    impl TokenSource for CountingSource {
        fn name(&self) -> &str {
            self.name
        }

        fn fetch(&self) -> BoxFuture<'_, Result<AccessToken, ProviderError>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.unreachable {
                    return Err(ProviderError::connection(format!("{} timed out", self.name)));
                }
                if self.fail {
                    return Err(ProviderError::auth(format!("{} unavailable", self.name)));
                }
                let expires_at = self.lifetime.map(|l| Instant::now() + l);
                Ok(AccessToken::new(format!("{}-{}", self.name, n), expires_at))
            })
        }
    }

    #[tokio::test]
    async fn test_cached_token_reused_until_near_expiry() {
        let (source, calls) = CountingSource::boxed("sp", Some(Duration::from_secs(3600)), false);
        let cache = CachedToken::new(source);

        let first = cache.token().await.unwrap();
        let second = cache.token().await.unwrap();
        assert_eq!(first.secret(), second.secret());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_inside_refresh_margin_is_refetched() {
        let (source, calls) = CountingSource::boxed("mi", Some(Duration::from_secs(60)), false);
        let cache = CachedToken::new(source);

        let first = cache.token().await.unwrap();
        let second = cache.token().await.unwrap();
        assert_ne!(first.secret(), second.secret());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chain_uses_first_success() {
        let (env, env_calls) = CountingSource::boxed("environment", None, true);
        let (mi, mi_calls) = CountingSource::boxed("managed identity", None, false);
        let (cli, cli_calls) = CountingSource::boxed("azure cli", None, false);
        let chain = ChainedTokenSource::new(vec![env, mi, cli]);

        let token = chain.fetch().await.unwrap();
        assert_eq!(token.secret(), "managed identity-1");
        assert_eq!(env_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mi_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cli_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chain_reports_every_failure() {
        let (env, _) = CountingSource::boxed("environment", None, true);
        let (cli, _) = CountingSource::boxed("azure cli", None, true);
        let chain = ChainedTokenSource::new(vec![env, cli]);

        let err = chain.fetch().await.unwrap_err();
        assert!(matches!(err, ProviderError::Authentication(_)));
        let message = err.to_string();
        assert!(message.contains("environment"));
        assert!(message.contains("azure cli"));
    }

    #[tokio::test]
    async fn test_chain_with_unreachable_source_is_transient() {
        let (env, _) = CountingSource::boxed("environment", None, true);
        let mi = CountingSource::unreachable("managed identity");
        let chain = ChainedTokenSource::new(vec![env, mi]);

        let err = chain.fetch().await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("managed identity"));
    }

    #[test]
    fn test_password_credential_needs_no_tokens() {
        let credential = CredentialDescriptor::UsernamePassword {
            username: "svc".to_string(),
            password: "x".to_string(),
        };
        assert!(build_token_source(&credential).unwrap().is_none());
    }

    #[cfg(not(feature = "azure-auth"))]
    #[test]
    fn test_token_credentials_need_feature() {
        let result = build_token_source(&CredentialDescriptor::DefaultChain);
        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedAuthMethod("azuread_default_chain_auth"))
        ));
    }

    #[test]
    fn test_token_debug_redacts_secret() {
        let token = AccessToken::new("eyJ0eXAi", None);
        assert!(!format!("{:?}", token).contains("eyJ0eXAi"));
        assert!(!token.is_fresh(Duration::ZERO));
    }
}
