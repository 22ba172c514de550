//! Authentication method resolution.
//!
//! The configuration bundle exposes four optional login blocks. Exactly one
//! of them must be declared; [`resolve`] turns that choice into a
//! [`CredentialDescriptor`] without touching the network.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `login` block: SQL authentication.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginBlock {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// `azure_login` block: Azure AD service principal.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureLoginBlock {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl fmt::Debug for LoginBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginBlock")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Debug for AzureLoginBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureLoginBlock")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// `azuread_default_chain_auth` block. Declaring it is the whole configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultChainBlock {}

/// `azuread_managed_identity_auth` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedIdentityBlock {
    /// Client id of a user-assigned identity. Omit for the system identity.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// The four mutually exclusive login blocks of the configuration bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthBlocks {
    #[serde(default)]
    pub login: Option<LoginBlock>,
    #[serde(default)]
    pub azure_login: Option<AzureLoginBlock>,
    #[serde(default)]
    pub azuread_default_chain_auth: Option<DefaultChainBlock>,
    #[serde(default)]
    pub azuread_managed_identity_auth: Option<ManagedIdentityBlock>,
}

impl AuthBlocks {
    /// Names of the blocks that are declared, in bundle order.
    pub fn declared(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.login.is_some() {
            names.push("login");
        }
        if self.azure_login.is_some() {
            names.push("azure_login");
        }
        if self.azuread_default_chain_auth.is_some() {
            names.push("azuread_default_chain_auth");
        }
        if self.azuread_managed_identity_auth.is_some() {
            names.push("azuread_managed_identity_auth");
        }
        names
    }
}

/// One resolved authentication method.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum CredentialDescriptor {
    UsernamePassword {
        username: String,
        password: String,
    },
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    DefaultChain,
    ManagedIdentity {
        user_id: Option<String>,
    },
}

impl CredentialDescriptor {
    /// Name of the configuration block this descriptor came from.
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::UsernamePassword { .. } => "login",
            Self::ServicePrincipal { .. } => "azure_login",
            Self::DefaultChain => "azuread_default_chain_auth",
            Self::ManagedIdentity { .. } => "azuread_managed_identity_auth",
        }
    }

    /// Whether connecting requires an Azure AD token.
    pub fn is_token_based(&self) -> bool {
        !matches!(self, Self::UsernamePassword { .. })
    }
}

impl fmt::Debug for CredentialDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::ServicePrincipal {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
            Self::DefaultChain => f.write_str("DefaultChain"),
            Self::ManagedIdentity { user_id } => f
                .debug_struct("ManagedIdentity")
                .field("user_id", user_id)
                .finish(),
        }
    }
}

/// Resolve the declared login blocks into a single credential descriptor.
///
/// Empty or whitespace-only strings count as missing.
pub fn resolve(blocks: &AuthBlocks) -> Result<CredentialDescriptor, ConfigError> {
    let declared = blocks.declared();
    match declared.len() {
        0 => return Err(ConfigError::NoAuthMethod),
        1 => {}
        _ => return Err(ConfigError::AmbiguousAuthMethod(declared)),
    }

    if let Some(login) = &blocks.login {
        return Ok(CredentialDescriptor::UsernamePassword {
            username: required("login", "username", &login.username)?,
            password: required("login", "password", &login.password)?,
        });
    }

    if let Some(azure) = &blocks.azure_login {
        return Ok(CredentialDescriptor::ServicePrincipal {
            tenant_id: required("azure_login", "tenant_id", &azure.tenant_id)?,
            client_id: required("azure_login", "client_id", &azure.client_id)?,
            client_secret: required("azure_login", "client_secret", &azure.client_secret)?,
        });
    }

    if blocks.azuread_default_chain_auth.is_some() {
        return Ok(CredentialDescriptor::DefaultChain);
    }

    let user_id = blocks
        .azuread_managed_identity_auth
        .as_ref()
        .and_then(|block| present(&block.user_id));
    Ok(CredentialDescriptor::ManagedIdentity { user_id })
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
}

fn required(
    method: &'static str,
    field: &'static str,
    value: &Option<String>,
) -> Result<String, ConfigError> {
    present(value).ok_or(ConfigError::IncompleteAuthConfig { method, field })
}
