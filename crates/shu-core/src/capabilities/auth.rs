// Provider-token resolution for plugins
//
// Plugins never see refresh tokens or client secrets; they ask this
// capability for a bearer token and get back the minted grant (or nothing).
// Auth instructions arrive through the host context, written there by the
// executor from the manifest's op_auth and the caller's params - plugins
// cannot widen their own scopes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::AuthSection;
use crate::error::Result;
use crate::manifest::AuthMode;
use crate::traits::{DelegationStatus, ProviderIdentity, TokenBroker, TokenGrant};

pub struct AuthCapability {
    broker: Arc<dyn TokenBroker>,
    plugin_name: String,
    user_id: String,
    provider_identities: HashMap<String, Vec<ProviderIdentity>>,
    auth_context: HashMap<String, AuthSection>,
}

impl AuthCapability {
    pub fn new(
        broker: Arc<dyn TokenBroker>,
        plugin_name: &str,
        user_id: &str,
        provider_identities: HashMap<String, Vec<ProviderIdentity>>,
        auth_context: HashMap<String, AuthSection>,
    ) -> Self {
        Self {
            broker,
            plugin_name: plugin_name.to_string(),
            user_id: user_id.to_string(),
            provider_identities,
            auth_context,
        }
    }

    fn context_for(&self, provider: &str) -> Option<&AuthSection> {
        self.auth_context.get(&provider.to_ascii_lowercase())
    }

    fn scopes_for(&self, provider: &str, required_scopes: Option<&[String]>) -> Vec<String> {
        if let Some(scopes) = required_scopes {
            if !scopes.is_empty() {
                return scopes.to_vec();
            }
        }
        self.context_for(provider)
            .map(|s| s.scopes.clone())
            .unwrap_or_default()
    }

    /// Mint a token from the executing user's stored identity.
    pub async fn provider_user_token(
        &self,
        provider: &str,
        required_scopes: Option<&[String]>,
    ) -> Result<Option<TokenGrant>> {
        let scopes = self.scopes_for(provider, required_scopes);
        self.broker
            .user_token(&self.user_id, provider, &scopes)
            .await
    }

    /// Check whether domain delegation is ready for `subject` + scopes.
    pub async fn provider_delegation_check(
        &self,
        provider: &str,
        scopes: &[String],
        subject: &str,
    ) -> Result<DelegationStatus> {
        self.broker.delegation_check(provider, scopes, subject).await
    }

    /// Mint a service-account token, optionally impersonating `subject`.
    pub async fn provider_service_account_token(
        &self,
        provider: &str,
        scopes: &[String],
        subject: Option<&str>,
    ) -> Result<TokenGrant> {
        self.broker
            .service_account_token(provider, scopes, subject)
            .await
    }

    /// Resolve a token and its target subject for `provider`, following the
    /// auth instructions bound in the host context.
    ///
    /// Returns None when no mode applies or no token can be minted; callers
    /// treat that as identity_required.
    pub async fn resolve_token_and_target(
        &self,
        provider: &str,
    ) -> Result<Option<(TokenGrant, Option<String>)>> {
        let section = self.context_for(provider).cloned().unwrap_or_default();
        let scopes = section.scopes.clone();
        let mode = section
            .mode
            .as_deref()
            .and_then(AuthMode::parse)
            .unwrap_or(AuthMode::User);

        debug!(
            plugin = %self.plugin_name,
            provider = %provider,
            mode = mode.as_str(),
            "Resolving provider token"
        );

        match mode {
            AuthMode::User => {
                let grant = self
                    .broker
                    .user_token(&self.user_id, provider, &scopes)
                    .await?;
                Ok(grant.map(|g| {
                    let subject = g.subject.clone().or_else(|| self.stored_subject(provider));
                    (g, subject)
                }))
            }
            AuthMode::DomainDelegate => {
                let Some(subject) = section.subject.filter(|s| !s.trim().is_empty()) else {
                    return Ok(None);
                };
                let grant = self
                    .broker
                    .service_account_token(provider, &scopes, Some(&subject))
                    .await?;
                Ok(Some((grant, Some(subject))))
            }
            AuthMode::ServiceAccount => {
                let subject = section.subject.filter(|s| !s.trim().is_empty());
                let grant = self
                    .broker
                    .service_account_token(provider, &scopes, subject.as_deref())
                    .await?;
                Ok(Some((grant, subject)))
            }
        }
    }

    /// Subject of the first stored identity for `provider`, if any
    fn stored_subject(&self, provider: &str) -> Option<String> {
        self.provider_identities
            .get(provider)
            .and_then(|ids| ids.first())
            .map(|id| id.subject.clone())
    }

    /// Stored identities visible to this plugin call, keyed by provider
    pub fn identities(&self, provider: &str) -> &[ProviderIdentity] {
        self.provider_identities
            .get(provider)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
