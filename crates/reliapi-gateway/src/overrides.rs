//! Routing override headers.
//!
//! An external router may pin the provider or model for a request via
//! request headers. Applied overrides are echoed back in namespaced
//! response headers so the router can correlate its decision with the
//! gateway's outcome.

use crate::config::GatewayConfig;
use axum::http::HeaderMap;

pub const ROUTE_PROVIDER_HEADER: &str = "x-route-provider";
pub const ROUTE_MODEL_HEADER: &str = "x-route-model";
pub const ROUTE_DECISION_ID_HEADER: &str = "x-route-decision-id";
pub const ROUTE_NAME_HEADER: &str = "x-route-name";
pub const ROUTE_REASON_HEADER: &str = "x-route-reason";

pub const ECHO_PROVIDER_HEADER: &str = "x-reliapi-provider";
pub const ECHO_MODEL_HEADER: &str = "x-reliapi-model";
pub const ECHO_DECISION_ID_HEADER: &str = "x-reliapi-decision-id";

/// A routing decision extracted from request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDecision {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub decision_id: Option<String>,
    pub route_name: Option<String>,
    pub reason: Option<String>,
}

impl RouteDecision {
    /// Extracts a decision; `None` when no routing headers are present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let decision = Self {
            provider: get(ROUTE_PROVIDER_HEADER),
            model: get(ROUTE_MODEL_HEADER),
            decision_id: get(ROUTE_DECISION_ID_HEADER),
            route_name: get(ROUTE_NAME_HEADER),
            reason: get(ROUTE_REASON_HEADER),
        };
        if decision == Self::default() {
            None
        } else {
            Some(decision)
        }
    }

    /// Whether target or model selection is overridden.
    pub fn has_override(&self) -> bool {
        self.provider.is_some() || self.model.is_some()
    }

    /// Applies the override to target and model selection.
    ///
    /// A provider override re-resolves the target to the first target
    /// whose LLM provider matches, falling back to a target of that name;
    /// a model override replaces the requested model.
    pub fn apply(
        &self,
        target: &str,
        model: Option<&str>,
        config: &GatewayConfig,
    ) -> (String, Option<String>) {
        let mut resolved_target = target.to_string();
        let mut resolved_model = model.map(str::to_string);

        if let Some(provider) = &self.provider {
            let by_provider = config.targets.iter().find(|(_, t)| {
                t.llm
                    .as_ref()
                    .and_then(|llm| llm.provider.as_deref())
                    .map(|p| p.eq_ignore_ascii_case(provider))
                    .unwrap_or(false)
            });
            if let Some((name, _)) = by_provider {
                if *name != resolved_target {
                    tracing::info!(from = %target, to = %name, provider, "route override re-targeted request");
                }
                resolved_target = name.clone();
            } else if config.targets.contains_key(provider) {
                resolved_target = provider.clone();
            }
        }
        if let Some(model) = &self.model {
            resolved_model = Some(model.clone());
        }
        (resolved_target, resolved_model)
    }

    /// Echo headers for the response.
    pub fn response_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(provider) = &self.provider {
            headers.push((ECHO_PROVIDER_HEADER, provider.clone()));
        }
        if let Some(model) = &self.model {
            headers.push((ECHO_MODEL_HEADER, model.clone()));
        }
        if let Some(decision_id) = &self.decision_id {
            headers.push((ECHO_DECISION_ID_HEADER, decision_id.clone()));
        }
        headers
    }
}
