//! Subscription plans and quotas
//!
//! The plan a tenant is on is *derived* from billing state by the
//! entitlement resolver, never set directly. Quotas here are the single
//! source of truth for product limits.

use serde::{Deserialize, Serialize};

/// Tenant-visible subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Paid,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Paid => "paid",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Plan::Free),
            "paid" => Some(Plan::Paid),
            _ => None,
        }
    }

    /// Maximum number of published sites.
    pub fn max_sites(&self) -> u32 {
        match self {
            Plan::Free => 1,
            Plan::Paid => 25,
        }
    }

    /// Maximum pages per site.
    pub fn max_pages_per_site(&self) -> u32 {
        match self {
            Plan::Free => 5,
            Plan::Paid => 500,
        }
    }

    /// AI page generations per calendar month.
    pub fn ai_generations_per_month(&self) -> u32 {
        match self {
            Plan::Free => 10,
            Plan::Paid => 2_000,
        }
    }

    /// Whether the tenant may attach custom domains.
    pub fn custom_domains_enabled(&self) -> bool {
        matches!(self, Plan::Paid)
    }

    /// Whether the tenant may enable monetization features.
    pub fn monetization_enabled(&self) -> bool {
        matches!(self, Plan::Paid)
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
