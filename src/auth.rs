use std::collections::HashSet;

use async_trait::async_trait;

use crate::models::UserId;

/// Admin-capability check delegated to the authentication collaborator
///
/// The core trusts the identity it is handed; it only asks whether that
/// identity may arbitrate.
#[async_trait]
pub trait AdminDirectory: Send + Sync {
    async fn is_admin(&self, user: &UserId) -> bool;
}

/// Fixed set of admin identities
#[derive(Debug, Default, Clone)]
pub struct StaticAdmins {
    admins: HashSet<UserId>,
}

impl StaticAdmins {
    pub fn new<I, U>(admins: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<UserId>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }

    /// Comma-separated identities from `ESCROW_ADMINS`, or `fallback` when unset
    pub fn from_env_or(fallback: &[&str]) -> Self {
        match std::env::var("ESCROW_ADMINS") {
            Ok(list) => Self::new(
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            ),
            Err(_) => Self::new(fallback.iter().copied()),
        }
    }
}

#[async_trait]
impl AdminDirectory for StaticAdmins {
    async fn is_admin(&self, user: &UserId) -> bool {
        self.admins.contains(user)
    }
}
