use std::collections::HashSet;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::db::DbHandle;

/// Owner-set entity kinds, as stored in the owners table.
pub const ENTITY_CHANNEL: &str = "channel";
pub const ENTITY_ISSUE: &str = "issue";

/// Effective access level, totally ordered:
/// `User < Owner < ProgramOwner < Admin`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    User,
    Owner,
    ProgramOwner,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Owner => "owner",
            Self::ProgramOwner => "program_owner",
            Self::Admin => "admin",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::User => 0,
            Self::Owner => 1,
            Self::ProgramOwner => 2,
            Self::Admin => 3,
        }
    }

    pub fn satisfies(&self, required: Permission) -> bool {
        self.rank() >= required.rank()
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "owner" => Ok(Self::Owner),
            "program_owner" => Ok(Self::ProgramOwner),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Invalid permission: {}", s)),
        }
    }
}

/// Outcome of a permission pre-check at a mutating entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed(Permission),
    Denied {
        required: Permission,
        resolved: Permission,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    /// The denial message reported to the caller; `None` when allowed.
    pub fn denial_message(&self) -> Option<String> {
        match self {
            Self::Allowed(_) => None,
            Self::Denied { required, .. } => Some(format!(
                "You need {} permission to perform this action.",
                required
            )),
        }
    }
}

/// Computes a user's effective access level against a channel/issue pair.
///
/// Levels are recomputed per request from the source-of-truth stores rather
/// than cached, so ownership changes take effect immediately. Evaluation is
/// strict priority order, first match wins: admin allow-list, then program
/// ownership (channel-bound program first, then the issue's linked program),
/// then the channel/issue owner sets, then the default.
#[derive(Clone)]
pub struct PermissionResolver {
    db: DbHandle,
    admin_users: HashSet<String>,
}

impl PermissionResolver {
    pub fn new(db: DbHandle, admin_users: HashSet<String>) -> Self {
        Self { db, admin_users }
    }

    pub async fn resolve(
        &self,
        user_id: &str,
        channel_id: Option<&str>,
        issue_id: Option<i64>,
    ) -> Result<Permission> {
        if self.admin_users.contains(user_id) {
            return Ok(Permission::Admin);
        }

        let user = user_id.to_string();
        let channel = channel_id.map(str::to_string);
        self.db
            .call(move |db| {
                if let Some(ref channel) = channel
                    && let Some(program) = db.find_program_by_channel(channel)?
                    && program.has_owner(&user)
                {
                    return Ok(Permission::ProgramOwner);
                }

                if let Some(issue_id) = issue_id
                    && let Some(issue) = db.get_issue(issue_id)?
                    && let Some(program_id) = issue.program_id
                    && let Some(program) = db.get_program(program_id)?
                    && program.has_owner(&user)
                {
                    return Ok(Permission::ProgramOwner);
                }

                if let Some(ref channel) = channel
                    && db.is_owner(ENTITY_CHANNEL, channel, &user)?
                {
                    return Ok(Permission::Owner);
                }

                if let Some(issue_id) = issue_id
                    && db.is_owner(ENTITY_ISSUE, &issue_id.to_string(), &user)?
                {
                    return Ok(Permission::Owner);
                }

                Ok(Permission::User)
            })
            .await
    }

    pub async fn has_permission(
        &self,
        user_id: &str,
        required: Permission,
        channel_id: Option<&str>,
        issue_id: Option<i64>,
    ) -> Result<bool> {
        let resolved = self.resolve(user_id, channel_id, issue_id).await?;
        Ok(resolved.satisfies(required))
    }

    /// Explicit pre-check for mutating entry points. Callers run the guarded
    /// action only on `Allowed`; on `Denied` nothing must execute.
    pub async fn check(
        &self,
        user_id: &str,
        required: Permission,
        channel_id: Option<&str>,
        issue_id: Option<i64>,
    ) -> Result<Decision> {
        let resolved = self.resolve(user_id, channel_id, issue_id).await?;
        if resolved.satisfies(required) {
            Ok(Decision::Allowed(resolved))
        } else {
            Ok(Decision::Denied { required, resolved })
        }
    }
}
