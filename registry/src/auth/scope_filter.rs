//! Scope filter: a pure function (aside from DB reads) narrowing
//! a requested ScopeSet down to what a UserIdentity is actually permitted.

use crate::audience::Audience;
use crate::db::{self, Db};
use crate::identity::UserIdentity;
use crate::scope::{Scope, ScopeSet};

/// Minimal account lookup used by the filter: name + auth tenant id.
pub struct AccountRef {
    pub name: String,
    pub auth_tenant_id: String,
}

pub async fn filter_scopes(
    db: &Db,
    identity: &dyn UserIdentity,
    audience: &Audience,
    requested: &ScopeSet,
) -> Result<ScopeSet, sqlx::Error> {
    let mut granted = ScopeSet::new();

    for scope in requested.iter() {
        match scope.resource_type.as_str() {
            "registry" if scope.name == "catalog" => {
                if audience.anycast || identity.is_anonymous() {
                    continue;
                }
                let viewable = viewable_accounts(db, identity).await?;
                if audience.is_domain_remapped() {
                    if let Some(acct) = viewable.iter().find(|a| a.name == audience.account_name) {
                        granted.add(Scope::new("registry", "catalog", scope.actions.clone()));
                        granted.add(Scope::new("keppel_account", acct.name.clone(), vec!["view".into()]));
                    }
                    continue;
                }
                granted.add(Scope::new("registry", "catalog", scope.actions.clone()));
                for acct in viewable {
                    granted.add(Scope::new("keppel_account", acct.name, vec!["view".into()]));
                }
            }

            "repository" => {
                if let Some(g) = filter_repository_scope(db, identity, scope).await? {
                    granted.add(g);
                }
            }

            "keppel_api" if scope.name == "peer" => {
                if identity.is_peer() {
                    granted.add(scope.clone());
                }
            }

            "keppel_api" if scope.name == "info" => {
                if !identity.is_anonymous() {
                    granted.add(scope.clone());
                }
            }

            "keppel_account" => {
                if audience.is_domain_remapped() && audience.account_name != scope.name {
                    continue;
                }
                if audience.anycast {
                    continue;
                }
                if let Some(account) = db::find_account(db, &scope.name).await? {
                    let mut actions = Vec::new();
                    for action in &scope.actions {
                        let allowed = match action.as_str() {
                            "view" => identity.can_view_account(&account.auth_tenant_id),
                            "change" => identity.can_change_account(&account.auth_tenant_id),
                            "viewquota" => identity.can_view_account_quota(&account.auth_tenant_id),
                            "changequota" => identity.can_change_account_quota(&account.auth_tenant_id),
                            _ => false,
                        };
                        if allowed {
                            actions.push(action.clone());
                        }
                    }
                    if !actions.is_empty() {
                        granted.add(Scope::new("keppel_account", scope.name.clone(), actions));
                    }
                }
            }

            "keppel_auth_tenant" => {
                if audience.is_domain_remapped() || audience.anycast {
                    continue;
                }
                let mut actions = Vec::new();
                for action in &scope.actions {
                    let allowed = match action.as_str() {
                        "view" => identity.can_view_account(&scope.name),
                        "change" => identity.can_change_account(&scope.name),
                        "viewquota" => identity.can_view_account_quota(&scope.name),
                        "changequota" => identity.can_change_account_quota(&scope.name),
                        _ => false,
                    };
                    if allowed {
                        actions.push(action.clone());
                    }
                }
                if !actions.is_empty() {
                    granted.add(Scope::new("keppel_auth_tenant", scope.name.clone(), actions));
                }
            }

            _ => {}
        }
    }

    Ok(granted)
}

async fn viewable_accounts(db: &Db, identity: &dyn UserIdentity) -> Result<Vec<AccountRef>, sqlx::Error> {
    let accounts = sqlx::query_as::<_, (String, String)>("SELECT name, auth_tenant_id FROM accounts")
        .fetch_all(db)
        .await?;
    Ok(accounts
        .into_iter()
        .filter(|(_, tenant)| identity.can_view_account(tenant))
        .map(|(name, auth_tenant_id)| AccountRef { name, auth_tenant_id })
        .collect())
}

async fn filter_repository_scope(
    db: &Db,
    identity: &dyn UserIdentity,
    scope: &Scope,
) -> Result<Option<Scope>, sqlx::Error> {
    if scope.name.is_empty() {
        return Ok(None);
    }
    let Some((account_name, _path)) = scope.name.split_once('/') else {
        return Ok(None);
    };
    let Some(account) = db::find_account(db, account_name).await? else {
        return Ok(None);
    };

    let mut actions: Vec<String> = scope
        .actions
        .iter()
        .filter(|action| match action.as_str() {
            "pull" => identity.can_pull_from_account(&account.auth_tenant_id),
            "push" => identity.can_push_to_account(&account.auth_tenant_id),
            "delete" => identity.can_delete_from_account(&account.auth_tenant_id),
            _ => false,
        })
        .cloned()
        .collect();

    for policy in db::rbac_policies_for_account(db, account_name).await? {
        if !repository_matches(&policy.repository_pattern, &scope.name) {
            continue;
        }
        if let Some(username_pattern) = &policy.username_pattern {
            if !username_matches(username_pattern, &identity.username()) {
                continue;
            }
        }
        let perms: crate::db::models::RbacPermissions =
            serde_json::from_value(policy.permissions_json.clone()).unwrap_or_default();

        if perms.anonymous_pull && !actions.contains(&"pull".to_string()) {
            actions.push("pull".to_string());
        }
        if !identity.is_anonymous() {
            if perms.pull && !actions.contains(&"pull".to_string()) {
                actions.push("pull".to_string());
            }
            if perms.push && !actions.contains(&"push".to_string()) {
                actions.push("push".to_string());
            }
            if perms.delete && !actions.contains(&"delete".to_string()) {
                actions.push("delete".to_string());
            }
        }
    }

    if actions.is_empty() {
        return Ok(None);
    }
    Ok(Some(Scope::new("repository", scope.name.clone(), actions)))
}

fn repository_matches(pattern: &str, repository_path: &str) -> bool {
    regex::Regex::new(pattern).map(|re| re.is_match(repository_path)).unwrap_or(false)
}

fn username_matches(pattern: &str, username: &str) -> bool {
    regex::Regex::new(pattern).map(|re| re.is_match(username)).unwrap_or(false)
}
