//! Resolves the cluster-wide `config` singleton into a kind-to-mode table,
//! verifies each entry against live API discovery, and drives propagator
//! registration. Unknown kinds surface as `TypeNotFound` conditions instead
//! of failing the reconcile.

use futures::Stream;
use kube::api::{Api, Patch, PatchParams};
use kube::core::ApiResource;
use kube::discovery::Discovery;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::api::v1alpha2::{
    Condition, HNCConfiguration, HNCConfigurationStatus, ResourceSpec, ResourceStatus, SyncMode,
    conditions_equal,
};
use crate::api::{
    CONDITION_BAD_CONFIGURATION, CONDITION_FORBIDDEN, CONFIG_SINGLETON, REASON_ENFORCED_MODE,
    REASON_TYPE_NOT_FOUND, TypeKey,
};
use crate::errors::{Error, backoff_for};
use crate::reconcilers::Context;

/// RBAC propagation is enforced: these kinds are always in `Propagate`
/// mode and the config cannot turn them off.
pub fn enforced_defaults() -> Vec<TypeKey> {
    vec![
        TypeKey::new("rbac.authorization.k8s.io", "roles"),
        TypeKey::new("rbac.authorization.k8s.io", "rolebindings"),
    ]
}

pub fn controller(
    ctx: Arc<Context>,
) -> impl Stream<
    Item = Result<
        (ObjectRef<HNCConfiguration>, Action),
        kube::runtime::controller::Error<Error, watcher::Error>,
    >,
> {
    Controller::new(
        Api::<HNCConfiguration>::all(ctx.client.clone()),
        watcher::Config::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
}

/// The webhook-facing check for sync-configuration changes: enforced kinds
/// never leave `Propagate` mode. The reconciler calls the same function, so
/// an unguarded store converges to the same rejection via a `Forbidden`
/// condition.
pub fn validate_config(declared: &[ResourceSpec]) -> Result<(), Error> {
    for r in declared {
        let key = TypeKey::new(r.group.clone(), r.resource.clone());
        if enforced_defaults().contains(&key) && r.mode != SyncMode::Propagate {
            return Err(Error::EnforcedModeForbidden {
                resource: key.to_string(),
            });
        }
    }
    Ok(())
}

/// Applies the enforced defaults before the first `config` event (or in
/// its permanent absence) so RBAC propagation never waits on the user.
/// Retries until Discovery answers: a hiccup at startup must not leave the
/// enforced kinds unsynced for the life of the process. Stops once the
/// config reconciler has installed a table of its own.
pub async fn run_bootstrap(ctx: Arc<Context>) {
    let mut attempt = 0u32;
    loop {
        if ctx.propagator.is_configured() {
            return;
        }
        match bootstrap(&ctx).await {
            Ok(()) => {
                info!("applied default sync configuration");
                return;
            }
            Err(e) => {
                warn!(error = %e, attempt, "could not apply default sync configuration, retrying");
                tokio::time::sleep(backoff_for(attempt)).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

async fn bootstrap(ctx: &Context) -> Result<(), Error> {
    let table = resolve_table(ctx, &merge_spec(&[]).0).await?;
    // Re-check under the race with the config reconciler: its table already
    // contains the enforced defaults.
    if !ctx.propagator.is_configured() {
        ctx.propagator.apply_modes(table);
    }
    Ok(())
}

/// Merges the declared resources over the enforced defaults. Returns the
/// effective table and conditions for entries the config may not change.
fn merge_spec(declared: &[ResourceSpec]) -> (BTreeMap<TypeKey, SyncMode>, Vec<Condition>) {
    let mut table = BTreeMap::new();
    let mut conditions = Vec::new();
    for key in enforced_defaults() {
        table.insert(key, SyncMode::Propagate);
    }
    if let Err(e) = validate_config(declared) {
        conditions.push(Condition::new(
            CONDITION_FORBIDDEN,
            REASON_ENFORCED_MODE,
            e.to_string(),
        ));
    }
    for r in declared {
        let key = TypeKey::new(r.group.clone(), r.resource.clone());
        if enforced_defaults().contains(&key) {
            // Always propagated; a downgrade attempt was reported above.
            continue;
        }
        table.insert(key, r.mode);
    }
    (table, conditions)
}

/// Looks every table entry up in API discovery; entries the server does not
/// serve are dropped and reported.
async fn resolve_table(
    ctx: &Context,
    table: &BTreeMap<TypeKey, SyncMode>,
) -> Result<Vec<(TypeKey, ApiResource, SyncMode)>, Error> {
    let discovery = Discovery::new(ctx.client.clone()).run().await?;
    let mut resolved = Vec::new();
    for (key, mode) in table {
        match find_resource(&discovery, key) {
            Some(ar) => resolved.push((key.clone(), ar, *mode)),
            None => {
                return Err(Error::TypeNotFound {
                    group: key.group.clone(),
                    resource: key.resource.clone(),
                });
            }
        }
    }
    Ok(resolved)
}

fn find_resource(discovery: &Discovery, key: &TypeKey) -> Option<ApiResource> {
    for group in discovery.groups() {
        if group.name() != key.group {
            continue;
        }
        for (ar, _caps) in group.recommended_resources() {
            if ar.plural == key.resource {
                return Some(ar);
            }
        }
    }
    None
}

async fn reconcile(cfg: Arc<HNCConfiguration>, ctx: Arc<Context>) -> Result<Action, Error> {
    if cfg.name_any() != CONFIG_SINGLETON {
        warn!(name = %cfg.name_any(), "ignoring non-singleton configuration object");
        return Ok(Action::await_change());
    }

    let (table, mut conditions) = merge_spec(&cfg.spec.resources);

    // Resolve kind by kind so one unknown type does not stall the rest.
    let discovery = Discovery::new(ctx.client.clone()).run().await?;
    let mut resolved = Vec::new();
    let mut statuses = Vec::new();
    for (key, mode) in &table {
        match find_resource(&discovery, key) {
            Some(ar) => {
                resolved.push((key.clone(), ar, *mode));
                let (num_sources, num_propagated) = ctx.propagator.counts(key);
                statuses.push(ResourceStatus {
                    group: key.group.clone(),
                    resource: key.resource.clone(),
                    mode: *mode,
                    num_sources: Some(num_sources),
                    num_propagated: Some(num_propagated),
                });
            }
            None => {
                conditions.push(Condition::new(
                    CONDITION_BAD_CONFIGURATION,
                    REASON_TYPE_NOT_FOUND,
                    format!("resource \"{key}\" is not served by this cluster"),
                ));
            }
        }
    }

    info!(kinds = resolved.len(), "applying sync configuration");
    ctx.propagator.apply_modes(resolved);

    let desired = HNCConfigurationStatus {
        resources: statuses,
        conditions,
    };
    let current = cfg.status.clone().unwrap_or_default();
    if current.resources != desired.resources
        || !conditions_equal(&current.conditions, &desired.conditions)
    {
        let api: Api<HNCConfiguration> = Api::all(ctx.client.clone());
        let patch = json!({"status": desired});
        api.patch_status(
            CONFIG_SINGLETON,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    }

    // Counts drift as propagation proceeds; refresh periodically.
    Ok(Action::requeue(Duration::from_secs(60)))
}

fn error_policy(_cfg: Arc<HNCConfiguration>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(error = %error, "config reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_always_propagate() {
        let (table, conditions) = merge_spec(&[]);
        assert_eq!(
            table.get(&TypeKey::new("rbac.authorization.k8s.io", "roles")),
            Some(&SyncMode::Propagate)
        );
        assert!(conditions.is_empty());
    }

    #[test]
    fn validate_config_rejects_enforced_downgrade() {
        let declared = vec![ResourceSpec {
            group: "rbac.authorization.k8s.io".to_string(),
            resource: "rolebindings".to_string(),
            mode: SyncMode::Remove,
        }];
        assert!(matches!(
            validate_config(&declared),
            Err(Error::EnforcedModeForbidden { .. })
        ));
        // Propagate on an enforced kind, and any mode on other kinds, pass.
        let fine = vec![
            ResourceSpec {
                group: "rbac.authorization.k8s.io".to_string(),
                resource: "roles".to_string(),
                mode: SyncMode::Propagate,
            },
            ResourceSpec {
                group: String::new(),
                resource: "secrets".to_string(),
                mode: SyncMode::Ignore,
            },
        ];
        assert!(validate_config(&fine).is_ok());
    }

    #[test]
    fn config_cannot_downgrade_enforced_kinds() {
        let declared = vec![ResourceSpec {
            group: "rbac.authorization.k8s.io".to_string(),
            resource: "roles".to_string(),
            mode: SyncMode::Ignore,
        }];
        let (table, conditions) = merge_spec(&declared);
        assert_eq!(
            table.get(&TypeKey::new("rbac.authorization.k8s.io", "roles")),
            Some(&SyncMode::Propagate)
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_FORBIDDEN);
        assert_eq!(conditions[0].reason, REASON_ENFORCED_MODE);
    }

    #[test]
    fn declared_kinds_join_the_table() {
        let declared = vec![ResourceSpec {
            group: String::new(),
            resource: "secrets".to_string(),
            mode: SyncMode::Propagate,
        }];
        let (table, _) = merge_spec(&declared);
        assert_eq!(
            table.get(&TypeKey::new("", "secrets")),
            Some(&SyncMode::Propagate)
        );
        assert_eq!(table.len(), 3);
    }
}
