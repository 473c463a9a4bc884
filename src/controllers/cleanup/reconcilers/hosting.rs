use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};

use crate::resources::manifestworks::{
    klusterlet_crds_work_name, klusterlet_work_name, ManifestWork, ANNOTATION_CLEANUP_PRIORITY,
    ANNOTATION_POSTPONE_DELETE, HOSTED_KUBECONFIG_WORK_SUFFIX,
};

/// Whether a work's postpone-delete window is still holding off its
/// deletion. The window opens when the cluster deletion starts and closes
/// after the configured grace period.
pub fn postpone_active(
    work: &ManifestWork,
    cluster_deleted_at: Option<&Time>,
    now: DateTime<Utc>,
    grace: Duration,
) -> bool {
    if !work.annotations().contains_key(ANNOTATION_POSTPONE_DELETE) {
        return false;
    }
    let Some(started) = cluster_deleted_at else {
        return false;
    };
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
    now < started.0 + grace
}

/// Whether the CRD work's finalizers may be stripped during a forced
/// detach: the agent has reported the deletion, or the grace period since
/// the delete was issued has elapsed.
pub fn crd_work_force_ready(work: &ManifestWork, now: DateTime<Utc>, grace: Duration) -> bool {
    if work.is_deleting_reported() {
        return true;
    }
    match &work.meta().deletion_timestamp {
        Some(started) => {
            let grace =
                chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
            now >= started.0 + grace
        }
        None => false,
    }
}

/// What a forced detach does with a single work this pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkTeardown {
    /// Delete and strip the finalizers right away
    ForceDelete,
    /// Delete, but leave the finalizers in place
    Delete,
    /// Nothing to do yet
    Wait,
}

/// Forced-detach step for one cluster-namespace work. Everything is
/// force-deleted except the CRD work, whose finalizers are only stripped
/// once `crd_work_force_ready` holds. Its delete is issued immediately so
/// a still-reachable agent gets the chance to acknowledge it.
pub fn force_teardown_step(
    cluster: &str,
    work: &ManifestWork,
    now: DateTime<Utc>,
    grace: Duration,
) -> WorkTeardown {
    if work.name_any() == klusterlet_crds_work_name(cluster) {
        if work.meta().deletion_timestamp.is_none() {
            return WorkTeardown::Delete;
        }
        if crd_work_force_ready(work, now, grace) {
            return WorkTeardown::ForceDelete;
        }
        return WorkTeardown::Wait;
    }
    WorkTeardown::ForceDelete
}

/// Cluster-namespace works to delete next during a graceful detach.
/// Non-core works go first (honouring their postpone windows), then, once
/// every extension is gone, the klusterlet work after its agent has
/// acknowledged applying it, then the CRD work last.
pub fn next_graceful_deletions<'a>(
    cluster: &str,
    works: &'a [ManifestWork],
    extensions_remaining: usize,
    cluster_deleted_at: Option<&Time>,
    now: DateTime<Utc>,
    postpone_grace: Duration,
) -> Vec<&'a ManifestWork> {
    let klusterlet = klusterlet_work_name(cluster);
    let crds = klusterlet_crds_work_name(cluster);
    let live = |w: &ManifestWork| w.meta().deletion_timestamp.is_none();

    let others: Vec<&ManifestWork> = works
        .iter()
        .filter(|w| w.name_any() != klusterlet && w.name_any() != crds)
        .collect();
    if !others.is_empty() {
        return others
            .into_iter()
            .filter(|w| live(w))
            .filter(|w| !postpone_active(w, cluster_deleted_at, now, postpone_grace))
            .collect();
    }

    // the extensions' finalizers have to clear before the core bundles go
    if extensions_remaining > 0 {
        return vec![];
    }

    if let Some(work) = works.iter().find(|w| w.name_any() == klusterlet) {
        // the agent removes the orphaned resources only if it applied them
        return if live(work) && work.is_applied() {
            vec![work]
        } else {
            vec![]
        };
    }

    works
        .iter()
        .filter(|w| w.name_any() == crds && live(w))
        .collect()
}

fn deletion_rank(work: &ManifestWork) -> u32 {
    if work
        .name_any()
        .ends_with(&format!("-{HOSTED_KUBECONFIG_WORK_SUFFIX}"))
    {
        // the kubeconfig work goes last, the hosting agent needs it to
        // acknowledge every other deletion
        return u32::MAX;
    }
    work.annotations()
        .get(ANNOTATION_CLEANUP_PRIORITY)
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}

/// Hosting-side works to delete next: the lowest-ranked works that are not
/// already deleting. A work that is deleting but not yet gone keeps gating
/// every batch behind it.
pub fn next_hosting_deletions(works: &[ManifestWork]) -> Vec<&ManifestWork> {
    let Some(min) = works.iter().map(deletion_rank).min() else {
        return vec![];
    };
    works
        .iter()
        .filter(|w| deletion_rank(w) == min && w.meta().deletion_timestamp.is_none())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resources::manifestworks::{
        hosted_klusterlet_work_name, hosted_kubeconfig_work_name, ManifestWorkSpec,
        ManifestWorkStatus, CONDITION_WORK_APPLIED, CONDITION_WORK_DELETING,
    };
    use crate::resources::Condition;
    use std::collections::BTreeMap;

    fn work(name: &str) -> ManifestWork {
        ManifestWork::new(name, ManifestWorkSpec::default())
    }

    fn with_annotation(mut w: ManifestWork, key: &str, value: &str) -> ManifestWork {
        w.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        w
    }

    fn with_condition(mut w: ManifestWork, type_: &str) -> ManifestWork {
        w.status = Some(ManifestWorkStatus {
            conditions: Some(vec![Condition::new(type_, "True", "Done", "")]),
        });
        w
    }

    fn deleting_since(mut w: ManifestWork, at: DateTime<Utc>) -> ManifestWork {
        w.metadata.deletion_timestamp = Some(Time(at));
        w
    }

    #[test]
    fn postponed_work_waits_out_its_window() {
        let now = Utc::now();
        let deleted_at = Time(now - chrono::Duration::seconds(60));
        let grace = Duration::from_secs(300);

        let postponed = with_annotation(work("c1-addon"), ANNOTATION_POSTPONE_DELETE, "");
        assert!(postpone_active(&postponed, Some(&deleted_at), now, grace));

        // window closed four minutes later
        let later = now + chrono::Duration::seconds(241);
        assert!(!postpone_active(&postponed, Some(&deleted_at), later, grace));

        // without the annotation there is no window at all
        assert!(!postpone_active(
            &work("c1-addon"),
            Some(&deleted_at),
            now,
            grace
        ));
    }

    #[test]
    fn graceful_plan_holds_postponed_works_and_records_nothing_else() {
        let now = Utc::now();
        let deleted_at = Time(now - chrono::Duration::seconds(10));
        let postponed = with_annotation(work("c1-addon"), ANNOTATION_POSTPONE_DELETE, "");
        let works = vec![
            postponed,
            work("c1-klusterlet"),
            work("c1-klusterlet-crds"),
        ];

        let plan = next_graceful_deletions(
            "c1",
            &works,
            0,
            Some(&deleted_at),
            now,
            Duration::from_secs(300),
        );
        assert!(plan.is_empty(), "the window is open, nothing gets deleted");
    }

    #[test]
    fn graceful_plan_deletes_non_core_works_before_the_klusterlet() {
        let now = Utc::now();
        let works = vec![
            work("c1-addon"),
            work("c1-klusterlet"),
            work("c1-klusterlet-crds"),
        ];
        let plan = next_graceful_deletions("c1", &works, 0, None, now, Duration::from_secs(300));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name_any(), "c1-addon");
    }

    #[test]
    fn graceful_plan_waits_for_the_klusterlet_to_be_applied() {
        let now = Utc::now();
        let works = vec![work("c1-klusterlet"), work("c1-klusterlet-crds")];
        let plan = next_graceful_deletions("c1", &works, 0, None, now, Duration::from_secs(300));
        assert!(plan.is_empty(), "not applied yet, the agent would orphan nothing");

        let works = vec![
            with_condition(work("c1-klusterlet"), CONDITION_WORK_APPLIED),
            work("c1-klusterlet-crds"),
        ];
        let plan = next_graceful_deletions("c1", &works, 0, None, now, Duration::from_secs(300));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name_any(), "c1-klusterlet");
    }

    #[test]
    fn graceful_plan_holds_the_core_bundles_while_addons_remain() {
        let now = Utc::now();
        let works = vec![
            with_condition(work("c1-klusterlet"), CONDITION_WORK_APPLIED),
            work("c1-klusterlet-crds"),
        ];

        // one addon still waiting on its framework finalizer
        let plan = next_graceful_deletions("c1", &works, 1, None, now, Duration::from_secs(300));
        assert!(plan.is_empty(), "the klusterlet outlives every addon");

        let crds_only = vec![work("c1-klusterlet-crds")];
        let plan =
            next_graceful_deletions("c1", &crds_only, 1, None, now, Duration::from_secs(300));
        assert!(plan.is_empty());

        // non-core works still come down in the same pass as the addons
        let with_addon_work = vec![work("c1-addon-work"), work("c1-klusterlet")];
        let plan =
            next_graceful_deletions("c1", &with_addon_work, 1, None, now, Duration::from_secs(300));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name_any(), "c1-addon-work");
    }

    #[test]
    fn graceful_plan_deletes_the_crds_work_last() {
        let now = Utc::now();
        let works = vec![work("c1-klusterlet-crds")];
        let plan = next_graceful_deletions("c1", &works, 0, None, now, Duration::from_secs(300));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name_any(), "c1-klusterlet-crds");
    }

    #[test]
    fn force_plan_strips_everything_but_gates_the_crds_work() {
        let now = Utc::now();
        let grace = Duration::from_secs(30);

        assert_eq!(
            force_teardown_step("c1", &work("c1-addon"), now, grace),
            WorkTeardown::ForceDelete
        );
        assert_eq!(
            force_teardown_step("c1", &work("c1-klusterlet"), now, grace),
            WorkTeardown::ForceDelete
        );

        // the crds work is deleted but not stripped until the gate opens
        let crds = work("c1-klusterlet-crds");
        assert_eq!(force_teardown_step("c1", &crds, now, grace), WorkTeardown::Delete);

        let deleting = deleting_since(work("c1-klusterlet-crds"), now - chrono::Duration::seconds(5));
        assert_eq!(
            force_teardown_step("c1", &deleting, now, grace),
            WorkTeardown::Wait
        );

        let elapsed = deleting_since(work("c1-klusterlet-crds"), now - chrono::Duration::seconds(31));
        assert_eq!(
            force_teardown_step("c1", &elapsed, now, grace),
            WorkTeardown::ForceDelete
        );

        let acknowledged = with_condition(
            deleting_since(work("c1-klusterlet-crds"), now - chrono::Duration::seconds(5)),
            CONDITION_WORK_DELETING,
        );
        assert_eq!(
            force_teardown_step("c1", &acknowledged, now, grace),
            WorkTeardown::ForceDelete
        );
    }

    #[test]
    fn hosting_deletions_keep_the_kubeconfig_work_for_last() {
        let klusterlet = with_annotation(
            work(&hosted_klusterlet_work_name("c1")),
            ANNOTATION_CLEANUP_PRIORITY,
            "100",
        );
        let kubeconfig = work(&hosted_kubeconfig_work_name("c1"));
        let addon = work("c1-addon-work");

        // the addon work has no priority annotation, it goes first
        let works = vec![klusterlet.clone(), kubeconfig.clone(), addon];
        let plan = next_hosting_deletions(&works);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name_any(), "c1-addon-work");

        // no addon works left: the klusterlet work goes before the kubeconfig
        let works = vec![klusterlet.clone(), kubeconfig.clone()];
        let plan = next_hosting_deletions(&works);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name_any(), hosted_klusterlet_work_name("c1"));

        // still deleting: the kubeconfig work stays gated
        let deleting = deleting_since(klusterlet, Utc::now());
        let works = vec![deleting, kubeconfig.clone()];
        assert!(next_hosting_deletions(&works).is_empty());

        // gone for good: the kubeconfig work is finally released
        let works = vec![kubeconfig];
        let plan = next_hosting_deletions(&works);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name_any(), hosted_kubeconfig_work_name("c1"));
    }
}
