//! Pure predicates over `DependencyDeclaration`s and the current live graph. Kept as free
//! functions rather than methods on the policy enums (§9: "keep them in `PolicyEngine` as free
//! functions... to keep `DependencyDeclaration` a plain value").

use crate::types::{
    CreatePolicy, DependencyDeletePolicy, DependencyDeclaration, DependencyUpdatePolicy,
    DeletePolicy, InstanceId, Properties, UpdatePolicy,
};

/// True iff `decl`'s `CreatePolicy` permits registering a fresh instance for this declaration.
/// `existing_of_alternative` should report, per alternative `app_id`, whether a live instance of
/// that app exists that is *not* already owned by another parent (a "lonely" candidate) — only
/// that shape of existence blocks `IF_NOT_EXISTING`.
pub fn allowed_to_create(decl: &DependencyDeclaration, lonely_candidate_exists: bool) -> bool {
    match decl.create_policy {
        CreatePolicy::Always => true,
        CreatePolicy::IfNotExisting => !lonely_candidate_exists,
        CreatePolicy::Never => false,
    }
}

/// True iff `parent` may rewrite `child`'s properties under `decl`'s `UpdatePolicy`.
/// `referring_parents` is the full set of live instances currently referencing `child`.
pub fn allowed_to_update(
    decl: &DependencyDeclaration,
    parent: InstanceId,
    referring_parents: &[InstanceId],
) -> bool {
    match decl.update_policy {
        UpdatePolicy::Always => true,
        UpdatePolicy::Never => false,
        UpdatePolicy::IfMine => referring_parents == [parent],
    }
}

/// True iff `parent` may delete `child` under `decl`'s `DeletePolicy`, given the child's current
/// set of non-deleting live referrers.
pub fn allowed_to_delete(
    decl: &DependencyDeclaration,
    parent: InstanceId,
    referring_parents: &[InstanceId],
) -> bool {
    match decl.delete_policy {
        DeletePolicy::Never => false,
        DeletePolicy::Always => true,
        DeletePolicy::IfMine => referring_parents == [parent],
    }
}

/// True iff a child may override `property_name` given the parent already set `parent_value` for
/// it (or didn't: `parent_value = None`).
pub fn child_may_override(
    decl: &DependencyDeclaration,
    property_name: &str,
    parent_properties: &Properties,
) -> bool {
    match decl.dependency_update_policy {
        DependencyUpdatePolicy::AllowAll => true,
        DependencyUpdatePolicy::AllowNone => false,
        DependencyUpdatePolicy::AllowOnlyUnconfiguredProperties => {
            !parent_properties.contains_key(property_name)
        }
    }
}

/// True iff `decl` allows its target to be deleted independently while the declaring parent still
/// exists.
pub fn parent_may_delete_child(decl: &DependencyDeclaration) -> bool {
    !matches!(
        decl.dependency_delete_policy,
        DependencyDeletePolicy::NotAllowed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppDependencyConfig, DependencyUpdatePolicy};
    use uuid::Uuid;

    fn decl(
        create: CreatePolicy,
        update: UpdatePolicy,
        delete: DeletePolicy,
        dep_update: DependencyUpdatePolicy,
        dep_delete: DependencyDeletePolicy,
    ) -> DependencyDeclaration {
        DependencyDeclaration {
            key: "meter".into(),
            alternatives: vec![AppDependencyConfig::by_app("Meter")],
            create_policy: create,
            update_policy: update,
            delete_policy: delete,
            dependency_update_policy: dep_update,
            dependency_delete_policy: dep_delete,
        }
    }

    #[test]
    fn if_not_existing_blocks_creation_only_when_lonely_candidate_exists() {
        let d = decl(
            CreatePolicy::IfNotExisting,
            UpdatePolicy::Always,
            DeletePolicy::Always,
            DependencyUpdatePolicy::AllowAll,
            DependencyDeletePolicy::Allowed,
        );
        assert!(allowed_to_create(&d, false));
        assert!(!allowed_to_create(&d, true));
    }

    #[test]
    fn always_create_ignores_existing() {
        let d = decl(
            CreatePolicy::Always,
            UpdatePolicy::Always,
            DeletePolicy::Always,
            DependencyUpdatePolicy::AllowAll,
            DependencyDeletePolicy::Allowed,
        );
        assert!(allowed_to_create(&d, true));
    }

    #[test]
    fn never_create_always_blocked() {
        let d = decl(
            CreatePolicy::Never,
            UpdatePolicy::Always,
            DeletePolicy::Always,
            DependencyUpdatePolicy::AllowAll,
            DependencyDeletePolicy::Allowed,
        );
        assert!(!allowed_to_create(&d, false));
    }

    #[test]
    fn if_mine_requires_sole_referrer() {
        let d = decl(
            CreatePolicy::Always,
            UpdatePolicy::IfMine,
            DeletePolicy::IfMine,
            DependencyUpdatePolicy::AllowAll,
            DependencyDeletePolicy::Allowed,
        );
        let parent = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert!(allowed_to_update(&d, parent, &[parent]));
        assert!(!allowed_to_update(&d, parent, &[parent, other]));
        assert!(allowed_to_delete(&d, parent, &[parent]));
        assert!(!allowed_to_delete(&d, parent, &[parent, other]));
    }

    #[test]
    fn child_override_policy_variants() {
        let mut parent_props = Properties::new();
        parent_props.insert("voltage".to_string(), serde_json::json!(230));

        let allow_all = decl(
            CreatePolicy::Always,
            UpdatePolicy::Always,
            DeletePolicy::Always,
            DependencyUpdatePolicy::AllowAll,
            DependencyDeletePolicy::Allowed,
        );
        assert!(child_may_override(&allow_all, "voltage", &parent_props));

        let allow_none = decl(
            CreatePolicy::Always,
            UpdatePolicy::Always,
            DeletePolicy::Always,
            DependencyUpdatePolicy::AllowNone,
            DependencyDeletePolicy::Allowed,
        );
        assert!(!child_may_override(&allow_none, "voltage", &parent_props));

        let allow_unconfigured = decl(
            CreatePolicy::Always,
            UpdatePolicy::Always,
            DeletePolicy::Always,
            DependencyUpdatePolicy::AllowOnlyUnconfiguredProperties,
            DependencyDeletePolicy::Allowed,
        );
        assert!(!child_may_override(
            &allow_unconfigured,
            "voltage",
            &parent_props
        ));
        assert!(child_may_override(
            &allow_unconfigured,
            "current",
            &parent_props
        ));
    }

    #[test]
    fn parent_may_delete_child_reflects_dependency_delete_policy() {
        let allowed = decl(
            CreatePolicy::Always,
            UpdatePolicy::Always,
            DeletePolicy::Always,
            DependencyUpdatePolicy::AllowAll,
            DependencyDeletePolicy::Allowed,
        );
        assert!(parent_may_delete_child(&allowed));

        let not_allowed = decl(
            CreatePolicy::Always,
            UpdatePolicy::Always,
            DeletePolicy::Always,
            DependencyUpdatePolicy::AllowAll,
            DependencyDeletePolicy::NotAllowed,
        );
        assert!(!parent_may_delete_child(&not_allowed));
    }
}
