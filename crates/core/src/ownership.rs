//! Ownership configuration and the label conventions derived from it.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::CoreError;

/// Value stamped on managed-marker labels.
pub const MANAGED_TRUE: &str = "true";

const MAX_LABEL_VALUE_LEN: usize = 63;

pub fn owner_label_key(domain: &str) -> String {
    format!("{}/owner", domain)
}

pub fn component_label_key(domain: &str) -> String {
    format!("{}/component", domain)
}

pub fn label_selector(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

/// Kubernetes label value rules: empty, or up to 63 chars of `[A-Za-z0-9_.-]`
/// starting and ending with an alphanumeric.
pub fn validate_label_value(value: &str) -> Result<(), CoreError> {
    let invalid = |reason| Err(CoreError::InvalidLabelValue { value: value.to_string(), reason });
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_LABEL_VALUE_LEN {
        return invalid("longer than 63 characters");
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return invalid("only alphanumerics, '-', '_' and '.' are allowed");
    }
    let first = value.chars().next().unwrap_or('-');
    let last = value.chars().last().unwrap_or('-');
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return invalid("must start and end with an alphanumeric character");
    }
    Ok(())
}

/// Who owns the objects written during a reconciliation pass, and how that is
/// expressed on the objects.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipConfig {
    owner: OwnerReference,
    owner_namespace: Option<String>,
    owner_label: String,
    component_label: String,
    component: String,
    field_manager: String,
}

impl OwnershipConfig {
    /// `owner_namespace` is `None` for a cluster-scoped owner. The owner
    /// reference is normalised to a controller reference.
    pub fn new(
        domain: &str,
        mut owner: OwnerReference,
        owner_namespace: Option<String>,
        component: &str,
        field_manager: &str,
    ) -> Result<Self, CoreError> {
        if owner.name.is_empty() {
            return Err(CoreError::MissingField("owner name"));
        }
        if owner.uid.is_empty() {
            return Err(CoreError::MissingField("owner uid"));
        }
        if field_manager.trim().is_empty() {
            return Err(CoreError::EmptyFieldManager);
        }
        validate_label_value(&owner.name)?;
        validate_label_value(component)?;
        owner.controller = Some(true);
        owner.block_owner_deletion = Some(true);
        Ok(Self {
            owner,
            owner_namespace: owner_namespace.filter(|ns| !ns.is_empty()),
            owner_label: owner_label_key(domain),
            component_label: component_label_key(domain),
            component: component.to_string(),
            field_manager: field_manager.to_string(),
        })
    }

    pub fn owner_ref(&self) -> &OwnerReference {
        &self.owner
    }

    pub fn owner_name(&self) -> &str {
        &self.owner.name
    }

    pub fn owner_namespace(&self) -> Option<&str> {
        self.owner_namespace.as_deref()
    }

    pub fn owner_label(&self) -> &str {
        &self.owner_label
    }

    pub fn component_label(&self) -> &str {
        &self.component_label
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn field_manager(&self) -> &str {
        &self.field_manager
    }

    /// Labels stamped on every object applied under this configuration.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(self.owner_label.clone(), self.owner.name.clone());
        labels.insert(self.component_label.clone(), self.component.clone());
        labels
    }

    pub fn owner_selector(&self) -> String {
        label_selector(&self.owner_label, &self.owner.name)
    }

    /// Owner references cannot cross namespaces, and a namespaced owner cannot
    /// own a cluster-scoped object.
    pub fn can_own(&self, target_namespace: Option<&str>) -> bool {
        match (self.owner_namespace.as_deref(), target_namespace) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(owner_ns), Some(ns)) => owner_ns == ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "platform.example.io/v1".into(),
            kind: "Platform".into(),
            name: name.into(),
            uid: "0b1c9a0e-2b7f-4c1e-9d8a-5f7f7f7f7f7f".into(),
            ..Default::default()
        }
    }

    #[test]
    fn labels_follow_domain_convention() {
        let cfg =
            OwnershipConfig::new("example.io", owner("svc-a"), Some("apps".into()), "gateway", "converge").unwrap();
        let labels = cfg.labels();
        assert_eq!(labels.get("example.io/owner").map(String::as_str), Some("svc-a"));
        assert_eq!(labels.get("example.io/component").map(String::as_str), Some("gateway"));
        assert_eq!(cfg.owner_selector(), "example.io/owner=svc-a");
        assert_eq!(cfg.owner_ref().controller, Some(true));
        assert_eq!(cfg.owner_ref().block_owner_deletion, Some(true));
    }

    #[test]
    fn invalid_identity_is_rejected() {
        let long = "a".repeat(64);
        assert!(matches!(
            OwnershipConfig::new("example.io", owner(&long), None, "c", "fm"),
            Err(CoreError::InvalidLabelValue { .. })
        ));
        assert!(matches!(
            OwnershipConfig::new("example.io", owner("ok"), None, "bad value", "fm"),
            Err(CoreError::InvalidLabelValue { .. })
        ));
        assert_eq!(
            OwnershipConfig::new("example.io", owner("ok"), None, "c", " ").unwrap_err(),
            CoreError::EmptyFieldManager
        );
        let mut no_uid = owner("ok");
        no_uid.uid.clear();
        assert_eq!(
            OwnershipConfig::new("example.io", no_uid, None, "c", "fm").unwrap_err(),
            CoreError::MissingField("owner uid")
        );
    }

    #[test]
    fn label_value_edges() {
        assert!(validate_label_value("").is_ok());
        assert!(validate_label_value("a.b-c_d").is_ok());
        assert!(validate_label_value("-lead").is_err());
        assert!(validate_label_value("trail.").is_err());
        assert!(validate_label_value(&"x".repeat(63)).is_ok());
    }

    #[test]
    fn owner_references_stay_within_namespace() {
        let namespaced = OwnershipConfig::new("example.io", owner("o"), Some("apps".into()), "c", "fm").unwrap();
        assert!(namespaced.can_own(Some("apps")));
        assert!(!namespaced.can_own(Some("other")));
        assert!(!namespaced.can_own(None));

        let cluster = OwnershipConfig::new("example.io", owner("o"), None, "c", "fm").unwrap();
        assert!(cluster.can_own(None));
        assert!(cluster.can_own(Some("anywhere")));
    }
}
