//! Ownership enforcement: owner stamping on writes, owner filters on
//! collection reads, and 404-masking of cross-owner single-record access.
//!
//! The 404 (never 403) on cross-owner access is a security invariant: a
//! caller must not be able to distinguish "exists but not yours" from
//! "does not exist".

use serde_json::Value;

use japi_data::{id_string, record_id, FilterClause, Record};

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::schema::{Ownership, ResourceDefinition};

/// Whether ownership is enforced for this resource at all.
///
/// AUTO resources are owned only when the owner field actually exists in
/// their schema.
pub fn applies(def: &ResourceDefinition) -> bool {
    match def.ownership {
        Ownership::Always => true,
        Ownership::Never => false,
        Ownership::Auto => def.has_owner_field(),
    }
}

/// The record's owner, stringified. When the owner field equals the id
/// column (a user acting on itself), the record's own id is the owner.
pub fn owner_value(def: &ResourceDefinition, record: &Record) -> Option<String> {
    if def.owner_field == def.id_field {
        record_id(record, &def.id_field)
    } else {
        record.get(&def.owner_field).and_then(id_string)
    }
}

/// Whether the given context owns the record. Exposed to the `owns`
/// checker so rule sets can require ownership explicitly.
pub fn owns(def: &ResourceDefinition, auth: &AuthContext, record: &Record) -> bool {
    if !applies(def) {
        return false;
    }
    match (&auth.user_id, owner_value(def, record)) {
        (Some(user_id), Some(owner)) => *user_id == owner,
        _ => false,
    }
}

/// Stamp the owner field on a write. No-op for admins/system callers,
/// anonymous callers, unowned resources, and self-owned resources (owner
/// field == id column).
pub fn stamp_owner(def: &ResourceDefinition, auth: &AuthContext, attributes: &mut Record) {
    if !applies(def) || auth.is_admin() || def.owner_field == def.id_field {
        return;
    }
    let Some(user_id) = &auth.user_id else {
        return;
    };
    attributes.insert(def.owner_field.clone(), Value::String(user_id.clone()));
}

/// The owner filter appended to collection reads, when one applies.
pub fn collection_filter(def: &ResourceDefinition, auth: &AuthContext) -> Option<FilterClause> {
    if !applies(def) || auth.is_admin() {
        return None;
    }
    let user_id = auth.user_id.as_ref()?;
    Some(FilterClause::eq(
        def.owner_field.clone(),
        Value::String(user_id.clone()),
    ))
}

/// The 404 mask on single-record access, run *after* authorization: an
/// authenticated non-admin touching another owner's record sees
/// `not_found`, indistinguishable from a truly absent id.
pub fn mask_single(
    def: &ResourceDefinition,
    auth: &AuthContext,
    minimal: &Record,
) -> Result<(), ApiError> {
    if !applies(def) || auth.is_admin() {
        return Ok(());
    }
    let Some(user_id) = &auth.user_id else {
        return Ok(());
    };
    match owner_value(def, minimal) {
        Some(owner) if owner == *user_id => Ok(()),
        _ => Err(ApiError::not_found(format!(
            "No {} with the requested id",
            def.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, Ownership};
    use serde_json::json;

    fn owned_def() -> ResourceDefinition {
        ResourceDefinition::new("articles")
            .attribute("title", FieldSpec::string())
            .belongs_to("owner", "users", "user_id")
            .ownership(Ownership::Auto)
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn auto_applies_only_with_owner_field() {
        assert!(applies(&owned_def()));
        assert!(!applies(
            &ResourceDefinition::new("tags").ownership(Ownership::Auto)
        ));
        assert!(applies(
            &ResourceDefinition::new("tags").ownership(Ownership::Always)
        ));
    }

    #[test]
    fn stamp_sets_owner_for_plain_users_only() {
        let def = owned_def();

        let mut attrs = record(&[("title", json!("T"))]);
        stamp_owner(&def, &AuthContext::user("7"), &mut attrs);
        assert_eq!(attrs.get("user_id"), Some(&json!("7")));

        let mut attrs = record(&[("title", json!("T"))]);
        stamp_owner(&def, &AuthContext::user("7").with_roles(["admin"]), &mut attrs);
        assert_eq!(attrs.get("user_id"), None);

        let mut attrs = record(&[("title", json!("T"))]);
        stamp_owner(&def, &AuthContext::anonymous(), &mut attrs);
        assert_eq!(attrs.get("user_id"), None);
    }

    #[test]
    fn collection_filter_targets_owner_column() {
        let def = owned_def();
        let clause = collection_filter(&def, &AuthContext::user("7")).unwrap();
        assert_eq!(clause.field, "user_id");
        assert_eq!(clause.value, json!("7"));
        assert!(collection_filter(&def, &AuthContext::system()).is_none());
        assert!(collection_filter(&def, &AuthContext::anonymous()).is_none());
    }

    #[test]
    fn mask_rejects_cross_owner_access_as_not_found() {
        let def = owned_def();
        let theirs = record(&[("id", json!(1)), ("user_id", json!(9))]);

        let err = mask_single(&def, &AuthContext::user("7"), &theirs).unwrap_err();
        assert_eq!(err.status(), http::StatusCode::NOT_FOUND);

        assert!(mask_single(&def, &AuthContext::user("9"), &theirs).is_ok());
        assert!(mask_single(&def, &AuthContext::user("7").with_roles(["admin"]), &theirs).is_ok());
    }

    #[test]
    fn self_owned_resources_compare_record_id() {
        let def = ResourceDefinition::new("users")
            .owner_field("id")
            .ownership(Ownership::Always);
        let me = record(&[("id", json!(7))]);
        assert!(owns(&def, &AuthContext::user("7"), &me));
        assert!(!owns(&def, &AuthContext::user("8"), &me));
        // Stamping never writes into the id column.
        let mut attrs = record(&[]);
        stamp_owner(&def, &AuthContext::user("7"), &mut attrs);
        assert!(attrs.is_empty());
    }
}
