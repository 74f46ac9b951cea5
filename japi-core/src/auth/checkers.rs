//! The declarative authorization evaluator.
//!
//! Each resource operation lists rules (`"public"`, `"owns"`,
//! `"role:admin"`). Rules name checkers registered in a
//! [`CheckerRegistry`] at startup; evaluation is left-to-right with OR
//! semantics, and an operation with no rules is denied.

use std::collections::HashMap;
use std::sync::Arc;

use japi_data::Record;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::ownership;
use crate::schema::{OperationKind, ResourceDefinition};

/// What a checker sees besides the auth context.
pub struct CheckerContext<'a> {
    pub resource: &'a ResourceDefinition,
    pub operation: OperationKind,
    /// The prefetched target record, for id-targeted operations.
    pub minimal_record: Option<&'a Record>,
    /// The `param` part of a `"name:param"` rule.
    pub param: Option<&'a str>,
}

/// A named boolean predicate consulted by rule evaluation.
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, auth: &AuthContext, ctx: &CheckerContext<'_>) -> bool;
}

struct FnChecker<F>(F);

#[async_trait::async_trait]
impl<F> Checker for FnChecker<F>
where
    F: Fn(&AuthContext, &CheckerContext<'_>) -> bool + Send + Sync,
{
    async fn check(&self, auth: &AuthContext, ctx: &CheckerContext<'_>) -> bool {
        (self.0)(auth, ctx)
    }
}

/// `public` — always true.
struct Public;

#[async_trait::async_trait]
impl Checker for Public {
    async fn check(&self, _auth: &AuthContext, _ctx: &CheckerContext<'_>) -> bool {
        true
    }
}

/// `authenticated` — a local user id, a provider id, or the system flag.
struct Authenticated;

#[async_trait::async_trait]
impl Checker for Authenticated {
    async fn check(&self, auth: &AuthContext, _ctx: &CheckerContext<'_>) -> bool {
        auth.is_authenticated()
    }
}

/// `owns` — the target record's owner linkage matches the caller.
/// Admins and system callers own everything, mirroring the enforcer's
/// bypass.
struct Owns;

#[async_trait::async_trait]
impl Checker for Owns {
    async fn check(&self, auth: &AuthContext, ctx: &CheckerContext<'_>) -> bool {
        match ctx.minimal_record {
            Some(record) => auth.is_admin() || ownership::owns(ctx.resource, auth, record),
            None => false,
        }
    }
}

/// `role:<name>` — the caller carries the named role.
struct Role;

#[async_trait::async_trait]
impl Checker for Role {
    async fn check(&self, auth: &AuthContext, ctx: &CheckerContext<'_>) -> bool {
        match ctx.param {
            Some(role) => auth.has_role(role),
            None => false,
        }
    }
}

/// Named checkers, populated at startup, read-only while serving.
pub struct CheckerRegistry {
    checkers: HashMap<String, Arc<dyn Checker>>,
}

impl Default for CheckerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckerRegistry {
    /// A registry with the built-in checkers: `public`, `authenticated`,
    /// `owns`, `role`.
    pub fn new() -> Self {
        let mut registry = Self {
            checkers: HashMap::new(),
        };
        registry.register("public", Arc::new(Public));
        registry.register("authenticated", Arc::new(Authenticated));
        registry.register("owns", Arc::new(Owns));
        registry.register("role", Arc::new(Role));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, checker: Arc<dyn Checker>) {
        self.checkers.insert(name.into(), checker);
    }

    /// Register a synchronous closure as a checker.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&AuthContext, &CheckerContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnChecker(f)));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Checker>> {
        self.checkers.get(name)
    }

    /// Evaluate the resource's rule set for an operation. Any rule passing
    /// authorizes; no rules declared means denial.
    pub async fn authorize(
        &self,
        def: &ResourceDefinition,
        operation: OperationKind,
        auth: &AuthContext,
        minimal_record: Option<&Record>,
    ) -> Result<(), ApiError> {
        let rules = def.rules_for(operation).unwrap_or(&[]);
        let required: Vec<String> = rules.iter().map(|r| r.to_string()).collect();
        if rules.is_empty() {
            return Err(ApiError::authorization(
                required,
                vec![format!(
                    "no rules declared for {} on {}",
                    operation.as_str(),
                    def.name
                )],
            ));
        }

        let mut reasons = Vec::new();
        for rule in rules {
            let Some(checker) = self.get(&rule.name) else {
                reasons.push(format!("{rule}: no checker registered under that name"));
                continue;
            };
            let ctx = CheckerContext {
                resource: def,
                operation,
                minimal_record,
                param: rule.param.as_deref(),
            };
            if checker.check(auth, &ctx).await {
                return Ok(());
            }
            reasons.push(format!("{rule}: denied"));
        }
        Err(ApiError::authorization(required, reasons))
    }
}
