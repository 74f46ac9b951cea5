//! Plugin system: composable units of functionality installed into an
//! [`EngineBuilder`](crate::executor::EngineBuilder) with `.with(plugin)`.
//!
//! A plugin typically registers a group of resource definitions and the
//! custom checkers their rule sets name. Feature modules compose this way
//! instead of mutating registries after freeze.

use crate::executor::EngineBuilder;

/// A composable unit of functionality installed at build time.
///
/// # Example
///
/// ```ignore
/// struct Blog;
///
/// impl EnginePlugin for Blog {
///     fn install(self, builder: EngineBuilder) -> EngineBuilder {
///         builder
///             .resource(ResourceDefinition::new("articles")
///                 .attribute("title", FieldSpec::string().required())
///                 .rules(OperationKind::Query, ["public"]))
///             .checker_fn("editor", |auth, _ctx| auth.has_role("editor"))
///     }
/// }
///
/// let engine = Engine::builder(storage).with(Blog).build()?;
/// ```
pub trait EnginePlugin: Send + 'static {
    /// Install this plugin, returning the modified builder.
    fn install(self, builder: EngineBuilder) -> EngineBuilder;

    /// The name of this plugin (for diagnostics).
    fn name() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}
